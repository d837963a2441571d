//! Deferred script-thread dispatch.
//!
//! The host's threading facility takes a bare function pointer per logical
//! thread and cannot pass a context argument at call time, so this module
//! keeps a bounded pool of monomorphized stubs, each closing over its own
//! compile-time slot index. Activating a request parks it under a free slot
//! and hands the host that slot's stub; when the host later invokes the
//! stub, the request is taken back out and run against its environment.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::diag;
use crate::host::HostApi;
use crate::interp::{push_all, ScriptEnv, ScriptValue};

/// Compile-time bound on concurrently parked thread requests.
pub const MAX_THREAD_SLOTS: usize = 64;

pub type ThreadStubFn = unsafe extern "C" fn();

/// A request to run a named script function on a host-side logical thread.
pub struct ThreadRequest {
    pub env: Rc<ScriptEnv>,
    pub function: String,
    pub args: Vec<ScriptValue>,
    /// Label handed to the host; must stay alive while the slot is parked.
    pub label: CString,
}

thread_local! {
    static PARKED: RefCell<BTreeMap<usize, ThreadRequest>> = RefCell::new(BTreeMap::new());
}

/// Park `request` under a free slot and submit its stub to the host's
/// threading facility. Returns the slot, or None when the facility binding
/// is unavailable or every slot is occupied (logged, request dropped).
pub fn activate(api: &HostApi, request: ThreadRequest) -> Option<usize> {
    let Some(start_thread) = api.start_thread else {
        diag!(
            "host binding start_thread unavailable; thread '{}' dropped",
            request.function
        );
        return None;
    };
    let (slot, label_ptr) = PARKED.with(|parked| {
        let mut map = parked.borrow_mut();
        let Some(slot) = (0..MAX_THREAD_SLOTS).find(|slot| !map.contains_key(slot)) else {
            diag!(
                "all {MAX_THREAD_SLOTS} thread slots occupied; '{}' dropped",
                request.function
            );
            return None;
        };
        let label_ptr = request.label.as_ptr();
        map.insert(slot, request);
        Some((slot, label_ptr))
    })?;
    // The stub may fire synchronously inside start_thread; the map borrow
    // is already released here.
    unsafe { start_thread(THREAD_STUBS[slot], label_ptr) };
    Some(slot)
}

pub fn parked_count() -> usize {
    PARKED.with(|parked| parked.borrow().len())
}

fn run_slot(slot: usize) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let Some(request) = PARKED.with(|parked| parked.borrow_mut().remove(&slot)) else {
            diag!("thread stub {slot} fired with no parked request");
            return;
        };
        let Some(key) = request.env.function(&request.function) else {
            diag!("thread '{}' names an unknown function", request.function);
            return;
        };
        if let Err(err) = request
            .env
            .call(&key, &request.function, |lua| push_all(lua, &request.args))
        {
            diag!("thread '{}' failed: {err}", request.function);
        }
    }));
    if result.is_err() {
        diag!("thread stub {slot} panicked; suppressed at the host boundary");
    }
}

extern "C" fn thread_slot<const SLOT: usize>() {
    run_slot(SLOT);
}

macro_rules! thread_stubs {
    ($($slot:literal),+ $(,)?) => {
        [$(thread_slot::<$slot> as ThreadStubFn),+]
    };
}

pub static THREAD_STUBS: [ThreadStubFn; MAX_THREAD_SLOTS] = thread_stubs![
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63,
];
