//! Quest hosts: ABI-shaped objects the host instantiates through factory
//! slots and drives through the vtable during its update loop.
//!
//! The host only ever sees a `*mut QuestScriptBase`; the full object keeps
//! the interface and master pointers at the offsets the compiled host code
//! writes to, followed by the extension's own state. Lifecycle entry points
//! cross the ABI boundary through `catch_unwind` and never propagate
//! errors; failures are logged and recorded on the quest's event trail.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ffi::{c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::rc::Rc;

use mlua::{IntoLuaMulti, LightUserData, RegistryKey};

use raven_abi::layout::{EntityBindingRecord, QuestScriptBase};
use raven_abi::shared::SharedBlock;
use raven_abi::vtable::QuestScriptVtbl;

use crate::diag;
use crate::host::{self, HostApi};
use crate::interp::{ScriptEnv, ScriptValue};
use crate::registrar;
use crate::state_api::{PersistApi, QuestStateApi};
use crate::threads::{self, ThreadRequest};

/// Vtable the host dispatches through; entry order is fixed by the
/// contract in `raven_abi::vtable`.
pub static QUEST_VTBL: QuestScriptVtbl = QuestScriptVtbl {
    destroy: quest_destroy,
    init: quest_init,
    step: quest_step,
    persist: quest_persist,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingThread {
    pub function: String,
    pub region: Option<String>,
    pub args: Vec<ScriptValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBinding {
    pub entity: String,
    pub file: String,
}

/// Bookkeeping shared between the quest host and the Lua-visible state
/// capability (and, through it, the quest's entity scripts).
#[derive(Default)]
pub struct QuestShared {
    pub pending_threads: BTreeMap<u32, PendingThread>,
    pub next_thread: u32,
    pub pending_bindings: Vec<PendingBinding>,
    /// Ownership blocks of entities spawned for this quest; released at
    /// teardown so the deleter fires once both sides are done.
    pub entity_blocks: Vec<*mut SharedBlock>,
    /// Diagnostic trail mirroring the log file; drives tests and dumps.
    pub events: Vec<String>,
}

pub struct QuestScriptState {
    name: String,
    main: Option<RegistryKey>,
    /// None once torn down, or from the start when the script failed to
    /// load; every lifecycle call on an inert quest is a no-op.
    env: Option<Rc<ScriptEnv>>,
    step_error_logged: Cell<bool>,
    shared: Rc<RefCell<QuestShared>>,
    // The host retains raw pointers into these; they live as long as the
    // quest does.
    binding_records: Vec<Box<EntityBindingRecord>>,
    binding_names: Vec<CString>,
}

#[repr(C)]
pub struct QuestHost {
    // Must stay at offset 0: the host upcasts base pointers unchecked.
    base: QuestScriptBase,
    iface: *mut c_void,
    master: *mut c_void,
    state: QuestScriptState,
}

const _: () = assert!(std::mem::offset_of!(QuestHost, base) == 0);

impl QuestHost {
    /// Construct a host bound to `file`, returning the base-pointer shape
    /// the host's script table expects. Load failures leave the host inert
    /// and raise the blocking host dialog, since a silently dead quest has
    /// no recovery path a player could notice.
    pub fn spawn(name: &str, file: &Path) -> *mut QuestScriptBase {
        let env = match load_environment(file) {
            Ok(env) => Some(Rc::new(env)),
            Err(err) => {
                diag!("quest '{name}': {err}");
                host::api().dialog(&format!("Quest script '{name}' failed to load:\n{err}"));
                None
            }
        };
        let host = Box::new(QuestHost {
            base: QuestScriptBase {
                vtable: &QUEST_VTBL,
                run_state: 0,
                section: 0,
            },
            iface: ptr::null_mut(),
            master: ptr::null_mut(),
            state: QuestScriptState {
                name: name.to_string(),
                main: None,
                env,
                step_error_logged: Cell::new(false),
                shared: Rc::new(RefCell::new(QuestShared::default())),
                binding_records: Vec::new(),
                binding_names: Vec::new(),
            },
        });
        let raw = Box::into_raw(host);
        unsafe { ptr::addr_of_mut!((*raw).base) }
    }

    /// # Safety
    /// `base` must point at the base member of a live `QuestHost`.
    pub unsafe fn from_base<'a>(base: *mut QuestScriptBase) -> &'a mut QuestHost {
        // base sits at offset 0, so the two pointers coincide.
        &mut *base.cast::<QuestHost>()
    }

    pub fn base_ptr(&mut self) -> *mut QuestScriptBase {
        ptr::addr_of_mut!(self.base)
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn iface(&self) -> *mut c_void {
        self.iface
    }

    pub fn master(&self) -> *mut c_void {
        self.master
    }

    pub fn env(&self) -> Option<Rc<ScriptEnv>> {
        self.state.env.clone()
    }

    pub fn is_inert(&self) -> bool {
        self.state.env.is_none()
    }

    pub fn shared(&self) -> Rc<RefCell<QuestShared>> {
        self.state.shared.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.shared.borrow().events.clone()
    }

    pub fn push_event(&self, event: String) {
        self.state.shared.borrow_mut().events.push(event);
    }

    pub(crate) fn take_pending_bindings(&mut self) -> Vec<PendingBinding> {
        std::mem::take(&mut self.state.shared.borrow_mut().pending_bindings)
    }

    pub(crate) fn retain_binding(&mut self, record: Box<EntityBindingRecord>, name: CString) {
        self.state.binding_records.push(record);
        self.state.binding_names.push(name);
    }

    pub(crate) fn binding_record_count(&self) -> usize {
        self.state.binding_records.len()
    }

    /// First lifecycle call after construction: cache `Main`, run `Init`,
    /// then submit the entity bindings `Init` declared in one batch.
    pub fn initialize(&mut self, api: &HostApi) {
        let Some(env) = self.state.env.clone() else {
            return;
        };
        self.state.main = env.function("Main");
        if self.state.main.is_none() {
            diag!("quest '{}' defines no Main; steps will be no-ops", self.state.name);
        }
        if let Some(init) = env.function("Init") {
            let capability = self.capability();
            let iface = self.iface;
            if let Err(err) = env.call(&init, "Init", move |lua| {
                (capability, LightUserData(iface)).into_lua_multi(lua)
            }) {
                diag!("quest '{}' Init failed: {err}", self.state.name);
                self.push_event(format!("init.error {err}"));
            }
        }
        registrar::finalize_entity_bindings(api, self);
    }

    /// Per-frame call: first flush queued thread requests (the facility is
    /// only safe to use from here on), then run `Main`.
    pub fn step(&mut self, api: &HostApi) {
        let Some(env) = self.state.env.clone() else {
            return;
        };
        self.flush_thread_requests(api, &env);
        let Some(main) = self.state.main.as_ref() else {
            return;
        };
        let capability = self.capability();
        let iface = self.iface;
        if let Err(err) = env.call(main, "Main", move |lua| {
            (capability, LightUserData(iface)).into_lua_multi(lua)
        }) {
            // Main runs at frame frequency; latch the first failure and
            // keep quiet afterwards.
            if !self.state.step_error_logged.get() {
                self.state.step_error_logged.set(true);
                diag!("quest '{}' Main failed: {err}", self.state.name);
                self.push_event(format!("step.error {err}"));
            }
        }
    }

    /// Save/load call: `OnPersist` is looked up fresh each time, and every
    /// failure is reported since persistence passes are rare.
    pub fn persist(&mut self, api: &HostApi, ctx: *mut c_void) {
        let Some(env) = self.state.env.clone() else {
            return;
        };
        let Some(on_persist) = env.function("OnPersist") else {
            return;
        };
        let capability = self.capability();
        let iface = self.iface;
        let persist_api = PersistApi::new(api, ctx);
        if let Err(err) = env.call(&on_persist, "OnPersist", move |lua| {
            (capability, LightUserData(iface), persist_api).into_lua_multi(lua)
        }) {
            diag!("quest '{}' OnPersist failed: {err}", self.state.name);
            self.push_event(format!("persist.error {err}"));
        }
    }

    fn flush_thread_requests(&mut self, api: &HostApi, env: &Rc<ScriptEnv>) {
        if api.start_thread.is_none() {
            // Facility not available; keep the queue for a later step.
            return;
        }
        let pending: Vec<(u32, PendingThread)> = {
            let mut shared = self.state.shared.borrow_mut();
            std::mem::take(&mut shared.pending_threads).into_iter().collect()
        };
        for (index, request) in pending {
            let label = match &request.region {
                Some(region) => format!("{}:{}@{region}", self.state.name, request.function),
                None => format!("{}:{}", self.state.name, request.function),
            };
            let Ok(label) = CString::new(label) else {
                continue;
            };
            let activated = threads::activate(
                api,
                ThreadRequest {
                    env: env.clone(),
                    function: request.function.clone(),
                    args: request.args,
                    label,
                },
            );
            if let Some(slot) = activated {
                self.push_event(format!(
                    "thread.start {} (#{index} -> slot {slot})",
                    request.function
                ));
            }
        }
    }

    /// Drop script state and release this side's entity references. The
    /// allocation itself is freed by `destroy` when the host says so.
    fn teardown(&mut self) {
        let blocks: Vec<*mut SharedBlock> = {
            let mut shared = self.state.shared.borrow_mut();
            shared.pending_threads.clear();
            std::mem::take(&mut shared.entity_blocks)
        };
        for block in blocks {
            unsafe { raven_abi::shared::release(block) };
        }
        self.state.main = None;
        self.state.env = None;
    }

    fn capability(&self) -> QuestStateApi {
        QuestStateApi {
            quest: self.state.name.clone(),
            shared: self.state.shared.clone(),
        }
    }
}

fn load_environment(file: &Path) -> Result<ScriptEnv, crate::interp::ScriptError> {
    let env = ScriptEnv::new()?;
    let chunk_name = file.display().to_string();
    env.load_file(file, &chunk_name)?;
    Ok(env)
}

fn boundary(label: &str, this: *mut QuestScriptBase, f: impl FnOnce(&mut QuestHost)) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if this.is_null() {
            return;
        }
        let host = unsafe { QuestHost::from_base(this) };
        f(host);
    }));
    if result.is_err() {
        diag!("{label} panicked; suppressed at the host boundary");
    }
}

unsafe extern "C" fn quest_destroy(this: *mut QuestScriptBase, release: u32) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if this.is_null() {
            return;
        }
        QuestHost::from_base(this).teardown();
        if release != 0 {
            drop(Box::from_raw(this.cast::<QuestHost>()));
        }
    }));
    if result.is_err() {
        diag!("quest destroy panicked; suppressed at the host boundary");
    }
}

unsafe extern "C" fn quest_init(this: *mut QuestScriptBase) {
    boundary("quest init", this, |host| host.initialize(host::api()));
}

unsafe extern "C" fn quest_step(this: *mut QuestScriptBase) {
    boundary("quest step", this, |host| host.step(host::api()));
}

unsafe extern "C" fn quest_persist(this: *mut QuestScriptBase, ctx: *mut c_void) {
    boundary("quest persist", this, |host| {
        host.persist(host::api(), ctx)
    });
}
