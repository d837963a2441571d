//! Transfer-with-default persistence helpers.
//!
//! The host exposes a single symmetric primitive per type: given a name and
//! a fallback, it either yields the stored value or stores and yields the
//! fallback, depending on whether the process is saving or loading. Scripts
//! never learn which direction ran; they just call the same entry point
//! from `OnPersist` in both modes.

use std::ffi::{c_void, CString};

use crate::diag;
use crate::host::HostApi;

pub fn transfer_int(api: &HostApi, ctx: *mut c_void, name: &str, fallback: i32) -> i32 {
    let Some(transfer) = api.transfer_i32 else {
        diag!("persist binding transfer_i32 unavailable; '{name}' keeps its default");
        return fallback;
    };
    let Ok(name_c) = CString::new(name) else {
        return fallback;
    };
    unsafe { transfer(ctx, name_c.as_ptr(), fallback) }
}

pub fn transfer_number(api: &HostApi, ctx: *mut c_void, name: &str, fallback: f64) -> f64 {
    let Some(transfer) = api.transfer_f64 else {
        diag!("persist binding transfer_f64 unavailable; '{name}' keeps its default");
        return fallback;
    };
    let Ok(name_c) = CString::new(name) else {
        return fallback;
    };
    unsafe { transfer(ctx, name_c.as_ptr(), fallback) }
}

pub fn transfer_flag(api: &HostApi, ctx: *mut c_void, name: &str, fallback: bool) -> bool {
    transfer_int(api, ctx, name, fallback as i32) != 0
}

#[cfg(test)]
pub(crate) mod stub_store {
    //! In-process stand-in for the host's transfer store, shared by the
    //! persistence tests here and the quest lifecycle tests.

    use std::collections::HashMap;
    use std::ffi::{c_char, c_void, CStr};
    use std::sync::Mutex;

    use crate::host::HostApi;

    static INTS: Mutex<Option<HashMap<String, i32>>> = Mutex::new(None);
    static NUMBERS: Mutex<Option<HashMap<String, f64>>> = Mutex::new(None);
    static SERIAL: Mutex<()> = Mutex::new(());

    /// Tests sharing the store hold this guard around reset-and-assert so
    /// they cannot clear each other's entries mid-flight.
    pub fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn reset() {
        *INTS.lock().expect("store lock") = Some(HashMap::new());
        *NUMBERS.lock().expect("store lock") = Some(HashMap::new());
    }

    unsafe extern "C" fn transfer_i32(_ctx: *mut c_void, name: *const c_char, fallback: i32) -> i32 {
        let name = CStr::from_ptr(name).to_string_lossy().to_string();
        let mut guard = INTS.lock().expect("store lock");
        let store = guard.get_or_insert_with(HashMap::new);
        *store.entry(name).or_insert(fallback)
    }

    unsafe extern "C" fn transfer_f64(_ctx: *mut c_void, name: *const c_char, fallback: f64) -> f64 {
        let name = CStr::from_ptr(name).to_string_lossy().to_string();
        let mut guard = NUMBERS.lock().expect("store lock");
        let store = guard.get_or_insert_with(HashMap::new);
        *store.entry(name).or_insert(fallback)
    }

    pub fn api() -> HostApi {
        let mut api = HostApi::unresolved();
        api.transfer_i32 = Some(transfer_i32);
        api.transfer_f64 = Some(transfer_f64);
        api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn first_transfer_stores_the_fallback_and_later_calls_see_it() {
        let _serial = stub_store::serial();
        stub_store::reset();
        let api = stub_store::api();
        assert_eq!(transfer_int(&api, ptr::null_mut(), "gold", 25), 25);
        // A different fallback must not override what the store holds.
        assert_eq!(transfer_int(&api, ptr::null_mut(), "gold", 99), 25);
        assert_eq!(transfer_number(&api, ptr::null_mut(), "progress", 0.5), 0.5);
        assert_eq!(transfer_number(&api, ptr::null_mut(), "progress", 1.0), 0.5);
    }

    #[test]
    fn flags_ride_on_the_int_transfer() {
        let _serial = stub_store::serial();
        stub_store::reset();
        let api = stub_store::api();
        assert!(transfer_flag(&api, ptr::null_mut(), "met_guard", true));
        assert!(transfer_flag(&api, ptr::null_mut(), "met_guard", false));
        assert!(!transfer_flag(&api, ptr::null_mut(), "saw_bandit", false));
    }

    #[test]
    fn unresolved_bindings_fall_back_without_touching_the_store() {
        let api = HostApi::unresolved();
        assert_eq!(transfer_int(&api, ptr::null_mut(), "gold", 7), 7);
        assert_eq!(transfer_number(&api, ptr::null_mut(), "progress", 0.25), 0.25);
        assert!(transfer_flag(&api, ptr::null_mut(), "met_guard", true));
    }
}
