//! Process attach: diagnostics, host-table resolution, and the load hook.
//!
//! Attach runs exactly once, from `DllMain` under the host's loader or from
//! the exported `raven_attach` for loaders that call an export explicitly.
//! Nothing registers here; registration happens inside the host's own
//! level-load path, which the hook routes through [`load_event_entry`] on
//! every load event.

use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use raven_abi::hook::{relocate, HookError, LoadHook, TrampolineSpec};

use crate::diag;
use crate::host::{
    self, HostApi, EXPECTED_IMAGE_BASE, LOAD_HOOK_DISPLACED_LEN, LOAD_HOOK_RESUME_VA, LOAD_HOOK_VA,
};
use crate::logging;
use crate::registrar;

/// Diagnostics land next to the host executable.
pub const LOG_FILE: &str = "raven/raven_engine.log";
/// Registry document, resolved against the host's working directory.
pub const REGISTRY_FILE: &str = "scripts/quests.json";
pub const SCRIPTS_ROOT: &str = "scripts";

static LOAD_HOOK: Mutex<LoadHook> = Mutex::new(LoadHook::new());

#[repr(C, align(16))]
struct FxSaveArea(UnsafeCell<[u8; 512]>);

// Written only by the trampoline between fxsave and fxrstor, while the
// host thread is parked inside the hook.
unsafe impl Sync for FxSaveArea {}

static FXSAVE_AREA: FxSaveArea = FxSaveArea(UnsafeCell::new([0; 512]));

/// Everything that must happen once at process attach. Failures are logged
/// and surfaced in a dialog when possible, but never unwind into the
/// loader.
pub fn attach(actual_base: u32) -> bool {
    let result = std::panic::catch_unwind(|| attach_inner(actual_base));
    match result {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            diag!("attach failed: {err:#}");
            host::api().dialog(&format!("raven_engine failed to attach:\n{err:#}"));
            false
        }
        Err(_) => false,
    }
}

fn attach_inner(actual_base: u32) -> Result<()> {
    let mirror = std::env::var_os("RAVEN_VERBOSE").is_some();
    logging::init(Path::new(LOG_FILE), mirror)?;
    diag!("attach: image base {actual_base:#010x} (expected {EXPECTED_IMAGE_BASE:#010x})");
    let api = unsafe { HostApi::resolve(actual_base) };
    if !host::install(api) {
        diag!("host table already installed; keeping the existing one");
    }
    unsafe { install_load_hook(actual_base) }.context("installing load hook")?;
    diag!(
        "load hook armed at {:#010x}",
        relocate(LOAD_HOOK_VA, EXPECTED_IMAGE_BASE, actual_base)
    );
    Ok(())
}

/// Trampoline target: one registrar pass per load event, then straight back
/// to the displaced host instructions.
extern "C" fn load_event_entry() {
    let api = *host::api();
    registrar::on_load_event(&api, Path::new(REGISTRY_FILE), Path::new(SCRIPTS_ROOT));
}

unsafe fn install_load_hook(actual_base: u32) -> Result<(), HookError> {
    let site = relocate(LOAD_HOOK_VA, EXPECTED_IMAGE_BASE, actual_base) as usize as *mut u8;
    // The displaced instruction bytes are read from the live site rather
    // than hard-coded, so a host patched by other tooling still round-trips.
    let displaced = std::slice::from_raw_parts(site, LOAD_HOOK_DISPLACED_LEN).to_vec();
    let spec = TrampolineSpec {
        entry: load_event_entry as usize as u32,
        fxsave_area: FXSAVE_AREA.0.get() as usize as u32,
        displaced,
        resume: relocate(LOAD_HOOK_RESUME_VA, EXPECTED_IMAGE_BASE, actual_base),
    };
    let Ok(mut hook) = LOAD_HOOK.lock() else {
        return Err(HookError::AlreadyInstalled);
    };
    hook.install(site, &spec)
}

/// Manual injection entry for loaders that invoke an export after mapping
/// the module.
#[no_mangle]
pub extern "C" fn raven_attach(actual_base: u32) -> i32 {
    attach(actual_base) as i32
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;

    extern "system" {
        fn GetModuleHandleA(name: *const u8) -> *mut c_void;
    }

    const DLL_PROCESS_ATTACH: u32 = 1;

    #[no_mangle]
    pub extern "system" fn DllMain(
        _module: *mut c_void,
        reason: u32,
        _reserved: *mut c_void,
    ) -> i32 {
        if reason == DLL_PROCESS_ATTACH {
            // Base of the host executable, not of this module.
            let base = unsafe { GetModuleHandleA(std::ptr::null()) } as usize as u32;
            super::attach(base);
        }
        1
    }
}
