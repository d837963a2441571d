//! Resolved entry points into the host binary.
//!
//! The virtual addresses below are the externally supplied contract for the
//! one supported host build; they are documented here once and resolved
//! against the actual load base at attach time. Every call site guards
//! against an unresolved binding and degrades to a logged no-op, so the
//! whole crate stays exercisable outside the host process.

use std::ffi::{c_char, c_void, CString};
use std::sync::OnceLock;

use raven_abi::layout::{EntityBindingRecord, QuestScriptBase, QuestScriptDesc};

use crate::diag;
use crate::threads::ThreadStubFn;

/// Link-time image base the address table was taken from.
pub const EXPECTED_IMAGE_BASE: u32 = 0x0040_0000;

/// Fixed point in the host's level-load path; fires once per load event.
pub const LOAD_HOOK_VA: u32 = 0x0047_23A0;
/// Whole instructions the jump patch overwrites at the hook site.
pub const LOAD_HOOK_DISPLACED_LEN: usize = 6;
/// First intact instruction after the displaced bytes.
pub const LOAD_HOOK_RESUME_VA: u32 = LOAD_HOOK_VA + LOAD_HOOK_DISPLACED_LEN as u32;

/// Virtual addresses of the host operations the extension calls, as found
/// in the supported build.
pub mod va {
    pub const ADD_SCRIPT: u32 = 0x0045_9F80;
    pub const CHECK_SECTION: u32 = 0x0045_A010;
    pub const ADD_ENTITY_SCRIPT: u32 = 0x0045_A450;
    pub const POST_ADD_SCRIPTED_ENTITIES: u32 = 0x0045_A5C0;
    pub const POST_ADD_SCRIPTED_ENTITIES_GLOBAL: u32 = 0x0045_A640;
    pub const ENTITY_BINDING_VTBL: u32 = 0x005D_1F68;
    pub const START_THREAD: u32 = 0x0044_8730;
    pub const ADVANCE_FRAME: u32 = 0x0044_83F0;
    pub const THREAD_TERMINATING: u32 = 0x0044_8A20;
    pub const POLL_PROMPT: u32 = 0x004C_66B0;
    pub const SHOW_DIALOG: u32 = 0x004E_0D40;
    pub const TRANSFER_I32: u32 = 0x0046_1B90;
    pub const TRANSFER_F64: u32 = 0x0046_1C30;
}

pub type AddScriptFn = unsafe extern "C" fn(desc: *mut QuestScriptDesc);
pub type CheckSectionFn = unsafe extern "C" fn(desc: *mut QuestScriptDesc) -> i32;
pub type AddEntityScriptFn = unsafe extern "C" fn(record: *mut EntityBindingRecord) -> i32;
pub type PostAddQuestFn = unsafe extern "C" fn(owner: *mut QuestScriptBase);
pub type PostAddGlobalFn = unsafe extern "C" fn();
pub type StartThreadFn = unsafe extern "C" fn(stub: ThreadStubFn, label: *const c_char) -> i32;
pub type AdvanceFrameFn = unsafe extern "C" fn();
pub type ThreadTerminatingFn = unsafe extern "C" fn() -> i32;
/// -1 while the prompt is still open, 0 for "no", anything else for "yes".
pub type PollPromptFn = unsafe extern "C" fn() -> i32;
pub type ShowDialogFn = unsafe extern "C" fn(text: *const c_char);
/// Transfer-with-default: yields the stored value under `name`, or stores
/// and yields `fallback` when the store has none. Whether it reads or
/// writes depends on the host's save/load mode, which is opaque here.
pub type TransferI32Fn =
    unsafe extern "C" fn(ctx: *mut c_void, name: *const c_char, fallback: i32) -> i32;
pub type TransferF64Fn =
    unsafe extern "C" fn(ctx: *mut c_void, name: *const c_char, fallback: f64) -> f64;

/// The full set of host bindings. `None` means unresolved; callers treat
/// that as "operation unavailable", never as an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostApi {
    pub add_script: Option<AddScriptFn>,
    pub check_section: Option<CheckSectionFn>,
    pub add_entity_script: Option<AddEntityScriptFn>,
    pub post_add_quest: Option<PostAddQuestFn>,
    pub post_add_global: Option<PostAddGlobalFn>,
    pub start_thread: Option<StartThreadFn>,
    pub advance_frame: Option<AdvanceFrameFn>,
    pub thread_terminating: Option<ThreadTerminatingFn>,
    pub poll_prompt: Option<PollPromptFn>,
    pub show_dialog: Option<ShowDialogFn>,
    pub transfer_i32: Option<TransferI32Fn>,
    pub transfer_f64: Option<TransferF64Fn>,
    /// Address of the host's entity-binding vtable, 0 when unresolved.
    pub entity_binding_vtbl: u32,
}

impl HostApi {
    /// Table with nothing resolved. Used before attach and in tests.
    pub const fn unresolved() -> Self {
        HostApi {
            add_script: None,
            check_section: None,
            add_entity_script: None,
            post_add_quest: None,
            post_add_global: None,
            start_thread: None,
            advance_frame: None,
            thread_terminating: None,
            poll_prompt: None,
            show_dialog: None,
            transfer_i32: None,
            transfer_f64: None,
            entity_binding_vtbl: 0,
        }
    }

    /// Resolve the documented address table against the actual load base.
    ///
    /// # Safety
    /// `actual_base` must be the load address of the supported host image;
    /// the resolved pointers are only meaningful inside that process.
    pub unsafe fn resolve(actual_base: u32) -> Self {
        let at = |va: u32| {
            raven_abi::hook::relocate(va, EXPECTED_IMAGE_BASE, actual_base) as usize
        };
        HostApi {
            add_script: Some(std::mem::transmute::<usize, AddScriptFn>(at(va::ADD_SCRIPT))),
            check_section: Some(std::mem::transmute::<usize, CheckSectionFn>(at(
                va::CHECK_SECTION,
            ))),
            add_entity_script: Some(std::mem::transmute::<usize, AddEntityScriptFn>(at(
                va::ADD_ENTITY_SCRIPT,
            ))),
            post_add_quest: Some(std::mem::transmute::<usize, PostAddQuestFn>(at(
                va::POST_ADD_SCRIPTED_ENTITIES,
            ))),
            post_add_global: Some(std::mem::transmute::<usize, PostAddGlobalFn>(at(
                va::POST_ADD_SCRIPTED_ENTITIES_GLOBAL,
            ))),
            start_thread: Some(std::mem::transmute::<usize, StartThreadFn>(at(
                va::START_THREAD,
            ))),
            advance_frame: Some(std::mem::transmute::<usize, AdvanceFrameFn>(at(
                va::ADVANCE_FRAME,
            ))),
            thread_terminating: Some(std::mem::transmute::<usize, ThreadTerminatingFn>(at(
                va::THREAD_TERMINATING,
            ))),
            poll_prompt: Some(std::mem::transmute::<usize, PollPromptFn>(at(
                va::POLL_PROMPT,
            ))),
            show_dialog: Some(std::mem::transmute::<usize, ShowDialogFn>(at(
                va::SHOW_DIALOG,
            ))),
            transfer_i32: Some(std::mem::transmute::<usize, TransferI32Fn>(at(
                va::TRANSFER_I32,
            ))),
            transfer_f64: Some(std::mem::transmute::<usize, TransferF64Fn>(at(
                va::TRANSFER_F64,
            ))),
            entity_binding_vtbl: at(va::ENTITY_BINDING_VTBL) as u32,
        }
    }

    /// Blocking native dialog, for failures that would otherwise leave a
    /// whole registration pass silently inconsistent. Falls back to the
    /// diagnostic log when the binding is unresolved.
    pub fn dialog(&self, text: &str) {
        let Some(show) = self.show_dialog else {
            diag!("host dialog unavailable: {text}");
            return;
        };
        let Ok(text) = CString::new(text) else {
            return;
        };
        unsafe { show(text.as_ptr()) };
    }
}

static HOST_API: OnceLock<HostApi> = OnceLock::new();

/// Process-wide host table; unresolved until [`install`] runs at attach.
pub fn api() -> &'static HostApi {
    HOST_API.get_or_init(HostApi::unresolved)
}

/// First caller wins; returns false if a table was already installed.
pub fn install(api: HostApi) -> bool {
    HOST_API.set(api).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_dialog_is_a_no_op() {
        HostApi::unresolved().dialog("nothing to show");
    }

    #[test]
    fn unresolved_table_has_no_bindings() {
        let api = HostApi::unresolved();
        assert!(api.add_script.is_none());
        assert!(api.start_thread.is_none());
        assert_eq!(api.entity_binding_vtbl, 0);
    }
}
