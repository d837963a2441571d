//! Vtable shapes for the two scripted-object kinds.
//!
//! Entry order and count below mirror the host binary's dispatch tables
//! exactly. The order IS the contract: a wrong position makes the host call
//! the wrong operation with the wrong arguments, and nothing at run time can
//! detect it. Never reorder these independently of the host contract.
//!
//! All entries use an explicit receiver argument; the concrete register
//! convention is part of the externally supplied contract and is handled by
//! the host-side shim, not re-derived here. Boundary implementations must
//! never unwind: a panic crossing one of these pointers into host frames is
//! undefined behavior.

use std::ffi::c_void;

use crate::layout::{EntityScriptHeader, EntitySpawn, QuestScriptBase, ThingHandle};

/// Teardown, parameterized by whether to actually free the allocation. The
/// host sometimes invokes this purely to run cleanup without deallocating.
pub type QuestDestroyFn = unsafe extern "C" fn(this: *mut QuestScriptBase, release: u32);
pub type QuestInitFn = unsafe extern "C" fn(this: *mut QuestScriptBase);
pub type QuestStepFn = unsafe extern "C" fn(this: *mut QuestScriptBase);
/// Persistence pass; `ctx` is an opaque transfer-context token owned by the
/// host and only ever handed back to host transfer primitives.
pub type QuestPersistFn = unsafe extern "C" fn(this: *mut QuestScriptBase, ctx: *mut c_void);

#[repr(C)]
pub struct QuestScriptVtbl {
    pub destroy: QuestDestroyFn,
    pub init: QuestInitFn,
    pub step: QuestStepFn,
    pub persist: QuestPersistFn,
}

pub type EntityDestroyFn = unsafe extern "C" fn(this: *mut EntityScriptHeader, release: u32);
pub type EntityInitFn = unsafe extern "C" fn(this: *mut EntityScriptHeader);
pub type EntityStepFn = unsafe extern "C" fn(this: *mut EntityScriptHeader);
pub type EntityPersistFn = unsafe extern "C" fn(this: *mut EntityScriptHeader, ctx: *mut c_void);
/// Failure/interruption notifications. The host may invoke these; they carry
/// no behavior beyond diagnostic logging.
pub type EntityNotifyFn = unsafe extern "C" fn(this: *mut EntityScriptHeader);

#[repr(C)]
pub struct EntityScriptVtbl {
    pub destroy: EntityDestroyFn,
    pub init: EntityInitFn,
    pub step: EntityStepFn,
    pub persist: EntityPersistFn,
    pub on_failure: EntityNotifyFn,
    pub on_interrupt: EntityNotifyFn,
}

/// Quest instantiation entry as the host's script table expects it: a plain
/// function pointer carrying no identity of its own. Returns a pointer to
/// the embedded base sub-object, or null for an unpopulated slot.
pub type QuestFactoryFn = unsafe extern "C" fn() -> *mut QuestScriptBase;

/// Entity instantiation entry. Fills `out` with the new host and its shared
/// ownership block and returns nonzero, or returns 0 without touching `out`
/// for an unpopulated slot.
pub type EntityFactoryFn = unsafe extern "C" fn(
    owner: *mut QuestScriptBase,
    thing: *const ThingHandle,
    out: *mut EntitySpawn,
) -> i32;
