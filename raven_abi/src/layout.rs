//! In-memory layouts the host's compiled code reads and writes directly.
//!
//! The host performs unchecked pointer reinterpretation on these structs: it
//! treats a `QuestHost` pointer as a `QuestScriptBase` pointer and indexes
//! fields of `EntityScriptHeader` at fixed byte offsets. Required fields must
//! therefore keep the exact order documented here; any extension bookkeeping
//! is appended after all required fields, never interleaved.

use std::ffi::{c_char, c_void};

use crate::vtable::{EntityFactoryFn, EntityScriptVtbl, QuestFactoryFn, QuestScriptVtbl};

/// By-value copy of the host's entity handle: world id, slot index, and a
/// uniqueness counter. The host dereferences the embedded copy directly, so
/// it must stay byte-for-byte identical to the native definition.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThingHandle {
    pub raw: [u32; 3],
}

/// Native quest-script base object as the host's dispatch code knows it.
///
/// A pointer to any struct embedding this at offset 0 is a valid pointer to
/// the base; the host upcasts without a check. `run_state` and `section` are
/// host-written fields we never interpret.
#[repr(C)]
pub struct QuestScriptBase {
    pub vtable: *const QuestScriptVtbl,
    pub run_state: u32,
    pub section: u32,
}

/// Required header of an entity host, field-for-field in the host's order:
/// vtable, interface pointer, embedded thing handle, owning quest base,
/// shared master data, and one reserved word kept for layout compatibility.
#[repr(C)]
pub struct EntityScriptHeader {
    pub vtable: *const EntityScriptVtbl,
    pub iface: *mut c_void,
    pub thing: ThingHandle,
    pub owner: *mut QuestScriptBase,
    pub master: *mut c_void,
    pub reserved: u32,
}

/// Identity record the host's script manager tracks per registered quest.
///
/// Created once per process lifetime. The `name` string does not survive a
/// level reload and is destroyed and rebuilt on every subsequent load event;
/// the record itself is reused in place so slot assignment stays stable.
#[repr(C)]
pub struct QuestScriptDesc {
    pub name: *mut c_char,
    pub factory: QuestFactoryFn,
    pub section: u32,
    pub started: u32,
}

/// Native record submitted through the host's "add entity script binding"
/// operation: an opaque vtable the host supplies, the entity's display name,
/// a back-pointer to the parent quest's base, the factory that instantiates
/// the entity host, and a required-true flag.
#[repr(C)]
pub struct EntityBindingRecord {
    pub vtable: *const c_void,
    pub name: *const c_char,
    pub owner: *mut QuestScriptBase,
    pub factory: EntityFactoryFn,
    pub required: u32,
}

/// Out-location an entity factory fills for the host: the new host object
/// and the jointly owned reference-count block (see [`crate::shared`]).
#[repr(C)]
pub struct EntitySpawn {
    pub host: *mut EntityScriptHeader,
    pub block: *mut crate::shared::SharedBlock,
}

const PTR: usize = std::mem::size_of::<usize>();

const _: () = assert!(std::mem::offset_of!(QuestScriptBase, vtable) == 0);
const _: () = assert!(std::mem::offset_of!(EntityScriptHeader, vtable) == 0);
const _: () = assert!(std::mem::offset_of!(EntityScriptHeader, iface) == PTR);
const _: () = assert!(std::mem::offset_of!(EntityScriptHeader, thing) == 2 * PTR);
const _: () = assert!(std::mem::size_of::<ThingHandle>() == 12);
const _: () = assert!(std::mem::align_of::<ThingHandle>() == 4);
