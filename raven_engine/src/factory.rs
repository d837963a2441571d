//! Bounded factory pools: compile-time arrays of distinct instantiation
//! trampolines, one per script slot.
//!
//! The host's registration mechanism takes a bare function pointer per
//! script and cannot pass an index at call time, so each pool entry is a
//! monomorphized trampoline closing over its compile-time slot index. The
//! registrar decides which definition a slot maps to; a slot outside the
//! populated range reports "no object" the way the contract allows (null
//! for quests, 0 for entities) instead of failing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use raven_abi::layout::{EntitySpawn, QuestScriptBase, ThingHandle};
use raven_abi::vtable::{EntityFactoryFn, QuestFactoryFn};
use raven_analysis::registry::{MAX_ENTITY_SLOTS, MAX_QUEST_SLOTS};

use crate::diag;
use crate::entity;
use crate::quest::QuestHost;
use crate::registrar;

extern "C" fn quest_slot<const SLOT: usize>() -> *mut QuestScriptBase {
    match catch_unwind(AssertUnwindSafe(|| spawn_quest_slot(SLOT))) {
        Ok(base) => base,
        Err(_) => {
            diag!("quest factory slot {SLOT} panicked; suppressed at the host boundary");
            ptr::null_mut()
        }
    }
}

fn spawn_quest_slot(slot: usize) -> *mut QuestScriptBase {
    let Some((name, file)) = registrar::quest_slot_definition(slot) else {
        diag!("quest factory slot {slot} is outside the populated range");
        return ptr::null_mut();
    };
    QuestHost::spawn(&name, &file)
}

extern "C" fn entity_slot<const SLOT: usize>(
    owner: *mut QuestScriptBase,
    thing: *const ThingHandle,
    out: *mut EntitySpawn,
) -> i32 {
    match catch_unwind(AssertUnwindSafe(|| spawn_entity_slot(SLOT, owner, thing, out))) {
        Ok(filled) => filled,
        Err(_) => {
            diag!("entity factory slot {SLOT} panicked; suppressed at the host boundary");
            0
        }
    }
}

fn spawn_entity_slot(
    slot: usize,
    owner: *mut QuestScriptBase,
    thing: *const ThingHandle,
    out: *mut EntitySpawn,
) -> i32 {
    let Some((name, file)) = registrar::entity_slot_definition(slot) else {
        diag!("entity factory slot {slot} is outside the populated range");
        return 0;
    };
    entity::spawn(owner, &name, &file, thing, out) as i32
}

macro_rules! quest_factories {
    ($($slot:literal),+ $(,)?) => {
        [$(quest_slot::<$slot> as QuestFactoryFn),+]
    };
}

macro_rules! entity_factories {
    ($($slot:literal),+ $(,)?) => {
        [$(entity_slot::<$slot> as EntityFactoryFn),+]
    };
}

pub static QUEST_FACTORIES: [QuestFactoryFn; MAX_QUEST_SLOTS] = quest_factories![
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63,
];

pub static ENTITY_FACTORIES: [EntityFactoryFn; MAX_ENTITY_SLOTS] = entity_factories![
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71,
    72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93, 94,
    95, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113,
    114, 115, 116, 117, 118, 119, 120, 121, 122, 123, 124, 125, 126, 127,
];

/// Entity factory for a script file, by position in the flattened
/// load-order list. Absence is reportable, not fatal: the caller skips the
/// binding and logs it.
pub fn entity_factory_for_file(file: &str) -> Option<EntityFactoryFn> {
    let position = registrar::entity_position_for_file(file)?;
    ENTITY_FACTORIES.get(position).copied()
}
