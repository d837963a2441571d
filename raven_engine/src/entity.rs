//! Entity hosts and the side-table carrying their script state.
//!
//! The entity header layout is fully owned by the host's compiled code, so
//! there is no room in it for extension bookkeeping; script state lives in
//! a process-local side-table keyed by the header address instead. Entity
//! scripts share their owning quest's environment (they can read quest
//! globals directly) but keep their own entry-point handles, captured
//! immediately after their chunk runs so a later load into the same
//! environment cannot swap them out.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;

use mlua::{IntoLuaMulti, LightUserData, RegistryKey};

use raven_abi::layout::{EntityScriptHeader, EntitySpawn, QuestScriptBase, ThingHandle};
use raven_abi::shared::SharedBlock;
use raven_abi::vtable::EntityScriptVtbl;

use crate::diag;
use crate::host;
use crate::interp::ScriptEnv;
use crate::quest::{QuestHost, QuestShared};
use crate::state_api::{PersistApi, QuestStateApi};

pub static ENTITY_VTBL: EntityScriptVtbl = EntityScriptVtbl {
    destroy: entity_destroy,
    init: entity_init,
    step: entity_step,
    persist: entity_persist,
    on_failure: entity_on_failure,
    on_interrupt: entity_on_interrupt,
};

/// Live script state for one entity host.
pub struct EntityScriptState {
    name: String,
    env: Rc<ScriptEnv>,
    init: Option<RegistryKey>,
    main: Option<RegistryKey>,
    on_persist: Option<RegistryKey>,
    error_logged: Cell<bool>,
    quest_name: String,
    quest_shared: Rc<RefCell<QuestShared>>,
}

impl EntityScriptState {
    fn capability(&self) -> QuestStateApi {
        QuestStateApi {
            quest: self.quest_name.clone(),
            shared: self.quest_shared.clone(),
        }
    }
}

thread_local! {
    static SIDE_TABLE: RefCell<BTreeMap<usize, Rc<EntityScriptState>>> =
        RefCell::new(BTreeMap::new());
}

fn side_key(header: *const EntityScriptHeader) -> usize {
    header as usize
}

fn state_for(header: *const EntityScriptHeader) -> Option<Rc<EntityScriptState>> {
    SIDE_TABLE.with(|table| table.borrow().get(&side_key(header)).cloned())
}

pub fn registered_count() -> usize {
    SIDE_TABLE.with(|table| table.borrow().len())
}

/// Instantiate an entity host for `thing`, driven by the script at `file`,
/// inside `owner`'s environment. Fills `out` with the header and its shared
/// ownership block; returns false without touching `out` on failure.
pub fn spawn(
    owner: *mut QuestScriptBase,
    name: &str,
    file: &Path,
    thing: *const ThingHandle,
    out: *mut EntitySpawn,
) -> bool {
    if owner.is_null() || thing.is_null() || out.is_null() {
        diag!("entity '{name}': spawn called with null arguments");
        return false;
    }
    let quest = unsafe { QuestHost::from_base(owner) };
    let Some(env) = quest.env() else {
        diag!(
            "entity '{name}': owning quest '{}' is inert; not spawning",
            quest.name()
        );
        return false;
    };
    let chunk_name = file.display().to_string();
    if let Err(err) = env.load_file(file, &chunk_name) {
        diag!("entity '{name}': {err}");
        quest.push_event(format!("entity.load.error {name}"));
        return false;
    }
    // Capture the entry points this chunk just defined before another load
    // into the shared environment overwrites the names.
    let init = env.function("Init");
    let main = env.function("Main");
    let on_persist = env.function("OnPersist");

    let header = Box::new(EntityScriptHeader {
        vtable: &ENTITY_VTBL,
        iface: quest.iface(),
        thing: unsafe { *thing },
        owner,
        master: quest.master(),
        reserved: 0,
    });
    let raw = Box::into_raw(header);
    SIDE_TABLE.with(|table| {
        table.borrow_mut().insert(
            side_key(raw),
            Rc::new(EntityScriptState {
                name: name.to_string(),
                env,
                init,
                main,
                on_persist,
                error_logged: Cell::new(false),
                quest_name: quest.name().to_string(),
                quest_shared: quest.shared(),
            }),
        );
    });
    // One reference for the host, one for the owning quest.
    let block = SharedBlock::allocate(2, entity_deleter, raw.cast());
    quest.shared().borrow_mut().entity_blocks.push(block);
    unsafe {
        (*out).host = raw;
        (*out).block = block;
    }
    quest.push_event(format!("entity.spawn {name}"));
    true
}

unsafe extern "C" fn entity_deleter(block: *mut SharedBlock) {
    let target = (*block).target().cast::<EntityScriptHeader>();
    entity_destroy(target, 1);
}

fn boundary(
    label: &str,
    this: *mut EntityScriptHeader,
    f: impl FnOnce(*mut EntityScriptHeader, &EntityScriptState),
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if this.is_null() {
            return;
        }
        let Some(state) = state_for(this) else {
            diag!("{label}: no side-table entry for host {this:p}");
            return;
        };
        f(this, &state);
    }));
    if result.is_err() {
        diag!("{label} panicked; suppressed at the host boundary");
    }
}

unsafe extern "C" fn entity_init(this: *mut EntityScriptHeader) {
    boundary("entity init", this, |header, state| {
        let Some(init) = state.init.as_ref() else {
            return;
        };
        let capability = state.capability();
        let handle = LightUserData(header.cast());
        if let Err(err) = state.env.call(init, "Init", move |lua| {
            (capability, handle).into_lua_multi(lua)
        }) {
            diag!("entity '{}' Init failed: {err}", state.name);
            state
                .quest_shared
                .borrow_mut()
                .events
                .push(format!("entity.init.error {err}"));
        }
    });
}

unsafe extern "C" fn entity_step(this: *mut EntityScriptHeader) {
    boundary("entity step", this, |header, state| {
        let Some(main) = state.main.as_ref() else {
            return;
        };
        let capability = state.capability();
        let handle = LightUserData(header.cast());
        if let Err(err) = state.env.call(main, "Main", move |lua| {
            (capability, handle).into_lua_multi(lua)
        }) {
            if !state.error_logged.get() {
                state.error_logged.set(true);
                diag!("entity '{}' Main failed: {err}", state.name);
                state
                    .quest_shared
                    .borrow_mut()
                    .events
                    .push(format!("entity.step.error {err}"));
            }
        }
    });
}

unsafe extern "C" fn entity_persist(this: *mut EntityScriptHeader, ctx: *mut std::ffi::c_void) {
    boundary("entity persist", this, |header, state| {
        let Some(on_persist) = state.on_persist.as_ref() else {
            return;
        };
        let capability = state.capability();
        let handle = LightUserData(header.cast());
        let persist_api = PersistApi::new(host::api(), ctx);
        if let Err(err) = state.env.call(on_persist, "OnPersist", move |lua| {
            (capability, handle, persist_api).into_lua_multi(lua)
        }) {
            diag!("entity '{}' OnPersist failed: {err}", state.name);
            state
                .quest_shared
                .borrow_mut()
                .events
                .push(format!("entity.persist.error {err}"));
        }
    });
}

unsafe extern "C" fn entity_on_failure(this: *mut EntityScriptHeader) {
    if let Some(state) = state_for(this) {
        diag!("entity '{}' failure notification from the host", state.name);
    }
}

unsafe extern "C" fn entity_on_interrupt(this: *mut EntityScriptHeader) {
    if let Some(state) = state_for(this) {
        diag!("entity '{}' interrupted by the host", state.name);
    }
}

unsafe extern "C" fn entity_destroy(this: *mut EntityScriptHeader, release: u32) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if this.is_null() {
            return;
        }
        if let Some(state) = SIDE_TABLE.with(|table| table.borrow_mut().remove(&side_key(this))) {
            diag!("entity '{}' destroyed", state.name);
        }
        if release != 0 {
            drop(Box::from_raw(this));
        }
    }));
    if result.is_err() {
        diag!("entity destroy panicked; suppressed at the host boundary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostApi;
    use crate::interp::ScriptValue;
    use crate::quest::QUEST_VTBL;
    use std::io::Write;
    use std::ptr;

    fn write_script(source: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "{source}").expect("write script");
        file
    }

    fn spawn_pair(entity_source: &str) -> (Vec<tempfile::NamedTempFile>, *mut QuestScriptBase, EntitySpawn) {
        let quest_file = write_script("function Main(state) end\nquest_marker = 'set'");
        let entity_file = write_script(entity_source);
        let owner = QuestHost::spawn("long_road", quest_file.path());
        let quest = unsafe { QuestHost::from_base(owner) };
        quest.initialize(&HostApi::unresolved());
        let thing = ThingHandle { raw: [1, 2, 3] };
        let mut out = EntitySpawn {
            host: ptr::null_mut(),
            block: ptr::null_mut(),
        };
        let before = registered_count();
        assert!(spawn(owner, "bandit", entity_file.path(), &thing, &mut out));
        assert_eq!(registered_count(), before + 1);
        assert!(!out.host.is_null());
        assert!(!out.block.is_null());
        (vec![quest_file, entity_file], owner, out)
    }

    #[test]
    fn entity_shares_the_quest_environment() {
        let (_files, owner, out) = spawn_pair(
            "function Main(state, me) seen = quest_marker end",
        );
        unsafe { (ENTITY_VTBL.step)(out.host) };
        let quest = unsafe { QuestHost::from_base(owner) };
        assert_eq!(
            quest.env().expect("env").capture_value("seen"),
            Some(ScriptValue::Str("set".to_string()))
        );
        unsafe { raven_abi::shared::release(out.block) };
        unsafe { (QUEST_VTBL.destroy)(owner, 1) };
    }

    #[test]
    fn entry_points_survive_a_second_load_into_the_same_environment() {
        let (mut files, owner, first) = spawn_pair(
            "function Main(state, me) first_ticks = (first_ticks or 0) + 1 end",
        );
        let second_file = write_script(
            "function Main(state, me) second_ticks = (second_ticks or 0) + 1 end",
        );
        let thing = ThingHandle { raw: [4, 5, 6] };
        let mut second = EntitySpawn {
            host: ptr::null_mut(),
            block: ptr::null_mut(),
        };
        assert!(spawn(owner, "guard", second_file.path(), &thing, &mut second));
        files.push(second_file);
        // The first entity's Main was captured before the second load
        // redefined the name.
        unsafe { (ENTITY_VTBL.step)(first.host) };
        unsafe { (ENTITY_VTBL.step)(second.host) };
        let quest = unsafe { QuestHost::from_base(owner) };
        let env = quest.env().expect("env");
        assert_eq!(env.capture_value("first_ticks"), Some(ScriptValue::Number(1.0)));
        assert_eq!(env.capture_value("second_ticks"), Some(ScriptValue::Number(1.0)));
        unsafe { raven_abi::shared::release(first.block) };
        unsafe { raven_abi::shared::release(second.block) };
        unsafe { (QUEST_VTBL.destroy)(owner, 1) };
    }

    #[test]
    fn step_failures_latch_per_entity() {
        let (_files, owner, out) = spawn_pair("function Main(state, me) error('hurt') end");
        for _ in 0..4 {
            unsafe { (ENTITY_VTBL.step)(out.host) };
        }
        let quest = unsafe { QuestHost::from_base(owner) };
        let errors = quest
            .events()
            .iter()
            .filter(|event| event.starts_with("entity.step.error"))
            .count();
        assert_eq!(errors, 1);
        unsafe { raven_abi::shared::release(out.block) };
        unsafe { (QUEST_VTBL.destroy)(owner, 1) };
    }

    #[test]
    fn quest_teardown_releases_its_entity_reference() {
        let (_files, owner, out) = spawn_pair("function Main(state, me) end");
        // Host side lets go first; the quest's reference keeps the entity
        // alive until teardown.
        unsafe { raven_abi::shared::release(out.block) };
        assert_eq!(registered_count(), 1);
        unsafe { (QUEST_VTBL.destroy)(owner, 1) };
        assert_eq!(registered_count(), 0);
    }

    #[test]
    fn spawn_against_an_inert_quest_is_refused() {
        let entity_file = write_script("function Main() end");
        let owner = QuestHost::spawn("ghost", Path::new("no/such/quest.lua"));
        let thing = ThingHandle { raw: [0, 0, 0] };
        let mut out = EntitySpawn {
            host: ptr::null_mut(),
            block: ptr::null_mut(),
        };
        assert!(!spawn(owner, "bandit", entity_file.path(), &thing, &mut out));
        assert!(out.host.is_null());
        unsafe { (QUEST_VTBL.destroy)(owner, 1) };
    }
}
