//! Lifecycle registrar: wires declared quests into the host's script
//! manager on every load event.
//!
//! The registry document is re-read on each load because its content can
//! change between levels. The first load creates one identity record per
//! quest (the host's script manager tracks these for the whole process);
//! every subsequent load reuses the records in place, rebuilding only the
//! name string the host destroyed during the level transition and clearing
//! the started flag. Slot order is the registry's id-sorted order and must
//! stay stable across reloads for the in-place reuse to be sound.

use std::cell::RefCell;
use std::ffi::CString;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use anyhow::Result;

use raven_abi::layout::{EntityBindingRecord, QuestScriptDesc};
use raven_analysis::registry::{
    entity_load_order, EntityScriptDefinition, QuestDefinition, ScriptRegistry, MAX_QUEST_SLOTS,
};

use crate::diag;
use crate::factory;
use crate::host::HostApi;
use crate::quest::QuestHost;

#[derive(Default)]
struct Registrar {
    /// Id-sorted quest definitions from the most recent load.
    definitions: Vec<QuestDefinition>,
    /// Flattened entity definitions in factory-slot order.
    entities: Vec<EntityScriptDefinition>,
    scripts_root: PathBuf,
    /// One record per first-registered quest; addresses are stable for the
    /// process lifetime because the host keeps raw pointers to them.
    identity: Vec<Box<QuestScriptDesc>>,
    first_load_done: bool,
}

impl Drop for Registrar {
    fn drop(&mut self) {
        for desc in &mut self.identity {
            if !desc.name.is_null() {
                unsafe { drop(CString::from_raw(desc.name)) };
                desc.name = std::ptr::null_mut();
            }
        }
    }
}

thread_local! {
    static REGISTRAR: RefCell<Registrar> = RefCell::new(Registrar::default());
}

/// Hook-invoked load-event pass. Never propagates failure: the hooked host
/// routine must regain control no matter what happened here. A first-load
/// failure additionally raises the blocking dialog, because a process that
/// never registered anything looks identical to one with no extension.
pub fn on_load_event(api: &HostApi, registry_path: &Path, scripts_root: &Path) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        run_load_event(api, registry_path, scripts_root)
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            diag!("load event failed: {err:#}");
            let first_load = REGISTRAR.with(|cell| !cell.borrow().first_load_done);
            if first_load {
                api.dialog(&format!("Script registry failed to load:\n{err:#}"));
            }
        }
        Err(_) => diag!("load event panicked; suppressed at the host boundary"),
    }
}

fn run_load_event(api: &HostApi, registry_path: &Path, scripts_root: &Path) -> Result<()> {
    let registry = ScriptRegistry::from_json_file(registry_path)?;
    let duplicates = registry.duplicate_ids();
    if !duplicates.is_empty() {
        diag!("registry has duplicate quest ids {duplicates:?}; document order breaks the ties");
    }
    REGISTRAR.with(|cell| {
        cell.borrow_mut()
            .apply(api, registry, scripts_root.to_path_buf());
    });
    Ok(())
}

impl Registrar {
    fn apply(&mut self, api: &HostApi, registry: ScriptRegistry, scripts_root: PathBuf) {
        self.definitions = registry.sorted_quests();
        self.entities = entity_load_order(&self.definitions);
        self.scripts_root = scripts_root;
        if self.first_load_done {
            self.reregister(api);
        } else {
            self.first_register(api);
            self.first_load_done = true;
        }
    }

    fn first_register(&mut self, api: &HostApi) {
        if self.definitions.len() > MAX_QUEST_SLOTS {
            diag!(
                "{} quest definition(s) exceed the {MAX_QUEST_SLOTS}-slot bound and will not register",
                self.definitions.len() - MAX_QUEST_SLOTS
            );
        }
        for (slot, def) in self.definitions.iter().take(MAX_QUEST_SLOTS).enumerate() {
            let mut desc = Box::new(QuestScriptDesc {
                name: CString::new(def.name.as_str()).unwrap_or_default().into_raw(),
                factory: factory::QUEST_FACTORIES[slot],
                section: def.id as u32,
                started: 0,
            });
            submit(api, desc.as_mut(), &def.name);
            self.identity.push(desc);
        }
        diag!("first load: {} quest(s) registered", self.identity.len());
    }

    fn reregister(&mut self, api: &HostApi) {
        // Slot assignment and the records themselves stay put; only the
        // name string died with the previous level, and the started flag
        // must be cleared for the new one.
        for (slot, desc) in self.identity.iter_mut().enumerate() {
            let Some(def) = self.definitions.get(slot) else {
                diag!("quest slot {slot} has no definition in the reloaded registry; left dormant");
                continue;
            };
            if !desc.name.is_null() {
                unsafe { drop(CString::from_raw(desc.name)) };
            }
            desc.name = CString::new(def.name.as_str()).unwrap_or_default().into_raw();
            desc.started = 0;
            submit(api, desc.as_mut(), &def.name);
        }
        if self.definitions.len() > self.identity.len() {
            // Identity records are created exactly once; a quest added to
            // the document mid-process cannot be given one retroactively.
            diag!(
                "{} quest definition(s) appeared after the first load and cannot register until restart",
                self.definitions.len() - self.identity.len()
            );
        }
        diag!("reload: {} quest(s) re-registered", self.identity.len());
    }
}

fn submit(api: &HostApi, desc: &mut QuestScriptDesc, name: &str) {
    let Some(add_script) = api.add_script else {
        diag!("host binding add_script unavailable; quest '{name}' not registered");
        return;
    };
    unsafe { add_script(desc) };
    if let Some(check_section) = api.check_section {
        unsafe { check_section(desc) };
    }
}

/// Submit every entity binding the quest declared since the last pass, then
/// run the host's two post-add passes (quest-scoped, then global) exactly
/// once for the batch.
pub fn finalize_entity_bindings(api: &HostApi, quest: &mut QuestHost) {
    let pending = quest.take_pending_bindings();
    if pending.is_empty() {
        return;
    }
    let mut submitted = 0usize;
    for binding in pending {
        let Some(factory_fn) = factory::entity_factory_for_file(&binding.file) else {
            diag!(
                "quest '{}': no entity script registered for file '{}'; binding '{}' skipped",
                quest.name(),
                binding.file,
                binding.entity
            );
            quest.push_event(format!("binding.skip {}", binding.entity));
            continue;
        };
        let name = CString::new(binding.entity.as_str()).unwrap_or_default();
        let mut record = Box::new(EntityBindingRecord {
            vtable: api.entity_binding_vtbl as usize as *const std::ffi::c_void,
            name: name.as_ptr(),
            owner: quest.base_ptr(),
            factory: factory_fn,
            required: 1,
        });
        let record_ptr: *mut EntityBindingRecord = record.as_mut();
        // The host retains the raw record and name pointers; both live on
        // the quest from here.
        quest.retain_binding(record, name);
        if let Some(add_entity_script) = api.add_entity_script {
            unsafe { add_entity_script(record_ptr) };
        } else {
            diag!(
                "host binding add_entity_script unavailable; '{}' not submitted",
                binding.entity
            );
        }
        quest.push_event(format!("binding.add {}", binding.entity));
        submitted += 1;
    }
    if let Some(post_add_quest) = api.post_add_quest {
        unsafe { post_add_quest(quest.base_ptr()) };
    }
    if let Some(post_add_global) = api.post_add_global {
        unsafe { post_add_global() };
    }
    diag!(
        "quest '{}': {submitted} entity binding(s) finalized",
        quest.name()
    );
}

/// Quest definition populated at `slot`, with the script path resolved
/// against the configured root.
pub(crate) fn quest_slot_definition(slot: usize) -> Option<(String, PathBuf)> {
    REGISTRAR.with(|cell| {
        let registrar = cell.borrow();
        let def = registrar.definitions.get(slot)?;
        Some((def.name.clone(), registrar.scripts_root.join(&def.file)))
    })
}

pub(crate) fn entity_slot_definition(slot: usize) -> Option<(String, PathBuf)> {
    REGISTRAR.with(|cell| {
        let registrar = cell.borrow();
        let def = registrar.entities.get(slot)?;
        Some((def.name.clone(), registrar.scripts_root.join(&def.file)))
    })
}

pub(crate) fn entity_position_for_file(file: &str) -> Option<usize> {
    REGISTRAR.with(|cell| {
        cell.borrow()
            .entities
            .iter()
            .position(|entity| entity.file == file)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::QUEST_VTBL;
    use raven_abi::layout::QuestScriptBase;
    use std::ffi::CStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    static ADDED: AtomicUsize = AtomicUsize::new(0);
    static CHECKED: AtomicUsize = AtomicUsize::new(0);
    static ENTITY_ADDS: AtomicUsize = AtomicUsize::new(0);
    static POST_QUEST: AtomicUsize = AtomicUsize::new(0);
    static POST_GLOBAL: AtomicUsize = AtomicUsize::new(0);
    static SUBMITTED_NAMES: Mutex<Vec<String>> = Mutex::new(Vec::new());
    // Counters are process-global while registrar state is per-thread;
    // tests that assert on the counters hold this to serialize.
    static COUNTER_LOCK: Mutex<()> = Mutex::new(());

    unsafe extern "C" fn count_add(desc: *mut QuestScriptDesc) {
        ADDED.fetch_add(1, Ordering::SeqCst);
        let name = CStr::from_ptr((*desc).name).to_string_lossy().to_string();
        SUBMITTED_NAMES.lock().expect("names lock").push(name);
    }

    unsafe extern "C" fn count_check(_desc: *mut QuestScriptDesc) -> i32 {
        CHECKED.fetch_add(1, Ordering::SeqCst);
        1
    }

    unsafe extern "C" fn count_entity_add(_record: *mut EntityBindingRecord) -> i32 {
        ENTITY_ADDS.fetch_add(1, Ordering::SeqCst);
        1
    }

    unsafe extern "C" fn count_post_quest(_owner: *mut QuestScriptBase) {
        POST_QUEST.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn count_post_global() {
        POST_GLOBAL.fetch_add(1, Ordering::SeqCst);
    }

    fn counting_api() -> HostApi {
        let mut api = HostApi::unresolved();
        api.add_script = Some(count_add);
        api.check_section = Some(count_check);
        api.add_entity_script = Some(count_entity_add);
        api.post_add_quest = Some(count_post_quest);
        api.post_add_global = Some(count_post_global);
        api.entity_binding_vtbl = 0x5D1F68;
        api
    }

    fn reset_counters() {
        ADDED.store(0, Ordering::SeqCst);
        CHECKED.store(0, Ordering::SeqCst);
        ENTITY_ADDS.store(0, Ordering::SeqCst);
        POST_QUEST.store(0, Ordering::SeqCst);
        POST_GLOBAL.store(0, Ordering::SeqCst);
        SUBMITTED_NAMES.lock().expect("names lock").clear();
    }

    fn write_registry(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("quests.json");
        std::fs::write(&path, json).expect("write registry");
        path
    }

    fn write_script(dir: &Path, file: &str, source: &str) {
        std::fs::write(dir.join(file), source).expect("write script");
    }

    const REGISTRY: &str = r#"{
        "quests": [
            { "name": "The Long Road", "file": "long_road.lua", "id": 20,
              "entityScripts": [
                { "name": "Bandit", "file": "bandit.lua", "id": 3 },
                { "name": "Caravan Guard", "file": "caravan_guard.lua", "id": 7 }
              ] },
            { "name": "Embers", "file": "embers.lua", "id": 5 }
        ]
    }"#;

    #[test]
    fn first_load_registers_in_id_order_and_reloads_reuse_identity() {
        let _serial = COUNTER_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        reset_counters();
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = write_registry(dir.path(), REGISTRY);
        let api = counting_api();

        on_load_event(&api, &registry, dir.path());
        assert_eq!(ADDED.load(Ordering::SeqCst), 2);
        assert_eq!(CHECKED.load(Ordering::SeqCst), 2);
        assert_eq!(
            *SUBMITTED_NAMES.lock().expect("names lock"),
            vec!["Embers".to_string(), "The Long Road".to_string()]
        );

        // Two reloads: the same records are resubmitted with fresh names.
        on_load_event(&api, &registry, dir.path());
        on_load_event(&api, &registry, dir.path());
        assert_eq!(ADDED.load(Ordering::SeqCst), 6);
        assert_eq!(SUBMITTED_NAMES.lock().expect("names lock").len(), 6);
        REGISTRAR.with(|cell| {
            let registrar = cell.borrow();
            assert_eq!(registrar.identity.len(), 2);
            for desc in &registrar.identity {
                assert_eq!(desc.started, 0);
                assert!(!desc.name.is_null());
            }
        });
    }

    #[test]
    fn missing_registry_leaves_prior_state_intact() {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = write_registry(dir.path(), REGISTRY);
        let api = HostApi::unresolved();
        on_load_event(&api, &registry, dir.path());
        REGISTRAR.with(|cell| assert!(cell.borrow().first_load_done));

        on_load_event(&api, Path::new("no/such/registry.json"), dir.path());
        REGISTRAR.with(|cell| {
            let registrar = cell.borrow();
            assert!(registrar.first_load_done);
            assert_eq!(registrar.definitions.len(), 2);
        });
    }

    #[test]
    fn slot_lookups_resolve_against_the_scripts_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = write_registry(dir.path(), REGISTRY);
        on_load_event(&HostApi::unresolved(), &registry, dir.path());

        // Slot order: Embers (id 5), then The Long Road (id 20).
        let (name, file) = quest_slot_definition(0).expect("slot 0");
        assert_eq!(name, "Embers");
        assert_eq!(file, dir.path().join("embers.lua"));
        assert!(quest_slot_definition(2).is_none());

        let (entity, _) = entity_slot_definition(0).expect("entity slot 0");
        assert_eq!(entity, "Bandit");
        assert_eq!(entity_position_for_file("caravan_guard.lua"), Some(1));
        assert_eq!(entity_position_for_file("stranger.lua"), None);
    }

    #[test]
    fn factories_build_quests_from_the_installed_registry() {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = write_registry(dir.path(), REGISTRY);
        write_script(dir.path(), "embers.lua", "function Main(state) end");
        write_script(dir.path(), "long_road.lua", "function Main(state) end");
        on_load_event(&HostApi::unresolved(), &registry, dir.path());

        let first = unsafe { factory::QUEST_FACTORIES[0]() };
        let second = unsafe { factory::QUEST_FACTORIES[1]() };
        assert!(!first.is_null());
        assert!(!second.is_null());
        assert_ne!(first, second);
        let host = unsafe { QuestHost::from_base(first) };
        assert_eq!(host.name(), "Embers");
        assert!(!host.is_inert());
        unsafe {
            (QUEST_VTBL.destroy)(first, 1);
            (QUEST_VTBL.destroy)(second, 1);
        }
    }

    #[test]
    fn binding_finalization_submits_known_files_and_posts_once() {
        let _serial = COUNTER_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        reset_counters();
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = write_registry(dir.path(), REGISTRY);
        write_script(dir.path(), "long_road.lua", "function Main(state) end");
        let api = counting_api();
        on_load_event(&api, &registry, dir.path());
        reset_counters();

        let base = unsafe { factory::QUEST_FACTORIES[1]() };
        let host = unsafe { QuestHost::from_base(base) };
        host.shared().borrow_mut().pending_bindings.extend([
            crate::quest::PendingBinding {
                entity: "Bandit".to_string(),
                file: "bandit.lua".to_string(),
            },
            crate::quest::PendingBinding {
                entity: "Caravan Guard".to_string(),
                file: "caravan_guard.lua".to_string(),
            },
            crate::quest::PendingBinding {
                entity: "Stranger".to_string(),
                file: "stranger.lua".to_string(),
            },
        ]);
        finalize_entity_bindings(&api, host);

        assert_eq!(ENTITY_ADDS.load(Ordering::SeqCst), 2);
        assert_eq!(POST_QUEST.load(Ordering::SeqCst), 1);
        assert_eq!(POST_GLOBAL.load(Ordering::SeqCst), 1);
        assert_eq!(host.binding_record_count(), 2);
        let events = host.events();
        assert!(events.iter().any(|event| event == "binding.skip Stranger"));
        assert!(host.shared().borrow().pending_bindings.is_empty());

        // A second pass with nothing pending must not re-run the posts.
        finalize_entity_bindings(&api, unsafe { QuestHost::from_base(base) });
        assert_eq!(POST_QUEST.load(Ordering::SeqCst), 1);
        unsafe { (QUEST_VTBL.destroy)(base, 1) };
    }
}
