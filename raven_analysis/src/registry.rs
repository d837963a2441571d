//! Declarative script registry: the JSON document enumerating quests and
//! their entity scripts.
//!
//! The engine re-reads this document on every load event (its content can
//! change between host levels) and derives factory-slot indices from the
//! id-sorted order. That ordering must be stable across reloads within one
//! process lifetime, because re-registration reuses identity records by
//! position; the sort here is the single place the ordering is defined.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Compile-time bound on quest factory slots. Definitions beyond the bound
/// are silently unusable by design, not by accident.
pub const MAX_QUEST_SLOTS: usize = 64;
/// Compile-time bound on entity factory slots.
pub const MAX_ENTITY_SLOTS: usize = 128;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityScriptDefinition {
    pub name: String,
    pub file: String,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuestDefinition {
    pub name: String,
    pub file: String,
    pub id: i64,
    #[serde(default, rename = "entityScripts")]
    pub entity_scripts: Vec<EntityScriptDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptRegistry {
    pub quests: Vec<QuestDefinition>,
}

impl ScriptRegistry {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading script registry {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("parsing script registry {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let registry: ScriptRegistry =
            serde_json::from_str(raw).context("script registry is not valid JSON")?;
        Ok(registry)
    }

    /// Quests in slot-assignment order: ascending id, stable for ties.
    pub fn sorted_quests(&self) -> Vec<QuestDefinition> {
        let mut quests = self.quests.clone();
        quests.sort_by_key(|quest| quest.id);
        quests
    }

    /// Ids that appear on more than one quest; each reported once.
    pub fn duplicate_ids(&self) -> Vec<i64> {
        let mut seen = Vec::new();
        let mut duplicates = Vec::new();
        for quest in &self.quests {
            if seen.contains(&quest.id) {
                if !duplicates.contains(&quest.id) {
                    duplicates.push(quest.id);
                }
            } else {
                seen.push(quest.id);
            }
        }
        duplicates
    }
}

/// Entity definitions in factory-slot order: quests in id-sorted order,
/// entities within each quest in id-sorted order.
pub fn entity_load_order(quests: &[QuestDefinition]) -> Vec<EntityScriptDefinition> {
    let mut entities = Vec::new();
    for quest in quests {
        let mut scripts = quest.entity_scripts.clone();
        scripts.sort_by_key(|script| script.id);
        entities.extend(scripts);
    }
    entities
}

/// Deterministic slot assignment derived from a registry, with anything
/// beyond the compiled bounds reported as overflow rather than assigned.
#[derive(Debug, Clone, Default)]
pub struct SlotPlan {
    pub quests: Vec<(usize, QuestDefinition)>,
    pub quest_overflow: Vec<QuestDefinition>,
    pub entities: Vec<(usize, EntityScriptDefinition)>,
    pub entity_overflow: Vec<EntityScriptDefinition>,
}

pub fn assign_slots(registry: &ScriptRegistry) -> SlotPlan {
    let quests = registry.sorted_quests();
    let entities = entity_load_order(&quests);
    let mut plan = SlotPlan::default();
    for (slot, quest) in quests.into_iter().enumerate() {
        if slot < MAX_QUEST_SLOTS {
            plan.quests.push((slot, quest));
        } else {
            plan.quest_overflow.push(quest);
        }
    }
    for (slot, entity) in entities.into_iter().enumerate() {
        if slot < MAX_ENTITY_SLOTS {
            plan.entities.push((slot, entity));
        } else {
            plan.entity_overflow.push(entity);
        }
    }
    plan
}
