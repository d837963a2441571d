//! Offline validation for a script registry document: prints the slot
//! assignment the engine would derive, flags duplicate ids and over-capacity
//! definitions, and optionally lints each referenced Lua source for the
//! well-known entry points.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use raven_analysis::lint;
use raven_analysis::registry::{assign_slots, ScriptRegistry, MAX_ENTITY_SLOTS, MAX_QUEST_SLOTS};

#[derive(Parser, Debug)]
#[command(about = "Validate a quest script registry before shipping it")]
struct Args {
    /// Path to the registry JSON document.
    registry: PathBuf,
    /// Directory the script files resolve against (defaults to the
    /// registry's own directory).
    #[arg(long)]
    scripts_root: Option<PathBuf>,
    /// Parse each referenced Lua source and report its entry points.
    #[arg(long)]
    lint: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let registry = ScriptRegistry::from_json_file(&args.registry)?;
    let scripts_root = args
        .scripts_root
        .clone()
        .or_else(|| args.registry.parent().map(|parent| parent.to_path_buf()))
        .context("registry path has no parent directory")?;

    let duplicates = registry.duplicate_ids();
    if !duplicates.is_empty() {
        println!("warning: duplicate quest ids {duplicates:?}; slot order falls back to document order for ties");
    }

    let plan = assign_slots(&registry);
    println!(
        "{} quest slot(s) of {MAX_QUEST_SLOTS}, {} entity slot(s) of {MAX_ENTITY_SLOTS}",
        plan.quests.len(),
        plan.entities.len()
    );
    for (slot, quest) in &plan.quests {
        println!("  quest slot {slot:3}  id {:5}  {} ({})", quest.id, quest.name, quest.file);
    }
    for quest in &plan.quest_overflow {
        println!(
            "warning: quest '{}' (id {}) exceeds the {MAX_QUEST_SLOTS}-slot bound and will never be registered",
            quest.name, quest.id
        );
    }
    for (slot, entity) in &plan.entities {
        println!(
            "  entity slot {slot:3}  id {:5}  {} ({})",
            entity.id, entity.name, entity.file
        );
    }
    for entity in &plan.entity_overflow {
        println!(
            "warning: entity '{}' (id {}) exceeds the {MAX_ENTITY_SLOTS}-slot bound and will never be registered",
            entity.name, entity.id
        );
    }

    if args.lint {
        for (_, quest) in &plan.quests {
            report_entry_points(&scripts_root.join(&quest.file), &quest.name, true);
        }
        for (_, entity) in &plan.entities {
            report_entry_points(&scripts_root.join(&entity.file), &entity.name, false);
        }
    }

    Ok(())
}

fn report_entry_points(path: &std::path::Path, name: &str, expect_main: bool) {
    match lint::scan_file(path) {
        Ok(report) => {
            let mut found = Vec::new();
            for entry in lint::ENTRY_POINTS {
                if report.defines(entry) {
                    found.push(*entry);
                }
            }
            println!("  {} -> {}", name, if found.is_empty() { "no entry points".to_string() } else { found.join(", ") });
            if expect_main && !report.main {
                println!("warning: '{name}' defines no Main; its Step calls will be no-ops");
            }
            for shadowed in &report.shadowed {
                println!("warning: '{name}' declares {shadowed} as local; the engine will not see it");
            }
        }
        Err(err) => println!("warning: {err:#}"),
    }
}
