//! Entry-point lint for quest and entity Lua sources.
//!
//! The engine resolves `Init`, `Main`, and `OnPersist` by name inside each
//! script's environment at run time; a typo there surfaces only as a quest
//! that silently does nothing. This lint parses a source offline and reports
//! which of the well-known entry points it actually defines, plus any that
//! are declared `local` and therefore invisible to the environment lookup.

use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};
use full_moon::ast::Stmt;

pub const ENTRY_POINTS: &[&str] = &["Init", "Main", "OnPersist"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntryPointReport {
    pub init: bool,
    pub main: bool,
    pub on_persist: bool,
    /// Entry-point names declared as `local function`; the engine's
    /// environment lookup will never see these.
    pub shadowed: Vec<String>,
}

impl EntryPointReport {
    pub fn defines(&self, name: &str) -> bool {
        match name {
            "Init" => self.init,
            "Main" => self.main,
            "OnPersist" => self.on_persist,
            _ => false,
        }
    }
}

pub fn scan_source(source: &str) -> Result<EntryPointReport> {
    let ast = full_moon::parse(source).map_err(|err| anyhow!("parsing Lua source: {err}"))?;
    let mut report = EntryPointReport::default();
    for stmt in ast.nodes().stmts() {
        match stmt {
            Stmt::FunctionDeclaration(decl) => {
                match decl.name().to_string().trim() {
                    "Init" => report.init = true,
                    "Main" => report.main = true,
                    "OnPersist" => report.on_persist = true,
                    _ => {}
                }
            }
            Stmt::LocalFunction(local) => {
                let name = local.name().token().to_string();
                let name = name.trim();
                if ENTRY_POINTS.contains(&name) {
                    report.shadowed.push(name.to_string());
                }
            }
            _ => {}
        }
    }
    Ok(report)
}

pub fn scan_file(path: &Path) -> Result<EntryPointReport> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("reading script source {}", path.display()))?;
    scan_source(&source).with_context(|| format!("linting {}", path.display()))
}
