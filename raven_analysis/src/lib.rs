//! Offline model of the declarative script registry plus a small Lua lint
//! for quest/entity entry points. The engine consumes [`registry`] at every
//! load event; [`lint`] backs the `registry_check` developer tool.

pub mod lint;
pub mod registry;
