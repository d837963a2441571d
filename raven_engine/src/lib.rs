//! Run-time extension layer for the Raven host: bridges the game's native
//! quest and entity script objects onto an embedded Lua interpreter.
//!
//! The host instantiates quests and entities through [`factory`] slots wired
//! in by [`registrar`] on every level load (captured by [`entry`]'s code
//! hook), then drives them through the ABI vtables in [`quest`] and
//! [`entity`]; lifecycle calls land in per-quest Lua environments managed by
//! [`interp`]. Nothing in this crate ever lets an error or panic cross back
//! into the host's call stack.

pub mod entity;
pub mod entry;
pub mod factory;
pub mod host;
pub mod interp;
pub mod logging;
pub mod persist;
pub mod quest;
pub mod registrar;
pub mod state_api;
pub mod threads;
pub mod wait;
