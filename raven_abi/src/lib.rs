//! ABI-exact layouts, vtable shapes, and the load-hook machinery for the one
//! host binary this extender targets.
//!
//! Everything in this crate mirrors an externally supplied contract taken
//! from the host build: struct offsets, vtable entry order, and the hook
//! site. None of it is re-derived or validated at run time; a mismatch here
//! is the one failure class the extender cannot self-report.

pub mod hook;
pub mod layout;
pub mod shared;
pub mod vtable;
