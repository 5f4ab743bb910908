#![forbid(unsafe_code)]
//! permafrost public API facade.
//!
//! Re-exports the shared region cache from `pf-cache` through a stable
//! external interface. This is the crate that downstream consumers (CLI,
//! node wiring) depend on.

pub use pf_cache::*;
