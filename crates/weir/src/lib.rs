#![forbid(unsafe_code)]
//! Weir public API facade.
//!
//! Re-exports the recording engine from `weir-core` through a stable external
//! interface. This is the crate that downstream consumers (CLI, acquisition
//! services) depend on.

pub use weir_core::*;
