//! Reconstruction of typed kernel objects from a physical memory snapshot.
//!
//! Starting from the kernel's global variables, the builder follows
//! pointers, arrays, struct members and intrusive containers through a
//! memory image and records every plausible object it reaches, together
//! with a probability that the object really is what its type claims.
//! The result is queryable by virtual and physical address and can be
//! compared against the map of a second snapshot.

/// Configuration tree
pub mod config;
/// Type descriptors, symbol source and instances
pub mod core;
/// Crate error type
pub mod error;
/// Tracing set-up and macros
pub mod logging;
/// Builder, heuristics, differ and the map facade
pub mod map;
/// Memory images and page tables
pub mod memory;
/// Augmented interval tree
pub mod rangetree;
/// Rule engine interface
pub mod rules;

pub use config::{BuildMode, MapConfig};
pub use error::{MapError, Result};
pub use map::{BuildOptions, BuildReport, BuildState, MemoryMap};
