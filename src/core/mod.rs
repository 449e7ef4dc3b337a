//! Core data types for kernel memory mapping.
//!
//! This module contains the type descriptors supplied by the symbol layer,
//! the symbol source interface, and the typed instances the builder walks.

pub mod data_type;
pub mod instance;
pub mod symbols;

pub use data_type::{BitField, DataType, DataTypeKind, Member, TypeData, TypeId, TypeTags};
pub use instance::{Instance, Resolver, Unwrap};
pub use symbols::{Candidate, FunctionSymbol, SymbolOrigin, SymbolSource, SymbolTable, Variable};
