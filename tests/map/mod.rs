//! Memory map integration tests.

mod build;
mod diff;
mod dump;
mod lists;
mod rules;
mod slabs;
