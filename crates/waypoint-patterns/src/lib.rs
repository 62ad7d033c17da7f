//! Regex-based pattern discovery and ordered instance classification.
//!
//! A `PatternDefinition` is compiled once into a [`CompiledPattern`]; a
//! [`PatternSet`] runs many of them over text, and [`DiscoveryEngine`] runs a
//! set over a whole file inventory read through a `ContentStore`.

pub mod compiled;
pub mod discovery;
mod lines;

pub use compiled::{match_still_present, CompiledPattern};
pub use discovery::{DiscoveryEngine, DiscoveryOutcome, PatternSet};
