//! The memory map of a kernel snapshot.
//!
//! [`MemoryMap`] ties the pieces together: it owns the configuration and the
//! graph state of the last build, runs builds and snapshot comparisons, and
//! answers address queries against the virtual and physical indices.

pub mod builder;
pub mod coordinator;
pub mod diff;
pub mod dump;
pub mod heuristics;
pub mod node;
pub mod probability;
pub mod verifier;

pub use builder::{BuildContext, GraphState};
pub use coordinator::{BuildProgress, BuildProgressFn};
pub use diff::{ChangeKind, ChangedObject, DiffOptions, DiffProgress, DiffReport, DifferenceIndex, TypeChanges};
pub use node::{MemoryMapNode, NodeId, ProbabilityPolicy};
pub use verifier::{ObjectValidity, SlabObjects};

use crate::config::{BuildMode, MapConfig};
use crate::core::data_type::TypeId;
use crate::core::symbols::SymbolSource;
use crate::error::{MapError, Result};
use crate::memory::VirtualMemory;
use crate::rangetree::{MemMapProperties, PhysicalEntry, VirtualEntry};
use crate::rules::RuleOracle;
use builder::GraphBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Overrides and controls of one build.
#[derive(Clone, Default)]
pub struct BuildOptions<'a> {
    /// Replaces the configured mode.
    pub mode: Option<BuildMode>,
    /// Replaces the configured minimum probability.
    pub min_probability: Option<f32>,
    /// Slab objects file for validity classification and the slab mode.
    pub aux_data_file: Option<PathBuf>,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<BuildProgressFn<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Completed,
    Cancelled,
}

/// Summary of a finished build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub build_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: BuildMode,
    pub rules_used: bool,
    pub workers: usize,
    pub roots: usize,
    pub nodes: usize,
    pub processed: usize,
    pub physical_entries: usize,
    pub unknown_pointers: usize,
    pub state: BuildState,
}

pub struct MemoryMap<'a> {
    symbols: &'a dyn SymbolSource,
    vmem: &'a dyn VirtualMemory,
    rules: Option<&'a dyn RuleOracle>,
    config: MapConfig,
    state: GraphState,
    diff: Option<DifferenceIndex>,
}

impl<'a> MemoryMap<'a> {
    pub fn new(symbols: &'a dyn SymbolSource, vmem: &'a dyn VirtualMemory, config: MapConfig) -> Self {
        Self {
            symbols,
            vmem,
            rules: None,
            config,
            state: GraphState::default(),
            diff: None,
        }
    }

    pub fn with_rules(mut self, rules: &'a dyn RuleOracle) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    /// Discard the graph of the previous build and build a new one.
    pub fn build(&mut self, options: BuildOptions<'_>) -> Result<BuildReport> {
        let started_at = Utc::now();
        let build_id = Uuid::new_v4();

        let mut config = self.config.clone();
        if let Some(mode) = options.mode {
            config.build.mode = mode;
        }
        if let Some(p) = options.min_probability {
            config.build.min_probability = p;
        }
        config.validate()?;

        let slabs = match &options.aux_data_file {
            Some(path) => {
                let mut slabs = SlabObjects::load(path)?;
                slabs.resolve(self.symbols);
                Some(slabs)
            }
            None if config.build.mode == BuildMode::SlabCache => {
                return Err(MapError::MissingCollaborator("slab objects file"));
            }
            None => None,
        };

        let span = crate::span_trace!("build_map", id = %build_id, mode = ?config.build.mode);
        let _guard = span.enter();
        self.clear();

        let ctx = BuildContext {
            symbols: self.symbols,
            vmem: self.vmem,
            rules: self.rules,
            config: &config,
            slabs: slabs.as_ref(),
        };
        let cancel = options.cancel.unwrap_or_default();
        let outcome = GraphBuilder::new(ctx, cancel).run(options.progress)?;

        let report = BuildReport {
            build_id,
            started_at,
            finished_at: Utc::now(),
            mode: config.build.mode,
            rules_used: outcome.uses_rules,
            workers: outcome.workers,
            roots: outcome.roots,
            nodes: outcome.state.arena.len(),
            processed: outcome.processed,
            physical_entries: outcome.state.pindex.len(),
            unknown_pointers: outcome.state.unknown_pointers.len(),
            state: if outcome.cancelled { BuildState::Cancelled } else { BuildState::Completed },
        };
        self.state = outcome.state;
        Ok(report)
    }

    /// Compare the physical memory behind this map with the one behind
    /// `other` and keep the difference index.
    pub fn diff_with(&mut self, other: &MemoryMap<'_>, options: &DiffOptions<'_>) -> Result<DiffReport> {
        let unavailable = |e: crate::memory::MemoryError| MapError::PhysicalMemoryUnavailable(e.to_string());
        let a = self.vmem.open_physical().map_err(unavailable)?;
        let b = other.vmem.open_physical().map_err(unavailable)?;
        let total = self.vmem.physical_size().min(other.vmem.physical_size());

        let span = crate::span_trace!("diff_maps", total);
        let _guard = span.enter();
        let (index, report) = diff::diff_streams(a, b, total, &self.config.diff, options)?;
        self.diff = Some(index);
        Ok(report)
    }

    pub fn difference_index(&self) -> Option<&DifferenceIndex> {
        self.diff.as_ref()
    }

    /// Objects of this map inside differing runs, matched against `other`.
    pub fn changed_objects(&self, other: &MemoryMap<'_>) -> Result<Vec<ChangedObject>> {
        let index = self
            .diff
            .as_ref()
            .ok_or_else(|| MapError::Internal("no difference index, compare the snapshots first".to_string()))?;
        let changes = diff::changed_objects(&self.state, &other.state, index, self.symbols);
        info!(changed = changes.len(), "Changed objects found");
        Ok(changes)
    }

    pub fn changed_types(&self, other: &MemoryMap<'_>) -> Result<BTreeMap<Option<TypeId>, TypeChanges>> {
        Ok(diff::changed_types(&self.changed_objects(other)?))
    }

    // --- virtual address queries ---

    pub fn objects_in_range(&self, start: u64, end: u64) -> Vec<VirtualEntry> {
        self.state.vindex.objects_in_range(start, end)
    }

    pub fn objects_at(&self, address: u64) -> Vec<VirtualEntry> {
        self.state.vindex.objects_at(address)
    }

    pub fn properties_of_range(&self, start: u64, end: u64) -> MemMapProperties {
        self.state.vindex.properties_of_range(start, end)
    }

    // --- physical address queries ---

    pub fn phys_objects_in_range(&self, start: u64, end: u64) -> Vec<PhysicalEntry> {
        self.state.pindex.objects_in_range(start, end)
    }

    pub fn phys_objects_at(&self, address: u64) -> Vec<PhysicalEntry> {
        self.state.pindex.objects_at(address)
    }

    pub fn phys_properties_of_range(&self, start: u64, end: u64) -> MemMapProperties {
        self.state.pindex.properties_of_range(start, end)
    }

    // --- side indices ---

    /// Nodes holding a pointer to `address`.
    pub fn pointers_to(&self, address: u64) -> &[NodeId] {
        self.state.pointers_to.get(&address).map_or(&[], Vec::as_slice)
    }

    pub fn type_instances(&self, type_id: TypeId) -> &[NodeId] {
        self.state.type_instances.get(&type_id).map_or(&[], Vec::as_slice)
    }

    pub fn unknown_pointers(&self) -> &BTreeMap<u64, u64> {
        &self.state.unknown_pointers
    }

    pub fn roots(&self) -> &[NodeId] {
        self.state.arena.roots()
    }

    pub fn node(&self, id: NodeId) -> Option<&MemoryMapNode> {
        self.state.arena.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.state.arena.len()
    }

    pub fn clear(&mut self) {
        self.state.clear();
        self.diff = None;
    }

    // --- dumps ---

    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        dump::dump(&self.state, self.symbols, path)
    }

    pub fn dump_tree<P: AsRef<Path>>(&self, path: P, root: NodeId, depth: usize) -> Result<()> {
        dump::dump_tree(&self.state, self.symbols, root, depth, path)
    }
}
