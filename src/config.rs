//! Configuration for map building, scoring and snapshot comparison.
//!
//! Every tunable of the builder lives here with a sensible default. The whole
//! tree is serde-serialisable so a driver can keep it in a JSON file.

use crate::error::{MapError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Master configuration for the memory-map builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Traversal and scheduling configuration.
    pub build: BuildConfig,
    /// Constants of the probability model.
    pub probability: ProbabilityConfig,
    /// Names and tolerances used by the heuristics.
    pub heuristics: HeuristicsConfig,
    /// Snapshot comparison configuration.
    pub diff: DiffConfig,
}

impl MapConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: MapConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the builder cannot work with.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(MapError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {v}"
                )))
            }
        };

        if self.build.worker_count == 0 {
            return Err(MapError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        unit("min_probability", self.build.min_probability)?;
        unit("deg_invalid_instance", self.probability.deg_invalid_instance)?;
        unit("deg_invalid_pointer", self.probability.deg_invalid_pointer)?;
        unit("deg_invalid_list_head", self.probability.deg_invalid_list_head)?;
        unit("deg_invalid_magic", self.probability.deg_invalid_magic)?;
        if self.probability.encounter_multiplier < 0.0 {
            return Err(MapError::InvalidConfig(
                "encounter_multiplier must not be negative".into(),
            ));
        }
        if self.diff.block_size == 0 || self.diff.granularity == 0 {
            return Err(MapError::InvalidConfig(
                "diff block_size and granularity must be non-zero".into(),
            ));
        }
        if self.diff.block_size as u64 % self.diff.granularity != 0 {
            return Err(MapError::InvalidConfig(format!(
                "diff granularity {} does not divide block size {}",
                self.diff.granularity, self.diff.block_size
            )));
        }
        Ok(())
    }
}

/// Which node flavour and traversal a build uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildMode {
    /// One-shot probabilities computed from each node's own instance.
    Independent,
    /// Probabilities propagate between parents, children and candidate peers.
    Propagating,
    /// Only objects listed in the auxiliary slab file become nodes.
    SlabCache,
}

/// Traversal and scheduling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Node flavour and traversal.
    pub mode: BuildMode,
    /// Nodes below this probability are neither queued nor expanded.
    pub min_probability: f32,
    /// Number of worker threads pulling from the shared queue.
    pub worker_count: usize,
    /// Minimum delay between two progress callbacks.
    pub progress_interval_ms: u64,
    /// Sleep between polls of an empty queue.
    pub poll_interval_ms: u64,
    /// Ceiling for radix-tree and IDR layer descent.
    pub max_radix_layers: u32,
    /// Ceiling for the number of elements walked in one list.
    pub max_list_length: usize,
    /// Ceiling for node updates triggered by one probability change.
    pub max_propagation_steps: usize,
    /// Probability differences below this are not propagated.
    pub probability_epsilon: f32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            mode: BuildMode::Independent,
            min_probability: 0.0,
            worker_count: 1,
            progress_interval_ms: 500,
            poll_interval_ms: 1,
            max_radix_layers: 32,
            max_list_length: 1_000_000,
            max_propagation_steps: 100_000,
            probability_epsilon: 1e-6,
        }
    }
}

/// Constants of the multiplicative probability model.
///
/// Each `deg_*` value is the fraction removed from the score when the
/// corresponding check fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbabilityConfig {
    pub deg_invalid_instance: f32,
    pub deg_invalid_pointer: f32,
    pub deg_invalid_list_head: f32,
    pub deg_invalid_magic: f32,
    /// Factor per additional path that reached an object.
    pub encounter_multiplier: f32,
}

impl Default for ProbabilityConfig {
    fn default() -> Self {
        Self {
            deg_invalid_instance: 0.99,
            deg_invalid_pointer: 0.90,
            deg_invalid_list_head: 0.90,
            deg_invalid_magic: 0.99,
            encounter_multiplier: 1.5,
        }
    }
}

/// Type names recognised as special containers, plus traversal tolerances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    pub list_head_type: String,
    pub hlist_head_type: String,
    pub hlist_node_type: String,
    pub radix_root_type: String,
    pub idr_type: String,
    /// Pointers to targets not aligned to this are rejected.
    pub pointer_alignment: u64,
    /// Global holding the per-CPU base offsets.
    pub per_cpu_offset_symbol: String,
    /// Global holding the number of possible CPUs.
    pub cpu_count_symbol: String,
    /// Name prefix that marks a per-CPU variable when the symbol source does
    /// not flag it.
    pub per_cpu_prefix: String,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            list_head_type: "struct list_head".to_string(),
            hlist_head_type: "struct hlist_head".to_string(),
            hlist_node_type: "struct hlist_node".to_string(),
            radix_root_type: "struct radix_tree_root".to_string(),
            idr_type: "struct idr".to_string(),
            pointer_alignment: 4,
            per_cpu_offset_symbol: "__per_cpu_offset".to_string(),
            cpu_count_symbol: "nr_cpu_ids".to_string(),
            per_cpu_prefix: "per_cpu__".to_string(),
        }
    }
}

/// Snapshot comparison configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Size of the aligned chunks that are marked as changed.
    pub granularity: u64,
    /// Bytes read from each stream per step.
    pub block_size: usize,
    /// Minimum delay between two progress callbacks.
    pub progress_interval_ms: u64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            granularity: 16,
            block_size: 1024,
            progress_interval_ms: 500,
        }
    }
}
