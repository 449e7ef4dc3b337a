//! Items and aggregates stored in the map's range trees.

use super::{RangeItem, RangeProperties};
use crate::core::data_type::{TypeId, TypeTags};
use crate::map::node::NodeId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Slab verification outcomes OR'ed into aggregates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ValidityFlags: u32 {
        const INVALID = 1 << 0;
        const NO_SLAB_TYPE = 1 << 1;
        const NOT_FOUND = 1 << 2;
        const VALID_GLOBAL = 1 << 3;
        const MAYBE_VALID = 1 << 4;
        const CONFLICT = 1 << 5;
        const EMBEDDED = 1 << 6;
        const VALID = 1 << 7;
    }
}

/// Aggregate over map nodes in an address range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemMapProperties {
    pub min_probability: f32,
    pub max_probability: f32,
    pub object_count: usize,
    pub type_tags: TypeTags,
    pub validity: ValidityFlags,
}

impl Default for MemMapProperties {
    fn default() -> Self {
        Self {
            min_probability: 1.0,
            max_probability: 0.0,
            object_count: 0,
            type_tags: TypeTags::empty(),
            validity: ValidityFlags::empty(),
        }
    }
}

impl MemMapProperties {
    pub fn is_empty(&self) -> bool {
        self.object_count == 0
    }

    fn add(&mut self, probability: f32, tags: TypeTags, validity: ValidityFlags) {
        self.min_probability = self.min_probability.min(probability);
        self.max_probability = self.max_probability.max(probability);
        self.object_count += 1;
        self.type_tags |= tags;
        self.validity |= validity;
    }

    fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        self.min_probability = self.min_probability.min(other.min_probability);
        self.max_probability = self.max_probability.max(other.max_probability);
        self.object_count += other.object_count;
        self.type_tags |= other.type_tags;
        self.validity |= other.validity;
    }
}

/// A node in the virtual-address index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualEntry {
    pub node: NodeId,
    pub start: u64,
    pub end: u64,
    pub type_id: Option<TypeId>,
    pub type_hash: u64,
    pub probability: f32,
    pub tags: TypeTags,
    pub validity: ValidityFlags,
}

impl RangeItem for VirtualEntry {
    fn start(&self) -> u64 {
        self.start
    }

    fn end(&self) -> u64 {
        self.end
    }
}

impl RangeProperties<VirtualEntry> for MemMapProperties {
    fn update(&mut self, item: &VirtualEntry) {
        self.add(item.probability, item.tags, item.validity);
    }

    fn unite(&mut self, other: &Self) {
        self.merge(other);
    }
}

/// One physically contiguous piece of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalEntry {
    pub node: NodeId,
    pub start: u64,
    pub end: u64,
    pub probability: f32,
    pub tags: TypeTags,
    pub validity: ValidityFlags,
}

impl RangeItem for PhysicalEntry {
    fn start(&self) -> u64 {
        self.start
    }

    fn end(&self) -> u64 {
        self.end
    }
}

impl RangeProperties<PhysicalEntry> for MemMapProperties {
    fn update(&mut self, item: &PhysicalEntry) {
        self.add(item.probability, item.tags, item.validity);
    }

    fn unite(&mut self, other: &Self) {
        self.merge(other);
    }
}

/// A maximal run of differing physical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiffEntry {
    pub start: u64,
    pub length: u64,
}

impl RangeItem for DiffEntry {
    fn start(&self) -> u64 {
        self.start
    }

    fn end(&self) -> u64 {
        self.start.saturating_add(self.length.max(1) - 1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffProperties {
    pub run_count: usize,
    pub bytes: u64,
}

impl RangeProperties<DiffEntry> for DiffProperties {
    fn update(&mut self, item: &DiffEntry) {
        self.run_count += 1;
        self.bytes += item.length;
    }

    fn unite(&mut self, other: &Self) {
        self.run_count += other.run_count;
        self.bytes += other.bytes;
    }
}
