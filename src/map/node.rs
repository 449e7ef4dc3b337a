//! Graph nodes of a memory map and their probability policies.
//!
//! Nodes live in a [`NodeArena`] and refer to each other by [`NodeId`]. The
//! arena owns a strict tree: every node has at most one parent, and edges
//! that lead back into the existing tree are kept as non-owning returning
//! edges on the node they start from.

use crate::core::data_type::{TypeId, TypeTags};
use crate::core::instance::Instance;
use crate::rangetree::ValidityFlags;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parameters of the propagating probability policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropagationParams {
    pub encounter_multiplier: f32,
    pub epsilon: f32,
    pub max_steps: usize,
}

/// How node probabilities evolve after creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbabilityPolicy {
    /// Fixed at creation from the node's own instance.
    Independent,
    /// Recomputed from parent, children, candidate peers and encounters.
    Propagating(PropagationParams),
}

/// State only nodes under [`ProbabilityPolicy::Propagating`] carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationState {
    pub initial_probability: f32,
    pub has_candidates: bool,
    pub candidates_complete: bool,
    /// Sibling interpretations of the same parent slot.
    pub candidates: Vec<NodeId>,
    /// Edges from a slot of this node to nodes created elsewhere.
    pub returning_edges: HashMap<u64, Vec<NodeId>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMapNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub name: String,
    pub address: u64,
    /// Last byte of the object, clamped to the address space.
    pub end: u64,
    pub size: u64,
    /// `None` for slab objects known only by their size.
    pub type_id: Option<TypeId>,
    pub type_hash: u64,
    pub tags: TypeTags,
    pub probability: f32,
    pub seems_valid: bool,
    pub encountered: u32,
    /// Address or pointer value inside the parent that led here.
    pub addr_in_parent: u64,
    pub validity: ValidityFlags,
    pub ext: Option<PropagationState>,
}

impl MemoryMapNode {
    pub fn has_pending_candidates(&self) -> bool {
        self.ext
            .as_ref()
            .is_some_and(|e| e.has_candidates && !e.candidates_complete)
    }
}

/// Everything needed to create a node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub address: u64,
    pub end: u64,
    pub size: u64,
    pub type_id: Option<TypeId>,
    pub type_hash: u64,
    pub tags: TypeTags,
    pub probability: f32,
    pub seems_valid: bool,
    pub addr_in_parent: u64,
    pub has_candidates: bool,
}

/// Name of a node relative to its parent.
///
/// The instance's name path repeats the components the parent node already
/// shows; those are dropped.
pub fn node_name(parent_name: Option<&str>, inst: &Instance) -> String {
    let mut names: VecDeque<String> = inst.full_name_components().into();
    if let Some(parent) = parent_name {
        let array_prefix = format!("{parent}[");
        let is_element = names.front().is_some_and(|f| f.starts_with(&array_prefix));
        if is_element {
            if let Some(first) = names.front_mut() {
                first.replace_range(..parent.len(), "");
            }
        } else {
            if !parent.is_empty() {
                while let Some(first) = names.front() {
                    if parent == first.as_str() || parent.ends_with(&format!(".{first}")) {
                        break;
                    }
                    names.pop_front();
                }
            }
            names.pop_front();
        }
    }
    Vec::from(names).join(".")
}

#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<MemoryMapNode>,
    roots: Vec<NodeId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }

    pub fn get(&self, id: NodeId) -> Option<&MemoryMapNode> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut MemoryMapNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryMapNode> {
        self.nodes.iter()
    }

    /// Dot-joined names from the root down to `id`.
    pub fn full_name(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = self.get(id);
        while let Some(n) = cur {
            if !n.name.is_empty() {
                parts.push(n.name.as_str());
            }
            cur = n.parent.and_then(|p| self.get(p));
        }
        parts.reverse();
        parts.join(".").replace(".[", "[")
    }

    /// Create a node under `parent`, or a root when `parent` is `None`.
    ///
    /// Under the propagating policy the new node joins the candidate group of
    /// its slot and its probability is propagated through the tree.
    pub fn insert(&mut self, parent: Option<NodeId>, spec: NodeSpec, policy: &ProbabilityPolicy) -> NodeId {
        let id = NodeId(self.nodes.len());
        let ext = match policy {
            ProbabilityPolicy::Independent => None,
            ProbabilityPolicy::Propagating(_) => Some(PropagationState {
                initial_probability: spec.probability,
                has_candidates: spec.has_candidates,
                ..Default::default()
            }),
        };
        let probability = match policy {
            ProbabilityPolicy::Independent => spec.probability,
            ProbabilityPolicy::Propagating(_) => 1.0,
        };
        self.nodes.push(MemoryMapNode {
            id,
            parent,
            children: Vec::new(),
            name: spec.name,
            address: spec.address,
            end: spec.end,
            size: spec.size,
            type_id: spec.type_id,
            type_hash: spec.type_hash,
            tags: spec.tags,
            probability,
            seems_valid: spec.seems_valid,
            encountered: 1,
            addr_in_parent: spec.addr_in_parent,
            validity: ValidityFlags::empty(),
            ext,
        });

        match parent.and_then(|p| self.nodes.get_mut(p.0)) {
            Some(p) => p.children.push(id),
            None => self.roots.push(id),
        }

        if let ProbabilityPolicy::Propagating(params) = policy {
            self.link_candidates(id);
            self.update_probability(id, None, params);
        }
        id
    }

    /// Make `id` and every sibling sharing its parent slot known to each other.
    fn link_candidates(&mut self, id: NodeId) {
        let addr = self.nodes[id.0].addr_in_parent;
        let Some(parent) = self.nodes[id.0].parent else {
            return;
        };
        if addr == 0 {
            return;
        }
        let peers: Vec<NodeId> = self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .filter(|&c| c != id && self.nodes[c.0].addr_in_parent == addr)
            .collect();
        for peer in peers {
            if let Some(ext) = self.nodes[peer.0].ext.as_mut() {
                if !ext.candidates.contains(&id) {
                    ext.candidates.push(id);
                }
            }
            if let Some(ext) = self.nodes[id.0].ext.as_mut() {
                if !ext.candidates.contains(&peer) {
                    ext.candidates.push(peer);
                }
            }
        }
    }

    /// Probability a node contributes to its parent's average.
    pub fn candidate_probability(&self, id: NodeId) -> f32 {
        let node = &self.nodes[id.0];
        let Some(ext) = &node.ext else {
            return node.probability;
        };
        if ext.has_candidates && !ext.candidates_complete {
            return 1.0;
        }
        ext.candidates
            .iter()
            .map(|c| self.nodes[c.0].probability)
            .fold(node.probability, f32::max)
    }

    /// Recompute the probability of `id` and spread changes through the tree.
    ///
    /// A change travels to the parent and to the children, never back to the
    /// node that triggered it. Returns the number of nodes recomputed.
    pub fn update_probability(&mut self, id: NodeId, initiator: Option<NodeId>, params: &PropagationParams) -> usize {
        let mut work = VecDeque::from([(id, initiator)]);
        let mut steps = 0usize;

        while let Some((n, from)) = work.pop_front() {
            if steps >= params.max_steps {
                warn!(
                    node = %id,
                    pending = work.len() + 1,
                    "Probability propagation budget exhausted"
                );
                break;
            }
            steps += 1;

            let node = &self.nodes[n.0];
            let Some(ext) = &node.ext else { continue };
            let parent_prob = node
                .parent
                .map(|p| self.nodes[p.0].probability)
                .unwrap_or(1.0);
            let children_prob = if node.children.is_empty() {
                1.0
            } else {
                node.children
                    .iter()
                    .map(|&c| self.candidate_probability(c))
                    .sum::<f32>()
                    / node.children.len() as f32
            };
            let encounter = if node.encountered > 1 {
                params.encounter_multiplier * (node.encountered - 1) as f32
            } else {
                1.0
            };
            let prob = (ext.initial_probability * parent_prob * children_prob * encounter)
                .clamp(0.0, 1.0);

            if (prob - node.probability).abs() <= params.epsilon {
                continue;
            }
            let settled = !ext.has_candidates || ext.candidates_complete;
            let parent = node.parent;
            let children = node.children.clone();
            self.nodes[n.0].probability = prob;

            if !settled {
                continue;
            }
            if let Some(p) = parent {
                if from != Some(p) && (prob - parent_prob).abs() > params.epsilon {
                    work.push_back((p, Some(n)));
                }
            }
            work.extend(
                children
                    .into_iter()
                    .filter(|&c| Some(c) != from)
                    .map(|c| (c, Some(n))),
            );
        }
        steps
    }

    /// Close the candidate group of `id` and recompute every member.
    pub fn complete_candidates(&mut self, id: NodeId, policy: &ProbabilityPolicy) {
        let mut group = vec![id];
        if let Some(ext) = &self.nodes[id.0].ext {
            group.extend(ext.candidates.iter().copied());
        }
        for &n in &group {
            if let Some(ext) = self.nodes[n.0].ext.as_mut() {
                ext.candidates_complete = true;
            }
        }
        if let ProbabilityPolicy::Propagating(params) = policy {
            for &n in &group {
                self.update_probability(n, None, params);
            }
            // The parent's average changes once the group stops reporting 1.0.
            if let Some(p) = self.nodes[id.0].parent {
                self.update_probability(p, None, params);
            }
        }
    }

    /// Whether the slot at `addr_in_parent` of `parent` already led to `address`.
    pub fn member_processed(&self, parent: NodeId, addr_in_parent: u64, address: u64) -> bool {
        let node = &self.nodes[parent.0];
        let as_child = node.children.iter().any(|&c| {
            let child = &self.nodes[c.0];
            child.addr_in_parent == addr_in_parent && child.address == address
        });
        if as_child {
            return true;
        }
        node.ext
            .as_ref()
            .and_then(|e| e.returning_edges.get(&addr_in_parent))
            .is_some_and(|targets| targets.iter().any(|t| self.nodes[t.0].address == address))
    }

    /// Record that another path reached the existing node `id`.
    pub fn encounter(&mut self, id: NodeId, from: Option<NodeId>, addr_in_parent: u64, policy: &ProbabilityPolicy) {
        self.nodes[id.0].encountered += 1;
        if let Some(src) = from.filter(|&f| f != id) {
            if let Some(ext) = self.nodes[src.0].ext.as_mut() {
                ext.returning_edges.entry(addr_in_parent).or_default().push(id);
            }
        }
        if let ProbabilityPolicy::Propagating(params) = policy {
            self.update_probability(id, None, params);
        }
    }

    /// Overwrite the probability of a node, for slab-verified builds.
    pub fn set_probability(&mut self, id: NodeId, probability: f32) {
        if let Some(n) = self.nodes.get_mut(id.0) {
            n.probability = probability.clamp(0.0, 1.0);
        }
    }

    /// Mark `id` and its ancestors as plausible.
    pub fn set_seems_valid(&mut self, id: NodeId) {
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = &mut self.nodes[n.0];
            if node.seems_valid {
                break;
            }
            node.seems_valid = true;
            cur = node.parent;
        }
    }
}
