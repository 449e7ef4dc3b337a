//! Priority-ordered traversal of the kernel object graph.
//!
//! The builder seeds the queue with the kernel's global variables and then
//! lets the coordinator's workers expand the most probable pending node
//! until the queue runs dry, the build is cancelled or the probability of
//! the popped nodes drops below the configured minimum. Intrusive lists,
//! radix trees and IDR layers are walked iteratively.
//!
//! Lock order: no lock is held while another is taken, with the single
//! exception of the address reservation, which is held around the
//! existence check and insertion of one node.

use crate::config::{BuildMode, MapConfig};
use crate::core::data_type::{DataTypeKind, TypeId, TypeTags};
use crate::core::instance::{Instance, Resolver, Unwrap};
use crate::core::symbols::{SymbolOrigin, SymbolSource, Variable};
use crate::error::{MapError, Result};
use crate::map::coordinator::{lock, read, write, BuildCoordinator, BuildProgressFn, Visit};
use crate::map::heuristics::Heuristics;
use crate::map::node::{node_name, MemoryMapNode, NodeArena, NodeId, NodeSpec, ProbabilityPolicy, PropagationParams};
use crate::map::probability::ProbabilityModel;
use crate::map::verifier::{ObjectValidity, SlabObjects};
use crate::memory::{PageMapping, VirtualMemory};
use crate::rangetree::{AddressRangeTree, MemMapProperties, PhysicalEntry, ValidityFlags, VirtualEntry};
use crate::rules::RuleOracle;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pointer chains followed by one dereference.
const MAX_POINTER_DEPTH: u32 = 8;
/// Embedded structs and arrays processed inline below one node.
const MAX_INLINE_DEPTH: u32 = 32;
/// Upper bound for `nr_cpu_ids` read from memory.
const MAX_CPUS: u64 = 8192;

/// Kinds that may become nodes.
fn interesting(kind: DataTypeKind) -> bool {
    matches!(
        kind,
        DataTypeKind::Array
            | DataTypeKind::Pointer
            | DataTypeKind::Struct
            | DataTypeKind::Union
            | DataTypeKind::FuncPointer
    )
}

/// Kinds whose nodes are expanded.
fn expandable(kind: DataTypeKind) -> bool {
    matches!(
        kind,
        DataTypeKind::Array | DataTypeKind::Pointer | DataTypeKind::Struct | DataTypeKind::Union
    )
}

/// Graph and indices of a map.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub arena: NodeArena,
    pub vindex: AddressRangeTree<VirtualEntry, MemMapProperties>,
    pub pindex: AddressRangeTree<PhysicalEntry, MemMapProperties>,
    pub pointers_to: HashMap<u64, Vec<NodeId>>,
    pub type_instances: HashMap<TypeId, Vec<NodeId>>,
    /// Slot address to pointer value for radix and IDR slots that could
    /// not be typed.
    pub unknown_pointers: BTreeMap<u64, u64>,
}

impl GraphState {
    pub fn clear(&mut self) {
        self.arena.clear();
        self.vindex.clear();
        self.pindex.clear();
        self.pointers_to.clear();
        self.type_instances.clear();
        self.unknown_pointers.clear();
    }
}

pub(crate) fn virtual_entry(node: &MemoryMapNode) -> VirtualEntry {
    VirtualEntry {
        node: node.id,
        start: node.address,
        end: node.end,
        type_id: node.type_id,
        type_hash: node.type_hash,
        probability: node.probability,
        tags: node.tags,
        validity: node.validity,
    }
}

/// Collaborators and settings of one build.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub symbols: &'a dyn SymbolSource,
    pub vmem: &'a dyn VirtualMemory,
    pub rules: Option<&'a dyn RuleOracle>,
    pub config: &'a MapConfig,
    pub slabs: Option<&'a SlabObjects>,
}

/// What a finished build hands back.
#[derive(Debug)]
pub(crate) struct BuildOutcome {
    pub state: GraphState,
    pub roots: usize,
    pub processed: usize,
    pub cancelled: bool,
    pub uses_rules: bool,
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Added {
    New(NodeId),
    Existing(NodeId),
}

impl Added {
    fn id(self) -> NodeId {
        match self {
            Added::New(id) | Added::Existing(id) => id,
        }
    }
}

/// The node being expanded.
#[derive(Debug, Clone)]
struct Anchor {
    id: NodeId,
    address: u64,
    end: u64,
    size: u64,
    type_id: Option<TypeId>,
    name: String,
    probability: f32,
}

pub(crate) struct GraphBuilder<'a> {
    ctx: BuildContext<'a>,
    heur: Heuristics<'a>,
    model: ProbabilityModel<'a>,
    policy: ProbabilityPolicy,
    coord: BuildCoordinator,
    arena: Mutex<NodeArena>,
    vindex: RwLock<AddressRangeTree<VirtualEntry, MemMapProperties>>,
    pindex: Mutex<AddressRangeTree<PhysicalEntry, MemMapProperties>>,
    pointers_to: Mutex<HashMap<u64, Vec<NodeId>>>,
    type_instances: Mutex<HashMap<TypeId, Vec<NodeId>>>,
    unknown_pointers: Mutex<BTreeMap<u64, u64>>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ctx: BuildContext<'a>, cancel: CancellationToken) -> Self {
        let config = ctx.config;
        let resolver = Resolver::new(ctx.symbols, ctx.vmem);
        let heur = Heuristics::new(resolver, &config.heuristics, ctx.rules);
        let model = ProbabilityModel::new(heur, &config.probability);
        let policy = match config.build.mode {
            BuildMode::Propagating => ProbabilityPolicy::Propagating(PropagationParams {
                encounter_multiplier: config.probability.encounter_multiplier,
                epsilon: config.build.probability_epsilon,
                max_steps: config.build.max_propagation_steps,
            }),
            BuildMode::Independent | BuildMode::SlabCache => ProbabilityPolicy::Independent,
        };
        Self {
            ctx,
            heur,
            model,
            policy,
            coord: BuildCoordinator::new(config.build.worker_count, config.build.min_probability, cancel),
            arena: Mutex::new(NodeArena::new()),
            vindex: RwLock::new(AddressRangeTree::new()),
            pindex: Mutex::new(AddressRangeTree::new()),
            pointers_to: Mutex::new(HashMap::new()),
            type_instances: Mutex::new(HashMap::new()),
            unknown_pointers: Mutex::new(BTreeMap::new()),
        }
    }

    fn resolver(&self) -> &Resolver<'a> {
        &self.heur.resolver
    }

    /// Seed, traverse and index.
    pub fn run(self, progress: Option<BuildProgressFn<'_>>) -> Result<BuildOutcome> {
        let build = &self.ctx.config.build;
        let workers = self.coord.workers();
        info!(
            mode = ?build.mode,
            workers,
            min_probability = build.min_probability,
            "Building memory map"
        );
        if self.heur.uses_rules() {
            info!("Resolving ambiguous types with the rule engine");
        } else {
            info!("Resolving ambiguous types from structural candidates");
        }

        let previous_safety = self.ctx.vmem.set_thread_safety(workers > 1);
        let result = self.traverse(progress);
        self.ctx.vmem.set_thread_safety(previous_safety);
        let roots = result?;

        let processed = self.coord.processed();
        let cancelled = self.coord.is_cancelled();
        let uses_rules = self.heur.uses_rules();
        if self.coord.reached_threshold() {
            debug!(
                last_probability = self.coord.last_probability(),
                queued = self.coord.queue().len(),
                "Stopped at minimum probability"
            );
        }
        let state = self.into_state();
        info!(
            nodes = state.arena.len(),
            processed,
            physical = state.pindex.len(),
            unknown_pointers = state.unknown_pointers.len(),
            cancelled,
            "Memory map built"
        );
        Ok(BuildOutcome {
            state,
            roots,
            processed,
            cancelled,
            uses_rules,
            workers,
        })
    }

    fn traverse(&self, progress: Option<BuildProgressFn<'_>>) -> Result<usize> {
        let build = &self.ctx.config.build;
        if build.mode == BuildMode::SlabCache {
            let slabs = self.ctx.slabs.ok_or(MapError::MissingCollaborator("slab objects"))?;
            let roots = self.seed_slab_objects(slabs);
            info!(roots, "Slab objects added");
            return Ok(roots);
        }

        let functions = self.seed_functions();
        let roots = self.seed_variables();
        info!(roots, functions, "Roots seeded");

        self.coord.run(
            Duration::from_millis(build.poll_interval_ms),
            Duration::from_millis(build.progress_interval_ms),
            progress,
            |worker, node| self.visit(worker, node),
        )?;
        Ok(roots)
    }

    /// Rebuild both trees from the final node probabilities.
    fn into_state(self) -> GraphState {
        let arena = self.arena.into_inner().unwrap_or_else(PoisonError::into_inner);
        let pieces = self.pindex.into_inner().unwrap_or_else(PoisonError::into_inner);

        let mut vindex = AddressRangeTree::new();
        for node in arena.iter() {
            vindex.insert(virtual_entry(node));
        }
        let mut pindex = AddressRangeTree::new();
        for piece in pieces.iter() {
            let mut piece = piece.clone();
            if let Some(node) = arena.get(piece.node) {
                piece.probability = node.probability;
                piece.validity = node.validity;
            }
            pindex.insert(piece);
        }
        GraphState {
            arena,
            vindex,
            pindex,
            pointers_to: self.pointers_to.into_inner().unwrap_or_else(PoisonError::into_inner),
            type_instances: self.type_instances.into_inner().unwrap_or_else(PoisonError::into_inner),
            unknown_pointers: self.unknown_pointers.into_inner().unwrap_or_else(PoisonError::into_inner),
        }
    }

    // --- seeding ---

    /// Offsets of the per-CPU areas, `None` where a CPU has none.
    fn per_cpu_offsets(&self) -> Vec<Option<u64>> {
        let r = self.resolver();
        let cfg = &self.ctx.config.heuristics;
        let cpus = self
            .ctx
            .symbols
            .variable(&cfg.cpu_count_symbol)
            .and_then(|v| {
                let size = match r.size_of(&Instance::new(v.address, v.type_id, v.name.clone())) {
                    s @ (1 | 2 | 4 | 8) => s as usize,
                    _ => 4,
                };
                self.ctx.vmem.read_uint(v.address, size).ok()
            })
            .filter(|&n| n > 0 && n <= MAX_CPUS)
            .unwrap_or(1);

        let table = self.ctx.symbols.variable(&cfg.per_cpu_offset_symbol);
        let ptr = r.pointer_size();
        let missing = if ptr == 4 { u32::MAX as u64 } else { u64::MAX };
        (0..cpus)
            .map(|cpu| {
                let var = table?;
                let value = self.ctx.vmem.read_pointer(var.address + cpu * ptr).ok()?;
                (value != missing).then_some(value)
            })
            .collect()
    }

    fn seed_variables(&self) -> usize {
        let prefix = &self.ctx.config.heuristics.per_cpu_prefix;
        let offsets = self.per_cpu_offsets();
        let mut roots = 0;
        for var in self.ctx.symbols.variables() {
            if self.coord.is_cancelled() {
                break;
            }
            if var.origin == SymbolOrigin::Module {
                continue;
            }
            if var.per_cpu || var.name.starts_with(prefix.as_str()) {
                for (cpu, offset) in offsets.iter().enumerate() {
                    let address = offset.map_or(var.address, |o| var.address.wrapping_add(o));
                    let name = if offsets.len() > 1 {
                        format!("{}[{cpu}]", var.name)
                    } else {
                        var.name.clone()
                    };
                    roots += usize::from(self.add_root(var, address, name));
                }
            } else {
                roots += usize::from(self.add_root(var, var.address, var.name.clone()));
            }
        }
        roots
    }

    fn add_root(&self, var: &Variable, address: u64, name: String) -> bool {
        let inst = Instance::new(address, var.type_id, name);
        if inst.is_null() || !self.heur.has_valid_address(&inst, false) || !self.resolver().is_accessible(&inst) {
            trace!(variable = %var.name, "Root variable skipped");
            return false;
        }
        matches!(self.add_child(0, inst, None, 0, false, true), Some(Added::New(_)))
    }

    /// Functions go into the index unexpanded.
    fn seed_functions(&self) -> usize {
        let r = self.resolver();
        let mut count = 0;
        for f in self.ctx.symbols.functions() {
            if f.address == 0 {
                continue;
            }
            let size = r.strip_lexical(f.type_id).map_or(0, |t| t.size);
            let hash = r.strip_lexical(f.type_id).map_or(0, |t| t.hash);
            let spec = NodeSpec {
                name: f.name.clone(),
                address: f.address,
                end: end_of(f.address, size, r.specs().vaddr_space_end),
                size,
                type_id: Some(f.type_id),
                type_hash: hash,
                tags: TypeTags::FUNCTION,
                probability: 1.0,
                seems_valid: true,
                addr_in_parent: 0,
                has_candidates: false,
            };
            self.insert_node(None, spec, ValidityFlags::empty(), None);
            count += 1;
        }
        count
    }

    /// Slab objects become roots; nothing is followed from them.
    fn seed_slab_objects(&self, slabs: &SlabObjects) -> usize {
        let vend = self.resolver().specs().vaddr_space_end;
        let mut roots = 0;
        for obj in slabs.objects() {
            if self.coord.is_cancelled() {
                break;
            }
            match obj.cache.type_id {
                Some(type_id) => {
                    let inst = Instance::new(obj.address, type_id, obj.cache.name.clone());
                    if let Some(Added::New(_)) = self.add_child(0, inst, None, 0, false, false) {
                        roots += 1;
                    }
                }
                None => {
                    let size = obj.cache.object_size.unwrap_or(0);
                    let spec = NodeSpec {
                        name: obj.cache.name.clone(),
                        address: obj.address,
                        end: end_of(obj.address, size, vend),
                        size,
                        type_id: None,
                        type_hash: 0,
                        tags: TypeTags::empty(),
                        probability: 1.0,
                        seems_valid: false,
                        addr_in_parent: 0,
                        has_candidates: false,
                    };
                    self.insert_node(None, spec, ObjectValidity::MaybeValid.flag(), None);
                    roots += 1;
                }
            }
        }
        roots
    }

    // --- node creation ---

    /// Create a node for `inst` below `parent` unless one already holds it.
    fn add_child(
        &self,
        worker: usize,
        inst: Instance,
        parent: Option<NodeId>,
        addr_in_parent: u64,
        has_candidates: bool,
        enqueue: bool,
    ) -> Option<Added> {
        let r = self.resolver();
        let dt = r.base_type(&inst)?;
        if !interesting(dt.kind) {
            return None;
        }
        let inst = inst.with_type(dt.id);

        let _reservation = self.coord.reserve(worker, inst.address);
        if let Some(existing) = self.find_existing(&inst, dt.hash) {
            lock(&self.arena).encounter(existing, parent, addr_in_parent, &self.policy);
            return Some(Added::Existing(existing));
        }
        if inst.is_null() || dt.size == 0 {
            return None;
        }

        let probability = self.model.probability(&inst);
        let validity = self
            .ctx
            .slabs
            .map(|s| s.object_validity(r, &inst).flag())
            .unwrap_or_default();
        let spec = NodeSpec {
            name: String::new(),
            address: inst.address,
            end: r.end_address(&inst),
            size: dt.size,
            type_id: Some(dt.id),
            type_hash: dt.hash,
            tags: dt.tags(),
            probability,
            seems_valid: false,
            addr_in_parent,
            has_candidates,
        };
        let (id, current) = self.insert_node(parent, spec, validity, Some(&inst));

        if enqueue && expandable(dt.kind) && current > self.coord.min_probability() && r.is_accessible(&inst) {
            self.coord.enqueue(id, current);
        }
        trace!(
            node = %id,
            address = format_args!("{:#x}", inst.address),
            type_name = %dt.pretty_name(),
            probability = current,
            "Node added"
        );
        Some(Added::New(id))
    }

    /// Insert into the arena and both side indices. The name is derived
    /// from `inst` relative to the parent when given.
    fn insert_node(
        &self,
        parent: Option<NodeId>,
        mut spec: NodeSpec,
        validity: ValidityFlags,
        inst: Option<&Instance>,
    ) -> (NodeId, f32) {
        let type_id = spec.type_id;
        let (id, entry) = {
            let mut arena = lock(&self.arena);
            if let Some(inst) = inst {
                let parent_name = parent.and_then(|p| arena.get(p)).map(|n| n.name.as_str());
                spec.name = node_name(parent_name, inst);
            }
            let id = arena.insert(parent, spec, &self.policy);
            let node = arena.get_mut(id).map(|n| {
                n.validity = validity;
                virtual_entry(n)
            });
            (id, node)
        };
        let probability = entry.as_ref().map_or(0.0, |e| e.probability);
        if let Some(entry) = entry {
            write(&self.vindex).insert(entry);
        }
        if let Some(t) = type_id {
            lock(&self.type_instances).entry(t).or_default().push(id);
        }
        self.coord.node_created();
        (id, probability)
    }

    /// An existing node that is, or embeds, `inst`. Failing that, a
    /// function the instance overlaps.
    fn find_existing(&self, inst: &Instance, hash: u64) -> Option<NodeId> {
        let r = self.resolver();
        let end = r.end_address(inst);
        let overlapping = read(&self.vindex).objects_in_range(inst.address, end);
        let mut function = None;
        for entry in &overlapping {
            if entry.tags.contains(TypeTags::FUNCTION) {
                function.get_or_insert(entry.node);
                continue;
            }
            let Some(t) = entry.type_id.and_then(|id| r.strip_lexical(id)) else {
                continue;
            };
            if r.embeds(t, entry.start, inst.address, hash) {
                return Some(entry.node);
            }
        }
        function
    }

    // --- expansion ---

    fn anchor(&self, id: NodeId) -> Option<Anchor> {
        lock(&self.arena).get(id).map(|n| Anchor {
            id,
            address: n.address,
            end: n.end,
            size: n.size,
            type_id: n.type_id,
            name: n.name.clone(),
            probability: n.probability,
        })
    }

    fn visit(&self, worker: usize, id: NodeId) -> Visit {
        let Some(anchor) = self.anchor(id) else {
            return Visit::Expanded(0.0);
        };
        if anchor.probability < self.coord.min_probability() {
            return Visit::BelowThreshold(anchor.probability);
        }

        match self.physical_pieces(&anchor) {
            Ok(pieces) => {
                let mut pindex = lock(&self.pindex);
                for piece in pieces {
                    pindex.insert(piece);
                }
            }
            Err(address) => {
                trace!(node = %id, address = format_args!("{address:#x}"), "No physical mapping, node skipped");
                return Visit::Expanded(anchor.probability);
            }
        }

        let Some(type_id) = anchor.type_id else {
            return Visit::Expanded(anchor.probability);
        };
        trace!(node = %id, name = %anchor.name, probability = anchor.probability, "Expanding node");
        let inst = Instance::new(anchor.address, type_id, anchor.name.clone());
        self.process_node(worker, &anchor, &inst, 0);
        Visit::Expanded(anchor.probability)
    }

    /// Physical ranges backing a node, split at page boundaries when paged.
    /// Fails with the first untranslatable address.
    fn physical_pieces(&self, anchor: &Anchor) -> std::result::Result<Vec<PhysicalEntry>, u64> {
        if anchor.size == 0 {
            return Ok(Vec::new());
        }
        let vmem = self.ctx.vmem;
        let tags = self
            .lock_node(anchor.id, |n| (n.tags, n.validity))
            .unwrap_or((TypeTags::empty(), ValidityFlags::empty()));
        let piece = |start: u64, len: u64| PhysicalEntry {
            node: anchor.id,
            start,
            end: start.saturating_add(len - 1),
            probability: anchor.probability,
            tags: tags.0,
            validity: tags.1,
        };

        let mut pieces = Vec::new();
        let mut virt = anchor.address;
        let mut remaining = anchor.size;
        while remaining > 0 {
            let (phys, mapping) = vmem.virtual_to_physical(virt).map_err(|_| virt)?;
            match mapping {
                // A mapping without a page size cannot be split.
                PageMapping::Linear | PageMapping::Paged { page_size: 0 } => {
                    pieces.push(piece(phys, remaining));
                    break;
                }
                PageMapping::Paged { page_size } => {
                    let on_page = (page_size - virt % page_size).min(remaining);
                    pieces.push(piece(phys, on_page));
                    virt = virt.wrapping_add(on_page);
                    remaining -= on_page;
                }
            }
        }
        Ok(pieces)
    }

    fn lock_node<T>(&self, id: NodeId, f: impl FnOnce(&MemoryMapNode) -> T) -> Option<T> {
        lock(&self.arena).get(id).map(f)
    }

    fn process_node(&self, worker: usize, anchor: &Anchor, inst: &Instance, depth: u32) {
        if depth > MAX_INLINE_DEPTH {
            return;
        }
        let h = &self.heur;
        let Some(dt) = self.resolver().base_type(inst) else {
            return;
        };
        match dt.kind {
            DataTypeKind::Pointer => self.process_pointer(worker, anchor, inst),
            DataTypeKind::Array => self.process_array(worker, anchor, inst, depth),
            DataTypeKind::Struct | DataTypeKind::Union if !dt.members().is_empty() => {
                if h.is_list_head(inst) || h.is_hlist_head(inst) {
                    self.process_list_head(worker, anchor, inst);
                } else if h.is_hlist_node(inst) {
                    // Reached through the list walk of its head.
                } else if h.is_radix_root(inst) {
                    self.process_radix_tree(worker, anchor, inst);
                } else if h.is_idr(inst) {
                    self.process_idr(worker, anchor, inst);
                } else {
                    self.process_struct(worker, anchor, inst, depth);
                }
            }
            _ => {}
        }
    }

    /// Target of a pointer worth following from `anchor`, recorded in the
    /// pointer index.
    fn follow_target(&self, anchor: &Anchor, inst: &Instance) -> Option<u64> {
        let h = &self.heur;
        let r = self.resolver();
        if r.kind(inst) != Some(DataTypeKind::Pointer) || h.is_function_pointer(inst) {
            return None;
        }
        if !h.valid_pointer(inst, false) || h.user_land_pointer(inst) {
            return None;
        }
        let target = r.read_pointer(inst).ok()?;
        if target == inst.address || (anchor.address..=anchor.end).contains(&target) {
            return None;
        }
        lock(&self.pointers_to).entry(target).or_default().push(anchor.id);
        Some(target)
    }

    fn process_pointer(&self, worker: usize, anchor: &Anchor, inst: &Instance) {
        if self.follow_target(anchor, inst).is_none() {
            return;
        }
        let (target, derefs) = self.resolver().dereference(inst, Unwrap::LexicalAndPointers, MAX_POINTER_DEPTH);
        if derefs > 0 && !target.is_null() {
            self.add_child(worker, target, Some(anchor.id), inst.address, false, true);
        }
    }

    fn process_array(&self, worker: usize, anchor: &Anchor, inst: &Instance, depth: u32) {
        let r = self.resolver();
        let Some(len) = r.array_length(inst) else {
            return;
        };
        let elem_kind = r
            .base_type(inst)
            .and_then(|t| t.target())
            .and_then(|e| r.strip_lexical(e))
            .map(|t| t.kind);
        if !elem_kind.is_some_and(expandable) {
            return;
        }
        for i in 0..len {
            if self.coord.is_cancelled() {
                return;
            }
            let Some(elem) = r.array_elem(inst, i) else {
                break;
            };
            if self.heur.has_valid_address(&elem, false) {
                self.process_node(worker, anchor, &elem, depth + 1);
            }
        }
    }

    fn process_struct(&self, worker: usize, anchor: &Anchor, inst: &Instance, depth: u32) {
        let h = &self.heur;
        let r = self.resolver();
        let Some(dt) = r.base_type(inst) else {
            return;
        };
        for idx in 0..dt.members().len() {
            if self.coord.is_cancelled() {
                return;
            }
            let Some(member) = r.member(inst, idx) else {
                continue;
            };
            // Ambiguous and deferred verdicts count as no rule at all.
            let matched = h.rules().and_then(|rules| rules.resolve(inst, &[idx]).into_match());
            if let Some(resolved) = matched {
                let substituted = r.base_type(&resolved).map(|t| t.id) != r.base_type(&member).map(|t| t.id)
                    || resolved.address != member.address;
                if substituted {
                    self.add_child(worker, resolved, Some(anchor.id), member.address, false, true);
                } else {
                    self.process_node(worker, anchor, &member, depth + 1);
                }
                continue;
            }
            if !r.member_candidates(inst, idx).is_empty() && r.kind(&member) == Some(DataTypeKind::Pointer) {
                self.process_candidates(worker, anchor, inst, idx, &member, depth);
                continue;
            }
            self.process_node(worker, anchor, &member, depth + 1);
        }
    }

    /// Member `idx` of `parent` has candidate types. Every compatible
    /// candidate becomes a node in the member's slot; a single one is taken
    /// as the answer.
    fn process_candidates(
        &self,
        worker: usize,
        anchor: &Anchor,
        parent: &Instance,
        idx: usize,
        member: &Instance,
        depth: u32,
    ) {
        let h = &self.heur;
        let r = self.resolver();
        if self.follow_target(anchor, member).is_none() {
            return;
        }

        let mut compatible = Vec::new();
        for ci in 0..r.member_candidates(parent, idx).len() {
            let Some(cand) = r.member_candidate(parent, idx, ci) else {
                continue;
            };
            let cand = match r.kind(&cand) {
                Some(DataTypeKind::Void) | None => continue,
                Some(DataTypeKind::Pointer) => {
                    let (d, n) = r.dereference(&cand, Unwrap::LexicalAndPointers, MAX_POINTER_DEPTH);
                    if n == 0 || d.is_null() {
                        continue;
                    }
                    d
                }
                Some(_) => cand,
            };
            if h.compatible_candidate(member, &cand) {
                compatible.push(cand);
            }
        }

        match compatible.len() {
            0 => {
                let (target, derefs) = r.dereference(member, Unwrap::LexicalAndPointers, MAX_POINTER_DEPTH);
                if derefs > 0 && !target.is_null() {
                    self.add_child(worker, target, Some(anchor.id), member.address, false, true);
                }
            }
            1 => {
                if let Some(cand) = compatible.pop() {
                    self.add_child(worker, cand, Some(anchor.id), member.address, false, true);
                }
            }
            n => {
                debug!(member = %member.full_name(), candidates = n, depth, "Adding candidate group");
                let mut last = None;
                let (target, derefs) = r.dereference(member, Unwrap::LexicalAndPointers, MAX_POINTER_DEPTH);
                let declared = (derefs > 0 && !target.is_null()).then_some(target);
                for inst in declared.into_iter().chain(compatible) {
                    if let Some(Added::New(id)) = self.add_child(worker, inst, Some(anchor.id), member.address, true, true) {
                        last = Some(id);
                    }
                }
                if let Some(id) = last {
                    lock(&self.arena).complete_candidates(id, &self.policy);
                }
            }
        }
    }

    // --- lists ---

    fn process_list_head(&self, worker: usize, anchor: &Anchor, head: &Instance) {
        let h = &self.heur;
        let r = self.resolver();
        let Some(next) = r.member(head, 0) else {
            return;
        };
        if !h.valid_pointer(&next, false) {
            return;
        }
        if h.is_list_head(head) {
            if !h.valid_list_head(head, false) {
                return;
            }
            let Some(prev) = r.member(head, 1) else {
                return;
            };
            if !h.valid_pointer(&prev, false) {
                return;
            }
            // An empty list points back at itself.
            if r.read_pointer(&next).ok() == Some(head.address) {
                return;
            }
        }
        let Some(parent_type) = anchor.type_id else {
            return;
        };
        if !h.is_head_of_list(anchor.address, parent_type, head) {
            return;
        }
        let Some(first) = h.list_next_object(head) else {
            return;
        };
        if !h.is_valid_instance(&first) {
            return;
        }
        self.process_list(worker, anchor, head, first);
    }

    /// Walk the list anchored at `head`, adding one child of `anchor` per
    /// element. `first` is the first element, typed as its container.
    fn process_list(&self, worker: usize, anchor: &Anchor, head: &Instance, first: Instance) {
        let h = &self.heur;
        let r = self.resolver();
        if !h.is_valid_instance(head) || !h.is_valid_instance(&first) {
            return;
        }
        let hlist = h.is_hlist_head(head);
        if !hlist && !h.valid_list_head(head, false) {
            return;
        }
        if lock(&self.arena).member_processed(anchor.id, head.address, first.address) {
            return;
        }
        // Elements that are bare links tell nothing about their container.
        if h.is_list_head(&first) || h.is_hlist_node(&first) {
            return;
        }
        let Some(head_next) = r.member(head, 0).and_then(|m| r.read_pointer(&m).ok()) else {
            return;
        };
        let link_offset = head_next.wrapping_sub(first.address);
        let max_len = self.ctx.config.build.max_list_length;

        let mut element = first;
        let mut slot = head.address;
        let mut visited = HashSet::new();
        let mut renamed = false;
        loop {
            if self.coord.is_cancelled() {
                return;
            }
            if visited.len() >= max_len {
                warn!(head = format_args!("{:#x}", head.address), max_len, "List length limit reached");
                return;
            }
            if !visited.insert(element.address) {
                debug!(head = format_args!("{:#x}", head.address), "List does not close at its head");
                return;
            }

            let Some(link) = self.link_at(&element, link_offset, hlist) else {
                debug!(
                    element = format_args!("{:#x}", element.address),
                    offset = link_offset,
                    "No list link at offset, list walk aborted"
                );
                return;
            };
            if h.is_valid_instance(&element) {
                self.add_child(worker, element.clone(), Some(anchor.id), slot, false, true);
            }

            let sound = if hlist { h.valid_hlist_node(&link) } else { h.valid_list_head(&link, false) };
            if !sound {
                debug!(link = format_args!("{:#x}", link.address), "Broken list link, list walk aborted");
                return;
            }
            let Some(next) = r.member(&link, 0).and_then(|m| r.read_pointer(&m).ok()) else {
                return;
            };
            if next == head.address || h.default_value(next) {
                return;
            }

            slot = link.address;
            element = element.with_address(next.wrapping_sub(link_offset));
            if !renamed {
                element.name = format!("{}.{}", link.name, element.name);
                renamed = true;
            }
        }
    }

    /// The innermost list link starting `offset` bytes into `inst`.
    fn link_at(&self, inst: &Instance, offset: u64, hlist: bool) -> Option<Instance> {
        let mut found = Vec::new();
        self.structs_at(inst, offset, 0, &mut found);
        found
            .into_iter()
            .filter(|i| {
                if hlist {
                    self.heur.is_hlist_node(i)
                } else {
                    self.heur.is_list_head(i)
                }
            })
            .last()
    }

    /// Every struct or union that starts `offset` bytes into `inst`,
    /// outermost first. All members of a union are searched.
    fn structs_at(&self, inst: &Instance, offset: u64, depth: u32, out: &mut Vec<Instance>) {
        let r = self.resolver();
        let Some(dt) = r.base_type(inst) else {
            return;
        };
        if !dt.is_composite() || depth > MAX_INLINE_DEPTH {
            return;
        }
        if offset == 0 {
            out.push(inst.clone());
        }
        for (idx, m) in dt.members().iter().enumerate() {
            let size = r.strip_lexical(m.type_id).map_or(0, |t| t.size);
            if size == 0 || offset < m.offset || offset - m.offset >= size {
                continue;
            }
            if let Some(member) = r.member(inst, idx) {
                self.structs_at(&member, offset - m.offset, depth + 1, out);
            }
            if dt.kind == DataTypeKind::Struct {
                break;
            }
        }
    }

    // --- radix trees and IDRs ---

    fn record_unknown(&self, slot: u64, value: u64) {
        lock(&self.unknown_pointers).insert(slot, value);
    }

    fn process_radix_tree(&self, worker: usize, anchor: &Anchor, root: &Instance) {
        let h = &self.heur;
        let r = self.resolver();
        let Some(rnode) = r.member_by_name(root, "rnode") else {
            return;
        };
        let Ok(raw) = r.read_pointer(&rnode) else {
            return;
        };
        if raw == 0 {
            return;
        }
        let Some(node_type) = r.base_type(&rnode).and_then(|t| t.target()) else {
            return;
        };
        let mut top = rnode.with_type(node_type).with_address(raw & !1);
        top.name = format!("{}.rnode", root.name);
        if !h.is_valid_instance(&top) || r.kind(&top) == Some(DataTypeKind::Pointer) {
            return;
        }

        if raw & 1 == 1 {
            self.process_radix_nodes(worker, anchor, top);
            return;
        }
        // A direct pointer holds the only item of the tree.
        let hits = read(&self.vindex).objects_at(raw);
        match hits.as_slice() {
            [only] => lock(&self.arena).encounter(only.node, Some(anchor.id), rnode.address, &self.policy),
            [] => self.record_unknown(rnode.address, raw),
            _ => {}
        }
    }

    fn process_radix_nodes(&self, worker: usize, anchor: &Anchor, top: Instance) {
        let h = &self.heur;
        let r = self.resolver();
        let max_layers = self.ctx.config.build.max_radix_layers;
        let mut visited = HashSet::new();
        let mut stack = vec![(top, anchor.id, 0u32)];

        while let Some((rn, parent, layer)) = stack.pop() {
            if self.coord.is_cancelled() {
                return;
            }
            if layer >= max_layers {
                warn!(node = format_args!("{:#x}", rn.address), max_layers, "Radix tree deeper than allowed");
                continue;
            }
            if !visited.insert(rn.address) {
                continue;
            }
            let id = self
                .add_child(worker, rn.clone(), Some(parent), rn.address, false, false)
                .map_or(parent, Added::id);

            let Some(height) = r.member_by_name(&rn, "height").and_then(|m| r.read_uint(&m).ok()) else {
                continue;
            };
            let Some(slots) = r.member_by_name(&rn, "slots") else {
                continue;
            };
            let len = r.array_length(&slots).unwrap_or(0);
            for i in 0..len {
                let Some(slot) = r.array_elem(&slots, i) else {
                    break;
                };
                let Ok(value) = r.read_pointer(&slot) else {
                    continue;
                };
                let mut child = rn.with_address(value & !1);
                child.name = format!("{}slots[{i}]", rn.name);
                if !h.has_valid_address(&child, false) {
                    continue;
                }
                match height {
                    0 => {}
                    1 => self.record_unknown(slot.address, value),
                    _ => stack.push((child, id, layer + 1)),
                }
            }
        }
    }

    fn process_idr(&self, worker: usize, anchor: &Anchor, idr: &Instance) {
        let h = &self.heur;
        let r = self.resolver();
        if let Some(top) = r.member_by_name(idr, "top") {
            let (layer, derefs) = r.dereference(&top, Unwrap::LexicalAndPointers, 1);
            let layers = r.member_by_name(idr, "layers").and_then(|m| r.read_uint(&m).ok());
            if let Some(layers) = layers {
                if derefs > 0 && h.is_valid_instance(&layer) && r.kind(&layer) != Some(DataTypeKind::Pointer) {
                    self.process_idr_layers(worker, anchor, layer, layers);
                }
            }
        }
        if let Some(free) = r.member_by_name(idr, "id_free") {
            if h.valid_pointer(&free, false) {
                self.process_pointer(worker, anchor, &free);
            }
        }
    }

    fn process_idr_layers(&self, worker: usize, anchor: &Anchor, top: Instance, layers: u64) {
        let h = &self.heur;
        let r = self.resolver();
        let max_layers = u64::from(self.ctx.config.build.max_radix_layers);
        if layers > max_layers {
            warn!(layers, max_layers, "IDR layer count exceeds limit, not walked");
            return;
        }
        let mut stack = vec![(top, anchor.id, layers)];
        while let Some((layer, parent, remaining)) = stack.pop() {
            if self.coord.is_cancelled() {
                return;
            }
            let id = self
                .add_child(worker, layer.clone(), Some(parent), layer.address, false, false)
                .map_or(parent, Added::id);
            let Some(ary) = r.member_by_name(&layer, "ary") else {
                continue;
            };
            let len = r.array_length(&ary).unwrap_or(0);
            for i in 0..len {
                let Some(slot) = r.array_elem(&ary, i) else {
                    break;
                };
                let (target, derefs) = r.dereference(&slot, Unwrap::LexicalAndPointers, 1);
                if derefs == 0 || !h.is_valid_instance(&target) {
                    continue;
                }
                if remaining > 1 {
                    stack.push((target, id, remaining - 1));
                } else {
                    self.record_unknown(slot.address, target.address);
                }
            }
        }
    }
}

fn end_of(address: u64, size: u64, limit: u64) -> u64 {
    if size == 0 {
        address
    } else {
        address.saturating_add(size - 1).min(limit).max(address)
    }
}
