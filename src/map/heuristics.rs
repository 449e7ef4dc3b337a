//! Plausibility predicates over instances.
//!
//! Every predicate is read-only. Those that can meet a default pointer value
//! (null, all-ones, an error pointer or a list poison) take an explicit
//! `default_valid` flag that decides how such a value is judged.

use crate::config::HeuristicsConfig;
use crate::core::data_type::{DataTypeKind, TypeId};
use crate::core::instance::{Instance, Resolver, Unwrap};
use crate::memory::Arch;
use crate::rules::{RuleOracle, RuleVerdict};

/// How often a list head that does not point back at its neighbour may be
/// excused by a valid neighbour, for list heads used as tree links.
const LIST_HEAD_NEIGHBOUR_DEPTH: u32 = 1;

/// Lowest user-land address that maps anything on 32-bit kernels.
const USER_LAND_START_X86: u64 = 0x0040_0000;
/// Lowest user-land address that maps anything on 64-bit kernels.
const USER_LAND_START_X86_64: u64 = 0x0800_0000;

const MAX_POINTER_CHAIN: usize = 8;

#[derive(Clone, Copy)]
pub struct Heuristics<'a> {
    pub resolver: Resolver<'a>,
    config: &'a HeuristicsConfig,
    rules: Option<&'a dyn RuleOracle>,
}

impl<'a> Heuristics<'a> {
    /// A rule oracle without any rules is ignored.
    pub fn new(resolver: Resolver<'a>, config: &'a HeuristicsConfig, rules: Option<&'a dyn RuleOracle>) -> Self {
        Self {
            resolver,
            config,
            rules: rules.filter(|r| r.rule_count() > 0),
        }
    }

    pub fn config(&self) -> &'a HeuristicsConfig {
        self.config
    }

    pub fn rules(&self) -> Option<&'a dyn RuleOracle> {
        self.rules
    }

    pub fn uses_rules(&self) -> bool {
        self.rules.is_some()
    }

    /// Null, minus one, an `ERR_PTR` value or a list poison constant.
    pub fn default_value(&self, value: u64) -> bool {
        let specs = self.resolver.specs();
        let errno = specs.max_errno;
        let minus_one_32 = u32::MAX as u64;
        let is_err = (value > minus_one_32 - errno && value <= minus_one_32) || value > u64::MAX - errno;

        value == 0
            || value == minus_one_32
            || value == u64::MAX
            || is_err
            || value == specs.list_poison1
            || value == specs.list_poison2
    }

    /// Whether `address` lies in the kernel's part of the address space.
    pub fn valid_address(&self, address: u64, default_valid: bool) -> bool {
        if self.default_value(address) {
            return default_valid;
        }
        let specs = self.resolver.specs();
        match specs.arch {
            Arch::X86 => address >= specs.page_offset && address <= specs.vaddr_space_end,
            Arch::X86_64 => {
                let high_bits = address >> 47;
                if high_bits != 0 && high_bits != 0x1_ffff {
                    return false;
                }
                address >= specs.page_offset && address <= specs.vaddr_space_end
            }
        }
    }

    /// Start and, unless the start is an excused default, end address valid.
    pub fn has_valid_address(&self, inst: &Instance, default_valid: bool) -> bool {
        if !self.valid_address(inst.address, default_valid) {
            return false;
        }
        let size = self.resolver.size_of(inst);
        if size > 0 && !(default_valid && self.default_value(inst.address)) {
            let end = inst.address.wrapping_add(size - 1);
            if !self.valid_address(end, false) {
                return false;
            }
        }
        true
    }

    /// Non-null, not all ones and aligned.
    pub fn valid_pointer_address(&self, target: u64) -> bool {
        let all_ones = match self.resolver.pointer_size() {
            4 => u32::MAX as u64,
            _ => u64::MAX,
        };
        let align = self.config.pointer_alignment.max(1);
        target != 0 && target != all_ones && target % align == 0
    }

    /// A function pointer, or a data pointer that ends at one.
    pub fn is_function_pointer(&self, inst: &Instance) -> bool {
        matches!(
            self.pointer_target_kind(inst),
            Some(DataTypeKind::FuncPointer | DataTypeKind::Function)
        )
    }

    /// Kind reached by following pointer types, without reading memory.
    fn pointer_target_kind(&self, inst: &Instance) -> Option<DataTypeKind> {
        let mut dt = self.resolver.base_type(inst)?;
        for _ in 0..MAX_POINTER_CHAIN {
            if dt.kind != DataTypeKind::Pointer {
                return Some(dt.kind);
            }
            dt = self.resolver.strip_lexical(dt.target()?)?;
        }
        None
    }

    /// A data pointer whose value is a plausible kernel address.
    pub fn valid_pointer(&self, inst: &Instance, default_valid: bool) -> bool {
        if inst.type_id.is_none() || self.resolver.kind(inst) != Some(DataTypeKind::Pointer) {
            return false;
        }
        let Ok(target) = self.resolver.read_pointer(inst) else {
            return false;
        };
        if self.default_value(target) {
            return default_valid;
        }
        if self.target_needs_alignment(inst) && !self.valid_pointer_address(target) {
            return false;
        }
        self.valid_address(target, default_valid)
    }

    /// Byte-sized targets such as strings may sit anywhere; aggregates and
    /// pointers may not.
    fn target_needs_alignment(&self, inst: &Instance) -> bool {
        self.resolver
            .base_type(inst)
            .and_then(|dt| dt.target())
            .and_then(|t| self.resolver.strip_lexical(t))
            .is_some_and(|t| t.is_composite() || t.kind == DataTypeKind::Pointer)
    }

    pub fn user_land_address(&self, address: u64) -> bool {
        let specs = self.resolver.specs();
        let start = match specs.arch {
            Arch::X86 => USER_LAND_START_X86,
            Arch::X86_64 => USER_LAND_START_X86_64,
        };
        address >= start && address < specs.page_offset
    }

    /// A pointer whose target lies in user land.
    pub fn user_land_pointer(&self, inst: &Instance) -> bool {
        if self.resolver.kind(inst) != Some(DataTypeKind::Pointer) {
            return false;
        }
        self.resolver
            .read_pointer(inst)
            .is_ok_and(|target| self.user_land_address(target))
    }

    /// A function pointer whose target is executable kernel memory.
    pub fn valid_function_pointer(&self, inst: &Instance, default_valid: bool) -> bool {
        if !self.is_function_pointer(inst) {
            return false;
        }
        let Ok(target) = self.resolver.read_pointer(inst) else {
            return false;
        };
        if self.default_value(target) {
            return default_valid;
        }
        self.valid_address(target, false) && self.resolver.vmem.is_executable(target)
    }

    fn named_struct(&self, inst: &Instance, name: &str, members: Option<usize>) -> bool {
        match self.resolver.base_type(inst) {
            Some(dt) => {
                dt.kind == DataTypeKind::Struct
                    && dt.name == name
                    && members.map_or(true, |n| dt.members().len() == n)
            }
            None => false,
        }
    }

    pub fn is_list_head(&self, inst: &Instance) -> bool {
        self.named_struct(inst, &self.config.list_head_type, Some(2))
    }

    pub fn is_hlist_head(&self, inst: &Instance) -> bool {
        self.named_struct(inst, &self.config.hlist_head_type, Some(1))
    }

    pub fn is_hlist_node(&self, inst: &Instance) -> bool {
        self.named_struct(inst, &self.config.hlist_node_type, Some(2))
    }

    pub fn is_radix_root(&self, inst: &Instance) -> bool {
        self.named_struct(inst, &self.config.radix_root_type, None)
    }

    pub fn is_idr(&self, inst: &Instance) -> bool {
        self.named_struct(inst, &self.config.idr_type, None)
    }

    /// A list head whose neighbours point back at it.
    ///
    /// Both pointers holding default values is an empty or never initialised
    /// list, judged by `default_valid`.
    pub fn valid_list_head(&self, inst: &Instance, default_valid: bool) -> bool {
        self.list_head_consistent(inst, default_valid, LIST_HEAD_NEIGHBOUR_DEPTH)
    }

    fn list_head_consistent(&self, head: &Instance, default_valid: bool, depth: u32) -> bool {
        if head.is_null() || !self.is_list_head(head) {
            return false;
        }
        let r = &self.resolver;
        let (Some(next), Some(prev)) = (r.member_by_name(head, "next"), r.member_by_name(head, "prev")) else {
            return false;
        };
        let (Ok(next_addr), Ok(prev_addr)) = (r.read_pointer(&next), r.read_pointer(&prev)) else {
            return false;
        };
        if self.default_value(next_addr) && self.default_value(prev_addr) {
            return default_valid;
        }

        let (next, _) = r.dereference(&next, Unwrap::LexicalAndPointers, 1);
        let (prev, _) = r.dereference(&prev, Unwrap::LexicalAndPointers, 1);
        if next.is_null() || prev.is_null() || !r.is_accessible(&next) || !r.is_accessible(&prev) {
            return false;
        }

        let points_back = |from: &Instance, member: &str| {
            r.member_by_name(from, member)
                .and_then(|m| r.read_pointer(&m).ok())
                .is_some_and(|v| v == head.address)
        };
        // List heads also link trees, where a neighbour that is itself a
        // valid list head is good enough.
        if !points_back(&next, "prev") && (depth == 0 || !self.list_head_consistent(&next, false, depth - 1)) {
            return false;
        }
        if !points_back(&prev, "next") && (depth == 0 || !self.list_head_consistent(&prev, false, depth - 1)) {
            return false;
        }
        true
    }

    /// An hlist node whose neighbours refer back to it. Null ends are fine.
    pub fn valid_hlist_node(&self, node: &Instance) -> bool {
        if node.is_null() || !self.is_hlist_node(node) {
            return false;
        }
        let r = &self.resolver;
        let (Some(next), Some(pprev)) = (r.member_by_name(node, "next"), r.member_by_name(node, "pprev")) else {
            return false;
        };

        let Ok(next_addr) = r.read_pointer(&next) else {
            return false;
        };
        if !self.default_value(next_addr) {
            let (next, _) = r.dereference(&next, Unwrap::LexicalAndPointers, 1);
            if next.is_null() || !r.is_accessible(&next) {
                return false;
            }
            let back = r
                .member_by_name(&next, "pprev")
                .and_then(|m| r.read_pointer(&m).ok());
            if back != Some(node.address) {
                return false;
            }
        }

        let Ok(pprev_addr) = r.read_pointer(&pprev) else {
            return false;
        };
        if !self.default_value(pprev_addr) {
            // pprev points at the `next` slot of the previous node, which is
            // its first member.
            let prev = node.with_address(pprev_addr);
            if !r.is_accessible(&prev) {
                return false;
            }
            let back = r
                .member_by_name(&prev, "next")
                .and_then(|m| r.read_pointer(&m).ok());
            if back != Some(node.address) {
                return false;
            }
        }
        true
    }

    /// Whether `cand` embeds the list node that `list_head.next` points at,
    /// and that node links back to `list_head`.
    pub fn valid_candidate_based_on_list_head(&self, list_head: &Instance, cand: &Instance) -> bool {
        if !self.valid_list_head(list_head, false) {
            return false;
        }
        let r = &self.resolver;
        let Some(next) = r.member(list_head, 0) else {
            return false;
        };
        let Ok(member_next) = r.read_pointer(&next) else {
            return false;
        };
        if member_next == next.address || self.default_value(member_next) {
            return false;
        }

        let cand_offset = member_next.wrapping_sub(cand.address);
        let Some((_, cand_head)) = r.member_by_offset(cand, cand_offset) else {
            return false;
        };
        if !self.is_list_head(&cand_head) {
            return false;
        }
        r.member(&cand_head, 1)
            .and_then(|prev| r.read_pointer(&prev).ok())
            .is_some_and(|prev| prev == list_head.address)
    }

    /// Non-null, sized, not code, inside the kernel's address space and
    /// readable. Structs and unions must also be aligned.
    pub fn is_valid_instance(&self, inst: &Instance) -> bool {
        if inst.is_null() {
            return false;
        }
        let Some(dt) = self.resolver.base_type(inst) else {
            return false;
        };
        if dt.size == 0 || dt.kind == DataTypeKind::Function {
            return false;
        }
        if !self.has_valid_address(inst, false) {
            return false;
        }
        if dt.is_composite() && inst.address % self.config.pointer_alignment.max(1) != 0 {
            return false;
        }
        self.resolver.is_accessible(inst)
    }

    /// Veto a candidate of a member slot. Only list heads have a check.
    pub fn compatible_candidate(&self, parent: &Instance, cand: &Instance) -> bool {
        if self.is_list_head(parent) {
            return self.valid_candidate_based_on_list_head(parent, cand);
        }
        true
    }

    /// Object the `next` pointer of `head` leads to, if it can be told.
    ///
    /// A rule match wins. Otherwise a single structural candidate is used,
    /// no candidate means a plain dereference and several are undecidable.
    pub fn list_next_object(&self, head: &Instance) -> Option<Instance> {
        let r = &self.resolver;
        if let Some(rules) = self.rules {
            if let RuleVerdict::Match(inst) = rules.resolve(head, &[0]) {
                return Some(inst);
            }
        }
        match r.member_candidates(head, 0).len() {
            0 => {
                let next = r.member(head, 0)?;
                let (target, _) = r.dereference(&next, Unwrap::LexicalAndPointers, 1);
                (!target.is_null()).then_some(target)
            }
            1 => r.member_candidate(head, 0, 0),
            _ => None,
        }
    }

    /// Whether the list head `inst`, embedded in the object at
    /// `parent_address`, is the anchor of its list rather than a link
    /// inside one element.
    pub fn is_head_of_list(&self, parent_address: u64, parent_type: TypeId, inst: &Instance) -> bool {
        if self.is_hlist_head(inst) {
            return true;
        }
        if !self.is_list_head(inst) {
            return false;
        }
        let r = &self.resolver;
        let offset_in_parent = inst.address.wrapping_sub(parent_address);

        let Some(next) = r.member(inst, 0) else {
            return false;
        };
        let Ok(next_ptr) = r.read_pointer(&next) else {
            return false;
        };
        if next_ptr == 0 {
            return false;
        }
        let Some(next_obj) = self.list_next_object(inst) else {
            return false;
        };
        if !self.is_valid_instance(&next_obj) {
            return false;
        }

        let offset_in_next = next_ptr.wrapping_sub(next_obj.address);
        if offset_in_parent == offset_in_next {
            let same_type = match (r.strip_lexical(parent_type), r.base_type(&next_obj)) {
                (Some(a), Some(b)) => a.hash == b.hash,
                _ => false,
            };
            if same_type {
                return false;
            }
        }
        true
    }
}
