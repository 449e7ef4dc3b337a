//! Typed values located in virtual memory.
//!
//! An [`Instance`] is plain data: an address, a type and the name path it was
//! reached through. All operations that need the symbol table or the memory
//! image go through a [`Resolver`], which borrows both collaborators.

use crate::core::data_type::{DataType, DataTypeKind, TypeId};
use crate::core::symbols::{Candidate, SymbolSource};
use crate::memory::error::Result as MemResult;
use crate::memory::{MemSpecs, VirtualMemory};
use serde::{Deserialize, Serialize};

/// Lexical wrapper chains longer than this are treated as broken.
const MAX_LEXICAL_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub address: u64,
    pub type_id: Option<TypeId>,
    pub name: String,
    /// Names of the enclosing instances, outermost first.
    pub parent_names: Vec<String>,
}

impl Instance {
    pub fn new(address: u64, type_id: TypeId, name: impl Into<String>) -> Self {
        Self {
            address,
            type_id: Some(type_id),
            name: name.into(),
            parent_names: Vec::new(),
        }
    }

    /// An instance with no type, used for failed dereferences.
    pub fn null(name: impl Into<String>) -> Self {
        Self {
            address: 0,
            type_id: None,
            name: name.into(),
            parent_names: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.type_id.is_none() || self.address == 0
    }

    pub fn full_name_components(&self) -> Vec<String> {
        let mut names = self.parent_names.clone();
        names.push(self.name.clone());
        names
    }

    pub fn full_name(&self) -> String {
        self.full_name_components().join(".")
    }

    pub fn with_address(&self, address: u64) -> Self {
        Self {
            address,
            ..self.clone()
        }
    }

    pub fn with_type(&self, type_id: TypeId) -> Self {
        Self {
            type_id: Some(type_id),
            ..self.clone()
        }
    }
}

/// How far [`Resolver::dereference`] unwraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwrap {
    Lexical,
    LexicalAndPointers,
    LexicalPointersArrays,
}

impl Unwrap {
    fn pointers(self) -> bool {
        !matches!(self, Unwrap::Lexical)
    }

    fn arrays(self) -> bool {
        matches!(self, Unwrap::LexicalPointersArrays)
    }
}

/// Instance operations backed by a symbol source and a memory image.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    pub symbols: &'a dyn SymbolSource,
    pub vmem: &'a dyn VirtualMemory,
}

impl<'a> Resolver<'a> {
    pub fn new(symbols: &'a dyn SymbolSource, vmem: &'a dyn VirtualMemory) -> Self {
        Self { symbols, vmem }
    }

    pub fn specs(&self) -> &'a MemSpecs {
        self.vmem.specs()
    }

    pub fn pointer_size(&self) -> u64 {
        self.vmem.specs().pointer_size() as u64
    }

    pub fn type_by_id(&self, id: TypeId) -> Option<&'a DataType> {
        self.symbols.type_by_id(id)
    }

    /// Declared type of the instance, lexical wrappers included.
    pub fn type_of(&self, inst: &Instance) -> Option<&'a DataType> {
        inst.type_id.and_then(|id| self.symbols.type_by_id(id))
    }

    /// Follow typedef, const and volatile wrappers.
    pub fn strip_lexical(&self, id: TypeId) -> Option<&'a DataType> {
        let mut dt = self.symbols.type_by_id(id)?;
        for _ in 0..MAX_LEXICAL_DEPTH {
            if !dt.kind.is_lexical() {
                return Some(dt);
            }
            dt = self.symbols.type_by_id(dt.target()?)?;
        }
        None
    }

    /// Type of the instance with lexical wrappers removed.
    pub fn base_type(&self, inst: &Instance) -> Option<&'a DataType> {
        inst.type_id.and_then(|id| self.strip_lexical(id))
    }

    pub fn kind(&self, inst: &Instance) -> Option<DataTypeKind> {
        self.base_type(inst).map(|t| t.kind)
    }

    pub fn size_of(&self, inst: &Instance) -> u64 {
        self.base_type(inst).map(|t| t.size).unwrap_or(0)
    }

    /// Last byte of the instance, clamped to the end of the address space.
    pub fn end_address(&self, inst: &Instance) -> u64 {
        let size = self.size_of(inst);
        let end = if size == 0 {
            inst.address
        } else {
            inst.address.saturating_add(size - 1)
        };
        end.min(self.specs().vaddr_space_end)
    }

    pub fn type_name(&self, inst: &Instance) -> String {
        self.type_of(inst)
            .map(|t| t.pretty_name().to_string())
            .unwrap_or_else(|| "<no type>".to_string())
    }

    pub fn type_hash(&self, inst: &Instance) -> Option<u64> {
        self.base_type(inst).map(|t| t.hash)
    }

    pub fn member_count(&self, inst: &Instance) -> usize {
        self.base_type(inst).map(|t| t.members().len()).unwrap_or(0)
    }

    /// Project member `index` of a struct or union instance.
    pub fn member(&self, inst: &Instance, index: usize) -> Option<Instance> {
        let m = self.base_type(inst)?.members().get(index)?;
        Some(Instance {
            address: inst.address.wrapping_add(m.offset),
            type_id: Some(m.type_id),
            name: m.name.clone(),
            parent_names: inst.full_name_components(),
        })
    }

    pub fn member_by_name(&self, inst: &Instance, name: &str) -> Option<Instance> {
        let idx = self
            .base_type(inst)?
            .members()
            .iter()
            .position(|m| m.name == name)?;
        self.member(inst, idx)
    }

    /// The member starting exactly at byte `offset` of the instance.
    pub fn member_by_offset(&self, inst: &Instance, offset: u64) -> Option<(usize, Instance)> {
        let idx = self
            .base_type(inst)?
            .members()
            .iter()
            .position(|m| m.offset == offset)?;
        self.member(inst, idx).map(|m| (idx, m))
    }

    pub fn array_length(&self, inst: &Instance) -> Option<u64> {
        self.base_type(inst).and_then(|t| t.array_length())
    }

    /// Element `index` of an array instance.
    pub fn array_elem(&self, inst: &Instance, index: u64) -> Option<Instance> {
        let arr = self.base_type(inst)?;
        let elem_id = arr.target()?;
        let elem_size = self.strip_lexical(elem_id).map(|t| t.size).unwrap_or(0);
        Some(Instance {
            address: inst
                .address
                .wrapping_add(elem_size.wrapping_mul(index)),
            type_id: Some(elem_id),
            name: format!("{}[{}]", inst.name, index),
            parent_names: inst.parent_names.clone(),
        })
    }

    pub fn read_pointer(&self, inst: &Instance) -> MemResult<u64> {
        self.vmem.read_pointer(inst.address)
    }

    /// Read a scalar of the instance's own size.
    pub fn read_uint(&self, inst: &Instance) -> MemResult<u64> {
        let size = self.size_of(inst) as usize;
        self.vmem.read_uint(inst.address, size)
    }

    /// Unwrap lexical types and, depending on `unwrap`, pointers and arrays.
    ///
    /// Returns the resulting instance and the number of pointers followed. A
    /// void pointer is never followed. An unreadable or zero pointer yields a
    /// null instance.
    pub fn dereference(&self, inst: &Instance, unwrap: Unwrap, max_depth: u32) -> (Instance, u32) {
        let mut cur = inst.clone();
        let mut derefs = 0u32;

        for _ in 0..=MAX_LEXICAL_DEPTH + max_depth as usize {
            let Some(dt) = self.base_type(&cur) else {
                return (cur, derefs);
            };
            cur.type_id = Some(dt.id);

            match dt.kind {
                DataTypeKind::Pointer if unwrap.pointers() && derefs < max_depth => {
                    let Some(target) = dt.target() else {
                        return (cur, derefs);
                    };
                    match self.read_pointer(&cur) {
                        Ok(value) if value != 0 => {
                            cur.address = value;
                            cur.type_id = Some(target);
                            derefs += 1;
                        }
                        _ => {
                            let mut null = Instance::null(cur.name.clone());
                            null.parent_names = cur.parent_names.clone();
                            return (null, derefs);
                        }
                    }
                }
                DataTypeKind::Array if unwrap.arrays() => match dt.target() {
                    Some(elem) => cur.type_id = Some(elem),
                    None => return (cur, derefs),
                },
                _ => return (cur, derefs),
            }
        }
        (cur, derefs)
    }

    pub fn member_candidates(&self, inst: &Instance, index: usize) -> &'a [Candidate] {
        match self.base_type(inst) {
            Some(t) => self.symbols.member_candidates(t.id, index),
            None => &[],
        }
    }

    /// Object that candidate `cand_index` of member `index` points at.
    pub fn member_candidate(&self, inst: &Instance, index: usize, cand_index: usize) -> Option<Instance> {
        let cand = self.member_candidates(inst, index).get(cand_index)?;
        let member = self.member(inst, index)?;
        let value = self.vmem.read_pointer(member.address).ok()?;
        if value == 0 {
            return None;
        }
        let address = value.wrapping_sub(cand.offset as u64);
        let base = self.strip_lexical(cand.type_id)?;
        Some(Instance {
            address,
            type_id: Some(base.id),
            name: member.name,
            parent_names: member.parent_names,
        })
    }

    pub fn is_accessible(&self, inst: &Instance) -> bool {
        self.vmem.is_readable(inst.address)
    }

    /// Check every member with a declared magic value.
    pub fn passes_magic(&self, inst: &Instance) -> bool {
        let Some(dt) = self.base_type(inst) else {
            return true;
        };
        for m in dt.members() {
            let Some(expected) = m.magic else { continue };
            let size = self.strip_lexical(m.type_id).map(|t| t.size).unwrap_or(0) as usize;
            match self.vmem.read_uint(inst.address.wrapping_add(m.offset), size) {
                Ok(v) if v == expected => {}
                _ => return false,
            }
        }
        true
    }

    /// Whether an object of type `outer` at `outer_addr` contains, possibly
    /// nested, a member at `inner_addr` whose type hash is `inner_hash`.
    pub fn embeds(&self, outer: &DataType, outer_addr: u64, inner_addr: u64, inner_hash: u64) -> bool {
        let mut cur = outer;
        let mut base = outer_addr;
        for _ in 0..MAX_LEXICAL_DEPTH {
            if base == inner_addr && cur.hash == inner_hash {
                return true;
            }
            let off = inner_addr.wrapping_sub(base);
            if inner_addr < base || off >= cur.size {
                return false;
            }
            let next = match cur.kind {
                DataTypeKind::Struct | DataTypeKind::Union => cur.members().iter().find_map(|m| {
                    let mt = self.strip_lexical(m.type_id)?;
                    (off >= m.offset && off - m.offset < mt.size.max(1)).then_some((mt, m.offset))
                }),
                DataTypeKind::Array => cur.target().and_then(|e| self.strip_lexical(e)).and_then(|et| {
                    (et.size > 0).then(|| (et, off - off % et.size))
                }),
                _ => None,
            };
            match next {
                Some((t, rel)) => {
                    cur = t;
                    base = base.wrapping_add(rel);
                }
                None => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_type::Member;
    use crate::core::symbols::SymbolTable;
    use crate::memory::{MemoryImage, PageTable};

    const BASE: u64 = 0xffff_8800_0000_0000;

    struct Fixture {
        st: SymbolTable,
        mem: MemoryImage,
        outer: TypeId,
        inner: TypeId,
        inner_ptr: TypeId,
    }

    fn write_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn fixture() -> Fixture {
        let mut st = SymbolTable::new(8);
        let u64t = st.primitive("unsigned long", 8, false);
        let inner = st.structure("struct inner", 16, vec![
            Member::new("a", 0, u64t),
            Member::new("b", 8, u64t),
        ]);
        let inner_td = st.typedef("inner_t", inner);
        let inner_ptr = st.pointer_to(Some(inner_td));
        let outer = st.structure("struct outer", 40, vec![
            Member::new("magic", 0, u64t).with_magic(0x1234),
            Member::new("ptr", 8, inner_ptr),
            Member::new("embedded", 16, inner),
            Member::new("null", 32, inner_ptr),
        ]);

        let mut buf = vec![0u8; 0x100];
        write_u64(&mut buf, 0, 0x1234);
        write_u64(&mut buf, 8, BASE + 0x80);
        write_u64(&mut buf, 0x80, 7);
        let mut table = PageTable::new();
        table.map_linear(BASE, 0, 0x100, false);
        let mem = MemoryImage::from_bytes(buf, crate::memory::MemSpecs::x86_64(), table);
        Fixture {
            st,
            mem,
            outer,
            inner,
            inner_ptr,
        }
    }

    #[test]
    fn member_projection_and_names() {
        let f = fixture();
        let r = Resolver::new(&f.st, &f.mem);
        let root = Instance::new(BASE, f.outer, "root");

        let emb = r.member_by_name(&root, "embedded").unwrap();
        assert_eq!(emb.address, BASE + 16);
        assert_eq!(emb.full_name(), "root.embedded");

        let (idx, p) = r.member_by_offset(&root, 8).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(p.type_id, Some(f.inner_ptr));
        assert!(r.member_by_offset(&root, 9).is_none());
        assert_eq!(r.end_address(&root), BASE + 39);
    }

    #[test]
    fn dereference_follows_pointer_through_typedef() {
        let f = fixture();
        let r = Resolver::new(&f.st, &f.mem);
        let root = Instance::new(BASE, f.outer, "root");

        let ptr = r.member(&root, 1).unwrap();
        let (target, n) = r.dereference(&ptr, Unwrap::LexicalAndPointers, 1);
        assert_eq!(n, 1);
        assert_eq!(target.address, BASE + 0x80);
        assert_eq!(target.type_id, Some(f.inner));

        // Lexical-only unwrapping keeps the pointer.
        let (same, n) = r.dereference(&ptr, Unwrap::Lexical, 1);
        assert_eq!(n, 0);
        assert_eq!(same.type_id, Some(f.inner_ptr));
    }

    #[test]
    fn dereference_null_pointer_yields_null_instance() {
        let f = fixture();
        let r = Resolver::new(&f.st, &f.mem);
        let root = Instance::new(BASE, f.outer, "root");
        let null = r.member_by_name(&root, "null").unwrap();
        let (target, _) = r.dereference(&null, Unwrap::LexicalAndPointers, 1);
        assert!(target.is_null());
    }

    #[test]
    fn magic_check() {
        let f = fixture();
        let r = Resolver::new(&f.st, &f.mem);
        assert!(r.passes_magic(&Instance::new(BASE, f.outer, "root")));
        assert!(!r.passes_magic(&Instance::new(BASE + 8, f.outer, "shifted")));
    }

    #[test]
    fn embedding_search() {
        let f = fixture();
        let r = Resolver::new(&f.st, &f.mem);
        let outer = f.st.type_by_id(f.outer).unwrap();
        let inner_hash = f.st.type_by_id(f.inner).unwrap().hash;

        assert!(r.embeds(outer, BASE, BASE + 16, inner_hash));
        assert!(!r.embeds(outer, BASE, BASE + 8, inner_hash));
        assert!(!r.embeds(outer, BASE, BASE + 64, inner_hash));
        assert!(r.embeds(outer, BASE, BASE, outer.hash));
    }

    #[test]
    fn array_elements() {
        let mut f = fixture();
        let arr = f.st.array_of(f.inner, 4);
        let r = Resolver::new(&f.st, &f.mem);
        let a = Instance::new(BASE + 0x40, arr, "tbl");
        assert_eq!(r.array_length(&a), Some(4));
        let e = r.array_elem(&a, 2).unwrap();
        assert_eq!(e.address, BASE + 0x60);
        assert_eq!(e.name, "tbl[2]");

        let (first, n) = r.dereference(&a, Unwrap::LexicalPointersArrays, 1);
        assert_eq!(n, 0);
        assert_eq!(first.type_id, Some(f.inner));
    }
}
