//! Symbol source interface and an in-memory symbol table.

use crate::core::data_type::{DataType, DataTypeKind, Member, TypeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a global symbol was defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolOrigin {
    Kernel,
    /// Defined by a dynamically loaded module; never used as a root.
    Module,
}

/// A global variable of the kernel image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub type_id: TypeId,
    pub address: u64,
    pub per_cpu: bool,
    pub origin: SymbolOrigin,
}

impl Variable {
    pub fn new(name: impl Into<String>, type_id: TypeId, address: u64) -> Self {
        Self {
            name: name.into(),
            type_id,
            address,
            per_cpu: false,
            origin: SymbolOrigin::Kernel,
        }
    }

    pub fn per_cpu(mut self) -> Self {
        self.per_cpu = true;
        self
    }

    pub fn from_module(mut self) -> Self {
        self.origin = SymbolOrigin::Module;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSymbol {
    pub name: String,
    pub address: u64,
    pub type_id: TypeId,
}

/// Alternate type for an ambiguous member slot.
///
/// The slot holds a pointer whose value minus `offset` is the start of an
/// object of type `type_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub type_id: TypeId,
    pub offset: i64,
    /// Expression describing when the candidate applies, for diagnostics.
    pub condition: Option<String>,
}

/// Narrow, read-only query interface over a parsed kernel symbol table.
pub trait SymbolSource: Send + Sync {
    fn type_by_id(&self, id: TypeId) -> Option<&DataType>;

    fn type_by_name(&self, name: &str) -> Option<&DataType>;

    fn variables(&self) -> &[Variable];

    fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables().iter().find(|v| v.name == name)
    }

    fn functions(&self) -> &[FunctionSymbol] {
        &[]
    }

    /// Candidate types known for member `member_index` of type `owner`.
    fn member_candidates(&self, _owner: TypeId, _member_index: usize) -> &[Candidate] {
        &[]
    }
}

/// In-memory [`SymbolSource`].
#[derive(Debug, Clone)]
pub struct SymbolTable {
    pointer_size: u64,
    types: HashMap<TypeId, DataType>,
    by_name: HashMap<String, TypeId>,
    variables: Vec<Variable>,
    functions: Vec<FunctionSymbol>,
    candidates: HashMap<(TypeId, usize), Vec<Candidate>>,
    next_id: u32,
}

impl SymbolTable {
    pub fn new(pointer_size: u64) -> Self {
        Self {
            pointer_size,
            types: HashMap::new(),
            by_name: HashMap::new(),
            variables: Vec::new(),
            functions: Vec::new(),
            candidates: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn pointer_size(&self) -> u64 {
        self.pointer_size
    }

    /// Reserve an id for a type that is defined later, e.g. a self-referencing struct.
    pub fn reserve_id(&mut self) -> TypeId {
        let id = TypeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a descriptor. The first type registered under a name wins
    /// name lookups.
    pub fn add_type(&mut self, dt: DataType) -> TypeId {
        let id = dt.id;
        if id.0 >= self.next_id {
            self.next_id = id.0 + 1;
        }
        self.by_name.entry(dt.name.clone()).or_insert(id);
        self.types.insert(id, dt);
        id
    }

    pub fn add_variable(&mut self, var: Variable) {
        self.variables.push(var);
    }

    pub fn add_function(&mut self, name: impl Into<String>, address: u64, type_id: TypeId) {
        self.functions.push(FunctionSymbol {
            name: name.into(),
            address,
            type_id,
        });
    }

    pub fn add_candidate(&mut self, owner: TypeId, member_index: usize, candidate: Candidate) {
        self.candidates
            .entry((owner, member_index))
            .or_default()
            .push(candidate);
    }

    pub fn primitive(&mut self, name: &str, size: u64, signed: bool) -> TypeId {
        let id = self.reserve_id();
        self.add_type(DataType::new_primitive(id, name, size, signed))
    }

    pub fn void(&mut self) -> TypeId {
        let id = self.reserve_id();
        self.add_type(DataType::new_void(id))
    }

    pub fn pointer_to(&mut self, target: Option<TypeId>) -> TypeId {
        let name = match target.and_then(|t| self.types.get(&t)) {
            Some(t) => format!("{} *", t.name),
            None => "void *".to_string(),
        };
        let id = self.reserve_id();
        self.add_type(DataType::new_pointer(id, name, self.pointer_size, target))
    }

    /// Pointer to a type that may not be defined yet.
    pub fn declare_pointer(&mut self, name: &str, target: TypeId) -> TypeId {
        let id = self.reserve_id();
        self.add_type(DataType::new_pointer(id, name, self.pointer_size, Some(target)))
    }

    pub fn func_pointer(&mut self, name: &str) -> TypeId {
        let id = self.reserve_id();
        self.add_type(DataType::new_func_pointer(id, name, self.pointer_size))
    }

    pub fn array_of(&mut self, elem: TypeId, length: u64) -> TypeId {
        let (name, elem_size) = self
            .types
            .get(&elem)
            .map(|t| (format!("{}[{}]", t.name, length), t.size))
            .unwrap_or_else(|| (format!("?[{length}]"), 0));
        let id = self.reserve_id();
        self.add_type(DataType::new_array(id, name, elem_size * length, elem, length))
    }

    pub fn structure(&mut self, name: &str, size: u64, members: Vec<Member>) -> TypeId {
        let id = self.reserve_id();
        self.add_type(DataType::new_struct(id, name, size, members))
    }

    /// Define a struct under an id obtained from [`reserve_id`](Self::reserve_id).
    pub fn define_structure(&mut self, id: TypeId, name: &str, size: u64, members: Vec<Member>) -> TypeId {
        self.add_type(DataType::new_struct(id, name, size, members))
    }

    pub fn union(&mut self, name: &str, size: u64, members: Vec<Member>) -> TypeId {
        let id = self.reserve_id();
        self.add_type(DataType::new_union(id, name, size, members))
    }

    pub fn typedef(&mut self, name: &str, target: TypeId) -> TypeId {
        let size = self.types.get(&target).map(|t| t.size).unwrap_or(0);
        let id = self.reserve_id();
        self.add_type(DataType::new_lexical(
            id,
            DataTypeKind::Typedef,
            name,
            size,
            Some(target),
        ))
    }

    pub fn function(&mut self, name: &str) -> TypeId {
        let id = self.reserve_id();
        self.add_type(DataType::new_function(id, name, 1))
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

impl SymbolSource for SymbolTable {
    fn type_by_id(&self, id: TypeId) -> Option<&DataType> {
        self.types.get(&id)
    }

    fn type_by_name(&self, name: &str) -> Option<&DataType> {
        self.by_name.get(name).and_then(|id| self.types.get(id))
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }

    fn member_candidates(&self, owner: TypeId, member_index: usize) -> &[Candidate] {
        self.candidates
            .get(&(owner, member_index))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_self_referencing_struct() {
        let mut st = SymbolTable::new(8);
        let node = st.reserve_id();
        let ptr = st.pointer_to(Some(node));
        st.define_structure(node, "struct node", 16, vec![
            Member::new("next", 0, ptr),
            Member::new("value", 8, TypeId(0)),
        ]);

        let dt = st.type_by_name("struct node").unwrap();
        assert_eq!(dt.id, node);
        assert_eq!(dt.members()[0].type_id, ptr);
        assert_eq!(st.type_by_id(ptr).unwrap().target(), Some(node));
    }

    #[test]
    fn pointer_and_array_names() {
        let mut st = SymbolTable::new(8);
        let int = st.primitive("int", 4, true);
        let p = st.pointer_to(Some(int));
        let vp = st.pointer_to(None);
        let arr = st.array_of(int, 8);

        assert_eq!(st.type_by_id(p).unwrap().name, "int *");
        assert_eq!(st.type_by_id(vp).unwrap().name, "void *");
        assert_eq!(st.type_by_id(arr).unwrap().size, 32);
        assert_eq!(st.type_by_id(arr).unwrap().name, "int[8]");
    }

    #[test]
    fn variable_lookup_and_flags() {
        let mut st = SymbolTable::new(8);
        let int = st.primitive("int", 4, true);
        st.add_variable(Variable::new("jiffies", int, 0xffff_8800_0000_1000));
        st.add_variable(Variable::new("runqueues", int, 0x1000).per_cpu());
        st.add_variable(Variable::new("mod_var", int, 0x2000).from_module());

        assert_eq!(st.variables().len(), 3);
        assert!(st.variable("runqueues").unwrap().per_cpu);
        assert_eq!(st.variable("mod_var").unwrap().origin, SymbolOrigin::Module);
        assert!(st.variable("missing").is_none());
    }

    #[test]
    fn candidates_by_member() {
        let mut st = SymbolTable::new(8);
        let vp = st.pointer_to(None);
        let owner = st.structure("struct file", 8, vec![Member::new("private_data", 0, vp)]);
        let target = st.structure("struct pipe", 32, vec![]);
        st.add_candidate(owner, 0, Candidate {
            type_id: target,
            offset: 0,
            condition: Some("f_op == &pipefifo_fops".into()),
        });

        assert_eq!(st.member_candidates(owner, 0).len(), 1);
        assert!(st.member_candidates(owner, 1).is_empty());
    }
}
