//! Type descriptors consumed from the symbol layer.
//!
//! A descriptor is immutable once created and addressed by [`TypeId`]. The
//! builder never parses debug information itself; it only walks these
//! descriptors through the [`SymbolSource`](crate::core::symbols::SymbolSource)
//! interface.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a type in the symbol source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataTypeKind {
    Primitive,
    Enum,
    Pointer,
    FuncPointer,
    Array,
    Struct,
    Union,
    Function,
    Typedef,
    Const,
    Volatile,
    Void,
}

impl DataTypeKind {
    /// Typedef, const and volatile only rename another type.
    pub fn is_lexical(self) -> bool {
        matches!(
            self,
            DataTypeKind::Typedef | DataTypeKind::Const | DataTypeKind::Volatile
        )
    }

    pub fn tag(self) -> TypeTags {
        match self {
            DataTypeKind::Primitive => TypeTags::PRIMITIVE,
            DataTypeKind::Enum => TypeTags::ENUM,
            DataTypeKind::Pointer => TypeTags::POINTER,
            DataTypeKind::FuncPointer => TypeTags::FUNC_POINTER,
            DataTypeKind::Array => TypeTags::ARRAY,
            DataTypeKind::Struct => TypeTags::STRUCT,
            DataTypeKind::Union => TypeTags::UNION,
            DataTypeKind::Function => TypeTags::FUNCTION,
            DataTypeKind::Typedef | DataTypeKind::Const | DataTypeKind::Volatile => {
                TypeTags::LEXICAL
            }
            DataTypeKind::Void => TypeTags::VOID,
        }
    }
}

bitflags! {
    /// Kind bitmap OR'ed into range-tree aggregates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TypeTags: u32 {
        const PRIMITIVE = 1 << 0;
        const ENUM = 1 << 1;
        const POINTER = 1 << 2;
        const FUNC_POINTER = 1 << 3;
        const ARRAY = 1 << 4;
        const STRUCT = 1 << 5;
        const UNION = 1 << 6;
        const FUNCTION = 1 << 7;
        const LEXICAL = 1 << 8;
        const VOID = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitField {
    pub bit_offset: u8,
    pub bit_size: u8,
}

/// A named member of a struct or union.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub offset: u64,
    pub type_id: TypeId,
    pub bit_field: Option<BitField>,
    /// Constant the member holds in every live object of the enclosing type.
    pub magic: Option<u64>,
}

impl Member {
    pub fn new(name: impl Into<String>, offset: u64, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            offset,
            type_id,
            bit_field: None,
            magic: None,
        }
    }

    pub fn with_magic(mut self, value: u64) -> Self {
        self.magic = Some(value);
        self
    }

    pub fn with_bit_field(mut self, bit_offset: u8, bit_size: u8) -> Self {
        self.bit_field = Some(BitField {
            bit_offset,
            bit_size,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeData {
    Primitive { signed: bool },
    Enum,
    /// `None` is a void pointer.
    Pointer { target: Option<TypeId> },
    FuncPointer,
    Array { target: TypeId, length: u64 },
    Struct { members: Vec<Member> },
    Union { members: Vec<Member> },
    Function,
    Lexical { target: Option<TypeId> },
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    pub id: TypeId,
    pub name: String,
    pub kind: DataTypeKind,
    pub size: u64,
    pub type_data: TypeData,
    /// Identity of the layout, independent of the id.
    pub hash: u64,
}

impl DataType {
    fn build(id: TypeId, name: String, kind: DataTypeKind, size: u64, type_data: TypeData) -> Self {
        let hash = structural_hash(kind, &name, size, &type_data);
        Self {
            id,
            name,
            kind,
            size,
            type_data,
            hash,
        }
    }

    pub fn new_primitive(id: TypeId, name: impl Into<String>, size: u64, signed: bool) -> Self {
        Self::build(
            id,
            name.into(),
            DataTypeKind::Primitive,
            size,
            TypeData::Primitive { signed },
        )
    }

    pub fn new_enum(id: TypeId, name: impl Into<String>, size: u64) -> Self {
        Self::build(id, name.into(), DataTypeKind::Enum, size, TypeData::Enum)
    }

    pub fn new_pointer(id: TypeId, name: impl Into<String>, size: u64, target: Option<TypeId>) -> Self {
        Self::build(
            id,
            name.into(),
            DataTypeKind::Pointer,
            size,
            TypeData::Pointer { target },
        )
    }

    pub fn new_func_pointer(id: TypeId, name: impl Into<String>, size: u64) -> Self {
        Self::build(
            id,
            name.into(),
            DataTypeKind::FuncPointer,
            size,
            TypeData::FuncPointer,
        )
    }

    pub fn new_array(
        id: TypeId,
        name: impl Into<String>,
        size: u64,
        target: TypeId,
        length: u64,
    ) -> Self {
        Self::build(
            id,
            name.into(),
            DataTypeKind::Array,
            size,
            TypeData::Array { target, length },
        )
    }

    pub fn new_struct(id: TypeId, name: impl Into<String>, size: u64, members: Vec<Member>) -> Self {
        Self::build(
            id,
            name.into(),
            DataTypeKind::Struct,
            size,
            TypeData::Struct { members },
        )
    }

    pub fn new_union(id: TypeId, name: impl Into<String>, size: u64, members: Vec<Member>) -> Self {
        Self::build(
            id,
            name.into(),
            DataTypeKind::Union,
            size,
            TypeData::Union { members },
        )
    }

    pub fn new_function(id: TypeId, name: impl Into<String>, size: u64) -> Self {
        Self::build(id, name.into(), DataTypeKind::Function, size, TypeData::Function)
    }

    /// A typedef, const or volatile wrapper around `target`.
    pub fn new_lexical(
        id: TypeId,
        kind: DataTypeKind,
        name: impl Into<String>,
        size: u64,
        target: Option<TypeId>,
    ) -> Self {
        debug_assert!(kind.is_lexical());
        Self::build(id, name.into(), kind, size, TypeData::Lexical { target })
    }

    pub fn new_void(id: TypeId) -> Self {
        Self::build(id, "void".to_string(), DataTypeKind::Void, 0, TypeData::Void)
    }

    /// Referenced type of pointers, arrays and lexical wrappers.
    pub fn target(&self) -> Option<TypeId> {
        match &self.type_data {
            TypeData::Pointer { target } | TypeData::Lexical { target } => *target,
            TypeData::Array { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn members(&self) -> &[Member] {
        match &self.type_data {
            TypeData::Struct { members } | TypeData::Union { members } => members,
            _ => &[],
        }
    }

    pub fn array_length(&self) -> Option<u64> {
        match &self.type_data {
            TypeData::Array { length, .. } => Some(*length),
            _ => None,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, DataTypeKind::Pointer)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, DataTypeKind::Struct | DataTypeKind::Union)
    }

    pub fn tags(&self) -> TypeTags {
        self.kind.tag()
    }

    /// Name used in diagnostics and dumps.
    pub fn pretty_name(&self) -> &str {
        &self.name
    }
}

/// Hash of everything that makes two descriptors the same type, ids excluded.
fn structural_hash(kind: DataTypeKind, name: &str, size: u64, data: &TypeData) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[kind as u8]);
    hasher.update(name.as_bytes());
    hasher.update(&size.to_le_bytes());
    match data {
        TypeData::Struct { members } | TypeData::Union { members } => {
            for m in members {
                hasher.update(m.name.as_bytes());
                hasher.update(&m.offset.to_le_bytes());
                if let Some(bf) = m.bit_field {
                    hasher.update(&[bf.bit_offset, bf.bit_size]);
                }
            }
        }
        TypeData::Array { length, .. } => {
            hasher.update(&length.to_le_bytes());
        }
        TypeData::Primitive { signed } => {
            hasher.update(&[*signed as u8]);
        }
        _ => {}
    }
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_head(id: u32) -> DataType {
        DataType::new_struct(
            TypeId(id),
            "struct list_head",
            16,
            vec![
                Member::new("next", 0, TypeId(100)),
                Member::new("prev", 8, TypeId(100)),
            ],
        )
    }

    #[test]
    fn test_struct_type_creation() {
        let dt = list_head(1);
        assert!(dt.is_composite());
        assert_eq!(dt.members().len(), 2);
        assert_eq!(dt.tags(), TypeTags::STRUCT);
        assert_eq!(dt.target(), None);
    }

    #[test]
    fn test_hash_ignores_ids() {
        // The same layout described twice by the symbol layer.
        assert_eq!(list_head(1).hash, list_head(2).hash);

        let other = DataType::new_struct(
            TypeId(3),
            "struct list_head",
            16,
            vec![Member::new("next", 0, TypeId(100))],
        );
        assert_ne!(list_head(1).hash, other.hash);
    }

    #[test]
    fn test_pointer_and_array() {
        let p = DataType::new_pointer(TypeId(5), "struct list_head *", 8, Some(TypeId(1)));
        assert!(p.is_pointer());
        assert_eq!(p.target(), Some(TypeId(1)));

        let a = DataType::new_array(TypeId(6), "int[4]", 16, TypeId(7), 4);
        assert_eq!(a.array_length(), Some(4));
        assert_eq!(a.target(), Some(TypeId(7)));
        assert_eq!(a.tags(), TypeTags::ARRAY);
    }

    #[test]
    fn test_lexical_kinds() {
        assert!(DataTypeKind::Typedef.is_lexical());
        assert!(DataTypeKind::Const.is_lexical());
        assert!(!DataTypeKind::Pointer.is_lexical());
        let t = DataType::new_lexical(TypeId(9), DataTypeKind::Typedef, "spinlock_t", 4, Some(TypeId(2)));
        assert_eq!(t.tags(), TypeTags::LEXICAL);
    }

    #[test]
    fn test_member_builders() {
        let m = Member::new("state", 0, TypeId(1))
            .with_magic(0x4d41_4749)
            .with_bit_field(3, 2);
        assert_eq!(m.magic, Some(0x4d41_4749));
        assert_eq!(m.bit_field.unwrap().bit_size, 2);
    }

    #[test]
    fn test_serialization() {
        let dt = list_head(1);
        let json = serde_json::to_string(&dt).unwrap();
        let back: DataType = serde_json::from_str(&json).unwrap();
        assert_eq!(dt, back);
    }

    #[test]
    fn test_type_id_display() {
        assert_eq!(TypeId(0x2a).to_string(), "0x2a");
    }
}
