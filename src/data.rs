//! Model self-describing PVA values, for data interchange.
//!
//! Every PVA value is a pair of trees: a type description and its storage.
//! Both are kept flattened into depth-first arrays rather than as linked
//! nodes - a [`FieldDesc`] refers to its children by *relative* index, so the
//! arrays can be grown by tail-append while being built and shared read-only
//! afterwards.
//!
//! - [`TypeCode`] is the single-byte type kind carried on the wire.
//! - [`FieldDesc`] is one node of the flattened type tree. The whole tree is
//!   an `Arc<[FieldDesc]>` built either by the decoder
//!   ([`encoding::type_from_wire`](crate::encoding::type_from_wire)) or
//!   programmatically through [`TypeDef`].
//! - [`FieldStorage`] is one storage cell. A [`Value`] owns one cell per
//!   node of its subtree plus a [`BitSet`] marking which cells have been
//!   assigned, which drives the delta encoding.
//!
//! Union and `Any` members hold a complete sub-[`Value`] in their cell; the
//! member nodes of a union own default cells that never carry wire bytes.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Arc,
};

use num::NumCast;
use thiserror::Error;

use crate::bitset::BitSet;

/// Deprecated fixed-length array marker; faults on decode.
pub const FIXED_LENGTH_FLAG: u8 = 0x10;

/// Single-byte type kind of one field.
///
/// Array variants are the scalar code with bit `0x08` set. `Null` and the
/// introspection-cache tags (`0xFD`/`0xFE`) only ever appear in the type
/// stream, never as the code of a built node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Struct,
    Union,
    Any,
    BoolA,
    Int8A,
    Int16A,
    Int32A,
    Int64A,
    UInt8A,
    UInt16A,
    UInt32A,
    UInt64A,
    Float32A,
    Float64A,
    StringA,
    StructA,
    UnionA,
    AnyA,
    #[default]
    Null,
}

impl TypeCode {
    pub fn code(self) -> u8 {
        match self {
            TypeCode::Bool => 0x00,
            TypeCode::BoolA => 0x08,
            TypeCode::Int8 => 0x20,
            TypeCode::Int16 => 0x21,
            TypeCode::Int32 => 0x22,
            TypeCode::Int64 => 0x23,
            TypeCode::UInt8 => 0x24,
            TypeCode::UInt16 => 0x25,
            TypeCode::UInt32 => 0x26,
            TypeCode::UInt64 => 0x27,
            TypeCode::Int8A => 0x28,
            TypeCode::Int16A => 0x29,
            TypeCode::Int32A => 0x2A,
            TypeCode::Int64A => 0x2B,
            TypeCode::UInt8A => 0x2C,
            TypeCode::UInt16A => 0x2D,
            TypeCode::UInt32A => 0x2E,
            TypeCode::UInt64A => 0x2F,
            TypeCode::Float32 => 0x42,
            TypeCode::Float64 => 0x43,
            TypeCode::Float32A => 0x4A,
            TypeCode::Float64A => 0x4B,
            TypeCode::String => 0x60,
            TypeCode::StringA => 0x68,
            TypeCode::Struct => 0xC0,
            TypeCode::Union => 0xC1,
            TypeCode::Any => 0xC2,
            TypeCode::StructA => 0xC8,
            TypeCode::UnionA => 0xC9,
            TypeCode::AnyA => 0xCA,
            TypeCode::Null => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Option<TypeCode> {
        Some(match code {
            0x00 => TypeCode::Bool,
            0x08 => TypeCode::BoolA,
            0x20 => TypeCode::Int8,
            0x21 => TypeCode::Int16,
            0x22 => TypeCode::Int32,
            0x23 => TypeCode::Int64,
            0x24 => TypeCode::UInt8,
            0x25 => TypeCode::UInt16,
            0x26 => TypeCode::UInt32,
            0x27 => TypeCode::UInt64,
            0x28 => TypeCode::Int8A,
            0x29 => TypeCode::Int16A,
            0x2A => TypeCode::Int32A,
            0x2B => TypeCode::Int64A,
            0x2C => TypeCode::UInt8A,
            0x2D => TypeCode::UInt16A,
            0x2E => TypeCode::UInt32A,
            0x2F => TypeCode::UInt64A,
            0x42 => TypeCode::Float32,
            0x43 => TypeCode::Float64,
            0x4A => TypeCode::Float32A,
            0x4B => TypeCode::Float64A,
            0x60 => TypeCode::String,
            0x68 => TypeCode::StringA,
            0xC0 => TypeCode::Struct,
            0xC1 => TypeCode::Union,
            0xC2 => TypeCode::Any,
            0xC8 => TypeCode::StructA,
            0xC9 => TypeCode::UnionA,
            0xCA => TypeCode::AnyA,
            0xFF => TypeCode::Null,
            _ => return None,
        })
    }

    /// Map an array variant to its element code; identity on everything else.
    pub fn scalar_of(self) -> TypeCode {
        match self {
            TypeCode::BoolA => TypeCode::Bool,
            TypeCode::Int8A => TypeCode::Int8,
            TypeCode::Int16A => TypeCode::Int16,
            TypeCode::Int32A => TypeCode::Int32,
            TypeCode::Int64A => TypeCode::Int64,
            TypeCode::UInt8A => TypeCode::UInt8,
            TypeCode::UInt16A => TypeCode::UInt16,
            TypeCode::UInt32A => TypeCode::UInt32,
            TypeCode::UInt64A => TypeCode::UInt64,
            TypeCode::Float32A => TypeCode::Float32,
            TypeCode::Float64A => TypeCode::Float64,
            TypeCode::StringA => TypeCode::String,
            TypeCode::StructA => TypeCode::Struct,
            TypeCode::UnionA => TypeCode::Union,
            TypeCode::AnyA => TypeCode::Any,
            other => other,
        }
    }

    /// The array variant of a non-array code, if one exists.
    pub fn array_of(self) -> Option<TypeCode> {
        Some(match self {
            TypeCode::Bool => TypeCode::BoolA,
            TypeCode::Int8 => TypeCode::Int8A,
            TypeCode::Int16 => TypeCode::Int16A,
            TypeCode::Int32 => TypeCode::Int32A,
            TypeCode::Int64 => TypeCode::Int64A,
            TypeCode::UInt8 => TypeCode::UInt8A,
            TypeCode::UInt16 => TypeCode::UInt16A,
            TypeCode::UInt32 => TypeCode::UInt32A,
            TypeCode::UInt64 => TypeCode::UInt64A,
            TypeCode::Float32 => TypeCode::Float32A,
            TypeCode::Float64 => TypeCode::Float64A,
            TypeCode::String => TypeCode::StringA,
            TypeCode::Struct => TypeCode::StructA,
            TypeCode::Union => TypeCode::UnionA,
            TypeCode::Any => TypeCode::AnyA,
            _ => return None,
        })
    }

    pub fn is_array(self) -> bool {
        self != self.scalar_of()
    }
}

pub(crate) fn hash_str(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// One node of a flattened type tree.
///
/// The whole tree lives in one contiguous depth-first sequence; a node at
/// position `p` owns positions `[p+1, p+num_index)` and refers to children by
/// offsets relative to `p`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDesc {
    pub code: TypeCode,
    /// Type identifier; non-empty only for Struct/Union.
    pub id: String,
    /// Members in wire order as `(name, relative index)`. The order defines
    /// union selector indices and struct field encoding order.
    pub miter: Vec<(String, usize)>,
    /// Dotted-path name to relative index, covering every descendant
    /// reachable through nested structs of the same code.
    pub mlookup: HashMap<String, usize>,
    /// Structural fingerprint: XOR of the code, the id hash, and each
    /// member's name hash and subtree hash.
    pub hash: u64,
    /// This node's storage cell within the top-level tree.
    pub offset: usize,
    /// Exclusive end of the subtree's storage cells.
    pub next_offset: usize,
    /// Node count of the subtree rooted here, self-inclusive.
    pub num_index: usize,
}

/// Assign storage cells in depth-first order, one per node.
pub(crate) fn calculate_offsets(descs: &mut [FieldDesc]) {
    for index in 0..descs.len() {
        descs[index].offset = index;
        descs[index].next_offset = index + descs[index].num_index;
    }
}

/// Per-connection introspection cache: compact tag to previously transmitted
/// type subtree. Cleared on connection teardown.
pub type TypeCache = HashMap<u16, Vec<FieldDesc>>;

/// Recursive builder producing the same flattened form the decoder builds.
///
/// ```
/// use pvars::{TypeCode, TypeDef};
///
/// let scalar = TypeDef::structure(
///     "epics:nt/NTScalar:1.0",
///     [("value", TypeDef::scalar(TypeCode::Float64))],
/// );
/// let value = scalar.build_value();
/// assert_eq!(value.type_code(), TypeCode::Struct);
/// ```
#[derive(Debug, Clone)]
pub struct TypeDef {
    code: TypeCode,
    id: String,
    members: Vec<(String, TypeDef)>,
}

impl TypeDef {
    /// A leaf field: scalar, scalar array, or `Any`.
    pub fn scalar(code: TypeCode) -> TypeDef {
        debug_assert!(!matches!(
            code,
            TypeCode::Struct | TypeCode::Union | TypeCode::StructA | TypeCode::UnionA
        ));
        TypeDef {
            code,
            id: String::new(),
            members: Vec::new(),
        }
    }

    pub fn any() -> TypeDef {
        TypeDef::scalar(TypeCode::Any)
    }

    pub fn structure<S: Into<String>>(
        id: &str,
        members: impl IntoIterator<Item = (S, TypeDef)>,
    ) -> TypeDef {
        TypeDef {
            code: TypeCode::Struct,
            id: id.to_string(),
            members: members.into_iter().map(|(n, d)| (n.into(), d)).collect(),
        }
    }

    pub fn union_of<S: Into<String>>(
        id: &str,
        members: impl IntoIterator<Item = (S, TypeDef)>,
    ) -> TypeDef {
        TypeDef {
            code: TypeCode::Union,
            id: id.to_string(),
            members: members.into_iter().map(|(n, d)| (n.into(), d)).collect(),
        }
    }

    /// Turn this definition into an array of itself.
    pub fn array_of(mut self) -> TypeDef {
        self.code = self
            .code
            .array_of()
            .expect("no array form of this type exists");
        self
    }

    /// Flatten into the shared node sequence, with offsets assigned.
    pub fn build(&self) -> Arc<[FieldDesc]> {
        let mut descs = Vec::new();
        self.build_into(&mut descs);
        calculate_offsets(&mut descs);
        Arc::from(descs)
    }

    /// Build a default-initialised [`Value`] of this type.
    pub fn build_value(&self) -> Value {
        Value::new(self.build(), 0)
    }

    fn build_into(&self, descs: &mut Vec<FieldDesc>) {
        let index = descs.len();
        descs.push(FieldDesc {
            code: self.code,
            hash: self.code.code() as u64,
            ..Default::default()
        });

        match self.code {
            TypeCode::Struct | TypeCode::Union => {
                descs[index].id = self.id.clone();
                descs[index].hash ^= hash_str(&self.id);
                for (name, member) in &self.members {
                    let cindex = descs.len();
                    member.build_into(descs);
                    let rel = cindex - index;
                    let child_hash = descs[cindex].hash;
                    let child_code = descs[cindex].code;

                    let fld = &mut descs[index];
                    fld.hash ^= hash_str(name) ^ child_hash;
                    fld.miter.push((name.clone(), rel));
                    fld.mlookup.insert(name.clone(), rel);

                    if self.code == TypeCode::Struct && child_code == TypeCode::Struct {
                        // nested struct of the same code: lift its paths
                        let nested: Vec<(String, usize)> = descs[cindex]
                            .mlookup
                            .iter()
                            .map(|(path, sub)| (format!("{name}.{path}"), rel + sub))
                            .collect();
                        descs[index].mlookup.extend(nested);
                    }
                }
            }
            TypeCode::StructA | TypeCode::UnionA => {
                let element = TypeDef {
                    code: self.code.scalar_of(),
                    id: self.id.clone(),
                    members: self.members.clone(),
                };
                element.build_into(descs);
            }
            _ => {}
        }

        descs[index].num_index = descs.len() - index;
    }
}

/// Type-erased shared array of field elements.
///
/// Compound holds the elements of struct/union/any arrays; `None` entries
/// are null elements.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    Bool(Arc<[bool]>),
    Int8(Arc<[i8]>),
    Int16(Arc<[i16]>),
    Int32(Arc<[i32]>),
    Int64(Arc<[i64]>),
    UInt8(Arc<[u8]>),
    UInt16(Arc<[u16]>),
    UInt32(Arc<[u32]>),
    UInt64(Arc<[u64]>),
    Float32(Arc<[f32]>),
    Float64(Arc<[f64]>),
    String(Arc<[String]>),
    Compound(Arc<[Option<Value>]>),
}

impl ArrayValue {
    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Bool(val) => val.len(),
            ArrayValue::Int8(val) => val.len(),
            ArrayValue::Int16(val) => val.len(),
            ArrayValue::Int32(val) => val.len(),
            ArrayValue::Int64(val) => val.len(),
            ArrayValue::UInt8(val) => val.len(),
            ArrayValue::UInt16(val) => val.len(),
            ArrayValue::UInt32(val) => val.len(),
            ArrayValue::UInt64(val) => val.len(),
            ArrayValue::Float32(val) => val.len(),
            ArrayValue::Float64(val) => val.len(),
            ArrayValue::String(val) => val.len(),
            ArrayValue::Compound(val) => val.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty array matching the given array type code.
    pub(crate) fn empty_for(code: TypeCode) -> ArrayValue {
        match code.scalar_of() {
            TypeCode::Bool => ArrayValue::Bool(Arc::from(Vec::new())),
            TypeCode::Int8 => ArrayValue::Int8(Arc::from(Vec::new())),
            TypeCode::Int16 => ArrayValue::Int16(Arc::from(Vec::new())),
            TypeCode::Int32 => ArrayValue::Int32(Arc::from(Vec::new())),
            TypeCode::Int64 => ArrayValue::Int64(Arc::from(Vec::new())),
            TypeCode::UInt8 => ArrayValue::UInt8(Arc::from(Vec::new())),
            TypeCode::UInt16 => ArrayValue::UInt16(Arc::from(Vec::new())),
            TypeCode::UInt32 => ArrayValue::UInt32(Arc::from(Vec::new())),
            TypeCode::UInt64 => ArrayValue::UInt64(Arc::from(Vec::new())),
            TypeCode::Float32 => ArrayValue::Float32(Arc::from(Vec::new())),
            TypeCode::Float64 => ArrayValue::Float64(Arc::from(Vec::new())),
            TypeCode::String => ArrayValue::String(Arc::from(Vec::new())),
            _ => ArrayValue::Compound(Arc::from(Vec::new())),
        }
    }

    /// Does this array fit under the given node code?
    pub(crate) fn matches(&self, code: TypeCode) -> bool {
        matches!(
            (self, code),
            (ArrayValue::Bool(_), TypeCode::BoolA)
                | (ArrayValue::Int8(_), TypeCode::Int8A)
                | (ArrayValue::Int16(_), TypeCode::Int16A)
                | (ArrayValue::Int32(_), TypeCode::Int32A)
                | (ArrayValue::Int64(_), TypeCode::Int64A)
                | (ArrayValue::UInt8(_), TypeCode::UInt8A)
                | (ArrayValue::UInt16(_), TypeCode::UInt16A)
                | (ArrayValue::UInt32(_), TypeCode::UInt32A)
                | (ArrayValue::UInt64(_), TypeCode::UInt64A)
                | (ArrayValue::Float32(_), TypeCode::Float32A)
                | (ArrayValue::Float64(_), TypeCode::Float64A)
                | (ArrayValue::String(_), TypeCode::StringA)
                | (
                    ArrayValue::Compound(_),
                    TypeCode::StructA | TypeCode::UnionA | TypeCode::AnyA
                )
        )
    }
}

/// Implement From<Vec<T>> for the matching ArrayValue kind
macro_rules! impl_arrayvalue_from {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for ArrayValue {
            fn from(value: Vec<$typ>) -> Self {
                ArrayValue::$variant(value.into())
            }
        }
    };
}
impl_arrayvalue_from!(Bool, bool);
impl_arrayvalue_from!(Int8, i8);
impl_arrayvalue_from!(Int16, i16);
impl_arrayvalue_from!(Int32, i32);
impl_arrayvalue_from!(Int64, i64);
impl_arrayvalue_from!(UInt8, u8);
impl_arrayvalue_from!(UInt16, u16);
impl_arrayvalue_from!(UInt32, u32);
impl_arrayvalue_from!(UInt64, u64);
impl_arrayvalue_from!(Float32, f32);
impl_arrayvalue_from!(Float64, f64);
impl_arrayvalue_from!(String, String);
impl_arrayvalue_from!(Compound, Option<Value>);

/// One storage cell, paired 1:1 with a [`FieldDesc`] node.
///
/// Numeric storage is widened: all signed integers share `Integer`, unsigned
/// integers and bool share `UInteger`, both floats share `Real`. Struct
/// parents hold no direct value. Union and `Any` selections hold a complete
/// sub-[`Value`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldStorage {
    #[default]
    Null,
    Integer(i64),
    UInteger(u64),
    Real(f64),
    String(String),
    Array(ArrayValue),
    Compound(Option<Box<Value>>),
}

fn default_storage(code: TypeCode) -> FieldStorage {
    match code {
        TypeCode::Struct | TypeCode::Null => FieldStorage::Null,
        TypeCode::Bool | TypeCode::UInt8 | TypeCode::UInt16 | TypeCode::UInt32 | TypeCode::UInt64 => {
            FieldStorage::UInteger(0)
        }
        TypeCode::Int8 | TypeCode::Int16 | TypeCode::Int32 | TypeCode::Int64 => {
            FieldStorage::Integer(0)
        }
        TypeCode::Float32 | TypeCode::Float64 => FieldStorage::Real(0.0),
        TypeCode::String => FieldStorage::String(String::new()),
        TypeCode::Union | TypeCode::Any => FieldStorage::Compound(None),
        code => FieldStorage::Array(ArrayValue::empty_for(code)),
    }
}

/// Errors from the typed [`Value`] accessors.
///
/// These are API errors, distinct from wire faults: a failed accessor leaves
/// the value untouched.
#[derive(Debug, Error, PartialEq)]
pub enum AccessError {
    #[error("no field named '{0}'")]
    NoField(String),
    #[error("field '{0}' holds a different storage kind")]
    WrongKind(String),
    #[error("'{member}' is not a member of union '{union}'")]
    NotAMember { member: String, union: String },
    #[error("value cannot be represented by the target field")]
    NoConvert,
}

/// A typed value: a handle into a shared type tree plus owned storage.
///
/// Storage cell `i` belongs to type node `root + i`; the parallel valid
/// bitset records which cells have been assigned. Sub-values handed out for
/// union selections and array elements share the `Arc` type handle.
#[derive(Debug, Clone)]
pub struct Value {
    descs: Arc<[FieldDesc]>,
    index: usize,
    store: Vec<FieldStorage>,
    valid: BitSet,
}

impl PartialEq for Value {
    /// Same type shape and the same data in every cell; valid bits are
    /// delta-encoding state, not part of equality.
    fn eq(&self, other: &Value) -> bool {
        self.desc().hash == other.desc().hash && self.store == other.store
    }
}

impl Value {
    /// Default-initialised value for the subtree rooted at `index`.
    pub fn new(descs: Arc<[FieldDesc]>, index: usize) -> Value {
        let count = descs[index].num_index;
        let store = (index..index + count)
            .map(|node| default_storage(descs[node].code))
            .collect();
        Value {
            descs,
            index,
            store,
            valid: BitSet::with_len(count),
        }
    }

    pub fn desc(&self) -> &FieldDesc {
        &self.descs[self.index]
    }

    pub fn type_code(&self) -> TypeCode {
        self.desc().code
    }

    /// Number of storage cells (= nodes) in this value's subtree.
    pub fn num_cells(&self) -> usize {
        self.desc().num_index
    }

    pub fn valid(&self) -> &BitSet {
        &self.valid
    }

    pub(crate) fn set_valid(&mut self, valid: BitSet) {
        self.valid = valid;
    }

    pub(crate) fn descs_handle(&self) -> &Arc<[FieldDesc]> {
        &self.descs
    }

    pub(crate) fn root_index(&self) -> usize {
        self.index
    }

    pub(crate) fn node(&self, rel: usize) -> &FieldDesc {
        &self.descs[self.index + rel]
    }

    pub(crate) fn cell(&self, rel: usize) -> &FieldStorage {
        &self.store[rel]
    }

    pub(crate) fn cell_mut(&mut self, rel: usize) -> &mut FieldStorage {
        &mut self.store[rel]
    }

    /// Resolve a dotted path to a cell index; `""` names this value itself.
    fn resolve(&self, name: &str) -> Result<usize, AccessError> {
        if name.is_empty() {
            return Ok(0);
        }
        self.desc()
            .mlookup
            .get(name)
            .copied()
            .ok_or_else(|| AccessError::NoField(name.to_string()))
    }

    /// Mark a field as assigned without changing its content.
    pub fn mark(&mut self, name: &str) -> Result<(), AccessError> {
        let rel = self.resolve(name)?;
        self.valid.set(rel);
        Ok(())
    }

    pub fn is_marked(&self, name: &str) -> Result<bool, AccessError> {
        Ok(self.valid.get(self.resolve(name)?))
    }

    /// Store a number, widening or narrowing into the cell's storage kind.
    pub fn set_number<T: NumCast + Copy>(&mut self, name: &str, value: T) -> Result<(), AccessError> {
        let rel = self.resolve(name)?;
        match &mut self.store[rel] {
            FieldStorage::Integer(cell) => {
                *cell = NumCast::from(value).ok_or(AccessError::NoConvert)?
            }
            FieldStorage::UInteger(cell) => {
                *cell = NumCast::from(value).ok_or(AccessError::NoConvert)?
            }
            FieldStorage::Real(cell) => {
                *cell = NumCast::from(value).ok_or(AccessError::NoConvert)?
            }
            _ => return Err(AccessError::WrongKind(name.to_string())),
        }
        self.valid.set(rel);
        Ok(())
    }

    /// Read a numeric field, converting from the widened storage.
    pub fn number<T: NumCast>(&self, name: &str) -> Result<T, AccessError> {
        let converted = match self.cell(self.resolve(name)?) {
            FieldStorage::Integer(cell) => T::from(*cell),
            FieldStorage::UInteger(cell) => T::from(*cell),
            FieldStorage::Real(cell) => T::from(*cell),
            _ => return Err(AccessError::WrongKind(name.to_string())),
        };
        converted.ok_or(AccessError::NoConvert)
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<(), AccessError> {
        let rel = self.resolve(name)?;
        if self.node(rel).code != TypeCode::Bool {
            return Err(AccessError::WrongKind(name.to_string()));
        }
        self.store[rel] = FieldStorage::UInteger(value as u64);
        self.valid.set(rel);
        Ok(())
    }

    pub fn boolean(&self, name: &str) -> Result<bool, AccessError> {
        let rel = self.resolve(name)?;
        match (self.node(rel).code, self.cell(rel)) {
            (TypeCode::Bool, FieldStorage::UInteger(cell)) => Ok(*cell != 0),
            _ => Err(AccessError::WrongKind(name.to_string())),
        }
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> Result<(), AccessError> {
        let rel = self.resolve(name)?;
        match &mut self.store[rel] {
            FieldStorage::String(cell) => *cell = value.into(),
            _ => return Err(AccessError::WrongKind(name.to_string())),
        }
        self.valid.set(rel);
        Ok(())
    }

    pub fn string(&self, name: &str) -> Result<&str, AccessError> {
        match self.cell(self.resolve(name)?) {
            FieldStorage::String(cell) => Ok(cell),
            _ => Err(AccessError::WrongKind(name.to_string())),
        }
    }

    pub fn set_array(&mut self, name: &str, value: impl Into<ArrayValue>) -> Result<(), AccessError> {
        let rel = self.resolve(name)?;
        let array = value.into();
        if !array.matches(self.node(rel).code) {
            return Err(AccessError::WrongKind(name.to_string()));
        }
        self.store[rel] = FieldStorage::Array(array);
        self.valid.set(rel);
        Ok(())
    }

    pub fn array(&self, name: &str) -> Result<&ArrayValue, AccessError> {
        match self.cell(self.resolve(name)?) {
            FieldStorage::Array(cell) => Ok(cell),
            _ => Err(AccessError::WrongKind(name.to_string())),
        }
    }

    /// Select a union member, returning the member sub-value for assignment.
    pub fn select_union(&mut self, name: &str, member: &str) -> Result<&mut Value, AccessError> {
        let rel = self.resolve(name)?;
        let node = self.node(rel);
        if node.code != TypeCode::Union {
            return Err(AccessError::WrongKind(name.to_string()));
        }
        let member_rel = node
            .miter
            .iter()
            .find(|(n, _)| n == member)
            .map(|(_, r)| *r)
            .ok_or_else(|| AccessError::NotAMember {
                member: member.to_string(),
                union: node.id.clone(),
            })?;
        let selected = Value::new(self.descs.clone(), self.index + rel + member_rel);
        self.store[rel] = FieldStorage::Compound(Some(Box::new(selected)));
        self.valid.set(rel);
        match &mut self.store[rel] {
            FieldStorage::Compound(Some(sub)) => Ok(sub),
            _ => unreachable!(),
        }
    }

    /// Clear a union back to its null selection.
    pub fn clear_union(&mut self, name: &str) -> Result<(), AccessError> {
        let rel = self.resolve(name)?;
        if self.node(rel).code != TypeCode::Union {
            return Err(AccessError::WrongKind(name.to_string()));
        }
        self.store[rel] = FieldStorage::Compound(None);
        self.valid.set(rel);
        Ok(())
    }

    /// Assign an `Any` field; `None` makes it null.
    pub fn set_any(&mut self, name: &str, value: Option<Value>) -> Result<(), AccessError> {
        let rel = self.resolve(name)?;
        if self.node(rel).code != TypeCode::Any {
            return Err(AccessError::WrongKind(name.to_string()));
        }
        self.store[rel] = FieldStorage::Compound(value.map(Box::new));
        self.valid.set(rel);
        Ok(())
    }

    /// The sub-value held by a union or `Any` field, if one is selected.
    pub fn compound(&self, name: &str) -> Result<Option<&Value>, AccessError> {
        let rel = self.resolve(name)?;
        match (self.node(rel).code, self.cell(rel)) {
            (TypeCode::Union | TypeCode::Any, FieldStorage::Compound(sub)) => {
                Ok(sub.as_deref())
            }
            _ => Err(AccessError::WrongKind(name.to_string())),
        }
    }

    /// A fresh element value for a struct- or union-array field.
    pub fn new_element(&self, name: &str) -> Result<Value, AccessError> {
        let rel = self.resolve(name)?;
        match self.node(rel).code {
            TypeCode::StructA | TypeCode::UnionA => {
                Ok(Value::new(self.descs.clone(), self.index + rel + 1))
            }
            _ => Err(AccessError::WrongKind(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> TypeDef {
        TypeDef::structure(
            "A",
            [
                (
                    "B",
                    TypeDef::structure("B", [("x", TypeDef::scalar(TypeCode::Int32))]),
                ),
                ("y", TypeDef::scalar(TypeCode::Float64)),
            ],
        )
    }

    #[test]
    fn type_codes_round_trip() {
        for code in [
            TypeCode::Bool,
            TypeCode::Int64,
            TypeCode::UInt8A,
            TypeCode::Float32,
            TypeCode::StringA,
            TypeCode::Struct,
            TypeCode::UnionA,
            TypeCode::AnyA,
            TypeCode::Null,
        ] {
            assert_eq!(TypeCode::from_code(code.code()), Some(code));
        }
        assert_eq!(TypeCode::from_code(0x10), None);
        assert_eq!(TypeCode::Int32A.scalar_of(), TypeCode::Int32);
        assert_eq!(TypeCode::Struct.scalar_of(), TypeCode::Struct);
        assert!(TypeCode::StructA.is_array());
        assert!(!TypeCode::Any.is_array());
    }

    #[test]
    fn build_assigns_offsets_and_counts() {
        let descs = nested().build();
        // A, B, B.x, y
        assert_eq!(descs.len(), 4);
        assert_eq!(descs[0].num_index, 4);
        assert_eq!(descs[1].num_index, 2);
        for (index, desc) in descs.iter().enumerate() {
            assert_eq!(desc.offset, index);
            assert_eq!(desc.next_offset, index + desc.num_index);
            assert!(desc.next_offset <= descs[0].num_index);
            for (_, rel) in &desc.miter {
                let child = index + rel;
                assert!(desc.offset < child && child < desc.next_offset);
            }
        }
    }

    #[test]
    fn mlookup_lifts_nested_struct_paths() {
        let descs = nested().build();
        assert_eq!(descs[0].mlookup["B"], 1);
        assert_eq!(descs[0].mlookup["B.x"], 2);
        assert_eq!(descs[0].mlookup["y"], 3);
        // the nested struct sees only its own child
        assert_eq!(descs[1].mlookup.len(), 1);
        assert_eq!(descs[1].mlookup["x"], 1);
    }

    #[test]
    fn hash_reflects_structure() {
        assert_eq!(nested().build()[0].hash, nested().build()[0].hash);
        let renamed = TypeDef::structure(
            "A",
            [
                (
                    "B",
                    TypeDef::structure("B", [("x", TypeDef::scalar(TypeCode::Int32))]),
                ),
                ("z", TypeDef::scalar(TypeCode::Float64)),
            ],
        );
        assert_ne!(nested().build()[0].hash, renamed.build()[0].hash);
    }

    #[test]
    fn numeric_accessors_convert() {
        let mut value = nested().build_value();
        value.set_number("B.x", 42u8).unwrap();
        value.set_number("y", 1.5f32).unwrap();
        assert_eq!(value.number::<i64>("B.x").unwrap(), 42);
        assert_eq!(value.number::<f64>("y").unwrap(), 1.5);
        // out-of-range narrowing is refused
        assert_eq!(
            value.set_number("B.x", u64::MAX),
            Err(AccessError::NoConvert)
        );
        value.set_number("y", -2.5f64).unwrap();
        assert_eq!(value.number::<u8>("y"), Err(AccessError::NoConvert));
        assert_eq!(
            value.set_number("missing", 1),
            Err(AccessError::NoField("missing".to_string()))
        );
        assert!(value.is_marked("B.x").unwrap());
        assert!(!value.is_marked("B").unwrap());
    }

    #[test]
    fn union_selection() {
        let def = TypeDef::structure(
            "top",
            [(
                "u",
                TypeDef::union_of(
                    "choice",
                    [
                        ("a", TypeDef::scalar(TypeCode::Int32)),
                        ("b", TypeDef::scalar(TypeCode::String)),
                    ],
                ),
            )],
        );
        let mut value = def.build_value();
        assert_eq!(value.compound("u").unwrap(), None);
        value
            .select_union("u", "b")
            .unwrap()
            .set_string("", "hi")
            .unwrap();
        assert_eq!(value.compound("u").unwrap().unwrap().string("").unwrap(), "hi");
        assert_eq!(
            value.select_union("u", "c").unwrap_err(),
            AccessError::NotAMember {
                member: "c".to_string(),
                union: "choice".to_string()
            }
        );
        value.clear_union("u").unwrap();
        assert_eq!(value.compound("u").unwrap(), None);
    }

    #[test]
    fn array_kind_checked() {
        let def = TypeDef::structure("arr", [("value", TypeDef::scalar(TypeCode::Int32A))]);
        let mut value = def.build_value();
        value.set_array("value", vec![1i32, 2, 3]).unwrap();
        assert_eq!(value.array("value").unwrap().len(), 3);
        assert_eq!(
            value.set_array("value", vec![1.0f64]),
            Err(AccessError::WrongKind("value".to_string()))
        );
    }
}
