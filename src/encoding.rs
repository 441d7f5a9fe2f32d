//! Wire codecs for type descriptions and typed values.
//!
//! The type codec serialises [`FieldDesc`] trees. Senders may prefix a tree
//! with an introspection-cache tag - `0xFD key` defines a cache entry,
//! `0xFE key` replays one, `0xFF` is the null type - so the decoder carries a
//! per-connection [`TypeCache`]. The encoder itself never emits tags; tagging
//! is sender policy layered on top.
//!
//! The value codec has three modes:
//! - *full* ([`to_wire_full`]/[`from_wire_full`]): every cell of the subtree
//!   in depth-first order.
//! - *valid-delta* ([`to_wire_valid`]/[`from_wire_valid`]): the valid bitset
//!   followed by only the marked cells. Struct parents own a bit but carry
//!   no bytes.
//! - *type+value* ([`from_wire_type_value`]): an `Any`-style payload, type
//!   stream first.
//!
//! All decoding reports failure through the buffer's sticky fault; a fault
//! aborts the remaining decode and the caller discards the partial value.

use std::sync::Arc;

use crate::buffer::{ReadBuf, WriteBuf};
use crate::data::{
    ArrayValue, FIXED_LENGTH_FLAG, FieldDesc, FieldStorage, TypeCache, TypeCode, Value,
    calculate_offsets, hash_str,
};

/// Maximum recursion depth of the type stream.
const MAX_TYPE_DEPTH: u32 = 20;

/// Serialise the type subtree rooted at `pos`.
pub fn type_to_wire(buf: &mut WriteBuf, descs: &[FieldDesc], pos: usize) {
    let cur = &descs[pos];
    buf.put_u8(cur.code.code());

    match cur.code {
        TypeCode::StructA | TypeCode::UnionA => {
            // single child: the element description
            type_to_wire(buf, descs, pos + 1);
        }
        TypeCode::Struct | TypeCode::Union => {
            buf.put_string(&cur.id);
            buf.put_size(cur.miter.len());
            for (name, rel) in &cur.miter {
                buf.put_string(name);
                type_to_wire(buf, descs, pos + rel);
            }
        }
        _ => {}
    }
}

/// Destination and cache for one type-stream decode.
pub struct TypeDeserContext<'a> {
    pub descs: &'a mut Vec<FieldDesc>,
    pub cache: &'a mut TypeCache,
}

/// Decode one type subtree from the stream, appending to `ctxt.descs`.
///
/// A `Null` tag appends nothing. Cache tags splice previously transmitted
/// subtrees. Anything carrying the deprecated fixed-length bit faults.
pub fn type_from_wire(buf: &mut ReadBuf, ctxt: &mut TypeDeserContext, depth: u32) {
    if !buf.good() || depth > MAX_TYPE_DEPTH {
        buf.fault();
        return;
    }

    let code = buf.get_u8();
    let index = ctxt.descs.len();

    if code == 0xFF {
        return;
    } else if code == 0xFD {
        // define cache entry
        let key = buf.get_u16();
        type_from_wire(buf, ctxt, depth + 1);
        if !buf.good() || index == ctxt.descs.len() {
            buf.fault();
            return;
        }
        ctxt.cache.insert(key, ctxt.descs[index..].to_vec());
    } else if code == 0xFE {
        // replay cache entry
        let key = buf.get_u16();
        match ctxt.cache.get(&key) {
            Some(entry) if !entry.is_empty() => ctxt.descs.extend(entry.iter().cloned()),
            _ => buf.fault(),
        }
    } else if code & FIXED_LENGTH_FLAG != 0 {
        // fixed length arrays are deprecated
        buf.fault();
    } else {
        let Some(tc) = TypeCode::from_code(code) else {
            buf.fault();
            return;
        };
        ctxt.descs.push(FieldDesc {
            code: tc,
            hash: code as u64,
            ..Default::default()
        });

        match tc {
            TypeCode::StructA | TypeCode::UnionA => {
                type_from_wire(buf, ctxt, depth + 1);
                if !buf.good()
                    || ctxt.descs.len() == index + 1
                    || ctxt.descs[index + 1].code != tc.scalar_of()
                {
                    buf.fault();
                    return;
                }
            }
            TypeCode::Struct | TypeCode::Union => {
                let id = buf.get_string();
                {
                    let fld = &mut ctxt.descs[index];
                    fld.hash ^= hash_str(&id);
                    fld.id = id;
                }
                let nfld = buf.get_size();
                if !buf.good() || nfld == usize::MAX {
                    buf.fault();
                    return;
                }
                for _ in 0..nfld {
                    let name = buf.get_string();
                    let cindex = ctxt.descs.len();
                    type_from_wire(buf, ctxt, depth + 1);
                    if !buf.good() || cindex >= ctxt.descs.len() {
                        buf.fault();
                        return;
                    }

                    let rel = cindex - index;
                    let child_hash = ctxt.descs[cindex].hash;
                    let child_code = ctxt.descs[cindex].code;

                    let fld = &mut ctxt.descs[index];
                    fld.hash ^= hash_str(&name) ^ child_hash;
                    fld.miter.push((name.clone(), rel));
                    fld.mlookup.insert(name.clone(), rel);

                    if tc == TypeCode::Struct && child_code == TypeCode::Struct {
                        // nested struct of the same code: lift its paths
                        let nested: Vec<(String, usize)> = ctxt.descs[cindex]
                            .mlookup
                            .iter()
                            .map(|(path, sub)| (format!("{name}.{path}"), rel + sub))
                            .collect();
                        ctxt.descs[index].mlookup.extend(nested);
                    }
                }
            }
            _ => {}
        }

        ctxt.descs[index].num_index = ctxt.descs.len() - index;
    }
}

/// Decode a complete type stream into a shared tree with offsets assigned.
///
/// `None` means either the null type or a fault; disambiguate with
/// [`ReadBuf::good`].
pub fn from_wire_type(buf: &mut ReadBuf, cache: &mut TypeCache) -> Option<Arc<[FieldDesc]>> {
    let mut descs = Vec::new();
    let mut ctxt = TypeDeserContext {
        descs: &mut descs,
        cache,
    };
    type_from_wire(buf, &mut ctxt, 0);
    if !buf.good() || descs.is_empty() {
        return None;
    }
    calculate_offsets(&mut descs);
    Some(Arc::from(descs))
}

/// Serialise every cell of the value's subtree in depth-first order.
pub fn to_wire_full(buf: &mut WriteBuf, val: &Value) {
    to_wire_field(buf, val, 0);
}

/// Serialise the valid bitset, then only the marked cells.
pub fn to_wire_valid(buf: &mut WriteBuf, val: &Value) {
    buf.put_bitset(val.valid());
    let mut next = val.valid().next_set(0);
    while let Some(cell) = next {
        if cell >= val.num_cells() {
            break;
        }
        // struct parents carry a bit but no bytes
        if val.node(cell).code != TypeCode::Struct {
            to_wire_field(buf, val, cell);
        }
        next = val.valid().next_set(cell + 1);
    }
}

/// Populate every cell of the value's subtree from the stream.
pub fn from_wire_full(buf: &mut ReadBuf, cache: &mut TypeCache, val: &mut Value) {
    from_wire_field(buf, cache, val, 0);
}

/// Consume a valid bitset and then only the marked cells; unmarked cells
/// keep their prior content.
pub fn from_wire_valid(buf: &mut ReadBuf, cache: &mut TypeCache, val: &mut Value) {
    let mut valid = buf.get_bitset();
    // the wire rounds up to whole bytes
    valid.resize(val.num_cells());
    val.set_valid(valid);
    if !buf.good() {
        return;
    }
    let mut next = val.valid().next_set(0);
    while let Some(cell) = next {
        if val.node(cell).code != TypeCode::Struct {
            from_wire_field(buf, cache, val, cell);
        }
        next = val.valid().next_set(cell + 1);
    }
}

/// Decode a type stream followed by a full value: the top-level `Any` form.
///
/// `None` is the null value (or a fault; check [`ReadBuf::good`]).
pub fn from_wire_type_value(buf: &mut ReadBuf, cache: &mut TypeCache) -> Option<Value> {
    let descs = from_wire_type(buf, cache)?;
    let mut val = Value::new(descs, 0);
    from_wire_full(buf, cache, &mut val);
    Some(val)
}

fn union_selector(desc: &FieldDesc, abs: usize, descs: &Arc<[FieldDesc]>, sub: &Value) -> usize {
    desc.miter
        .iter()
        .position(|(_, rel)| {
            Arc::ptr_eq(descs, sub.descs_handle()) && sub.root_index() == abs + rel
        })
        .expect("union holds a value that is not a declared member")
}

fn to_wire_field(buf: &mut WriteBuf, val: &Value, rel: usize) {
    let descs = val.descs_handle().clone();
    let abs = val.root_index() + rel;
    let desc = &descs[abs];

    if desc.code == TypeCode::Struct {
        for (_, mrel) in &desc.miter {
            to_wire_field(buf, val, rel + mrel);
        }
        return;
    }

    match (val.cell(rel), desc.code) {
        (FieldStorage::Integer(v), TypeCode::Int8) => buf.put_i8(*v as i8),
        (FieldStorage::Integer(v), TypeCode::Int16) => buf.put_i16(*v as i16),
        (FieldStorage::Integer(v), TypeCode::Int32) => buf.put_i32(*v as i32),
        (FieldStorage::Integer(v), TypeCode::Int64) => buf.put_i64(*v),
        (FieldStorage::UInteger(v), TypeCode::Bool) => buf.put_u8((*v != 0) as u8),
        (FieldStorage::UInteger(v), TypeCode::UInt8) => buf.put_u8(*v as u8),
        (FieldStorage::UInteger(v), TypeCode::UInt16) => buf.put_u16(*v as u16),
        (FieldStorage::UInteger(v), TypeCode::UInt32) => buf.put_u32(*v as u32),
        (FieldStorage::UInteger(v), TypeCode::UInt64) => buf.put_u64(*v),
        (FieldStorage::Real(v), TypeCode::Float32) => buf.put_f32(*v as f32),
        (FieldStorage::Real(v), TypeCode::Float64) => buf.put_f64(*v),
        (FieldStorage::String(v), TypeCode::String) => buf.put_string(v),
        (FieldStorage::Compound(sel), TypeCode::Union) => match sel {
            // null union selection
            None => buf.put_size(usize::MAX),
            Some(sub) => {
                buf.put_size(union_selector(desc, abs, &descs, sub));
                to_wire_full(buf, sub);
            }
        },
        (FieldStorage::Compound(sel), TypeCode::Any) => match sel {
            None => buf.put_u8(0xFF),
            Some(sub) => {
                type_to_wire(buf, sub.descs_handle(), sub.root_index());
                to_wire_full(buf, sub);
            }
        },
        (FieldStorage::Array(arr), code) => to_wire_array(buf, arr, code, &descs, abs),
        _ => {
            debug_assert!(false, "storage does not match the field description");
            buf.fault();
        }
    }
}

fn to_wire_array(
    buf: &mut WriteBuf,
    arr: &ArrayValue,
    code: TypeCode,
    descs: &Arc<[FieldDesc]>,
    abs: usize,
) {
    macro_rules! put_elems {
        ($elems:expr, $put:ident) => {{
            buf.put_size($elems.len());
            for v in $elems.iter() {
                buf.$put(*v);
            }
        }};
    }

    match (arr, code) {
        (ArrayValue::Bool(elems), TypeCode::BoolA) => {
            // bool arrays are packed one byte per element
            buf.put_size(elems.len());
            for v in elems.iter() {
                buf.put_u8(*v as u8);
            }
        }
        (ArrayValue::Int8(elems), TypeCode::Int8A) => put_elems!(elems, put_i8),
        (ArrayValue::Int16(elems), TypeCode::Int16A) => put_elems!(elems, put_i16),
        (ArrayValue::Int32(elems), TypeCode::Int32A) => put_elems!(elems, put_i32),
        (ArrayValue::Int64(elems), TypeCode::Int64A) => put_elems!(elems, put_i64),
        (ArrayValue::UInt8(elems), TypeCode::UInt8A) => put_elems!(elems, put_u8),
        (ArrayValue::UInt16(elems), TypeCode::UInt16A) => put_elems!(elems, put_u16),
        (ArrayValue::UInt32(elems), TypeCode::UInt32A) => put_elems!(elems, put_u32),
        (ArrayValue::UInt64(elems), TypeCode::UInt64A) => put_elems!(elems, put_u64),
        (ArrayValue::Float32(elems), TypeCode::Float32A) => put_elems!(elems, put_f32),
        (ArrayValue::Float64(elems), TypeCode::Float64A) => put_elems!(elems, put_f64),
        (ArrayValue::String(elems), TypeCode::StringA) => {
            buf.put_size(elems.len());
            for v in elems.iter() {
                buf.put_string(v);
            }
        }
        (ArrayValue::Compound(elems), TypeCode::StructA | TypeCode::UnionA) => {
            buf.put_size(elems.len());
            for elem in elems.iter() {
                match elem {
                    None => buf.put_u8(0),
                    Some(sub) => {
                        debug_assert!(
                            Arc::ptr_eq(descs, sub.descs_handle())
                                && sub.root_index() == abs + 1,
                            "array element of a foreign type"
                        );
                        buf.put_u8(1);
                        to_wire_full(buf, sub);
                    }
                }
            }
        }
        (ArrayValue::Compound(elems), TypeCode::AnyA) => {
            buf.put_size(elems.len());
            for elem in elems.iter() {
                match elem {
                    None => buf.put_u8(0),
                    Some(sub) => {
                        buf.put_u8(1);
                        type_to_wire(buf, sub.descs_handle(), sub.root_index());
                        to_wire_full(buf, sub);
                    }
                }
            }
        }
        _ => {
            debug_assert!(false, "array storage does not match the field description");
            buf.fault();
        }
    }
}

fn from_wire_field(buf: &mut ReadBuf, cache: &mut TypeCache, val: &mut Value, rel: usize) {
    let descs = val.descs_handle().clone();
    let abs = val.root_index() + rel;
    let desc = &descs[abs];

    if desc.code == TypeCode::Struct {
        for (_, mrel) in &desc.miter {
            from_wire_field(buf, cache, val, rel + mrel);
        }
        return;
    }

    match desc.code {
        TypeCode::Union => {
            if !matches!(val.cell(rel), FieldStorage::Compound(_)) {
                buf.fault();
                return;
            }
            let select = buf.get_size();
            if !buf.good() {
                return;
            }
            let content = if select == usize::MAX {
                FieldStorage::Compound(None)
            } else if select < desc.miter.len() {
                let mut sub = Value::new(descs.clone(), abs + desc.miter[select].1);
                from_wire_full(buf, cache, &mut sub);
                FieldStorage::Compound(Some(Box::new(sub)))
            } else {
                // invalid selector
                buf.fault();
                return;
            };
            *val.cell_mut(rel) = content;
        }
        TypeCode::Any => {
            if !matches!(val.cell(rel), FieldStorage::Compound(_)) {
                buf.fault();
                return;
            }
            match from_wire_type(buf, cache) {
                None => {
                    if buf.good() {
                        *val.cell_mut(rel) = FieldStorage::Compound(None);
                    }
                }
                Some(typ) => {
                    let mut sub = Value::new(typ, 0);
                    from_wire_full(buf, cache, &mut sub);
                    *val.cell_mut(rel) = FieldStorage::Compound(Some(Box::new(sub)));
                }
            }
        }
        code if code.is_array() => {
            if !matches!(val.cell(rel), FieldStorage::Array(_)) {
                buf.fault();
                return;
            }
            if let Some(arr) = from_wire_array(buf, cache, &descs, abs, code)
                && buf.good()
            {
                *val.cell_mut(rel) = FieldStorage::Array(arr);
            }
        }
        _ => match (val.cell_mut(rel), desc.code) {
            (FieldStorage::Integer(v), TypeCode::Int8) => *v = buf.get_i8() as i64,
            (FieldStorage::Integer(v), TypeCode::Int16) => *v = buf.get_i16() as i64,
            (FieldStorage::Integer(v), TypeCode::Int32) => *v = buf.get_i32() as i64,
            (FieldStorage::Integer(v), TypeCode::Int64) => *v = buf.get_i64(),
            (FieldStorage::UInteger(v), TypeCode::Bool) => *v = (buf.get_u8() != 0) as u64,
            (FieldStorage::UInteger(v), TypeCode::UInt8) => *v = buf.get_u8() as u64,
            (FieldStorage::UInteger(v), TypeCode::UInt16) => *v = buf.get_u16() as u64,
            (FieldStorage::UInteger(v), TypeCode::UInt32) => *v = buf.get_u32() as u64,
            (FieldStorage::UInteger(v), TypeCode::UInt64) => *v = buf.get_u64(),
            (FieldStorage::Real(v), TypeCode::Float32) => *v = buf.get_f32() as f64,
            (FieldStorage::Real(v), TypeCode::Float64) => *v = buf.get_f64(),
            (FieldStorage::String(v), TypeCode::String) => *v = buf.get_string(),
            _ => buf.fault(),
        },
    }
}

fn from_wire_array(
    buf: &mut ReadBuf,
    cache: &mut TypeCache,
    descs: &Arc<[FieldDesc]>,
    abs: usize,
    code: TypeCode,
) -> Option<ArrayValue> {
    let count = buf.get_size();
    if !buf.good() || count == usize::MAX {
        buf.fault();
        return None;
    }

    macro_rules! get_elems {
        ($get:ident, $variant:ident) => {{
            let mut out = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                if !buf.good() {
                    return None;
                }
                out.push(buf.$get());
            }
            ArrayValue::$variant(out.into())
        }};
    }

    let arr = match code {
        TypeCode::BoolA => {
            let mut out = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                if !buf.good() {
                    return None;
                }
                out.push(buf.get_u8() != 0);
            }
            ArrayValue::Bool(out.into())
        }
        TypeCode::Int8A => get_elems!(get_i8, Int8),
        TypeCode::Int16A => get_elems!(get_i16, Int16),
        TypeCode::Int32A => get_elems!(get_i32, Int32),
        TypeCode::Int64A => get_elems!(get_i64, Int64),
        TypeCode::UInt8A => get_elems!(get_u8, UInt8),
        TypeCode::UInt16A => get_elems!(get_u16, UInt16),
        TypeCode::UInt32A => get_elems!(get_u32, UInt32),
        TypeCode::UInt64A => get_elems!(get_u64, UInt64),
        TypeCode::Float32A => get_elems!(get_f32, Float32),
        TypeCode::Float64A => get_elems!(get_f64, Float64),
        TypeCode::StringA => get_elems!(get_string, String),
        TypeCode::StructA => {
            let mut out: Vec<Option<Value>> = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                if !buf.good() {
                    return None;
                }
                match buf.get_u8() {
                    0 => out.push(None),
                    1 => {
                        let mut elem = Value::new(descs.clone(), abs + 1);
                        from_wire_full(buf, cache, &mut elem);
                        out.push(Some(elem));
                    }
                    _ => {
                        // presence byte is strictly 0 or 1
                        buf.fault();
                        return None;
                    }
                }
            }
            ArrayValue::Compound(out.into())
        }
        TypeCode::UnionA => {
            let mut out: Vec<Option<Value>> = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                if !buf.good() {
                    return None;
                }
                match buf.get_u8() {
                    0 => out.push(None),
                    1 => {
                        // the element begins with its union selector
                        let mut elem = Value::new(descs.clone(), abs + 1);
                        from_wire_field(buf, cache, &mut elem, 0);
                        match elem.cell(0) {
                            // null selector: same as an absent element
                            FieldStorage::Compound(None) => out.push(None),
                            _ => out.push(Some(elem)),
                        }
                    }
                    _ => {
                        buf.fault();
                        return None;
                    }
                }
            }
            ArrayValue::Compound(out.into())
        }
        TypeCode::AnyA => {
            let mut out: Vec<Option<Value>> = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                if !buf.good() {
                    return None;
                }
                match buf.get_u8() {
                    0 => out.push(None),
                    1 => match from_wire_type(buf, cache) {
                        None => {
                            if !buf.good() {
                                return None;
                            }
                            // null type: element left unset
                            out.push(None);
                        }
                        Some(typ) => {
                            let mut elem = Value::new(typ, 0);
                            from_wire_full(buf, cache, &mut elem);
                            out.push(Some(elem));
                        }
                    },
                    _ => {
                        buf.fault();
                        return None;
                    }
                }
            }
            ArrayValue::Compound(out.into())
        }
        _ => {
            buf.fault();
            return None;
        }
    };
    Some(arr)
}
