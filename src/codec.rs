// Read/write dispatch: turns types plus bytes into values and back

use std::sync::Arc;

use crate::bitbuf::{uint_from_bytes, uint_to_bytes, BitReader, BitWriter};
use crate::cursor::{Reader, Writer};
use crate::error::Error;
use crate::eval::{self, Scope};
use crate::registry::TypeRegistry;
use crate::types::{
    bitfield_storage, int_bounds, ArrayLen, ArrayType, StructType, Type, TypeKind, TypeRef,
};
use crate::value::{EnumValue, PointerValue, StructValue, Value};

fn type_mismatch(ty: &Type, value: &Value) -> Error {
    Error::ValueOutOfRange(format!(
        "cannot encode {} as `{}`",
        value, ty.name
    ))
}

// ---------- half-precision conversion ----------

pub(crate) fn f16_to_f64(bits: u16) -> f64 {
    let sign = (bits >> 15) as u32;
    let exp = ((bits >> 10) & 0x1F) as u32;
    let frac = (bits & 0x3FF) as u32;
    let out = if exp == 0 {
        if frac == 0 {
            sign << 31
        } else {
            // Subnormal half: renormalize into a normal f32
            let mut exp = 113u32;
            let mut frac = frac;
            while frac & 0x400 == 0 {
                frac <<= 1;
                exp -= 1;
            }
            (sign << 31) | (exp << 23) | ((frac & 0x3FF) << 13)
        }
    } else if exp == 31 {
        (sign << 31) | (0xFF << 23) | (frac << 13)
    } else {
        (sign << 31) | ((exp + 112) << 23) | (frac << 13)
    };
    f32::from_bits(out) as f64
}

pub(crate) fn f64_to_f16(value: f64) -> u16 {
    let bits = (value as f32).to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let frac = bits & 0x7F_FFFF;

    if exp == 255 {
        // Infinity or NaN
        let nan_bits = if frac != 0 { 0x200 } else { 0 };
        return sign | 0x7C00 | nan_bits | ((frac >> 13) & 0x3FF) as u16;
    }
    let exp = exp - 127 + 15;
    if exp >= 31 {
        return sign | 0x7C00;
    }
    if exp <= 0 {
        if exp < -10 {
            return sign;
        }
        let frac = frac | 0x80_0000;
        let shift = (14 - exp) as u32;
        let half = 1u32 << (shift - 1);
        return sign | ((frac + half) >> shift) as u16;
    }
    let mut out = ((exp as u32) << 10) | (frac >> 13);
    let round = frac & 0x1FFF;
    if round > 0x1000 || (round == 0x1000 && out & 1 == 1) {
        out += 1;
    }
    sign | out as u16
}

// ---------- reading ----------

/// Decode one value of `ty` from the cursor. `scope` carries the
/// sibling fields already read, for expression-sized arrays.
pub(crate) fn read_value(
    reg: &TypeRegistry,
    ty: &TypeRef,
    cur: &mut Reader<'_>,
    scope: Option<&[(Arc<str>, Value)]>,
) -> Result<Value, Error> {
    let endian = reg.endian();
    match &ty.kind {
        TypeKind::Int { bits, signed } => {
            let raw = uint_from_bytes(&cur.read_bytes(*bits as usize / 8)?, endian);
            Ok(Value::Int(extend_sign(raw, *bits, *signed)))
        }
        TypeKind::Float { bits } => {
            let bytes = cur.read_bytes(*bits as usize / 8)?;
            let raw = uint_from_bytes(&bytes, endian);
            Ok(Value::Float(match bits {
                16 => f16_to_f64(raw as u16),
                32 => f32::from_bits(raw as u32) as f64,
                _ => f64::from_bits(raw as u64),
            }))
        }
        TypeKind::Char => Ok(Value::Char(cur.read_byte()?)),
        TypeKind::Wchar => {
            let unit = read_wchar_unit(reg, cur)?;
            Ok(Value::WChar(
                char::from_u32(unit).unwrap_or('\u{FFFD}'),
            ))
        }
        TypeKind::Leb128 { signed } => Ok(Value::Int(read_leb128(cur, *signed)?)),
        TypeKind::Void => Ok(Value::Void),
        TypeKind::Enum(e) => {
            let base = read_value(reg, &e.base, cur, scope)?;
            let v = base.as_int().expect("enum base reads an integer");
            Ok(Value::Enum(EnumValue::new(ty.clone(), v)))
        }
        TypeKind::Array(arr) => read_array(reg, arr, cur, scope),
        TypeKind::Pointer(p) => {
            let size = reg.pointer_size() as usize;
            let addr = uint_from_bytes(&cur.read_bytes(size)?, endian) as u64;
            Ok(Value::Pointer(PointerValue::new(addr, p.target.clone())))
        }
        TypeKind::Struct(st) => {
            if st.is_union {
                read_union(reg, ty, st, cur)
            } else {
                read_struct(reg, ty, st, cur)
            }
        }
        TypeKind::Forward { .. } => Err(Error::UnknownType(format!(
            "`{}` was declared but never defined",
            ty.name
        ))),
        TypeKind::Custom(imp) => imp.read(cur, reg),
    }
}

fn extend_sign(raw: u128, bits: u32, signed: bool) -> i128 {
    if signed && bits < 128 && raw >> (bits - 1) & 1 == 1 {
        raw as i128 - (1i128 << bits)
    } else {
        raw as i128
    }
}

fn read_wchar_unit(reg: &TypeRegistry, cur: &mut Reader<'_>) -> Result<u32, Error> {
    let size = reg.wchar_size() as usize;
    Ok(uint_from_bytes(&cur.read_bytes(size)?, reg.endian()) as u32)
}

fn read_leb128(cur: &mut Reader<'_>, signed: bool) -> Result<i128, Error> {
    let mut result: u128 = 0;
    let mut shift = 0u32;
    let byte = loop {
        let byte = cur.read_byte()?;
        if shift >= 126 {
            return Err(Error::ValueOutOfRange(
                "LEB128 encoding is too long".to_string(),
            ));
        }
        result |= ((byte & 0x7F) as u128) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break byte;
        }
    };

    let mut value = result as i128;
    if signed && byte & 0x40 != 0 && shift < 128 {
        value |= !0i128 << shift;
    }
    Ok(value)
}

fn read_array(
    reg: &TypeRegistry,
    arr: &ArrayType,
    cur: &mut Reader<'_>,
    scope: Option<&[(Arc<str>, Value)]>,
) -> Result<Value, Error> {
    let count = match &arr.len {
        ArrayLen::Fixed(n) => Some(*n),
        ArrayLen::Expr(expr) => {
            let eval_scope = match scope {
                Some(fields) => Scope::with_fields(reg, fields),
                None => Scope::new(reg),
            };
            Some(eval::eval(expr, &eval_scope)?.max(0) as u64)
        }
        ArrayLen::Sentinel => None,
    };

    match &arr.element.kind {
        TypeKind::Char => match count {
            Some(n) => Ok(Value::Bytes(cur.read_bytes(n as usize)?)),
            None => {
                let n = cur.scan_to_zero(1)?;
                let bytes = cur.read_bytes(n)?;
                cur.read_byte()?;
                Ok(Value::Bytes(bytes))
            }
        },
        TypeKind::Wchar => {
            let unit = reg.wchar_size() as usize;
            let n = match count {
                Some(n) => n as usize,
                None => cur.scan_to_zero(unit)?,
            };
            let mut out = String::with_capacity(n);
            for _ in 0..n {
                let u = read_wchar_unit(reg, cur)?;
                out.push(char::from_u32(u).unwrap_or('\u{FFFD}'));
            }
            if count.is_none() {
                cur.read_bytes(unit)?;
            }
            Ok(Value::Str(out))
        }
        _ => match count {
            Some(n) => {
                let mut items = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    items.push(read_value(reg, &arr.element, cur, scope)?);
                }
                Ok(Value::Array(items))
            }
            None => {
                let mut items = Vec::new();
                loop {
                    let item = read_value(reg, &arr.element, cur, scope)?;
                    if is_zero(&item) {
                        break;
                    }
                    items.push(item);
                }
                Ok(Value::Array(items))
            }
        },
    }
}

/// Whether a value equals its type's zero value (the array sentinel)
fn is_zero(value: &Value) -> bool {
    match value {
        Value::Int(v) => *v == 0,
        Value::Float(v) => *v == 0.0,
        Value::Char(b) => *b == 0,
        Value::WChar(c) => *c == '\0',
        Value::Bytes(b) => b.iter().all(|&x| x == 0),
        Value::Str(s) => s.chars().all(|c| c == '\0'),
        Value::Enum(e) => e.value == 0,
        Value::Pointer(p) => p.is_null(),
        Value::Array(items) => items.iter().all(is_zero),
        Value::Struct(s) => s.iter().all(|(_, v)| is_zero(v)),
        Value::Void => true,
    }
}

fn read_struct(
    reg: &TypeRegistry,
    ty: &TypeRef,
    st: &StructType,
    cur: &mut Reader<'_>,
) -> Result<Value, Error> {
    let start = cur.tell();
    let mut value = StructValue::new(ty.clone());
    let mut bits = BitReader::new();

    for field in &st.fields {
        let fname = field.display_name();
        if let Some(width) = field.bits {
            let fv = read_bitfield(reg, field.ty.clone(), &mut bits, cur, width)
                .map_err(|e| e.at_field(fname))?;
            value.push(fname.into(), fv);
            continue;
        }

        bits.reset();
        let fstart = cur.tell();
        let fv = read_value(reg, &field.ty, cur, Some(value.fields.as_slice()))
            .map_err(|e| e.at_field(fname))?;
        if field.ty.is_dynamic() {
            value.dyn_sizes.insert(fname.to_string(), cur.tell() - fstart);
        }
        value.push(fname.into(), fv);
    }

    value.consumed = cur.tell() - start;
    Ok(Value::Struct(value))
}

fn read_bitfield(
    reg: &TypeRegistry,
    field_ty: TypeRef,
    bits: &mut BitReader,
    cur: &mut Reader<'_>,
    width: u32,
) -> Result<Value, Error> {
    let (storage_bits, signed) = bitfield_storage(&field_ty)?;
    let raw = bits.read(cur, storage_bits, reg.endian(), width)?;
    let v = extend_sign(raw, width, signed);
    if matches!(field_ty.kind, TypeKind::Enum(_)) {
        Ok(Value::Enum(EnumValue::new(field_ty, v)))
    } else {
        Ok(Value::Int(v))
    }
}

fn read_union(
    reg: &TypeRegistry,
    ty: &TypeRef,
    st: &StructType,
    cur: &mut Reader<'_>,
) -> Result<Value, Error> {
    let mut value = StructValue::new(ty.clone());

    let buf = match ty.size {
        Some(size) => cur.read_bytes(size as usize)?,
        None => {
            // Dynamic union: find the longest member read, then take
            // that many bytes as the union's backing buffer
            let start = cur.tell();
            let mut max_end = start;
            for field in &st.fields {
                cur.seek(start)?;
                read_value(reg, &field.ty, cur, None)
                    .map_err(|e| e.at_field(field.display_name()))?;
                max_end = max_end.max(cur.tell());
            }
            cur.seek(start)?;
            cur.read_bytes((max_end - start) as usize)?
        }
    };

    value.fields = read_union_members(reg, st, &buf)?;
    value.consumed = buf.len() as u64;
    value.raw = Some(buf);
    Ok(Value::Struct(value))
}

/// Decode every union member from the shared backing bytes
fn read_union_members(
    reg: &TypeRegistry,
    st: &StructType,
    buf: &[u8],
) -> Result<Vec<(Arc<str>, Value)>, Error> {
    let mut fields: Vec<(Arc<str>, Value)> = Vec::with_capacity(st.fields.len());
    for field in &st.fields {
        let fname = field.display_name();
        let mut sub = Reader::from_slice(buf);
        let fv = if let Some(width) = field.bits {
            let mut bits = BitReader::new();
            read_bitfield(reg, field.ty.clone(), &mut bits, &mut sub, width)
        } else {
            read_value(reg, &field.ty, &mut sub, Some(fields.as_slice()))
        }
        .map_err(|e| e.at_field(fname))?;
        fields.push((fname.into(), fv));
    }
    Ok(fields)
}

// ---------- writing ----------

/// Encode `value` as `ty` into the writer
pub(crate) fn write_value(
    reg: &TypeRegistry,
    ty: &TypeRef,
    w: &mut Writer,
    value: &Value,
) -> Result<(), Error> {
    let endian = reg.endian();
    match &ty.kind {
        TypeKind::Int { bits, signed } => {
            let v = value.as_int().ok_or_else(|| type_mismatch(ty, value))?;
            write_int(w, ty, v, *bits, *signed, endian)
        }
        TypeKind::Float { bits } => {
            let v = value.as_float().ok_or_else(|| type_mismatch(ty, value))?;
            let raw = match bits {
                16 => f64_to_f16(v) as u128,
                32 => (v as f32).to_bits() as u128,
                _ => v.to_bits() as u128,
            };
            w.write_bytes(&uint_to_bytes(raw, *bits as usize / 8, endian));
            Ok(())
        }
        TypeKind::Char => {
            let b = match value {
                Value::Char(b) => *b,
                Value::Bytes(bytes) if bytes.len() == 1 => bytes[0],
                Value::Int(v) if (0..=255).contains(v) => *v as u8,
                _ => return Err(type_mismatch(ty, value)),
            };
            w.write_bytes(&[b]);
            Ok(())
        }
        TypeKind::Wchar => {
            let c = match value {
                Value::WChar(c) => *c,
                Value::Int(v) => char::from_u32(*v as u32).ok_or_else(|| type_mismatch(ty, value))?,
                _ => return Err(type_mismatch(ty, value)),
            };
            write_wchar_unit(reg, w, c as u32)
        }
        TypeKind::Leb128 { signed } => {
            let v = value.as_int().ok_or_else(|| type_mismatch(ty, value))?;
            write_leb128(w, v, *signed)
        }
        TypeKind::Void => Ok(()),
        TypeKind::Enum(e) => {
            let v = value.as_int().ok_or_else(|| type_mismatch(ty, value))?;
            write_value(reg, &e.base, w, &Value::Int(v))
        }
        TypeKind::Array(arr) => write_array(reg, ty, arr, w, value),
        TypeKind::Pointer(_) => {
            let v = value.as_int().ok_or_else(|| type_mismatch(ty, value))?;
            let bits = reg.pointer_size() as u32 * 8;
            write_int(w, ty, v, bits, false, endian)
        }
        TypeKind::Struct(st) => {
            let sv = value.as_struct().ok_or_else(|| type_mismatch(ty, value))?;
            if st.is_union {
                let bytes = build_union_bytes(reg, ty, st, sv)?;
                w.write_bytes(&bytes);
                Ok(())
            } else {
                write_struct(reg, st, w, sv)
            }
        }
        TypeKind::Forward { .. } => Err(Error::UnknownType(format!(
            "`{}` was declared but never defined",
            ty.name
        ))),
        TypeKind::Custom(imp) => imp.write(w, value, reg),
    }
}

fn write_int(
    w: &mut Writer,
    ty: &Type,
    v: i128,
    bits: u32,
    signed: bool,
    endian: crate::types::Endian,
) -> Result<(), Error> {
    let (lo, hi) = int_bounds(bits, signed);
    if v < lo || v > hi {
        return Err(Error::ValueOutOfRange(format!(
            "{} does not fit `{}`",
            v, ty.name
        )));
    }
    let raw = if v < 0 {
        (v + (1i128 << bits)) as u128
    } else {
        v as u128
    };
    w.write_bytes(&uint_to_bytes(raw, bits as usize / 8, endian));
    Ok(())
}

fn write_wchar_unit(reg: &TypeRegistry, w: &mut Writer, unit: u32) -> Result<(), Error> {
    let size = reg.wchar_size() as usize;
    if size == 2 && unit > 0xFFFF {
        return Err(Error::ValueOutOfRange(format!(
            "U+{:04X} does not fit a 2 byte wchar",
            unit
        )));
    }
    w.write_bytes(&uint_to_bytes(unit as u128, size, reg.endian()));
    Ok(())
}

fn write_leb128(w: &mut Writer, v: i128, signed: bool) -> Result<(), Error> {
    if v < 0 && !signed {
        return Err(Error::ValueOutOfRange(format!(
            "cannot encode {} as unsigned LEB128",
            v
        )));
    }
    let mut data = v;
    loop {
        let byte = (data & 0x7F) as u8;
        data >>= 7;
        let done = if signed {
            (data == 0 && byte & 0x40 == 0) || (data == -1 && byte & 0x40 != 0)
        } else {
            data == 0
        };
        if done {
            w.write_bytes(&[byte]);
            return Ok(());
        }
        w.write_bytes(&[0x80 | byte]);
    }
}

fn write_array(
    reg: &TypeRegistry,
    ty: &TypeRef,
    arr: &ArrayType,
    w: &mut Writer,
    value: &Value,
) -> Result<(), Error> {
    match &arr.element.kind {
        TypeKind::Char => {
            let bytes = char_array_bytes(ty, value)?;
            w.write_bytes(&bytes);
            if matches!(arr.len, ArrayLen::Sentinel) {
                w.write_bytes(&[0]);
            }
            Ok(())
        }
        TypeKind::Wchar => {
            let s = value.as_str().ok_or_else(|| type_mismatch(ty, value))?;
            for c in s.chars() {
                write_wchar_unit(reg, w, c as u32)?;
            }
            if matches!(arr.len, ArrayLen::Sentinel) {
                w.write_bytes(&uint_to_bytes(0, reg.wchar_size() as usize, reg.endian()));
            }
            Ok(())
        }
        _ => {
            let items = value.as_array().ok_or_else(|| type_mismatch(ty, value))?;
            if let ArrayLen::Fixed(n) = arr.len {
                if items.len() as u64 != n {
                    return Err(Error::ValueOutOfRange(format!(
                        "expected {} elements for `{}`, got {}",
                        n,
                        ty.name,
                        items.len()
                    )));
                }
            }
            for item in items {
                write_value(reg, &arr.element, w, item)?;
            }
            if matches!(arr.len, ArrayLen::Sentinel) {
                let zero = default_value(&arr.element);
                write_value(reg, &arr.element, w, &zero)?;
            }
            Ok(())
        }
    }
}

fn char_array_bytes(ty: &Type, value: &Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::Str(s) => s
            .chars()
            .map(|c| {
                if (c as u32) < 256 {
                    Ok(c as u8)
                } else {
                    Err(type_mismatch(ty, value))
                }
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|v| match v.as_int() {
                Some(i) if (0..=255).contains(&i) => Ok(i as u8),
                _ => Err(type_mismatch(ty, value)),
            })
            .collect(),
        _ => Err(type_mismatch(ty, value)),
    }
}

fn write_struct(
    reg: &TypeRegistry,
    st: &StructType,
    w: &mut Writer,
    sv: &StructValue,
) -> Result<(), Error> {
    let mut bits = BitWriter::new();
    for field in &st.fields {
        let fname = field.display_name();
        let default;
        let fv = match sv.get(fname) {
            Some(v) => v,
            None => {
                default = default_value(&field.ty);
                &default
            }
        };

        if field.bits.is_some() {
            write_bitfield(reg, field, &mut bits, w, fv).map_err(|e| e.at_field(fname))?;
        } else {
            bits.flush(w);
            write_value(reg, &field.ty, w, fv).map_err(|e| e.at_field(fname))?;
        }
    }
    bits.flush(w);
    Ok(())
}

fn write_bitfield(
    reg: &TypeRegistry,
    field: &crate::types::Field,
    bits: &mut BitWriter,
    w: &mut Writer,
    value: &Value,
) -> Result<(), Error> {
    let width = field.bits.expect("caller checked bits");
    let (storage_bits, signed) = bitfield_storage(&field.ty)?;
    let v = value
        .as_int()
        .ok_or_else(|| type_mismatch(&field.ty, value))?;
    let (lo, hi) = int_bounds(width, signed);
    if v < lo || v > hi {
        return Err(Error::ValueOutOfRange(format!(
            "{} does not fit a {} bit field",
            v, width
        )));
    }
    let raw = if v < 0 {
        (v + (1i128 << width)) as u128
    } else {
        v as u128
    };
    bits.write(w, storage_bits, reg.endian(), raw, width);
    Ok(())
}

/// Encode a union's backing bytes: start from the current raw bytes
/// (or zeros), then overlay the last-assigned member.
pub(crate) fn build_union_bytes(
    reg: &TypeRegistry,
    ty: &TypeRef,
    st: &StructType,
    sv: &StructValue,
) -> Result<Vec<u8>, Error> {
    let size = match ty.size {
        Some(size) => size as usize,
        None => {
            // A dynamic union read from data can be re-emitted as-is;
            // one modified after the fact cannot be re-laid-out.
            return match (&sv.raw, &sv.last_set) {
                (Some(raw), None) => Ok(raw.clone()),
                _ => Err(Error::Unsupported(format!(
                    "writing a modified dynamic union `{}`",
                    ty.name
                ))),
            };
        }
    };

    let mut buf = match &sv.raw {
        Some(raw) => raw.clone(),
        None => vec![0; size],
    };
    buf.resize(size, 0);

    let member = match &sv.last_set {
        Some(name) => Some(name.clone()),
        None if sv.raw.is_some() => None,
        None => largest_member(st).map(|f| f.display_name().to_string()),
    };

    if let Some(name) = member {
        let top = member_for(st, &name).ok_or_else(|| {
            Error::UnknownType(format!("no member `{}` in `{}`", name, ty.name))
        })?;
        let fv = sv
            .get(top.display_name())
            .cloned()
            .unwrap_or_else(|| default_value(&top.ty));
        let mut sub = Writer::new();
        if top.bits.is_some() {
            let mut bits = BitWriter::new();
            write_bitfield(reg, top, &mut bits, &mut sub, &fv)?;
            bits.flush(&mut sub);
        } else {
            write_value(reg, &top.ty, &mut sub, &fv)
                .map_err(|e| e.at_field(top.display_name()))?;
        }
        let bytes = sub.into_bytes();
        if bytes.len() > size {
            return Err(Error::ValueOutOfRange(format!(
                "member `{}` encodes to {} bytes, union `{}` is {}",
                name,
                bytes.len(),
                ty.name,
                size
            )));
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
    }

    Ok(buf)
}

/// The union member to emit when nothing was assigned: the largest,
/// preferring named members, matching how the original encoder picks.
fn largest_member(st: &StructType) -> Option<&crate::types::Field> {
    st.fields
        .iter()
        .max_by_key(|f| (f.ty.size.unwrap_or(0), f.name.is_some()))
}

/// Find the top-level member that holds `name`, looking through
/// anonymous inner structs for promoted names.
fn member_for<'a>(st: &'a StructType, name: &str) -> Option<&'a crate::types::Field> {
    for field in &st.fields {
        if field.display_name() == name {
            return Some(field);
        }
        if field.name.is_none() {
            if let Some(inner) = field.ty.as_struct() {
                if member_for(inner, name).is_some() {
                    return Some(field);
                }
            }
        }
    }
    None
}

/// Rebuild a union's raw bytes after a member assignment and re-decode
/// every member from them, restoring the shared-bytes view.
pub(crate) fn sync_union(reg: &TypeRegistry, sv: &mut StructValue) -> Result<(), Error> {
    let ty = sv.ty().clone();
    let st = match ty.as_struct() {
        Some(st) if st.is_union => st,
        _ => return Ok(()),
    };
    let buf = build_union_bytes(reg, &ty, st, sv)?;
    sv.fields = read_union_members(reg, st, &buf)?;
    sv.consumed = buf.len() as u64;
    sv.raw = Some(buf);
    sv.last_set = None;
    Ok(())
}

// ---------- defaults ----------

/// The zero-equivalent value of a type: 0, empty array, first enum
/// member, null pointer, all-default structure.
pub(crate) fn default_value(ty: &TypeRef) -> Value {
    match &ty.kind {
        TypeKind::Int { .. } | TypeKind::Leb128 { .. } => Value::Int(0),
        TypeKind::Float { .. } => Value::Float(0.0),
        TypeKind::Char => Value::Char(0),
        TypeKind::Wchar => Value::WChar('\0'),
        TypeKind::Void => Value::Void,
        TypeKind::Enum(e) => {
            let v = e.members.first().map(|(_, v)| *v).unwrap_or(0);
            Value::Enum(EnumValue::new(ty.clone(), v))
        }
        TypeKind::Array(arr) => match (&arr.element.kind, &arr.len) {
            (TypeKind::Char, ArrayLen::Fixed(n)) => Value::Bytes(vec![0; *n as usize]),
            (TypeKind::Char, _) => Value::Bytes(Vec::new()),
            (TypeKind::Wchar, ArrayLen::Fixed(n)) => {
                Value::Str("\0".repeat(*n as usize))
            }
            (TypeKind::Wchar, _) => Value::Str(String::new()),
            (_, ArrayLen::Fixed(n)) => {
                Value::Array((0..*n).map(|_| default_value(&arr.element)).collect())
            }
            _ => Value::Array(Vec::new()),
        },
        TypeKind::Pointer(p) => Value::Pointer(PointerValue::new(0, p.target.clone())),
        TypeKind::Struct(st) => {
            let mut value = StructValue::new(ty.clone());
            for field in &st.fields {
                let fv = if field.bits.is_some() {
                    if matches!(field.ty.kind, TypeKind::Enum(_)) {
                        default_value(&field.ty)
                    } else {
                        Value::Int(0)
                    }
                } else {
                    default_value(&field.ty)
                };
                value.push(field.display_name().into(), fv);
            }
            value.consumed = ty.size.unwrap_or(0);
            Value::Struct(value)
        }
        TypeKind::Forward { .. } => Value::Void,
        TypeKind::Custom(imp) => imp.default_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endian, Field};

    fn reg() -> TypeRegistry {
        TypeRegistry::new()
    }

    fn read_one(reg: &TypeRegistry, ty: &TypeRef, data: &[u8]) -> Value {
        let mut cur = Reader::from_slice(data);
        read_value(reg, ty, &mut cur, None).unwrap()
    }

    fn write_one(reg: &TypeRegistry, ty: &TypeRef, value: &Value) -> Vec<u8> {
        let mut w = Writer::new();
        write_value(reg, ty, &mut w, value).unwrap();
        w.into_bytes()
    }

    #[test]
    fn test_packed_int_le() {
        let reg = reg();
        let ty = Type::int("uint32", 32, false, 4);
        assert_eq!(
            read_one(&reg, &ty, &[0x78, 0x56, 0x34, 0x12]),
            Value::Int(0x12345678)
        );
        assert_eq!(
            write_one(&reg, &ty, &Value::Int(0x12345678)),
            vec![0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_packed_int_be() {
        let reg = TypeRegistry::with_config(Endian::Big, 8);
        let ty = Type::int("uint32", 32, false, 4);
        assert_eq!(
            read_one(&reg, &ty, &[0x12, 0x34, 0x56, 0x78]),
            Value::Int(0x12345678)
        );
    }

    #[test]
    fn test_signed_int() {
        let reg = reg();
        let ty = Type::int("int16", 16, true, 2);
        assert_eq!(read_one(&reg, &ty, &[0xFF, 0xFF]), Value::Int(-1));
        assert_eq!(write_one(&reg, &ty, &Value::Int(-2)), vec![0xFE, 0xFF]);
    }

    #[test]
    fn test_int24() {
        let reg = reg();
        let ty = Type::int("uint24", 24, false, 4);
        assert_eq!(read_one(&reg, &ty, &[0x01, 0x00, 0x00]), Value::Int(1));
        assert_eq!(
            read_one(&reg, &ty, &[0xFF, 0xFF, 0xFF]),
            Value::Int(0xFFFFFF)
        );
        let sty = Type::int("int24", 24, true, 4);
        assert_eq!(read_one(&reg, &sty, &[0xFF, 0xFF, 0xFF]), Value::Int(-1));
    }

    #[test]
    fn test_int_write_out_of_range() {
        let reg = reg();
        let ty = Type::int("uint8", 8, false, 1);
        let mut w = Writer::new();
        assert!(matches!(
            write_value(&reg, &ty, &mut w, &Value::Int(256)),
            Err(Error::ValueOutOfRange(_))
        ));
        assert!(matches!(
            write_value(&reg, &ty, &mut w, &Value::Int(-1)),
            Err(Error::ValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_float_round_trip() {
        let reg = reg();
        let ty = Type::float("float", 32);
        let bytes = write_one(&reg, &ty, &Value::Float(1.5));
        assert_eq!(read_one(&reg, &ty, &bytes), Value::Float(1.5));

        let dty = Type::float("double", 64);
        let bytes = write_one(&reg, &dty, &Value::Float(-0.125));
        assert_eq!(read_one(&reg, &dty, &bytes), Value::Float(-0.125));
    }

    #[test]
    fn test_float16() {
        let reg = reg();
        let ty = Type::float("float16", 16);
        // 1.0 in binary16 is 0x3C00
        assert_eq!(read_one(&reg, &ty, &[0x00, 0x3C]), Value::Float(1.0));
        assert_eq!(write_one(&reg, &ty, &Value::Float(1.0)), vec![0x00, 0x3C]);
        // -2.0 is 0xC000
        assert_eq!(read_one(&reg, &ty, &[0x00, 0xC0]), Value::Float(-2.0));
        // 0.5 round-trips
        let bytes = write_one(&reg, &ty, &Value::Float(0.5));
        assert_eq!(read_one(&reg, &ty, &bytes), Value::Float(0.5));
    }

    #[test]
    fn test_leb128_unsigned() {
        let reg = reg();
        let ty = Type::leb128("uleb128", false);
        assert_eq!(read_one(&reg, &ty, &[0xE5, 0x8E, 0x26]), Value::Int(624485));
        assert_eq!(
            write_one(&reg, &ty, &Value::Int(624485)),
            vec![0xE5, 0x8E, 0x26]
        );
        assert_eq!(read_one(&reg, &ty, &[0x00]), Value::Int(0));
        let mut w = Writer::new();
        assert!(matches!(
            write_value(&reg, &ty, &mut w, &Value::Int(-1)),
            Err(Error::ValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_leb128_signed() {
        let reg = reg();
        let ty = Type::leb128("leb128", true);
        // -123456 encodes as C0 BB 78
        assert_eq!(
            read_one(&reg, &ty, &[0xC0, 0xBB, 0x78]),
            Value::Int(-123456)
        );
        assert_eq!(
            write_one(&reg, &ty, &Value::Int(-123456)),
            vec![0xC0, 0xBB, 0x78]
        );
        assert_eq!(write_one(&reg, &ty, &Value::Int(-1)), vec![0x7F]);
    }

    #[test]
    fn test_leb128_truncated() {
        let reg = reg();
        let ty = Type::leb128("uleb128", false);
        let mut cur = Reader::from_slice(&[0x80, 0x80]);
        assert!(matches!(
            read_value(&reg, &ty, &mut cur, None),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn test_char_array_fixed() {
        let reg = reg();
        let ty = Type::array(Type::char_type(), ArrayLen::Fixed(5)).unwrap();
        assert_eq!(
            read_one(&reg, &ty, b"hello"),
            Value::Bytes(b"hello".to_vec())
        );
        // Trailing zeros are preserved
        assert_eq!(
            read_one(&reg, &ty, b"hi\x00\x00\x00"),
            Value::Bytes(b"hi\x00\x00\x00".to_vec())
        );
    }

    #[test]
    fn test_char_array_sentinel() {
        let reg = reg();
        let ty = Type::array(Type::char_type(), ArrayLen::Sentinel).unwrap();
        let mut cur = Reader::from_slice(b"hello world!\x00rest");
        let v = read_value(&reg, &ty, &mut cur, None).unwrap();
        assert_eq!(v, Value::Bytes(b"hello world!".to_vec()));
        // Sentinel is consumed
        assert_eq!(cur.tell(), 13);
        // Emit restores the sentinel
        assert_eq!(write_one(&reg, &ty, &v), b"hello world!\x00".to_vec());
    }

    #[test]
    fn test_wchar_array() {
        let reg = reg();
        let ty = Type::array(Type::wchar_type(2), ArrayLen::Fixed(2)).unwrap();
        assert_eq!(
            read_one(&reg, &ty, &[0x41, 0x00, 0x42, 0x00]),
            Value::Str("AB".into())
        );
        assert_eq!(
            write_one(&reg, &ty, &Value::Str("AB".into())),
            vec![0x41, 0x00, 0x42, 0x00]
        );

        let sent = Type::array(Type::wchar_type(2), ArrayLen::Sentinel).unwrap();
        assert_eq!(
            read_one(&reg, &sent, &[0x41, 0x00, 0x00, 0x00]),
            Value::Str("A".into())
        );
    }

    #[test]
    fn test_int_sentinel_array() {
        let reg = reg();
        let ty = Type::array(Type::int("uint16", 16, false, 2), ArrayLen::Sentinel).unwrap();
        let v = read_one(&reg, &ty, &[0x01, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(v, Value::Array(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(
            write_one(&reg, &ty, &v),
            vec![0x01, 0x00, 0x02, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_fixed_array_write_length_check() {
        let reg = reg();
        let ty = Type::array(Type::int("uint8", 8, false, 1), ArrayLen::Fixed(2)).unwrap();
        let mut w = Writer::new();
        assert!(matches!(
            write_value(&reg, &ty, &mut w, &Value::Array(vec![Value::Int(1)])),
            Err(Error::ValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_missing_sentinel_is_truncated() {
        let reg = reg();
        let ty = Type::array(Type::char_type(), ArrayLen::Sentinel).unwrap();
        let mut cur = Reader::from_slice(b"abc");
        assert!(matches!(
            read_value(&reg, &ty, &mut cur, None),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn test_struct_round_trip() {
        let reg = reg();
        let ty = Type::structure(
            "S",
            vec![
                Field::new("a", Type::int("uint8", 8, false, 1)),
                Field::new("b", Type::int("uint16", 16, false, 2)),
            ],
            false,
            false,
        )
        .unwrap();
        let data = [0x01, 0x02, 0x03];
        let v = read_one(&reg, &ty, &data);
        let sv = v.as_struct().unwrap();
        assert_eq!(sv.get("a"), Some(&Value::Int(1)));
        assert_eq!(sv.get("b"), Some(&Value::Int(0x0302)));
        assert_eq!(sv.size(), 3);
        assert_eq!(write_one(&reg, &ty, &v), data.to_vec());
    }

    #[test]
    fn test_struct_error_carries_field_path() {
        let reg = reg();
        let inner = Type::structure(
            "Inner",
            vec![Field::new("x", Type::int("uint32", 32, false, 4))],
            false,
            false,
        )
        .unwrap();
        let outer = Type::structure("Outer", vec![Field::new("i", inner)], false, false).unwrap();
        let mut cur = Reader::from_slice(&[0x01]);
        let err = read_value(&reg, &outer, &mut cur, None).unwrap_err();
        assert!(err.to_string().contains("`i.x`"), "got: {}", err);
    }

    #[test]
    fn test_bitfield_round_trip() {
        let reg = reg();
        let u16_ty = Type::int("uint16", 16, false, 2);
        let ty = Type::structure(
            "B",
            vec![
                Field::bitfield("a", u16_ty.clone(), 1),
                Field::bitfield("b", u16_ty.clone(), 1),
                Field::new("c", Type::int("uint32", 32, false, 4)),
                Field::bitfield("d", u16_ty.clone(), 2),
                Field::bitfield("e", u16_ty, 3),
            ],
            false,
            false,
        )
        .unwrap();
        let data = [0x03, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x1F, 0x00];
        let v = read_one(&reg, &ty, &data);
        let sv = v.as_struct().unwrap();
        assert_eq!(sv.get("a"), Some(&Value::Int(1)));
        assert_eq!(sv.get("b"), Some(&Value::Int(1)));
        assert_eq!(sv.get("c"), Some(&Value::Int(0xFF)));
        assert_eq!(sv.get("d"), Some(&Value::Int(0b11)));
        assert_eq!(sv.get("e"), Some(&Value::Int(0b111)));
        assert_eq!(write_one(&reg, &ty, &v), data.to_vec());
    }

    #[test]
    fn test_bitfield_write_range_check() {
        let reg = reg();
        let ty = Type::structure(
            "B",
            vec![Field::bitfield("a", Type::int("uint8", 8, false, 1), 2)],
            false,
            false,
        )
        .unwrap();
        let mut v = default_value(&ty);
        v.as_struct_mut().unwrap().set("a", Value::Int(4)).unwrap();
        let mut w = Writer::new();
        assert!(matches!(
            write_value(&reg, &ty, &mut w, &v),
            Err(Error::ValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_union_read_and_write() {
        let reg = reg();
        let ty = Type::structure(
            "U",
            vec![
                Field::new("word", Type::int("uint32", 32, false, 4)),
                Field::new("bytes", Type::array(Type::char_type(), ArrayLen::Fixed(4)).unwrap()),
            ],
            true,
            false,
        )
        .unwrap();
        let data = [0x41, 0x42, 0x43, 0x44];
        let v = read_one(&reg, &ty, &data);
        let sv = v.as_struct().unwrap();
        assert_eq!(sv.get("word"), Some(&Value::Int(0x44434241)));
        assert_eq!(sv.get("bytes"), Some(&Value::Bytes(b"ABCD".to_vec())));
        assert_eq!(write_one(&reg, &ty, &v), data.to_vec());
    }

    #[test]
    fn test_union_assignment_rebuilds() {
        let reg = reg();
        let ty = Type::structure(
            "U",
            vec![
                Field::new("word", Type::int("uint32", 32, false, 4)),
                Field::new("half", Type::int("uint16", 16, false, 2)),
            ],
            true,
            false,
        )
        .unwrap();
        let mut v = read_one(&reg, &ty, &[0xFF, 0xFF, 0xFF, 0xFF]);
        let sv = v.as_struct_mut().unwrap();
        sv.set("half", Value::Int(0)).unwrap();
        sync_union(&reg, sv).unwrap();
        // Writing the half member zeroed its two bytes and kept the rest
        assert_eq!(sv.get("word"), Some(&Value::Int(0xFFFF0000)));
        assert_eq!(write_one(&reg, &ty, &v), vec![0x00, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_default_values() {
        let enum_ty = Type::enumeration(
            "E",
            Type::int("uint16", 16, false, 2),
            vec![("FIRST".into(), 3), ("SECOND".into(), 5)],
            false,
        )
        .unwrap();
        // Default enum value is the first declared member
        match default_value(&enum_ty) {
            Value::Enum(e) => assert_eq!(e.value, 3),
            other => panic!("unexpected {:?}", other),
        }

        let arr = Type::array(Type::char_type(), ArrayLen::Fixed(3)).unwrap();
        assert_eq!(default_value(&arr), Value::Bytes(vec![0, 0, 0]));

        let ty = Type::structure(
            "S",
            vec![Field::new("a", Type::int("uint8", 8, false, 1))],
            false,
            false,
        )
        .unwrap();
        let v = default_value(&ty);
        assert_eq!(v.as_struct().unwrap().get("a"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_expression_array_against_scope() {
        let reg = reg();
        let expr = crate::parser::parse_expr_text("n * 2").unwrap();
        let ty = Type::array(Type::int("uint8", 8, false, 1), ArrayLen::Expr(expr)).unwrap();
        let fields: Vec<(Arc<str>, Value)> = vec![("n".into(), Value::Int(2))];
        let mut cur = Reader::from_slice(&[1, 2, 3, 4, 5]);
        let v = read_value(&reg, &ty, &mut cur, Some(fields.as_slice())).unwrap();
        assert_eq!(
            v,
            Value::Array(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::Int(4)
            ])
        );
    }
}
