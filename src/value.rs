// Parsed value model: attribute access, equality and rendering

use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Index};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::types::{PtrTarget, TypeRef};

/// A decoded (or to-be-encoded) value
#[derive(Debug, Clone)]
pub enum Value {
    Int(i128),
    Float(f64),
    /// Single `char`: a raw byte
    Char(u8),
    /// Single `wchar`
    WChar(char),
    /// `char` array contents, trailing zeros preserved
    Bytes(Vec<u8>),
    /// `wchar` array contents
    Str(String),
    Enum(EnumValue),
    Pointer(PointerValue),
    Array(Vec<Value>),
    /// Structure or union instance
    Struct(StructValue),
    Void,
}

impl Value {
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Char(b) => Some(*b as i128),
            Value::WChar(c) => Some(*c as u32 as i128),
            Value::Enum(e) => Some(e.value),
            Value::Pointer(p) => Some(p.addr as i128),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct_mut(&mut self) -> Option<&mut StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumValue> {
        match self {
            Value::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&PointerValue> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }
}

/// `value["field"]` convenience access; panics on a missing field
impl Index<&str> for Value {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        match self {
            Value::Struct(s) => s
                .get(name)
                .unwrap_or_else(|| panic!("no field `{}` in `{}`", name, s.type_name())),
            other => panic!("cannot index into {}", other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::WChar(a), Value::WChar(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Void, Value::Void) => true,
            // Integer-like values compare across representations
            (Value::Int(a), Value::Char(b)) | (Value::Char(b), Value::Int(a)) => {
                *a == *b as i128
            }
            (Value::Int(a), Value::Enum(b)) | (Value::Enum(b), Value::Int(a)) => *a == b.value,
            _ => false,
        }
    }
}

/// An enum or flag member instance. Carries its type so rendering and
/// bitwise operations stay typed.
#[derive(Debug, Clone)]
pub struct EnumValue {
    pub(crate) ty: TypeRef,
    pub value: i128,
}

impl EnumValue {
    pub(crate) fn new(ty: TypeRef, value: i128) -> Self {
        Self { ty, value }
    }

    pub fn type_name(&self) -> &str {
        &self.ty.name
    }

    /// Member name when the value matches a defined constant
    pub fn name(&self) -> Option<&str> {
        self.ty.as_enum().and_then(|e| e.member_name(self.value))
    }

    pub fn is_flag(&self) -> bool {
        self.ty.as_enum().map(|e| e.is_flag).unwrap_or(false)
    }

    /// True when every bit of `flag` is set in this value
    pub fn contains(&self, flag: i128) -> bool {
        self.value & flag == flag
    }
}

impl PartialEq for EnumValue {
    fn eq(&self, other: &Self) -> bool {
        self.ty.name == other.ty.name && self.value == other.value
    }
}

impl PartialEq<i128> for EnumValue {
    fn eq(&self, other: &i128) -> bool {
        self.value == *other
    }
}

impl BitOr for EnumValue {
    type Output = EnumValue;
    fn bitor(self, rhs: EnumValue) -> EnumValue {
        EnumValue::new(self.ty, self.value | rhs.value)
    }
}

impl BitOr<i128> for EnumValue {
    type Output = EnumValue;
    fn bitor(self, rhs: i128) -> EnumValue {
        EnumValue::new(self.ty, self.value | rhs)
    }
}

impl BitAnd for EnumValue {
    type Output = EnumValue;
    fn bitand(self, rhs: EnumValue) -> EnumValue {
        EnumValue::new(self.ty, self.value & rhs.value)
    }
}

impl BitAnd<i128> for EnumValue {
    type Output = EnumValue;
    fn bitand(self, rhs: i128) -> EnumValue {
        EnumValue::new(self.ty, self.value & rhs)
    }
}

impl BitXor for EnumValue {
    type Output = EnumValue;
    fn bitxor(self, rhs: EnumValue) -> EnumValue {
        EnumValue::new(self.ty, self.value ^ rhs.value)
    }
}

impl BitXor<i128> for EnumValue {
    type Output = EnumValue;
    fn bitxor(self, rhs: i128) -> EnumValue {
        EnumValue::new(self.ty, self.value ^ rhs)
    }
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let enum_ty = match self.ty.as_enum() {
            Some(e) => e,
            None => return write!(f, "{}", self.value),
        };
        if enum_ty.is_flag {
            return write!(f, "{}", render_flag(&self.ty.name, enum_ty, self.value));
        }
        match enum_ty.member_name(self.value) {
            Some(name) => write!(f, "{}.{}", self.ty.name, name),
            None => write!(f, "{}", self.value),
        }
    }
}

/// Decompose a flag value into named members, greedily from the
/// highest member value down, with any unnamed residual rendered as a
/// hex literal: `Perm.READ|WRITE|0x10`.
fn render_flag(type_name: &str, enum_ty: &crate::types::EnumType, value: i128) -> String {
    if value == 0 {
        if let Some(name) = enum_ty.member_name(0) {
            return format!("{}.{}", type_name, name);
        }
        return "0x0".to_string();
    }

    let mut members: Vec<&(String, i128)> = enum_ty.members.iter().filter(|(_, v)| *v != 0).collect();
    // Highest value first; single-bit members win ties with combined ones
    members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.1.count_ones().cmp(&b.1.count_ones())));

    let mut remaining = value;
    let mut parts: Vec<String> = Vec::new();
    for (name, v) in members {
        if remaining & v == *v && remaining & v != 0 {
            parts.push(name.clone());
            remaining &= !v;
        }
        if remaining == 0 {
            break;
        }
    }
    if parts.is_empty() {
        return format!("{:#x}", value);
    }
    if remaining != 0 {
        parts.push(format!("{:#x}", remaining));
    }
    format!("{}.{}", type_name, parts.join("|"))
}

/// A pointer value: the raw address plus its target type
#[derive(Debug, Clone)]
pub struct PointerValue {
    pub addr: u64,
    pub(crate) target: PtrTarget,
}

impl PointerValue {
    pub(crate) fn new(addr: u64, target: PtrTarget) -> Self {
        Self { addr, target }
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    pub fn target_name(&self) -> &str {
        match &self.target {
            PtrTarget::Resolved(ty) => &ty.name,
            PtrTarget::Named(name) => name,
        }
    }

    pub(crate) fn target(&self) -> &PtrTarget {
        &self.target
    }
}

impl PartialEq for PointerValue {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.target_name() == other.target_name()
    }
}

impl fmt::Display for PointerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}* @ {:#x}>", self.target_name(), self.addr)
    }
}

/// A structure or union instance: an ordered map from field name to
/// value, with promoted access through anonymous members.
#[derive(Debug, Clone)]
pub struct StructValue {
    pub(crate) ty: TypeRef,
    pub(crate) fields: Vec<(Arc<str>, Value)>,
    /// Total bytes consumed when this value was read
    pub(crate) consumed: u64,
    /// Bytes consumed per dynamically sized field
    pub(crate) dyn_sizes: FxHashMap<String, u64>,
    /// Raw backing bytes (unions only)
    pub(crate) raw: Option<Vec<u8>>,
    /// Name of the member assigned last (unions only)
    pub(crate) last_set: Option<String>,
}

impl StructValue {
    pub(crate) fn new(ty: TypeRef) -> Self {
        Self {
            ty,
            fields: Vec::new(),
            consumed: 0,
            dyn_sizes: FxHashMap::default(),
            raw: None,
            last_set: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.ty.name
    }

    pub(crate) fn ty(&self) -> &TypeRef {
        &self.ty
    }

    pub fn is_union(&self) -> bool {
        self.ty.as_struct().map(|s| s.is_union).unwrap_or(false)
    }

    /// Total bytes this value consumed when read. May exceed the
    /// static size when dynamic fields were present.
    pub fn size(&self) -> u64 {
        self.consumed
    }

    /// Bytes a specific field consumed: its static size, or the
    /// recorded dynamic size.
    pub fn field_size(&self, name: &str) -> Option<u64> {
        if let Some(size) = self.dyn_sizes.get(name) {
            return Some(*size);
        }
        let st = self.ty.as_struct()?;
        st.fields
            .iter()
            .find(|f| f.display_name() == name)
            .and_then(|f| f.ty.size)
    }

    /// Number of direct fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate direct fields in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_ref(), v))
    }

    /// Look up a field by name. Fields of anonymous inner
    /// structs/unions are reachable by their bare name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some((_, v)) = self.fields.iter().find(|(n, _)| n.as_ref() == name) {
            return Some(v);
        }
        let st = self.ty.as_struct()?;
        for (field, (_, value)) in st.fields.iter().zip(&self.fields) {
            if field.name.is_none() {
                if let Value::Struct(inner) = value {
                    if let Some(found) = inner.get(name) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    /// Replace a field value, with the same promoted-name access as
    /// `get`. On unions this records the member as last-assigned;
    /// emission overlays that member on the union's backing bytes, and
    /// `TypeRegistry::sync_union` re-decodes the other members from
    /// them.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), Error> {
        if self.set_inner(name, value.clone()) {
            if self.is_union() {
                self.last_set = Some(name.to_string());
            }
            return Ok(());
        }
        Err(Error::UnknownType(format!(
            "no field `{}` in `{}`",
            name, self.ty.name
        )))
    }

    fn set_inner(&mut self, name: &str, value: Value) -> bool {
        if let Some((_, slot)) = self.fields.iter_mut().find(|(n, _)| n.as_ref() == name) {
            *slot = value;
            return true;
        }
        let anon: Vec<bool> = match self.ty.as_struct() {
            Some(st) => st.fields.iter().map(|f| f.name.is_none()).collect(),
            None => return false,
        };
        for (is_anon, (_, slot)) in anon.into_iter().zip(self.fields.iter_mut()) {
            if is_anon {
                if let Value::Struct(inner) = slot {
                    if inner.set_inner(name, value.clone()) {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub(crate) fn push(&mut self, name: Arc<str>, value: Value) {
        self.fields.push((name, value));
    }
}

impl PartialEq for StructValue {
    fn eq(&self, other: &Self) -> bool {
        self.ty.name == other.ty.name
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|((an, av), (bn, bv))| an == bn && av == bv)
    }
}

pub(crate) fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 3);
    out.push_str("b\"");
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Char(b) => {
                if (0x20..=0x7E).contains(b) {
                    write!(f, "'{}'", *b as char)
                } else {
                    write!(f, "'\\x{:02x}'", b)
                }
            }
            Value::WChar(c) => write!(f, "'{}'", c),
            Value::Bytes(bytes) => write!(f, "{}", escape_bytes(bytes)),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Enum(e) => write!(f, "{}", e),
            Value::Pointer(p) => write!(f, "{}", p),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Struct(s) => {
                write!(f, "<{}", s.type_name())?;
                for (name, value) in s.iter() {
                    write!(f, " {}={}", name, value)?;
                }
                write!(f, ">")
            }
            Value::Void => write!(f, "void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn sample_enum(is_flag: bool) -> TypeRef {
        Type::enumeration(
            "Test",
            Type::int("uint16", 16, false, 2),
            vec![("A".into(), 1), ("B".into(), 5), ("C".into(), 6)],
            is_flag,
        )
        .unwrap()
    }

    #[test]
    fn test_enum_rendering() {
        let ty = sample_enum(false);
        assert_eq!(EnumValue::new(ty.clone(), 1).to_string(), "Test.A");
        assert_eq!(EnumValue::new(ty.clone(), 5).to_string(), "Test.B");
        // Unknown value renders as the bare number
        assert_eq!(EnumValue::new(ty, 7).to_string(), "7");
    }

    #[test]
    fn test_enum_equality() {
        let ty = sample_enum(false);
        assert_eq!(EnumValue::new(ty.clone(), 5), EnumValue::new(ty.clone(), 5));
        assert_ne!(EnumValue::new(ty.clone(), 5), EnumValue::new(ty.clone(), 6));
        assert_eq!(EnumValue::new(ty, 5), 5);
    }

    #[test]
    fn test_flag_rendering() {
        let ty = Type::enumeration(
            "Perm",
            Type::int("uint8", 8, false, 1),
            vec![("R".into(), 1), ("W".into(), 2), ("X".into(), 4)],
            true,
        )
        .unwrap();
        assert_eq!(EnumValue::new(ty.clone(), 1).to_string(), "Perm.R");
        assert_eq!(EnumValue::new(ty.clone(), 3).to_string(), "Perm.W|R");
        assert_eq!(
            EnumValue::new(ty.clone(), 0x13).to_string(),
            "Perm.W|R|0x10"
        );
        assert_eq!(EnumValue::new(ty, 0x10).to_string(), "0x10");
    }

    #[test]
    fn test_flag_ops_preserve_type() {
        let ty = sample_enum(true);
        let a = EnumValue::new(ty.clone(), 1);
        let b = EnumValue::new(ty, 4);
        let combined = a | b;
        assert_eq!(combined.value, 5);
        assert_eq!(combined.type_name(), "Test");
        let masked = combined & 4;
        assert_eq!(masked.value, 4);
        assert_eq!(masked.type_name(), "Test");
    }

    #[test]
    fn test_value_cross_equality() {
        assert_eq!(Value::Int(65), Value::Char(b'A'));
        let ty = sample_enum(false);
        assert_eq!(Value::Int(5), Value::Enum(EnumValue::new(ty, 5)));
    }

    #[test]
    fn test_escape_bytes() {
        assert_eq!(escape_bytes(b"ok"), "b\"ok\"");
        assert_eq!(escape_bytes(b"\x00\xff"), "b\"\\x00\\xff\"");
        assert_eq!(escape_bytes(b"a\"b"), "b\"a\\\"b\"");
    }

    #[test]
    fn test_struct_value_get_and_display() {
        let u8_ty = Type::int("uint8", 8, false, 1);
        let ty = Type::structure(
            "S",
            vec![
                crate::types::Field::new("a", u8_ty.clone()),
                crate::types::Field::new("b", u8_ty),
            ],
            false,
            false,
        )
        .unwrap();
        let mut value = StructValue::new(ty);
        value.push("a".into(), Value::Int(1));
        value.push("b".into(), Value::Int(2));
        assert_eq!(value.get("a"), Some(&Value::Int(1)));
        assert_eq!(value.get("missing"), None);
        assert_eq!(Value::Struct(value).to_string(), "<S a=1 b=2>");
    }

    #[test]
    fn test_struct_value_promoted_get() {
        let u8_ty = Type::int("uint8", 8, false, 1);
        let inner_ty = Type::structure(
            "__anonymous_0__",
            vec![crate::types::Field::new("x", u8_ty.clone())],
            false,
            true,
        )
        .unwrap();
        let outer_ty = Type::structure(
            "S",
            vec![
                crate::types::Field::new("a", u8_ty),
                crate::types::Field::anonymous(inner_ty.clone()),
            ],
            false,
            false,
        )
        .unwrap();

        let mut inner = StructValue::new(inner_ty);
        inner.push("x".into(), Value::Int(9));
        let mut outer = StructValue::new(outer_ty);
        outer.push("a".into(), Value::Int(1));
        outer.push("__anonymous_0__".into(), Value::Struct(inner));

        // Reachable both by bare name and via the synthetic member
        assert_eq!(outer.get("x"), Some(&Value::Int(9)));
        let via_member = outer.get("__anonymous_0__").unwrap();
        assert_eq!(via_member.as_struct().unwrap().get("x"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_struct_value_set_promoted() {
        let u8_ty = Type::int("uint8", 8, false, 1);
        let inner_ty = Type::structure(
            "__anonymous_0__",
            vec![crate::types::Field::new("x", u8_ty.clone())],
            false,
            true,
        )
        .unwrap();
        let outer_ty = Type::structure(
            "S",
            vec![
                crate::types::Field::new("a", u8_ty),
                crate::types::Field::anonymous(inner_ty.clone()),
            ],
            false,
            false,
        )
        .unwrap();

        let mut inner = StructValue::new(inner_ty);
        inner.push("x".into(), Value::Int(0));
        let mut outer = StructValue::new(outer_ty);
        outer.push("a".into(), Value::Int(1));
        outer.push("__anonymous_0__".into(), Value::Struct(inner));

        outer.set("x", Value::Int(7)).unwrap();
        assert_eq!(outer.get("x"), Some(&Value::Int(7)));
        assert!(outer.set("nope", Value::Int(0)).is_err());
    }
}
