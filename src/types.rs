// Runtime type model: primitives, composites and structure layout

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::cursor::{Reader, Writer};
use crate::error::Error;
use crate::parser::ast::Expr;
use crate::registry::TypeRegistry;
use crate::value::Value;

/// Byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

/// Shared handle to an immutable type
pub type TypeRef = Arc<Type>;

/// A registered type: layout description plus codec behavior
#[derive(Debug)]
pub struct Type {
    /// Declared name, or a synthetic `__anonymous_N__` name
    pub name: String,
    pub kind: TypeKind,
    /// Static byte size, or None when dynamic
    pub size: Option<u64>,
    pub alignment: u64,
}

pub enum TypeKind {
    /// Fixed-width packed integer, 8..=64 bits in multiples of 8
    Int { bits: u32, signed: bool },
    /// IEEE-754 binary16/32/64
    Float { bits: u32 },
    /// Single byte character
    Char,
    /// Wide character; width and byte order come from the registry
    Wchar,
    /// Variable-length LEB128 integer
    Leb128 { signed: bool },
    /// Zero-sized placeholder, mainly for pointer targets
    Void,
    Enum(EnumType),
    Array(ArrayType),
    Pointer(PointerType),
    Struct(StructType),
    /// Declared but not yet defined struct/union
    Forward { is_union: bool },
    Custom(Arc<dyn CustomType>),
}

impl fmt::Debug for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Int { bits, signed } => {
                write!(f, "Int {{ bits: {}, signed: {} }}", bits, signed)
            }
            TypeKind::Float { bits } => write!(f, "Float {{ bits: {} }}", bits),
            TypeKind::Char => write!(f, "Char"),
            TypeKind::Wchar => write!(f, "Wchar"),
            TypeKind::Leb128 { signed } => write!(f, "Leb128 {{ signed: {} }}", signed),
            TypeKind::Void => write!(f, "Void"),
            TypeKind::Enum(e) => write!(f, "Enum({})", e.members.len()),
            TypeKind::Array(a) => write!(f, "Array({:?})", a.len),
            TypeKind::Pointer(p) => write!(f, "Pointer({})", p.target_name()),
            TypeKind::Struct(s) => write!(f, "Struct({} fields)", s.fields.len()),
            TypeKind::Forward { is_union } => write!(f, "Forward {{ is_union: {} }}", is_union),
            TypeKind::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Enum or flag type. Flags differ only in auto-valuing and rendering.
#[derive(Debug)]
pub struct EnumType {
    pub base: TypeRef,
    pub members: Vec<(String, i128)>,
    pub is_flag: bool,
}

impl EnumType {
    pub fn member_value(&self, name: &str) -> Option<i128> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn member_name(&self, value: i128) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| n.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ArrayLen {
    /// `T x[4]` — fixed element count
    Fixed(u64),
    /// `T x[expr]` — evaluated while reading, against sibling fields
    Expr(Expr),
    /// `T x[NULL]` — terminated by a zero element
    Sentinel,
}

#[derive(Debug)]
pub struct ArrayType {
    pub element: TypeRef,
    pub len: ArrayLen,
}

/// Pointer target, resolved late by name so self-referencing
/// structures need no owning cycles
#[derive(Debug, Clone)]
pub enum PtrTarget {
    Resolved(TypeRef),
    Named(String),
}

#[derive(Debug)]
pub struct PointerType {
    pub target: PtrTarget,
}

impl PointerType {
    pub fn target_name(&self) -> &str {
        match &self.target {
            PtrTarget::Resolved(ty) => &ty.name,
            PtrTarget::Named(name) => name,
        }
    }
}

#[derive(Debug)]
pub struct StructType {
    pub fields: Vec<Field>,
    pub is_union: bool,
    pub anonymous: bool,
}

/// A structure or union member
#[derive(Debug, Clone)]
pub struct Field {
    /// None for an anonymous inner struct/union whose fields promote
    pub name: Option<String>,
    pub ty: TypeRef,
    /// Bitfield width, when this member is a bitfield
    pub bits: Option<u32>,
    /// Byte offset from the structure start; None once a dynamic
    /// field makes later offsets unknowable
    pub offset: Option<u64>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: Some(name.into()),
            ty,
            bits: None,
            offset: None,
        }
    }

    pub fn bitfield(name: impl Into<String>, ty: TypeRef, bits: u32) -> Self {
        Self {
            name: Some(name.into()),
            ty,
            bits: Some(bits),
            offset: None,
        }
    }

    pub fn anonymous(ty: TypeRef) -> Self {
        Self {
            name: None,
            ty,
            bits: None,
            offset: None,
        }
    }

    /// Field name, falling back to the type name for anonymous members
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.ty.name)
    }
}

/// Contract for user-registered codecs
pub trait CustomType: Send + Sync {
    fn size(&self) -> Option<u64>;
    fn alignment(&self) -> u64 {
        self.size().unwrap_or(1).max(1)
    }
    fn read(&self, cur: &mut Reader<'_>, reg: &TypeRegistry) -> Result<Value, Error>;
    fn write(&self, w: &mut Writer, value: &Value, reg: &TypeRegistry) -> Result<(), Error>;
    fn default_value(&self) -> Value;
}

/// Inclusive value bounds for an integer width
pub(crate) fn int_bounds(bits: u32, signed: bool) -> (i128, i128) {
    if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, if bits >= 127 { i128::MAX } else { (1i128 << bits) - 1 })
    }
}

/// Storage width and signedness for a bitfield's declared type
pub(crate) fn bitfield_storage(ty: &Type) -> Result<(u32, bool), Error> {
    match &ty.kind {
        TypeKind::Int { bits, signed } => Ok((*bits, *signed)),
        TypeKind::Enum(e) => bitfield_storage(&e.base),
        _ => Err(Error::InvalidBitfield(format!(
            "`{}` cannot be used as bitfield storage",
            ty.name
        ))),
    }
}

impl Type {
    pub fn int(name: impl Into<String>, bits: u32, signed: bool, alignment: u64) -> TypeRef {
        debug_assert!(bits % 8 == 0 && (8..=64).contains(&bits));
        Arc::new(Type {
            name: name.into(),
            kind: TypeKind::Int { bits, signed },
            size: Some(bits as u64 / 8),
            alignment,
        })
    }

    pub fn float(name: impl Into<String>, bits: u32) -> TypeRef {
        debug_assert!(matches!(bits, 16 | 32 | 64));
        Arc::new(Type {
            name: name.into(),
            kind: TypeKind::Float { bits },
            size: Some(bits as u64 / 8),
            alignment: bits as u64 / 8,
        })
    }

    pub fn char_type() -> TypeRef {
        Arc::new(Type {
            name: "char".into(),
            kind: TypeKind::Char,
            size: Some(1),
            alignment: 1,
        })
    }

    pub fn wchar_type(width: u64) -> TypeRef {
        Arc::new(Type {
            name: "wchar".into(),
            kind: TypeKind::Wchar,
            size: Some(width),
            alignment: width,
        })
    }

    pub fn leb128(name: impl Into<String>, signed: bool) -> TypeRef {
        Arc::new(Type {
            name: name.into(),
            kind: TypeKind::Leb128 { signed },
            size: None,
            alignment: 1,
        })
    }

    pub fn void() -> TypeRef {
        Arc::new(Type {
            name: "void".into(),
            kind: TypeKind::Void,
            size: Some(0),
            alignment: 1,
        })
    }

    pub fn forward(name: impl Into<String>, is_union: bool) -> TypeRef {
        Arc::new(Type {
            name: name.into(),
            kind: TypeKind::Forward { is_union },
            size: None,
            alignment: 1,
        })
    }

    pub fn custom(name: impl Into<String>, imp: Arc<dyn CustomType>) -> TypeRef {
        Arc::new(Type {
            name: name.into(),
            size: imp.size(),
            alignment: imp.alignment(),
            kind: TypeKind::Custom(imp),
        })
    }

    /// Build an enum or flag over an integer base type
    pub fn enumeration(
        name: impl Into<String>,
        base: TypeRef,
        members: Vec<(String, i128)>,
        is_flag: bool,
    ) -> Result<TypeRef, Error> {
        let name = name.into();
        let (bits, signed) = match &base.kind {
            TypeKind::Int { bits, signed } => (*bits, *signed),
            _ => {
                return Err(Error::BadExpression(format!(
                    "enum `{}` base type `{}` is not an integer",
                    name, base.name
                )))
            }
        };
        let (lo, hi) = int_bounds(bits, signed);
        let mut seen = FxHashSet::default();
        for (member, value) in &members {
            if !seen.insert(member.as_str()) {
                return Err(Error::DuplicateField(format!(
                    "enum member `{}.{}`",
                    name, member
                )));
            }
            if *value < lo || *value > hi {
                return Err(Error::ValueOutOfRange(format!(
                    "enum member `{}.{}` = {} does not fit {}",
                    name, member, value, base.name
                )));
            }
        }
        Ok(Arc::new(Type {
            name,
            size: base.size,
            alignment: base.alignment,
            kind: TypeKind::Enum(EnumType {
                base,
                members,
                is_flag,
            }),
        }))
    }

    /// Build an array type. `ArrayLen::Fixed` over a statically sized
    /// element is the only statically sized form.
    pub fn array(element: TypeRef, len: ArrayLen) -> Result<TypeRef, Error> {
        if matches!(element.kind, TypeKind::Void | TypeKind::Forward { .. }) {
            return Err(Error::UnknownType(format!(
                "cannot make an array of `{}`",
                element.name
            )));
        }
        let (name, size) = match &len {
            ArrayLen::Fixed(n) => (
                format!("{}[{}]", element.name, n),
                element.size.map(|s| s * n),
            ),
            ArrayLen::Expr(_) => (format!("{}[?]", element.name), None),
            ArrayLen::Sentinel => (format!("{}[]", element.name), None),
        };
        Ok(Arc::new(Type {
            name,
            size,
            alignment: element.alignment,
            kind: TypeKind::Array(ArrayType { element, len }),
        }))
    }

    pub fn pointer(target: PtrTarget, pointer_size: u64) -> TypeRef {
        let target_name = match &target {
            PtrTarget::Resolved(ty) => ty.name.clone(),
            PtrTarget::Named(name) => name.clone(),
        };
        Arc::new(Type {
            name: format!("{}*", target_name),
            kind: TypeKind::Pointer(PointerType { target }),
            size: Some(pointer_size),
            alignment: pointer_size,
        })
    }

    /// Build a structure or union, computing field offsets and the
    /// static size (None when any member chain is dynamic).
    pub fn structure(
        name: impl Into<String>,
        mut fields: Vec<Field>,
        is_union: bool,
        anonymous: bool,
    ) -> Result<TypeRef, Error> {
        let name = name.into();
        check_field_names(&name, &fields)?;

        let (size, alignment) = if is_union {
            layout_union(&mut fields)?
        } else {
            layout_struct(&name, &mut fields)?
        };

        Ok(Arc::new(Type {
            name,
            size,
            alignment,
            kind: TypeKind::Struct(StructType {
                fields,
                is_union,
                anonymous,
            }),
        }))
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match &self.kind {
            TypeKind::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumType> {
        match &self.kind {
            TypeKind::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.size.is_none()
    }
}

/// Reject duplicate names, including those promoted from anonymous
/// members. A field named `_` is exempt, like a C padding field.
fn check_field_names(type_name: &str, fields: &[Field]) -> Result<(), Error> {
    fn collect<'a>(
        type_name: &str,
        fields: &'a [Field],
        seen: &mut FxHashSet<&'a str>,
    ) -> Result<(), Error> {
        for field in fields {
            match (&field.name, field.ty.as_struct()) {
                (None, Some(inner)) => collect(type_name, &inner.fields, seen)?,
                _ => {
                    let name = field.display_name();
                    if name != "_" && !seen.insert(name) {
                        return Err(Error::DuplicateField(format!(
                            "`{}` in `{}`",
                            name, type_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
    let mut seen = FxHashSet::default();
    collect(type_name, fields, &mut seen)
}

fn layout_struct(type_name: &str, fields: &mut [Field]) -> Result<(Option<u64>, u64), Error> {
    let mut offset: Option<u64> = Some(0);
    let mut alignment: u64 = 1;

    // Current bitfield run: storage identity is (width, signedness is
    // irrelevant for packing) and the remaining bits in the open unit
    let mut run_key: Option<u32> = None;
    let mut run_remaining: u32 = 0;

    for field in fields.iter_mut() {
        alignment = alignment.max(field.ty.alignment);

        if let Some(bits) = field.bits {
            let (storage_bits, _) = bitfield_storage(&field.ty)?;
            if bits == 0 || bits > storage_bits {
                return Err(Error::InvalidBitfield(format!(
                    "`{}.{}`: {} bits in a {} bit storage type",
                    type_name,
                    field.display_name(),
                    bits,
                    storage_bits
                )));
            }
            // A storage change or an overflow starts a new unit
            if run_key != Some(storage_bits) || run_remaining < bits {
                run_key = Some(storage_bits);
                run_remaining = storage_bits;
                field.offset = offset;
                offset = offset.map(|o| o + storage_bits as u64 / 8);
            } else {
                field.offset = offset.map(|o| o - storage_bits as u64 / 8);
            }
            run_remaining -= bits;
        } else {
            run_key = None;
            run_remaining = 0;
            field.offset = offset;
            offset = match (offset, field.ty.size) {
                (Some(o), Some(s)) => Some(o + s),
                _ => None,
            };
        }
    }

    Ok((offset, alignment))
}

fn layout_union(fields: &mut [Field]) -> Result<(Option<u64>, u64), Error> {
    let mut size: Option<u64> = Some(0);
    let mut alignment: u64 = 1;

    for field in fields.iter_mut() {
        field.offset = Some(0);
        alignment = alignment.max(field.ty.alignment);
        let member_size = match field.bits {
            Some(_) => {
                let (storage_bits, _) = bitfield_storage(&field.ty)?;
                Some(storage_bits as u64 / 8)
            }
            None => field.ty.size,
        };
        size = match (size, member_size) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
    }

    Ok((size, alignment))
}

/// Structural compatibility, used for redefinition checks
pub(crate) fn compatible(a: &Type, b: &Type) -> bool {
    match (&a.kind, &b.kind) {
        (TypeKind::Int { bits: ab, signed: asg }, TypeKind::Int { bits: bb, signed: bsg }) => {
            ab == bb && asg == bsg
        }
        (TypeKind::Float { bits: ab }, TypeKind::Float { bits: bb }) => ab == bb,
        (TypeKind::Char, TypeKind::Char) => true,
        (TypeKind::Wchar, TypeKind::Wchar) => true,
        (TypeKind::Leb128 { signed: asg }, TypeKind::Leb128 { signed: bsg }) => asg == bsg,
        (TypeKind::Void, TypeKind::Void) => true,
        (TypeKind::Enum(ae), TypeKind::Enum(be)) => {
            ae.is_flag == be.is_flag
                && compatible(&ae.base, &be.base)
                && ae.members == be.members
        }
        (TypeKind::Array(aa), TypeKind::Array(ba)) => {
            let len_eq = match (&aa.len, &ba.len) {
                (ArrayLen::Fixed(x), ArrayLen::Fixed(y)) => x == y,
                (ArrayLen::Sentinel, ArrayLen::Sentinel) => true,
                // Expression lengths are never considered equal
                _ => false,
            };
            len_eq && compatible(&aa.element, &ba.element)
        }
        (TypeKind::Pointer(ap), TypeKind::Pointer(bp)) => ap.target_name() == bp.target_name(),
        (TypeKind::Struct(astr), TypeKind::Struct(bstr)) => {
            astr.is_union == bstr.is_union
                && astr.fields.len() == bstr.fields.len()
                && astr.fields.iter().zip(&bstr.fields).all(|(fa, fb)| {
                    fa.name == fb.name && fa.bits == fb.bits && compatible(&fa.ty, &fb.ty)
                })
        }
        (TypeKind::Forward { is_union: au }, TypeKind::Forward { is_union: bu }) => au == bu,
        (TypeKind::Custom(ac), TypeKind::Custom(bc)) => Arc::ptr_eq(ac, bc),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u8_ty() -> TypeRef {
        Type::int("uint8", 8, false, 1)
    }

    fn u16_ty() -> TypeRef {
        Type::int("uint16", 16, false, 2)
    }

    fn u32_ty() -> TypeRef {
        Type::int("uint32", 32, false, 4)
    }

    #[test]
    fn test_struct_size_additivity() {
        let ty = Type::structure(
            "S",
            vec![
                Field::new("a", u8_ty()),
                Field::new("b", u16_ty()),
                Field::new("c", u32_ty()),
            ],
            false,
            false,
        )
        .unwrap();
        assert_eq!(ty.size, Some(7));
        assert_eq!(ty.alignment, 4);
        let s = ty.as_struct().unwrap();
        assert_eq!(s.fields[0].offset, Some(0));
        assert_eq!(s.fields[1].offset, Some(1));
        assert_eq!(s.fields[2].offset, Some(4));
    }

    #[test]
    fn test_bitfield_run_shares_unit() {
        let ty = Type::structure(
            "B",
            vec![
                Field::bitfield("a", u16_ty(), 1),
                Field::bitfield("b", u16_ty(), 1),
                Field::new("c", u32_ty()),
                Field::bitfield("d", u16_ty(), 2),
                Field::bitfield("e", u16_ty(), 3),
            ],
            false,
            false,
        )
        .unwrap();
        // One uint16 unit + uint32 + one uint16 unit
        assert_eq!(ty.size, Some(8));
        let s = ty.as_struct().unwrap();
        assert_eq!(s.fields[0].offset, Some(0));
        assert_eq!(s.fields[1].offset, Some(0));
        assert_eq!(s.fields[2].offset, Some(2));
        assert_eq!(s.fields[3].offset, Some(6));
        assert_eq!(s.fields[4].offset, Some(6));
    }

    #[test]
    fn test_bitfield_overflow_starts_new_unit() {
        let ty = Type::structure(
            "B",
            vec![
                Field::bitfield("a", u8_ty(), 6),
                Field::bitfield("b", u8_ty(), 4),
            ],
            false,
            false,
        )
        .unwrap();
        assert_eq!(ty.size, Some(2));
        let s = ty.as_struct().unwrap();
        assert_eq!(s.fields[0].offset, Some(0));
        assert_eq!(s.fields[1].offset, Some(1));
    }

    #[test]
    fn test_bitfield_storage_change_starts_new_unit() {
        let ty = Type::structure(
            "B",
            vec![
                Field::bitfield("a", u16_ty(), 8),
                Field::bitfield("b", u32_ty(), 8),
            ],
            false,
            false,
        )
        .unwrap();
        assert_eq!(ty.size, Some(6));
    }

    #[test]
    fn test_bitfield_too_wide_fails() {
        let err = Type::structure(
            "B",
            vec![Field::bitfield("a", u8_ty(), 9)],
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidBitfield(_)));
    }

    #[test]
    fn test_bitfield_non_integer_storage_fails() {
        let err = Type::structure(
            "B",
            vec![Field::bitfield("a", Type::char_type(), 4)],
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidBitfield(_)));
    }

    #[test]
    fn test_dynamic_field_makes_struct_dynamic() {
        let arr = Type::array(Type::char_type(), ArrayLen::Sentinel).unwrap();
        let ty = Type::structure(
            "S",
            vec![Field::new("s", arr), Field::new("n", u8_ty())],
            false,
            false,
        )
        .unwrap();
        assert_eq!(ty.size, None);
        let s = ty.as_struct().unwrap();
        assert_eq!(s.fields[0].offset, Some(0));
        assert_eq!(s.fields[1].offset, None);
    }

    #[test]
    fn test_union_size_is_max() {
        let ty = Type::structure(
            "U",
            vec![Field::new("a", u32_ty()), Field::new("b", u8_ty())],
            true,
            false,
        )
        .unwrap();
        assert_eq!(ty.size, Some(4));
        let s = ty.as_struct().unwrap();
        assert!(s.fields.iter().all(|f| f.offset == Some(0)));
    }

    #[test]
    fn test_duplicate_field_fails() {
        let err = Type::structure(
            "S",
            vec![Field::new("x", u8_ty()), Field::new("x", u16_ty())],
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateField(_)));
    }

    #[test]
    fn test_promoted_duplicate_fails() {
        let inner = Type::structure(
            "__anonymous_0__",
            vec![Field::new("x", u8_ty())],
            false,
            true,
        )
        .unwrap();
        let err = Type::structure(
            "S",
            vec![Field::new("x", u8_ty()), Field::anonymous(inner)],
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateField(_)));
    }

    #[test]
    fn test_underscore_padding_fields_allowed() {
        let ty = Type::structure(
            "S",
            vec![Field::new("_", u8_ty()), Field::new("_", u8_ty())],
            false,
            false,
        )
        .unwrap();
        assert_eq!(ty.size, Some(2));
    }

    #[test]
    fn test_fixed_array_size() {
        let arr = Type::array(u16_ty(), ArrayLen::Fixed(3)).unwrap();
        assert_eq!(arr.size, Some(6));
        assert_eq!(arr.name, "uint16[3]");
        let sent = Type::array(Type::char_type(), ArrayLen::Sentinel).unwrap();
        assert_eq!(sent.size, None);
        assert_eq!(sent.name, "char[]");
    }

    #[test]
    fn test_enum_member_out_of_range_fails() {
        let err = Type::enumeration(
            "E",
            u8_ty(),
            vec![("A".into(), 300)],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange(_)));
    }

    #[test]
    fn test_compatible_structs() {
        let mk = || {
            Type::structure(
                "S",
                vec![Field::new("a", u8_ty()), Field::new("b", u16_ty())],
                false,
                false,
            )
            .unwrap()
        };
        assert!(compatible(&mk(), &mk()));

        let other = Type::structure(
            "S",
            vec![Field::new("a", u8_ty()), Field::new("b", u32_ty())],
            false,
            false,
        )
        .unwrap();
        assert!(!compatible(&mk(), &other));
    }

    #[test]
    fn test_int_bounds() {
        assert_eq!(int_bounds(8, false), (0, 255));
        assert_eq!(int_bounds(8, true), (-128, 127));
        assert_eq!(int_bounds(16, false), (0, 65535));
    }
}
