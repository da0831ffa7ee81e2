// Type registry: named types, constants, configuration and the public
// read/write surface

use std::io;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::codec;
use crate::cursor::{Reader, Writer};
use crate::error::Error;
use crate::eval::{self, Scope};
use crate::lexer::Lexer;
use crate::parser::{self, Parser};
use crate::types::{
    compatible, ArrayLen, CustomType, Endian, PtrTarget, Type, TypeKind, TypeRef,
};
use crate::value::{PointerValue, StructValue, Value};

/// A `#define`d constant
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i128),
    Str(String),
}

#[derive(Clone)]
enum Entry {
    /// Name-to-name alias, used by the built-in C type table
    Alias(String),
    Type(TypeRef),
}

/// External memory for pointer dereferencing
pub trait MemorySource {
    /// Read up to `buf.len()` bytes at `addr`; 0 means end of memory
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<usize, Error>;
}

impl MemorySource for Vec<u8> {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let start = (addr as usize).min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// Adapts a MemorySource into a sequential stream starting at an address
struct MemoryStream<'a> {
    src: &'a dyn MemorySource,
    addr: u64,
}

impl io::Read for MemoryStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .src
            .read_at(self.addr, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.addr += n as u64;
        Ok(n)
    }
}

/// The type universe: a mapping from names to types, plus the default
/// endianness, pointer size and preprocessor constants.
///
/// Types are immutable once registered, so lookups of loaded types are
/// safe to share; `load` and the setters are the only mutations.
pub struct TypeRegistry {
    endian: Endian,
    pointer_size: u64,
    wchar_size: u64,
    entries: FxHashMap<String, Entry>,
    consts: FxHashMap<String, ConstValue>,
    enum_members: FxHashMap<String, i128>,
    resolver: Option<Box<dyn MemorySource>>,
    anon_count: u64,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Little-endian registry with 8 byte pointers
    pub fn new() -> Self {
        Self::with_config(Endian::Little, 8)
    }

    pub fn with_config(endian: Endian, pointer_size: u64) -> Self {
        let mut reg = Self {
            endian,
            pointer_size,
            wchar_size: 2,
            entries: FxHashMap::default(),
            consts: FxHashMap::default(),
            enum_members: FxHashMap::default(),
            resolver: None,
            anon_count: 0,
        };
        reg.install_defaults();
        reg
    }

    fn install_defaults(&mut self) {
        let concrete: [(&str, TypeRef); 21] = [
            ("int8", Type::int("int8", 8, true, 1)),
            ("uint8", Type::int("uint8", 8, false, 1)),
            ("int16", Type::int("int16", 16, true, 2)),
            ("uint16", Type::int("uint16", 16, false, 2)),
            ("int32", Type::int("int32", 32, true, 4)),
            ("uint32", Type::int("uint32", 32, false, 4)),
            ("int64", Type::int("int64", 64, true, 8)),
            ("uint64", Type::int("uint64", 64, false, 8)),
            ("int24", Type::int("int24", 24, true, 4)),
            ("uint24", Type::int("uint24", 24, false, 4)),
            ("int48", Type::int("int48", 48, true, 8)),
            ("uint48", Type::int("uint48", 48, false, 8)),
            ("float16", Type::float("float16", 16)),
            ("float", Type::float("float", 32)),
            ("double", Type::float("double", 64)),
            ("char", Type::char_type()),
            ("wchar", Type::wchar_type(2)),
            ("uleb128", Type::leb128("uleb128", false)),
            ("ileb128", Type::leb128("ileb128", true)),
            ("leb128", Type::leb128("leb128", true)),
            ("void", Type::void()),
        ];
        for (name, ty) in concrete {
            self.entries.insert(name.to_string(), Entry::Type(ty));
        }

        // Convenience aliases for common C, Windows, GNU and IDA names
        let aliases: [(&str, &str); 66] = [
            ("signed char", "int8"),
            ("unsigned char", "char"),
            ("short", "int16"),
            ("signed short", "int16"),
            ("unsigned short", "uint16"),
            ("int", "int32"),
            ("signed int", "int32"),
            ("unsigned int", "uint32"),
            ("long", "int32"),
            ("signed long", "int32"),
            ("unsigned long", "uint32"),
            ("long long", "int64"),
            ("signed long long", "int64"),
            ("unsigned long long", "uint64"),
            ("BYTE", "uint8"),
            ("CHAR", "char"),
            ("SHORT", "int16"),
            ("WORD", "uint16"),
            ("DWORD", "uint32"),
            ("LONG", "int32"),
            ("LONG32", "int32"),
            ("LONG64", "int64"),
            ("LONGLONG", "int64"),
            ("QWORD", "uint64"),
            ("WCHAR", "wchar"),
            ("UCHAR", "uint8"),
            ("USHORT", "uint16"),
            ("ULONG", "uint32"),
            ("ULONG64", "uint64"),
            ("ULONGLONG", "uint64"),
            ("INT", "int32"),
            ("INT8", "int8"),
            ("INT16", "int16"),
            ("INT32", "int32"),
            ("INT64", "int64"),
            ("UINT", "uint32"),
            ("UINT8", "uint8"),
            ("UINT16", "uint16"),
            ("UINT32", "uint32"),
            ("UINT64", "uint64"),
            ("__int8", "int8"),
            ("__int16", "int16"),
            ("__int32", "int32"),
            ("__int64", "int64"),
            ("unsigned __int8", "uint8"),
            ("unsigned __int16", "uint16"),
            ("unsigned __int32", "uint32"),
            ("unsigned __int64", "uint64"),
            ("wchar_t", "wchar"),
            ("int8_t", "int8"),
            ("int16_t", "int16"),
            ("int32_t", "int32"),
            ("int64_t", "int64"),
            ("uint8_t", "uint8"),
            ("uint16_t", "uint16"),
            ("uint32_t", "uint32"),
            ("uint64_t", "uint64"),
            ("_BYTE", "uint8"),
            ("_WORD", "uint16"),
            ("_DWORD", "uint32"),
            ("_QWORD", "uint64"),
            ("u1", "uint8"),
            ("u2", "uint16"),
            ("u4", "uint32"),
            ("__u8", "uint8"),
            ("uchar", "uint8"),
        ];
        for (name, target) in aliases {
            self.entries
                .insert(name.to_string(), Entry::Alias(target.to_string()));
        }
        for (name, target) in [
            ("u8", "uint64"),
            ("__u16", "uint16"),
            ("__u32", "uint32"),
            ("__u64", "uint64"),
            ("ushort", "uint16"),
            ("uint", "uint32"),
            ("ulong", "uint32"),
        ] {
            self.entries
                .insert(name.to_string(), Entry::Alias(target.to_string()));
        }
    }

    // ---------- configuration ----------

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn pointer_size(&self) -> u64 {
        self.pointer_size
    }

    pub fn set_pointer_size(&mut self, size: u64) -> Result<(), Error> {
        if !(1..=8).contains(&size) {
            return Err(Error::ValueOutOfRange(format!(
                "pointer size {} is not between 1 and 8",
                size
            )));
        }
        self.pointer_size = size;
        Ok(())
    }

    pub fn wchar_size(&self) -> u64 {
        self.wchar_size
    }

    /// Set the wide character width (2 for UTF-16, 4 for UTF-32).
    /// Affects types declared afterwards.
    pub fn set_wchar_size(&mut self, size: u64) -> Result<(), Error> {
        if size != 2 && size != 4 {
            return Err(Error::ValueOutOfRange(format!(
                "wchar size {} is not 2 or 4",
                size
            )));
        }
        self.wchar_size = size;
        self.entries
            .insert("wchar".to_string(), Entry::Type(Type::wchar_type(size)));
        Ok(())
    }

    /// Attach the external memory pointers dereference against
    pub fn set_memory(&mut self, src: Box<dyn MemorySource>) {
        self.resolver = Some(src);
    }

    // ---------- loading ----------

    /// Parse a definition string and register its declarations.
    /// Transactional: when any declaration fails, nothing is committed.
    pub fn load(&mut self, text: &str) -> Result<(), Error> {
        let entries = self.entries.clone();
        let consts = self.consts.clone();
        let enum_members = self.enum_members.clone();
        let anon_count = self.anon_count;

        let result = Lexer::new(text)
            .tokenize()
            .and_then(|tokens| Parser::new(text, tokens, self).parse());

        if result.is_err() {
            self.entries = entries;
            self.consts = consts;
            self.enum_members = enum_members;
            self.anon_count = anon_count;
        }
        result
    }

    // ---------- type table ----------

    pub(crate) fn contains_type(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Resolve a name to its type, following aliases
    pub fn resolve(&self, name: &str) -> Result<TypeRef, Error> {
        let mut current = name;
        for _ in 0..10 {
            match self.entries.get(current) {
                None => return Err(Error::UnknownType(format!("`{}`", current))),
                Some(Entry::Type(ty)) => return Ok(ty.clone()),
                Some(Entry::Alias(target)) => current = target,
            }
        }
        Err(Error::UnknownType(format!(
            "alias recursion limit exceeded while resolving `{}`",
            name
        )))
    }

    /// Look up a type and bind it to this registry for reading/writing
    pub fn lookup(&self, name: &str) -> Result<TypeHandle<'_>, Error> {
        Ok(TypeHandle {
            reg: self,
            ty: self.resolve(name)?,
        })
    }

    /// Bind an already-built type to this registry
    pub fn handle(&self, ty: TypeRef) -> TypeHandle<'_> {
        TypeHandle { reg: self, ty }
    }

    /// Register a type under a name. Filling in a forward declaration
    /// is allowed, as is re-registering a structurally identical type;
    /// anything else is a redefinition error.
    pub(crate) fn add_named_type(&mut self, name: &str, ty: TypeRef) -> Result<(), Error> {
        if let Some(existing) = self.entries.get(name) {
            let existing = match existing {
                Entry::Type(t) => t.clone(),
                Entry::Alias(_) => self.resolve(name)?,
            };
            let fills_forward = matches!(
                (&existing.kind, &ty.kind),
                (
                    TypeKind::Forward { is_union: a },
                    TypeKind::Struct(st)
                ) if *a == st.is_union
            );
            if !fills_forward {
                if compatible(&existing, &ty) {
                    // Identical shape: keep the original definition
                    return Ok(());
                }
                return Err(Error::Redefinition(format!("`{}`", name)));
            }
        }
        self.entries.insert(name.to_string(), Entry::Type(ty));
        Ok(())
    }

    /// Register `alias` as another name for `target`
    pub fn typedef(&mut self, alias: &str, target: &str) -> Result<(), Error> {
        let ty = self.resolve(target)?;
        self.add_named_type(alias, ty)
    }

    /// Register a user-provided codec under a name
    pub fn add_custom_type(
        &mut self,
        name: &str,
        imp: Arc<dyn CustomType>,
    ) -> Result<(), Error> {
        let ty = Type::custom(name, imp);
        self.add_named_type(name, ty)?;
        debug!(name, "registered custom type");
        Ok(())
    }

    pub(crate) fn anonymous_name(&mut self) -> String {
        let name = format!("__anonymous_{}__", self.anon_count);
        self.anon_count += 1;
        name
    }

    // ---------- constants and enum members ----------

    pub(crate) fn add_constant(&mut self, name: &str, value: ConstValue) {
        self.consts.insert(name.to_string(), value);
    }

    pub fn const_value(&self, name: &str) -> Option<&ConstValue> {
        self.consts.get(name)
    }

    /// Integer constant by name
    pub fn constant(&self, name: &str) -> Option<i128> {
        match self.consts.get(name) {
            Some(ConstValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn register_enum_members(&mut self, ty: &TypeRef) {
        if let Some(e) = ty.as_enum() {
            for (name, value) in &e.members {
                self.enum_members.insert(name.clone(), *value);
            }
        }
    }

    pub(crate) fn enum_member(&self, name: &str) -> Option<i128> {
        self.enum_members.get(name).copied()
    }

    pub(crate) fn scoped_enum_member(&self, type_name: &str, member: &str) -> Option<i128> {
        self.resolve(type_name)
            .ok()?
            .as_enum()?
            .member_value(member)
    }

    /// Evaluate a constant expression against the registry's constants
    /// and enum members
    pub fn resolve_expr(&self, text: &str) -> Result<i128, Error> {
        let expr = parser::parse_expr_text(text)?;
        eval::eval(&expr, &Scope::new(self))
    }

    // ---------- reading and writing ----------

    /// Parse `data` as the named type
    pub fn read(&self, name: &str, data: &[u8]) -> Result<Value, Error> {
        self.lookup(name)?.read(data)
    }

    /// Emit a value as the named type
    pub fn dumps(&self, name: &str, value: &Value) -> Result<Vec<u8>, Error> {
        self.lookup(name)?.dumps(value)
    }

    /// Re-establish a union's shared-bytes view after member
    /// assignments: re-encodes the last-assigned member over the raw
    /// bytes and re-decodes every member from them.
    pub fn sync_union(&self, value: &mut StructValue) -> Result<(), Error> {
        codec::sync_union(self, value)
    }

    /// Dereference a pointer against the attached memory source
    pub fn dereference(&self, ptr: &PointerValue) -> Result<Value, Error> {
        let resolver = self.resolver.as_deref().ok_or_else(|| {
            Error::NullDereference("no memory source attached to the registry".to_string())
        })?;
        if ptr.is_null() {
            return Err(Error::NullDereference("address is null".to_string()));
        }
        let target = match ptr.target() {
            PtrTarget::Resolved(ty) => ty.clone(),
            PtrTarget::Named(name) => self.resolve(name)?,
        };
        let mut stream = MemoryStream {
            src: resolver,
            addr: ptr.addr,
        };
        let mut cur = Reader::from_stream(&mut stream);
        match &target.kind {
            // A char pointer dereferences to a null-terminated string
            TypeKind::Char => {
                let n = cur.scan_to_zero(1)?;
                Ok(Value::Bytes(cur.read_bytes(n)?))
            }
            _ => codec::read_value(self, &target, &mut cur, None),
        }
    }
}

/// A type bound to its registry, ready to parse and emit values
pub struct TypeHandle<'r> {
    reg: &'r TypeRegistry,
    ty: TypeRef,
}

impl<'r> TypeHandle<'r> {
    pub fn name(&self) -> &str {
        &self.ty.name
    }

    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    /// Static byte size, or None when dynamic
    pub fn size(&self) -> Option<u64> {
        self.ty.size
    }

    pub fn alignment(&self) -> u64 {
        self.ty.alignment
    }

    /// Parse a value from bytes
    pub fn read(&self, data: &[u8]) -> Result<Value, Error> {
        let mut cur = Reader::from_slice(data);
        codec::read_value(self.reg, &self.ty, &mut cur, None)
            .map_err(|e| e.at_field(&self.ty.name))
    }

    /// Parse a value from a streaming source
    pub fn read_stream(&self, stream: &mut dyn io::Read) -> Result<Value, Error> {
        let mut cur = Reader::from_stream(stream);
        codec::read_value(self.reg, &self.ty, &mut cur, None)
            .map_err(|e| e.at_field(&self.ty.name))
    }

    /// Emit a value back to bytes
    pub fn dumps(&self, value: &Value) -> Result<Vec<u8>, Error> {
        let mut w = Writer::new();
        codec::write_value(self.reg, &self.ty, &mut w, value)
            .map_err(|e| e.at_field(&self.ty.name))?;
        Ok(w.into_bytes())
    }

    /// The type's zero-equivalent value, ready for field assignment
    /// and `dumps`
    pub fn default_value(&self) -> Value {
        codec::default_value(&self.ty)
    }

    /// Construct an enum/flag instance from an integer. Values that
    /// match no member are legitimate and still round-trip.
    pub fn enum_value(&self, value: i128) -> Result<crate::value::EnumValue, Error> {
        if self.ty.as_enum().is_none() {
            return Err(Error::UnknownType(format!(
                "`{}` is not an enum or flag",
                self.ty.name
            )));
        }
        Ok(crate::value::EnumValue::new(self.ty.clone(), value))
    }

    /// Derive an array of this type: `Some(n)` for a fixed count,
    /// `None` for a sentinel-terminated array
    pub fn array(&self, count: Option<u64>) -> Result<TypeHandle<'r>, Error> {
        let len = match count {
            Some(n) => ArrayLen::Fixed(n),
            None => ArrayLen::Sentinel,
        };
        Ok(TypeHandle {
            reg: self.reg,
            ty: Type::array(self.ty.clone(), len)?,
        })
    }

    /// Derive a pointer to this type
    pub fn pointer(&self) -> TypeHandle<'r> {
        TypeHandle {
            reg: self.reg,
            ty: Type::pointer(PtrTarget::Resolved(self.ty.clone()), self.reg.pointer_size()),
        }
    }
}
