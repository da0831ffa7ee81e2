//! Parse and emit binary data described by C-like type definitions.
//!
//! A definition string declares structs, unions, enums, flags,
//! typedefs and `#define` constants. Loading it into a [`TypeRegistry`]
//! produces a type universe where each type can parse bytes (or a
//! stream) into a structured [`Value`] and emit such a value back to
//! bytes.
//!
//! ```
//! use binstruct::TypeRegistry;
//!
//! let mut reg = TypeRegistry::new();
//! reg.load(
//!     r#"
//!     struct header {
//!         char   magic[4];
//!         uint32 length;
//!         uint8  flags:4;
//!         uint8  version:4;
//!     };
//!     "#,
//! )
//! .unwrap();
//!
//! let value = reg.read("header", b"OHAI\x10\x00\x00\x00\x21").unwrap();
//! assert_eq!(value["magic"].as_bytes().unwrap(), b"OHAI");
//! assert_eq!(value["length"].as_int().unwrap(), 16);
//! assert_eq!(value["flags"].as_int().unwrap(), 1);
//! assert_eq!(value["version"].as_int().unwrap(), 2);
//! assert_eq!(reg.dumps("header", &value).unwrap(), b"OHAI\x10\x00\x00\x00\x21");
//! ```

pub mod bitbuf;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod registry;
pub mod span;
pub mod types;
pub mod value;

pub use cursor::{Reader, Writer};
pub use error::{Error, ParseError};
pub use registry::{ConstValue, MemorySource, TypeHandle, TypeRegistry};
pub use types::{ArrayLen, CustomType, Endian, Field, Type, TypeKind, TypeRef};
pub use value::{EnumValue, PointerValue, StructValue, Value};
