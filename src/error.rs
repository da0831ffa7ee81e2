// Error types for definition parsing and the binary codec

use crate::span::Span;
use std::fmt;

/// Malformed definition text, with 1-based source location
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub col: u32,
    pub expected: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            message: message.into(),
            line,
            col,
            expected: None,
        }
    }

    pub fn expected(
        message: impl Into<String>,
        expected: impl Into<String>,
        line: u32,
        col: u32,
    ) -> Self {
        Self {
            message: message.into(),
            line,
            col,
            expected: Some(expected.into()),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at {}:{}: {}",
            self.line, self.col, self.message
        )?;
        if let Some(ref expected) = self.expected {
            write!(f, " (expected {})", expected)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Everything that can go wrong when loading definitions or running the codec
#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed definition text
    Parse(ParseError),
    /// Reference to an undeclared type at a use site
    UnknownType(String),
    /// Incompatible redefinition of an existing name
    Redefinition(String),
    /// Two fields (including promoted anonymous fields) share a name
    DuplicateField(String),
    /// Division by zero, oversized shift, unknown identifier, or a
    /// non-integer result in a constant expression
    BadExpression(String),
    /// Cursor exhausted during a read
    Truncated(String),
    /// Bitfield width exceeds its storage width, or the storage type
    /// is not an integer
    InvalidBitfield(String),
    /// A value does not fit the declared width on write
    ValueOutOfRange(String),
    /// Pointer dereferenced without a memory resolver, or a null address
    NullDereference(String),
    /// Operation the codec explicitly does not support
    Unsupported(String),
}

impl Error {
    /// Prefix the error message with a field path segment, building up
    /// paths like `S.c.a` as codec errors propagate outward.
    pub(crate) fn at_field(self, name: &str) -> Self {
        fn prefix(msg: String, name: &str) -> String {
            match msg.strip_prefix("in `") {
                Some(rest) => format!("in `{}.{}", name, rest),
                None => format!("in `{}`: {}", name, msg),
            }
        }
        match self {
            Error::Truncated(m) => Error::Truncated(prefix(m, name)),
            Error::BadExpression(m) => Error::BadExpression(prefix(m, name)),
            Error::ValueOutOfRange(m) => Error::ValueOutOfRange(prefix(m, name)),
            Error::InvalidBitfield(m) => Error::InvalidBitfield(prefix(m, name)),
            Error::UnknownType(m) => Error::UnknownType(prefix(m, name)),
            Error::NullDereference(m) => Error::NullDereference(prefix(m, name)),
            Error::Unsupported(m) => Error::Unsupported(prefix(m, name)),
            other => other,
        }
    }

    pub(crate) fn parse_at(source: &str, span: Span, message: impl Into<String>) -> Self {
        let (line, col) = crate::span::offset_to_line_col(source, span.start);
        Error::Parse(ParseError::new(message, line, col))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(e) => write!(f, "{}", e),
            Error::UnknownType(m) => write!(f, "unknown type: {}", m),
            Error::Redefinition(m) => write!(f, "incompatible redefinition: {}", m),
            Error::DuplicateField(m) => write!(f, "duplicate field: {}", m),
            Error::BadExpression(m) => write!(f, "bad expression: {}", m),
            Error::Truncated(m) => write!(f, "truncated: {}", m),
            Error::InvalidBitfield(m) => write!(f, "invalid bitfield: {}", m),
            Error::ValueOutOfRange(m) => write!(f, "value out of range: {}", m),
            Error::NullDereference(m) => write!(f, "null dereference: {}", m),
            Error::Unsupported(m) => write!(f, "unsupported: {}", m),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}
