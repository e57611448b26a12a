use std::fmt;

/// Where in a descriptor source a problem was found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub source: String,
    pub line: Option<usize>,
}

impl Origin {
    pub fn new(source: impl Into<String>, line: Option<usize>) -> Self {
        Self { source: source.into(), line }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.source, line),
            None => write!(f, "{}", self.source),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LayoutError {
    #[error("malformed descriptor at {at}: {reason}")]
    MalformedDescriptor { at: Origin, reason: String },

    #[error("unknown structure: {name}")]
    UnknownStructure { name: String },

    #[error("unknown field {structure}::{field}")]
    UnknownField { structure: String, field: String },

    #[error("field {field} out of bounds: offset=0x{offset:X}, size=0x{size:X}, buffer_len=0x{len:X}")]
    FieldOutOfBounds {
        field: String,
        offset: usize,
        size: usize,
        len: usize,
    },

    #[error("no layout registered for build {build:?}")]
    NoMatchingVersion { build: String },

    #[error("field {field} is {found}, expected {expected}")]
    KindMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("vector {field} has invalid element count {count} (limit={limit})")]
    InvalidVector { field: String, count: i64, limit: usize },

    #[error("element read failed at 0x{address:X} (len=0x{len:X}): {reason}")]
    ElementRead {
        address: u64,
        len: usize,
        reason: String,
    },

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LayoutError {
    pub(crate) fn malformed(source: &str, line: Option<usize>, reason: impl Into<String>) -> Self {
        LayoutError::MalformedDescriptor {
            at: Origin::new(source, line),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LayoutError>;
