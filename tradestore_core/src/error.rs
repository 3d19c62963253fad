// tradestore_core/src/error.rs

//! Error categories callers need to tell apart.
//! Everything else is reported through `anyhow`.

/// A single input tuple or stored record that cannot be represented.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("field '{field}': cannot parse '{value}' as an unsigned integer")]
    Integer { field: &'static str, value: String },

    #[error("field '{field}': {len} bytes exceeds the {max}-byte limit")]
    TooLong { field: &'static str, len: usize, max: usize },

    #[error("field '{field}': contains a NUL byte")]
    EmbeddedNul { field: &'static str },

    #[error("field '{field}': stored text is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("record buffer is {found} bytes, expected {expected}")]
    Length { expected: usize, found: usize },
}

/// A request frame that does not describe a valid search.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown predicate kind {0}")]
    UnknownKind(u32),

    #[error("predicate text of {len} bytes exceeds the {max}-byte limit")]
    TextTooLong { len: usize, max: usize },

    #[error("predicate text contains a NUL byte")]
    EmbeddedNul,

    #[error("predicate text is not valid UTF-8")]
    InvalidUtf8,
}
