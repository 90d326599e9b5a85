use std::fmt;

/// Crate-wide result type.
pub type CResult<T> = Result<T, Error>;

/// Freezer errors.
///
/// Every failure surfaced by the public API is one of these kinds. Backend
/// failures (I/O, corruption, constraint violations, lock timeouts) fold into
/// `Storage`; schema violations and encoding failures abort the individual
/// operation before any tuple is appended.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// I/O, corruption, or constraint failures from the backing store.
    Storage(String),

    /// Unknown attribute, declared-type mismatch, or a conflicting
    /// redefinition of an existing attribute.
    Schema(String),

    /// A write transaction was opened inside a read transaction.
    Nesting(String),

    /// A value cannot be encoded as the attribute's declared type, or a
    /// stored blob does not decode under its tag.
    Encoding(String),

    /// Unexpected internal state; indicates a bug.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(msg) => write!(f, "storage error: {}", msg),
            Error::Schema(msg) => write!(f, "schema error: {}", msg),
            Error::Nesting(msg) => write!(f, "nesting error: {}", msg),
            Error::Encoding(msg) => write!(f, "encoding error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
