use std::fmt;

use thiserror::Error;

/// Crate-wide error type. Every variant carries the name of the operation
/// that produced it so failures read as a chain of operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{op}: invalid parameter: {msg}")]
    InvalidParameter { op: &'static str, msg: String },

    #[error("{op}: not found: {msg}")]
    NotFound { op: &'static str, msg: String },

    #[error("{op}: record not found: {msg}")]
    RecordNotFound { op: &'static str, msg: String },

    #[error("{op}: multiple records: {msg}")]
    MultipleRecords { op: &'static str, msg: String },

    #[error("{op}: invalid public id: {msg}")]
    InvalidPublicId { op: &'static str, msg: String },

    #[error("{op}: not unique: {msg}")]
    NotUnique { op: &'static str, msg: String },

    /// Retryable database conflict. The transaction wrapper in the store
    /// retries these with exponential backoff before giving up.
    #[error("{op}: transient database conflict: {source}")]
    Transient {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{op}: database error: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{op}: encoding error: {msg}")]
    Encoding { op: &'static str, msg: String },

    #[error("{op}: transport error: {msg}")]
    Transport { op: &'static str, msg: String },

    #[error("{op}: internal error: {msg}")]
    Internal { op: &'static str, msg: String },

    /// Accumulated non-fatal errors, e.g. from the per-user refresh loop.
    #[error("{0}")]
    Aggregate(AggregateError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_parameter(op: &'static str, msg: impl Into<String>) -> Self {
        Error::InvalidParameter { op, msg: msg.into() }
    }

    pub fn not_found(op: &'static str, msg: impl Into<String>) -> Self {
        Error::NotFound { op, msg: msg.into() }
    }

    pub fn record_not_found(op: &'static str, msg: impl Into<String>) -> Self {
        Error::RecordNotFound { op, msg: msg.into() }
    }

    pub fn multiple_records(op: &'static str, msg: impl Into<String>) -> Self {
        Error::MultipleRecords { op, msg: msg.into() }
    }

    pub fn invalid_public_id(op: &'static str, msg: impl Into<String>) -> Self {
        Error::InvalidPublicId { op, msg: msg.into() }
    }

    pub fn not_unique(op: &'static str, msg: impl Into<String>) -> Self {
        Error::NotUnique { op, msg: msg.into() }
    }

    pub fn encoding(op: &'static str, msg: impl fmt::Display) -> Self {
        Error::Encoding { op, msg: msg.to_string() }
    }

    pub fn transport(op: &'static str, msg: impl fmt::Display) -> Self {
        Error::Transport { op, msg: msg.to_string() }
    }

    pub fn internal(op: &'static str, msg: impl Into<String>) -> Self {
        Error::Internal { op, msg: msg.into() }
    }

    /// Classify a sqlx error under the given operation. Unique-constraint
    /// violations map to `NotUnique`, busy/locked conflicts to `Transient`,
    /// everything else to `Database`.
    pub fn from_sqlx(op: &'static str, source: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &source {
            if db.is_unique_violation() {
                return Error::NotUnique { op, msg: db.message().to_string() };
            }
            let code = db.code();
            let code = code.as_deref().unwrap_or("");
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
            if code == "5" || code == "6" || code.starts_with("261") || code.starts_with("517") {
                return Error::Transient { op, source };
            }
        }
        Error::Database { op, source }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Join a list of accumulated errors into one, or `Ok(())` when empty.
    pub fn join(errs: Vec<Error>) -> Result<()> {
        if errs.is_empty() {
            return Ok(());
        }
        Err(Error::Aggregate(AggregateError(errs)))
    }
}

#[derive(Debug)]
pub struct AggregateError(pub Vec<Error>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_empty_is_ok() {
        assert!(Error::join(Vec::new()).is_ok());
    }

    #[test]
    fn join_formats_all_errors() {
        let err = Error::join(vec![
            Error::not_found("cache.lookup", "token one"),
            Error::invalid_parameter("cache.add", "token two"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("token one"));
        assert!(msg.contains("token two"));
    }
}
