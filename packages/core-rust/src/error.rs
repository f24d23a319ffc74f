//! Error taxonomy shared by every layer of the store.
//!
//! Schema and type errors are non-retryable and indicate a corrupt or
//! inconsistent document or class. [`StoreError::Io`] is the only class a
//! caller may choose to retry; the store itself never retries.

/// Result alias used throughout `dynastore`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the dynamic-schema engine and the blob store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The type name is neither cached nor present in the durable store.
    #[error("unknown record type: {type_name}")]
    UnknownType { type_name: String },

    /// A schema definition uses a value kind outside the fixed set, or the
    /// engine was configured with an invalid reserved-word list.
    #[error("malformed schema {type_name}: {reason}")]
    MalformedSchema { type_name: String, reason: String },

    /// A property value disagrees with the kind of the member it maps to.
    #[error("type mismatch on {type_name}.{member}: expected {expected}, found {found}")]
    TypeMismatch {
        type_name: String,
        member: String,
        expected: String,
        found: String,
    },

    /// Text passed to `unescape` is not the output of `escape`.
    #[error("malformed escaped identifier: {identifier}")]
    MalformedIdentifier { identifier: String },

    /// A stored record could not be decoded.
    #[error("corrupt {what} record: {reason}")]
    Corrupt { what: &'static str, reason: String },

    /// The durable store could not complete the session.
    #[error("storage I/O failure: {0}")]
    Io(#[source] anyhow::Error),
}

impl StoreError {
    /// Whether the caller may retry the failed operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }

    /// Whether the error means the stored document or class is corrupt or
    /// inconsistent with the registry.
    #[must_use]
    pub fn is_inconsistency(&self) -> bool {
        matches!(
            self,
            StoreError::UnknownType { .. }
                | StoreError::MalformedSchema { .. }
                | StoreError::TypeMismatch { .. }
                | StoreError::Corrupt { .. }
        )
    }

    /// Wraps a backend failure as an I/O-class error.
    pub fn io(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Io(err.into())
    }

    /// Shorthand for [`StoreError::UnknownType`].
    pub fn unknown_type(type_name: impl Into<String>) -> Self {
        StoreError::UnknownType {
            type_name: type_name.into(),
        }
    }
}
