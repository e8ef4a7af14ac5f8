//! Discriminated error kinds shared by every store operation.

use std::path::PathBuf;

/// The error type returned by every public operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A caller-supplied path, name, or identifier failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A filesystem operation (copy, rename, open, chmod, ...) failed.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry is internally inconsistent: a reference points nowhere, a root is dangling,
    /// or a stored hash no longer matches the object's contents.
    #[error("registry inconsistency: {0}")]
    RegistryInconsistent(String),

    /// An external tool (dependency scanner, shell) exited with a nonzero status or could not be
    /// spawned at all.
    #[error("external tool `{tool}` failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// An operation ran out of some bounded resource (file count, recursion depth, argv).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Catch-all for lower-level errors that don't need their own variant, while still
    /// preserving the source for `Display`/`Debug`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidInput(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        StoreError::RegistryInconsistent(msg.into())
    }

    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::ExternalTool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}
