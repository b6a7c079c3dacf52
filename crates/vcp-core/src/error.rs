//! Unified error types for vcp.
//!
//! All errors are represented by [`VcpError`], using `thiserror` for the
//! definitions. Each variant names the operation that failed so the top-level
//! caller can print a single causal chain. Library code never uses `unwrap()`;
//! all fallible operations return `Result<T, VcpError>`.

use thiserror::Error;

/// Boxed source error carried by the wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The unified error type for all vcp operations.
#[derive(Error, Debug)]
pub enum VcpError {
    /// An object storage (sink/source) operation failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// The requested object or key was not found.
    #[error("Not found: {key}")]
    NotFound {
        /// The key or path that was not found.
        key: String,
    },

    /// The backing store could not be reached or rejected a request.
    #[error("Backing store error: {message}")]
    BackingStore {
        /// The operation that failed (e.g. "list keys", "member list").
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// The archive stream could not be encoded or decoded.
    #[error("Archive error: {message}")]
    Archive {
        /// Description of the malformed or failed archive operation.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// Replaying a key into the backing store failed mid-restore.
    ///
    /// Keys restored before this one remain applied.
    #[error("Restore key {key}")]
    Apply {
        /// The key whose `put` failed.
        key: String,
        /// The failure reported by the backing store.
        #[source]
        source: Box<VcpError>,
    },

    /// Protecting existing state before a restore failed. Nothing destructive
    /// has happened when this is returned.
    #[error("Protect existing data at {path}: {message}")]
    Protection {
        /// The file, directory or key prefix being protected.
        path: String,
        /// Description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// A bootstrap sub-step failed (certificates, shim start, connection).
    #[error("Bootstrap step '{step}' failed: {message}")]
    Bootstrap {
        /// The sub-step that failed.
        step: String,
        /// Description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An unsupported operation or combination of settings was requested.
    #[error("Unsupported: {message}")]
    Unsupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// An internal error (bug).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl VcpError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a backing store error from a message and source error.
    pub fn backing_store(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackingStore {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a backing store error from a message only.
    pub fn backing_store_msg(message: impl Into<String>) -> Self {
        Self::BackingStore {
            message: message.into(),
            source: None,
        }
    }

    /// Create an archive error from a message and source error.
    pub fn archive(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Archive {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an archive error from a message only.
    pub fn archive_msg(message: impl Into<String>) -> Self {
        Self::Archive {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protection error for `path`.
    pub fn protection(
        path: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protection {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap any error as the failure of bootstrap sub-step `step`.
    pub fn bootstrap(step: impl Into<String>, source: VcpError) -> Self {
        Self::Bootstrap {
            step: step.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a bootstrap error without an underlying source.
    pub fn bootstrap_msg(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bootstrap {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Attach the offending key to a failed restore `put`.
    pub fn apply(key: &[u8], source: VcpError) -> Self {
        Self::Apply {
            key: String::from_utf8_lossy(key).into_owned(),
            source: Box::new(source),
        }
    }

    /// Returns `true` if this error (or the error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Apply { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
