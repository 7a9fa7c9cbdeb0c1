//! Schema Proxy Error Hierarchy
//!
//! Defines error types for the caching proxy, categorized by origin:
//! backing-store failures and proxy lifecycle/stream failures.
//!
//! Every error type is `Clone`: the single-flight coordinator publishes one
//! outcome to all coalesced waiters, so outcomes must be shareable.

use std::sync::Arc;

use config::ConfigError;

use crate::storage::DefinitionKind;
use crate::storage::Revision;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Failures reported by the backing schema store
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Proxy lifecycle and watch-stream failures
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Configuration loading or validation failures
    #[error("Configuration error: {0}")]
    Config(Arc<ConfigError>),
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::Config(Arc::new(error))
    }
}

impl Error {
    /// Whether this error is the authoritative "definition does not exist"
    /// negative, which flows through every cache layer untouched.
    pub fn is_definition_not_found(&self) -> bool {
        matches!(
            self,
            Error::Storage(StorageError::DefinitionNotFound { .. })
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Authoritative negative: no definition with this name at the read
    /// revision. Tombstoned names surface the same error.
    #[error("{kind} definition `{name}` not found")]
    DefinitionNotFound { kind: DefinitionKind, name: String },

    /// Backing store failure, propagated unchanged and never cached
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The operation observed cancellation before a result was produced
    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// Read attempted after `close()`
    #[error("Schema proxy is closed")]
    Closed,

    /// `start()` called more than once
    #[error("Schema proxy already started")]
    AlreadyStarted,

    /// A change message arrived with a revision at or below the last
    /// observed revision for a name. Forces the fallback transition.
    #[error("Schema change at revision {revision} is not newer than last observed {last}")]
    OrderingViolation { revision: Revision, last: Revision },

    /// Terminal watch-stream failure. Consumed by the watch worker; never
    /// surfaces to readers.
    #[error("Schema watch stream failed: {0}")]
    StreamFailed(String),
}
