//! Error types for Nitrate
//!
//! All modules use `NitrateResult<T>` as their return type.

use crate::entity::{EntityClass, IdentityKey};
use crate::rpc::RemoteFault;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Nitrate operations
pub type NitrateResult<T> = Result<T, NitrateError>;

/// All errors that can occur in Nitrate
#[derive(Error, Debug)]
pub enum NitrateError {
    // Entity errors
    #[error("{0} not found")]
    NotFound(IdentityKey),

    #[error("Remote fault: {0}")]
    Remote(#[from] RemoteFault),

    // Usage errors
    #[error("{class} has no field named '{field}'")]
    InvalidField { class: EntityClass, field: String },

    #[error("{0} objects are read-only")]
    ReadOnly(EntityClass),

    #[error("Cannot modify {key}: it could not be loaded: {source}")]
    NotLoaded {
        key: IdentityKey,
        #[source]
        source: Box<NitrateError>,
    },

    #[error("{0} is not a container")]
    NotContainer(EntityClass),

    #[error("{0} cannot be looked up by natural key")]
    NoNaturalKey(EntityClass),

    #[error("{class} natural key takes {expected} parts, got {got}")]
    NaturalKeyArity {
        class: EntityClass,
        expected: usize,
        got: usize,
    },

    #[error("A batch is already being collected")]
    BatchActive,

    #[error("No batch is being collected")]
    NoBatch,

    #[error("The Nitrate session owning this object has been closed")]
    SessionClosed,

    #[error("{0}")]
    Usage(String),

    // Persistent store errors
    #[error("Cache file {path} is unreadable: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("Cache file {0} is locked by another process")]
    LockContention(PathBuf),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cache level '{0}', expected 0-3 or none/changes/objects/persistent")]
    InvalidCacheLevel(String),

    #[error("Invalid expiration '{0}', expected seconds, never-cache or never-expire")]
    InvalidExpiration(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NitrateError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a free-form usage error
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Whether the error is a caller mistake rather than a remote or IO failure
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::InvalidField { .. }
                | Self::ReadOnly(_)
                | Self::NotLoaded { .. }
                | Self::NotContainer(_)
                | Self::NoNaturalKey(_)
                | Self::NaturalKeyArity { .. }
                | Self::BatchActive
                | Self::NoBatch
                | Self::SessionClosed
                | Self::Usage(_)
        )
    }

    /// Whether the error means the remote entity does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::NotLoaded { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockContention(_) => {
                Some("Another nitrate process owns the cache; wait for it to exit or remove the .lock file")
            }
            Self::StoreCorrupt { .. } => Some("Run: nitrate cache clear"),
            Self::InvalidCacheLevel(_) => Some("Set NITRATE_CACHE to 0, 1, 2 or 3"),
            Self::BatchActive => Some("Call end_batch() before starting another batch"),
            _ => None,
        }
    }
}
