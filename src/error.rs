//! Error taxonomy shared by the registry, transfer, and orchestration layers.
//!
//! Each subsystem has its own enum so callers can match on the failures that
//! can actually happen at that seam. [`AeroError`] wraps them for the
//! orchestrator API.

use std::path::PathBuf;

use thiserror::Error;

/// Token issuance or validation failure.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `jwt` metadata on the call.
    #[error("token empty")]
    Unauthenticated,
    /// Token present but malformed, expired, or badly signed.
    #[error("invalid auth token")]
    PermissionDenied,
    /// The shared secret could not be loaded or created.
    #[error("key provider: {0}")]
    Key(#[source] std::io::Error),
    /// Claims could not be encoded.
    #[error("token encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Failure of a registry operation, as seen by the caller.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// A mutating call reached a node that is not the master.
    #[error("node is not master")]
    NotMaster,
    /// Refresh for an identity hash absent from the directory.
    #[error("did not find a matching device: {0}")]
    NotFound(String),
    /// Dial, send, or deadline failure.
    #[error("connection error: {0}")]
    Connection(String),
    /// The peer answered with something that is not a registry response.
    #[error("unexpected response ({status}): {message}")]
    Remote { status: u16, message: String },
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

/// Failure on the raw transfer channel.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Dial, listen, or accept failure.
    #[error("connection error: {0}")]
    Connection(#[source] std::io::Error),
    /// Local file I/O failed while writing or re-hashing the download.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The received bytes do not hash to the requested content hash.
    /// The written file is left at `path`.
    #[error("file transfer failed due to hash mismatch. want {expected} have {actual}")]
    Integrity {
        expected: String,
        actual: String,
        path: PathBuf,
    },
    /// Malformed or oversized request, or an unusable declared file name.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Configuration could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

/// Top-level error returned by [`crate::node::Aero`] operations.
#[derive(Debug, Error)]
pub enum AeroError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("file with same hash exists")]
    DuplicateFile,
    #[error("file index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("no master known; join a master first")]
    NoMaster,
    #[error("node already started")]
    AlreadyStarted,
    #[error("metadata for {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
