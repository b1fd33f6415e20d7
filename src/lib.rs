#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! aero: peer directory and file transfer for a small trusted network.
//!
//! One node runs as **master** and keeps the authoritative directory of
//! devices and the files each one offers. Every other node is a **peer** that
//! registers with the master, keeps its entry current, reads the directory,
//! and pulls files directly from other peers by content hash.
//!
//! ## Architecture
//!
//! ```text
//! node.rs          Aero orchestrator: start/stop, join, offer files, download
//! auth.rs          shared-secret HS256 tokens, axum middleware
//! config.rs        TOML + env-var configuration
//! model.rs         Device / File and their wire shapes
//! hasher.rs        base64 SHA-256 content hashes
//! metadata.rs      local file description (name, ext, MIME, size, hash)
//! messages.rs      protocol event sinks (memory, file, tracing)
//! registry/
//!   mod.rs         directory state, Init/Refresh/List/Status/Fetch
//!   routes.rs      axum router for the registry RPC surface
//!   client.rs      reqwest caller with per-call tokens and deadline
//! transfer/
//!   server.rs      raw TCP file server, source-address allow-list
//!   client.rs      hash request, streamed write, integrity re-hash
//!   downloads.rs   detached download ids and progress snapshots
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod hasher;
pub mod messages;
pub mod metadata;
pub mod model;
pub mod node;
pub mod registry;
pub mod transfer;

pub use auth::{AuthGate, FileKeyProvider, KeyProvider, StaticKeyProvider};
pub use config::Config;
pub use error::{AeroError, AuthError, ConfigError, RegistryError, TransferError};
pub use messages::{FileSink, MemorySink, MessageSink, Severity, TracingSink};
pub use model::{Device, File};
pub use node::Aero;
pub use registry::{Registry, Role};
