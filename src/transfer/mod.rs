//! Raw byte-stream file transfer between peers.
//!
//! The transfer channel is plain TCP on its own port, separate from the
//! registry. The protocol has no framing:
//!
//! ```text
//! client → server   content hash, raw bytes, at most MAX_REQUEST_LEN, one write
//! server → client   file bytes, then close
//! ```
//!
//! The server authorizes by source address only (the connecting host must be
//! listed in the known device set). A rejected source, an unknown hash, and a
//! malformed request all look the same to the requester: the connection
//! closes with zero bytes written. The client detects truncation or
//! corruption by re-hashing what it received.

pub mod client;
pub mod downloads;
pub mod server;

/// Largest accepted request. The server performs a single read of this size.
pub const MAX_REQUEST_LEN: usize = 1024;

/// Copy buffer size for streaming file content.
pub(crate) const COPY_BUF_SIZE: usize = 64 * 1024;

pub use client::TransferClient;
pub use downloads::{DownloadProgress, DownloadSnapshot, DownloadTracker};
pub use server::TransferServer;
