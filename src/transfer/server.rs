//! Transfer server: serves offered files to known hosts.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::MAX_REQUEST_LEN;
use crate::error::TransferError;
use crate::messages::{MessageSink, Severity};
use crate::model::Device;

/// Listens on the transfer port; one task per inbound connection.
pub struct TransferServer {
    listener: TcpListener,
    ctx: Arc<ServeContext>,
}

struct ServeContext {
    /// Files this node offers (with local paths).
    local: Arc<RwLock<Device>>,
    /// Devices whose hosts may connect.
    known: Arc<RwLock<Vec<Device>>>,
    messages: Arc<dyn MessageSink>,
}

impl TransferServer {
    pub async fn bind(
        addr: &str,
        local: Arc<RwLock<Device>>,
        known: Arc<RwLock<Vec<Device>>>,
        messages: Arc<dyn MessageSink>,
    ) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransferError::Connection)?;
        debug!(addr, "transfer server bound");
        Ok(Self {
            listener,
            ctx: Arc::new(ServeContext {
                local,
                known,
                messages,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        self.listener.local_addr().map_err(TransferError::Connection)
    }

    /// Accept until `shutdown` is cancelled. Connections already being served
    /// run to completion on their own tasks.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), TransferError> {
        info!(addr = ?self.listener.local_addr().ok(), "transfer server listening");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("transfer server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| {
                        self.ctx
                            .messages
                            .add(&format!("send_file: accept failed: {e}"), Severity::Error);
                        TransferError::Connection(e)
                    })?;
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        ctx.handle(stream, peer).await;
                    });
                }
            }
        }
    }
}

/// Host component of a peer address, with IPv4-mapped IPv6 unwrapped.
fn host_of(peer: SocketAddr) -> String {
    match peer.ip() {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or_else(|| v6.to_string(), |v4| v4.to_string()),
        IpAddr::V4(v4) => v4.to_string(),
    }
}

impl ServeContext {
    /// Every early return closes the connection without writing anything.
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        let host = host_of(peer);
        self.messages
            .add(&format!("send_file: serving client: {peer}"), Severity::Msg);

        let authorized = self.known.read().await.iter().any(|d| d.ip == host);
        if !authorized {
            warn!(%peer, "transfer rejected: source not in device list");
            self.messages.add(
                &format!("send_file: incoming device not found in list {host}"),
                Severity::Error,
            );
            return;
        }

        let mut buf = [0u8; MAX_REQUEST_LEN];
        let n = match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                self.messages
                    .add(&format!("send_file: {e}"), Severity::Error);
                return;
            }
        };
        let Ok(requested) = std::str::from_utf8(&buf[..n]) else {
            self.messages
                .add("send_file: request is not a valid hash", Severity::Error);
            return;
        };

        // Clone out so the lock is not held during the copy.
        let file = self.local.read().await.find_file(requested).cloned();
        let Some(file) = file else {
            self.messages.add(
                &format!("send_file: requested file not found in list {requested}"),
                Severity::Error,
            );
            return;
        };

        let mut source = match tokio::fs::File::open(&file.path).await {
            Ok(f) => f,
            Err(e) => {
                self.messages.add(
                    &format!("send_file: {}: {e}", file.path.display()),
                    Severity::Error,
                );
                return;
            }
        };

        self.messages
            .add(&format!("send_file: sending {}", file.name), Severity::Msg);
        match tokio::io::copy(&mut source, &mut stream).await {
            Ok(bytes) => {
                info!(file = %file.name, bytes, %peer, "file served");
                let _ = stream.shutdown().await;
            }
            Err(e) => {
                self.messages
                    .add(&format!("send_file: {e}"), Severity::Error);
            }
        }
    }
}
