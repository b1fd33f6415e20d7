//! Peer registry: the directory of known devices and the five registry
//! operations (`Init`, `Refresh`, `List`, `Status`, `Fetch`).
//!
//! Every node runs a [`Registry`], but only a master accepts the mutating
//! operations. The directory sits behind a `RwLock`: `List` takes a read lock,
//! `Init`/`Refresh` take the write lock, so concurrent joins never lose an
//! entry. After each mutation the new snapshot is published on a broadcast
//! channel; publishing never blocks and is a no-op when nobody subscribed.

pub mod client;
pub mod routes;

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::model::{Device, DeviceMsg, FetchResponse};

/// Capacity of the change-notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Whether this node holds the authoritative directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Peer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Peer => "peer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Joined,
    Refreshed,
}

/// "Directory changed" notification. Sent only after the mutation is visible
/// to subsequent reads; carries the full post-mutation snapshot.
#[derive(Debug, Clone)]
pub struct DirectoryChange {
    pub kind: ChangeKind,
    pub identity_hash: String,
    pub snapshot: Arc<Vec<Device>>,
}

/// Server-side registry state.
pub struct Registry {
    role: Role,
    directory: RwLock<Vec<Device>>,
    /// This node's own device, shared with the orchestrator and the transfer
    /// server. Files here carry local paths.
    local: Arc<RwLock<Device>>,
    changes: broadcast::Sender<DirectoryChange>,
}

/// Strip local-only fields by going through the wire form.
fn as_remote(device: &Device) -> Device {
    Device::from(DeviceMsg::from(device))
}

impl Registry {
    /// A master seeds its directory with its own device.
    pub async fn new(role: Role, local: Arc<RwLock<Device>>) -> Self {
        let mut directory = Vec::new();
        if role == Role::Master {
            directory.push(as_remote(&*local.read().await));
        }
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            role,
            directory: RwLock::new(directory),
            local,
            changes,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Receive a [`DirectoryChange`] after every successful `Init`/`Refresh`.
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryChange> {
        self.changes.subscribe()
    }

    /// Append `device` and return the full snapshot including it.
    ///
    /// A device re-joining with an identity already listed replaces its old
    /// entry in place, keeping identity hashes unique.
    pub async fn init(&self, device: Device) -> Result<Vec<Device>, RegistryError> {
        if !self.is_master() {
            return Err(RegistryError::NotMaster);
        }
        let device = as_remote(&device);
        let identity_hash = device.identity_hash.clone();

        let snapshot = {
            let mut directory = self.directory.write().await;
            if let Some(existing) = directory
                .iter_mut()
                .find(|d| d.identity_hash == identity_hash)
            {
                debug!(identity = %identity_hash, "re-join replaces existing entry");
                *existing = device;
            } else {
                directory.push(device);
            }
            let snapshot = Arc::new(directory.clone());
            self.notify(ChangeKind::Joined, identity_hash.clone(), snapshot.clone());
            snapshot
        };

        info!(identity = %identity_hash, devices = snapshot.len(), "device joined");
        Ok(Arc::unwrap_or_clone(snapshot))
    }

    /// Replace `files` and `active` of the entry with the same identity hash.
    pub async fn refresh(&self, device: Device) -> Result<Device, RegistryError> {
        if !self.is_master() {
            return Err(RegistryError::NotMaster);
        }
        let device = as_remote(&device);

        let updated = {
            let mut directory = self.directory.write().await;
            let entry = directory
                .iter_mut()
                .find(|d| d.identity_hash == device.identity_hash)
                .ok_or_else(|| RegistryError::NotFound(device.identity_hash.clone()))?;
            entry.files = device.files;
            entry.active = device.active;
            let updated = entry.clone();
            self.notify(
                ChangeKind::Refreshed,
                updated.identity_hash.clone(),
                Arc::new(directory.clone()),
            );
            updated
        };

        info!(
            identity = %updated.identity_hash,
            files = updated.files.len(),
            active = updated.active,
            "device refreshed"
        );
        Ok(updated)
    }

    /// Current directory snapshot.
    pub async fn list(&self) -> Vec<Device> {
        self.directory.read().await.clone()
    }

    /// This node's own device, without local paths.
    pub async fn status(&self) -> Device {
        as_remote(&*self.local.read().await)
    }

    /// Whether this node itself offers a file with exactly `hash`.
    pub async fn fetch(&self, hash: &str) -> FetchResponse {
        if self.local.read().await.find_file(hash).is_some() {
            FetchResponse {
                success: true,
                error: String::new(),
            }
        } else {
            FetchResponse {
                success: false,
                error: "file not found".to_string(),
            }
        }
    }

    /// Called with the directory write guard held, so notifications go out in
    /// mutation order. `send` never blocks.
    fn notify(&self, kind: ChangeKind, identity_hash: String, snapshot: Arc<Vec<Device>>) {
        // Err means no subscribers.
        let _ = self.changes.send(DirectoryChange {
            kind,
            identity_hash,
            snapshot,
        });
    }
}
