//! Directory model: peers ([`Device`]) and the files they offer ([`File`]).
//!
//! The in-memory types carry a local filesystem path on files this node owns.
//! The wire types ([`DeviceMsg`], [`FileMsg`], ...) are what travels over the
//! registry RPC channel; converting to wire form drops the path and converting
//! back yields files with an empty path.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AeroError;

/// A file offered by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct File {
    pub name: String,
    /// Base64 SHA-256 of the file bytes. Transfer key and dedup key.
    pub hash: String,
    pub mime_type: String,
    pub ext: String,
    pub size: u64,
    /// Local path, only meaningful on the owning node. Empty for remote files.
    pub path: PathBuf,
}

/// A participating host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    /// Directory key. Opaque to this crate, stable across restarts.
    pub identity_hash: String,
    pub name: String,
    pub ip: String,
    pub rpc_port: u16,
    pub transfer_port: u16,
    /// Caller-set liveness flag, never cleared automatically.
    pub active: bool,
    pub files: Vec<File>,
}

impl Device {
    pub fn new(
        identity_hash: impl Into<String>,
        name: impl Into<String>,
        ip: impl Into<String>,
        rpc_port: u16,
        transfer_port: u16,
    ) -> Self {
        Self {
            identity_hash: identity_hash.into(),
            name: name.into(),
            ip: ip.into(),
            rpc_port,
            transfer_port,
            active: true,
            files: Vec::new(),
        }
    }

    /// `ip:rpc_port`.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }

    /// `ip:transfer_port`.
    pub fn transfer_addr(&self) -> String {
        format!("{}:{}", self.ip, self.transfer_port)
    }

    /// Append `file` unless a file with the same hash is already listed.
    pub fn add_file(&mut self, file: File) -> Result<(), AeroError> {
        if self.find_file(&file.hash).is_some() {
            return Err(AeroError::DuplicateFile);
        }
        self.files.push(file);
        Ok(())
    }

    /// Remove the file at `index`. The last file takes its slot, so the order
    /// of the remaining files is not preserved.
    pub fn remove_file_at(&mut self, index: usize) -> Result<File, AeroError> {
        if index >= self.files.len() {
            return Err(AeroError::IndexOutOfBounds {
                index,
                len: self.files.len(),
            });
        }
        Ok(self.files.swap_remove(index))
    }

    /// Exact-match lookup by content hash.
    pub fn find_file(&self, hash: &str) -> Option<&File> {
        self.files.iter().find(|f| f.hash == hash)
    }
}

// ─── Wire shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMsg {
    pub name: String,
    pub hash: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMsg {
    pub identity_hash: String,
    pub name: String,
    pub ip: String,
    pub rpc_port: u16,
    pub transfer_port: u16,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub files: Vec<FileMsg>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesMsg {
    pub devices: Vec<DeviceMsg>,
}

/// Empty request body for `List` and `Status`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Void {}

/// Request body for `Fetch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRef {
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

impl From<&File> for FileMsg {
    fn from(f: &File) -> Self {
        Self {
            name: f.name.clone(),
            hash: f.hash.clone(),
            ext: f.ext.clone(),
            mime_type: f.mime_type.clone(),
            size: f.size,
        }
    }
}

impl From<FileMsg> for File {
    fn from(f: FileMsg) -> Self {
        Self {
            name: f.name,
            hash: f.hash,
            mime_type: f.mime_type,
            ext: f.ext,
            size: f.size,
            path: PathBuf::new(),
        }
    }
}

impl From<&Device> for DeviceMsg {
    fn from(d: &Device) -> Self {
        Self {
            identity_hash: d.identity_hash.clone(),
            name: d.name.clone(),
            ip: d.ip.clone(),
            rpc_port: d.rpc_port,
            transfer_port: d.transfer_port,
            active: d.active,
            files: d.files.iter().map(FileMsg::from).collect(),
        }
    }
}

impl From<DeviceMsg> for Device {
    fn from(d: DeviceMsg) -> Self {
        Self {
            identity_hash: d.identity_hash,
            name: d.name,
            ip: d.ip,
            rpc_port: d.rpc_port,
            transfer_port: d.transfer_port,
            active: d.active,
            files: d.files.into_iter().map(File::from).collect(),
        }
    }
}

impl From<DevicesMsg> for Vec<Device> {
    fn from(msg: DevicesMsg) -> Self {
        msg.devices.into_iter().map(Device::from).collect()
    }
}

impl From<&[Device]> for DevicesMsg {
    fn from(devices: &[Device]) -> Self {
        Self {
            devices: devices.iter().map(DeviceMsg::from).collect(),
        }
    }
}
