//! Node orchestration.
//!
//! [`Aero`] owns one node's state: its own [`Device`], its local view of the
//! directory, the registry service, and both transfer halves. It is the API
//! the CLI (or an embedding application) drives.
//!
//! ```text
//! start()  ─┬─ RPC listener  (axum, registry routes)
//!           ├─ transfer listener (raw TCP)
//!           └─ change listener (master only: directory → local view)
//! join()   ── Init against the master, adopt its snapshot
//! add_file / remove_file_at / set_active ── mutate self, push Refresh
//! ```
//!
//! On a master every mutation is applied straight to the local registry
//! instead of dialing itself. A peer that has not joined yet keeps changes
//! local; they travel with the `Init` sent by [`Aero::join`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthGate;
use crate::error::{AeroError, TransferError};
use crate::messages::{MessageSink, Severity};
use crate::metadata::{FileMetadataProvider, LocalMetadataProvider};
use crate::model::{Device, DeviceMsg, FetchResponse, File};
use crate::registry::client::RegistryClient;
use crate::registry::{routes, DirectoryChange, Registry, Role};
use crate::transfer::{DownloadSnapshot, DownloadTracker, TransferClient, TransferServer};

/// A running (or not yet started) Aero node.
pub struct Aero {
    role: Role,
    /// This node's device. Files carry local paths.
    local: Arc<RwLock<Device>>,
    /// Last known directory. Also the transfer server's allow-list.
    view: Arc<RwLock<Vec<Device>>>,
    gate: AuthGate,
    registry: OnceLock<Arc<Registry>>,
    client: RegistryClient,
    transfer: TransferClient,
    downloads: Arc<DownloadTracker>,
    metadata: Arc<dyn FileMetadataProvider>,
    messages: Arc<dyn MessageSink>,
    master_addr: parking_lot::RwLock<Option<String>>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

fn as_remote(device: &Device) -> Device {
    Device::from(DeviceMsg::from(device))
}

impl Aero {
    pub fn new(
        device: Device,
        role: Role,
        gate: AuthGate,
        download_dir: impl Into<PathBuf>,
        messages: Arc<dyn MessageSink>,
    ) -> Self {
        let view = vec![as_remote(&device)];
        Self {
            role,
            local: Arc::new(RwLock::new(device)),
            view: Arc::new(RwLock::new(view)),
            client: RegistryClient::new(gate.clone()),
            gate,
            registry: OnceLock::new(),
            transfer: TransferClient::new(download_dir, messages.clone()),
            downloads: Arc::new(DownloadTracker::new()),
            metadata: Arc::new(LocalMetadataProvider),
            messages,
            master_addr: parking_lot::RwLock::new(None),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Replace the metadata source used by [`Aero::add_file`].
    #[must_use]
    pub fn with_metadata_provider(mut self, provider: Arc<dyn FileMetadataProvider>) -> Self {
        self.metadata = provider;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Bind both listeners and spawn the servers.
    ///
    /// Port 0 binds a free port; the bound ports are written back into the
    /// local device before the registry is created, so a master's directory
    /// advertises the real addresses.
    pub async fn start(&self) -> Result<(), AeroError> {
        if self.registry.get().is_some() {
            return Err(AeroError::AlreadyStarted);
        }
        let (ip, rpc_port, transfer_port) = {
            let d = self.local.read().await;
            (d.ip.clone(), d.rpc_port, d.transfer_port)
        };

        let rpc_bind = format!("{ip}:{rpc_port}");
        let rpc_listener = TcpListener::bind(&rpc_bind)
            .await
            .map_err(|source| AeroError::Bind {
                addr: rpc_bind.clone(),
                source,
            })?;
        let rpc_local = rpc_listener
            .local_addr()
            .map_err(|source| AeroError::Bind {
                addr: rpc_bind,
                source,
            })?;

        let transfer_server = TransferServer::bind(
            &format!("{ip}:{transfer_port}"),
            self.local.clone(),
            self.view.clone(),
            self.messages.clone(),
        )
        .await?;
        let transfer_local = transfer_server.local_addr()?;

        {
            let mut d = self.local.write().await;
            d.rpc_port = rpc_local.port();
            d.transfer_port = transfer_local.port();
        }
        self.sync_self_into_view().await;

        let registry = Arc::new(Registry::new(self.role, self.local.clone()).await);
        if self.registry.set(registry.clone()).is_err() {
            return Err(AeroError::AlreadyStarted);
        }

        let mut tasks = Vec::with_capacity(3);

        // Subscribe and seed the view before the router can accept an Init.
        if registry.is_master() {
            let changes = registry.subscribe();
            *self.view.write().await = registry.list().await;
            tasks.push(self.spawn_change_listener(registry.clone(), changes));
        }

        let app = routes::router(registry.clone(), self.gate.clone());
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(rpc_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!("rpc server error: {e}");
            }
        }));

        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = transfer_server.serve(token).await {
                error!("transfer server error: {e}");
            }
        }));

        self.tasks.lock().extend(tasks);
        info!(
            role = self.role.as_str(),
            rpc = %rpc_local,
            transfer = %transfer_local,
            "aero node started"
        );
        Ok(())
    }

    /// Mirror the master's directory into the local view.
    fn spawn_change_listener(
        &self,
        registry: Arc<Registry>,
        mut rx: broadcast::Receiver<DirectoryChange>,
    ) -> JoinHandle<()> {
        let view = self.view.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    change = rx.recv() => match change {
                        Ok(change) => {
                            debug!(
                                kind = ?change.kind,
                                identity = %change.identity_hash,
                                devices = change.snapshot.len(),
                                "directory changed"
                            );
                            *view.write().await = (*change.snapshot).clone();
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "change listener lagged, resyncing");
                            *view.write().await = registry.list().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Stop both servers and the change listener and wait for them to exit.
    /// Transfers already in progress finish on their own tasks.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("node task ended abnormally: {e}");
            }
        }
        info!("aero node stopped");
    }

    /// Join the master at `master_addr` (`host:port`) and adopt its directory.
    pub async fn join(&self, master_addr: &str) -> Result<Vec<Device>, AeroError> {
        let me = self.local.read().await.clone();
        let snapshot = self.client.init(master_addr, &me).await?;
        *self.master_addr.write() = Some(master_addr.to_string());
        *self.view.write().await = snapshot.clone();

        info!(master = master_addr, devices = snapshot.len(), "joined master");
        self.messages.add(
            &format!("joined master {master_addr}: {} devices", snapshot.len()),
            Severity::Msg,
        );
        Ok(snapshot)
    }

    pub fn master_addr(&self) -> Option<String> {
        self.master_addr.read().clone()
    }

    /// Offer the file at `path`. Rejected if a file with the same content
    /// hash is already offered.
    ///
    /// The file stays offered locally even if the following Refresh fails.
    pub async fn add_file(&self, path: impl AsRef<Path>) -> Result<File, AeroError> {
        let path = path.as_ref().to_path_buf();
        let provider = self.metadata.clone();
        let target = path.clone();
        let file = tokio::task::spawn_blocking(move || provider.describe(&target))
            .await
            .map_err(|e| AeroError::Metadata {
                path: path.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| AeroError::Metadata {
                path: path.clone(),
                source,
            })?;

        self.local.write().await.add_file(file.clone())?;
        info!(file = %file.name, hash = %file.hash, size = file.size, "file offered");
        self.push_refresh().await?;
        Ok(file)
    }

    /// Stop offering the file at `index` of this node's file list.
    pub async fn remove_file_at(&self, index: usize) -> Result<File, AeroError> {
        let removed = self.local.write().await.remove_file_at(index)?;
        info!(file = %removed.name, "file withdrawn");
        self.push_refresh().await?;
        Ok(removed)
    }

    pub async fn set_active(&self, active: bool) -> Result<(), AeroError> {
        self.local.write().await.active = active;
        self.push_refresh().await
    }

    /// Send this node's files and active flag to the master.
    async fn push_refresh(&self) -> Result<(), AeroError> {
        self.sync_self_into_view().await;
        let me = self.local.read().await.clone();

        if let Some(registry) = self.master_registry() {
            registry.refresh(me).await?;
            return Ok(());
        }
        let Some(addr) = self.master_addr() else {
            debug!("no master joined yet, refresh deferred");
            return Ok(());
        };
        let updated = self.client.refresh(&addr, &me).await?;
        let mut view = self.view.write().await;
        if let Some(entry) = view
            .iter_mut()
            .find(|d| d.identity_hash == updated.identity_hash)
        {
            *entry = updated;
        }
        Ok(())
    }

    /// Replace this node's own entry in the local view.
    async fn sync_self_into_view(&self) {
        let me = as_remote(&*self.local.read().await);
        let mut view = self.view.write().await;
        match view.iter_mut().find(|d| d.identity_hash == me.identity_hash) {
            Some(entry) => *entry = me,
            None => view.insert(0, me),
        }
    }

    fn master_registry(&self) -> Option<&Arc<Registry>> {
        self.registry.get().filter(|r| r.is_master())
    }

    /// Fetch the directory from the master and adopt it as the local view.
    pub async fn list(&self) -> Result<Vec<Device>, AeroError> {
        let devices = if let Some(registry) = self.master_registry() {
            registry.list().await
        } else {
            let addr = self.master_addr().ok_or(AeroError::NoMaster)?;
            self.client.list(&addr).await?
        };
        *self.view.write().await = devices.clone();
        Ok(devices)
    }

    /// The local view, without contacting anyone.
    pub async fn devices(&self) -> Vec<Device> {
        self.view.read().await.clone()
    }

    /// This node's own device, including local file paths.
    pub async fn local_device(&self) -> Device {
        self.local.read().await.clone()
    }

    /// Ask `device` to describe itself.
    pub async fn status(&self, device: &Device) -> Result<Device, AeroError> {
        Ok(self.client.status(&device.rpc_addr()).await?)
    }

    /// Ask `device` whether it still offers its file at `file_idx`.
    pub async fn fetch_check(
        &self,
        device: &Device,
        file_idx: usize,
    ) -> Result<FetchResponse, AeroError> {
        let Some(file) = device.files.get(file_idx) else {
            return Ok(FetchResponse {
                success: false,
                error: "file doesn't exist in the device".to_string(),
            });
        };
        Ok(self.client.fetch(&device.rpc_addr(), &file.hash).await?)
    }

    /// Download `device`'s file at `file_idx` and wait for it to complete.
    pub async fn request_file(&self, device: &Device, file_idx: usize) -> Result<PathBuf, AeroError> {
        let file = file_at(device, file_idx)?;
        Ok(self.transfer.request_file(device, file).await?)
    }

    /// Start a detached download and return its id. Poll
    /// [`Aero::download_progress`] for the outcome.
    pub async fn download(&self, device: &Device, file_idx: usize) -> Result<u64, AeroError> {
        let file = file_at(device, file_idx)?.clone();
        let device = device.clone();
        let (id, progress) = self.downloads.begin(&file);
        let transfer = self.transfer.clone();
        let messages = self.messages.clone();

        debug!(id, file = %file.name, from = %device.name, "download started");
        tokio::spawn(async move {
            let result = transfer.fetch(&device, &file, Some(&*progress)).await;
            if let Err(e) = &result {
                warn!(id, file = %file.name, "download failed: {e}");
                // Integrity failures are already reported by the client.
                if !matches!(e, TransferError::Integrity { .. }) {
                    messages.add(
                        &format!("download {} from {} failed: {e}", file.name, device.name),
                        Severity::Error,
                    );
                }
            }
            progress.finish(&result);
        });
        Ok(id)
    }

    pub fn download_progress(&self, id: u64) -> Option<DownloadSnapshot> {
        self.downloads.get(id)
    }

    pub fn downloads(&self) -> Vec<DownloadSnapshot> {
        self.downloads.all()
    }

    pub fn messages(&self) -> Arc<dyn MessageSink> {
        self.messages.clone()
    }

    pub fn download_dir(&self) -> &Path {
        self.transfer.download_dir()
    }
}

fn file_at(device: &Device, index: usize) -> Result<&File, AeroError> {
    device.files.get(index).ok_or(AeroError::IndexOutOfBounds {
        index,
        len: device.files.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticKeyProvider;
    use crate::messages::MemorySink;

    fn node(id: &str, role: Role, dir: &Path) -> Aero {
        let gate = AuthGate::new(&StaticKeyProvider(b"node-test-secret".to_vec())).unwrap();
        Aero::new(
            Device::new(id, id, "127.0.0.1", 0, 0),
            role,
            gate,
            dir,
            Arc::new(MemorySink::default()),
        )
    }

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_start_writes_back_bound_ports() {
        let dir = tempfile::tempdir().unwrap();
        let master = node("m", Role::Master, dir.path());
        master.start().await.unwrap();

        let me = master.local_device().await;
        assert_ne!(me.rpc_port, 0);
        assert_ne!(me.transfer_port, 0);
        let listed = master.list().await.unwrap();
        assert_eq!(listed[0].rpc_port, me.rpc_port);
        assert!(matches!(master.start().await, Err(AeroError::AlreadyStarted)));
        master.stop().await;
    }

    #[tokio::test]
    async fn test_master_applies_refresh_locally() {
        let dir = tempfile::tempdir().unwrap();
        let master = node("m", Role::Master, dir.path());
        master.start().await.unwrap();

        let file = master
            .add_file(write(dir.path(), "a.txt", b"alpha"))
            .await
            .unwrap();
        let listed = master.list().await.unwrap();
        assert_eq!(listed[0].files.len(), 1);
        assert_eq!(listed[0].files[0].hash, file.hash);
        assert_eq!(listed[0].files[0].path, PathBuf::new());

        master.set_active(false).await.unwrap();
        assert!(!master.list().await.unwrap()[0].active);
        master.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_master_view_tracks_joins() {
        let dir = tempfile::tempdir().unwrap();
        let master = node("m", Role::Master, dir.path());
        master.start().await.unwrap();
        let addr = master.local_device().await.rpc_addr();
        let client = RegistryClient::new(
            AuthGate::new(&StaticKeyProvider(b"node-test-secret".to_vec())).unwrap(),
        );

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let client = client.clone();
                let addr = addr.clone();
                tokio::spawn(async move {
                    let d = Device::new(format!("p{i}"), "p", "127.0.0.1", 1, 2);
                    client.init(&addr, &d).await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // The view is the transfer allow-list and must settle on the full
        // directory without anyone calling list().
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while master.devices().await.len() != 17 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        master.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let n = node("p", Role::Peer, dir.path());
        n.add_file(write(dir.path(), "a.txt", b"same")).await.unwrap();
        let err = n
            .add_file(write(dir.path(), "b.txt", b"same"))
            .await
            .unwrap_err();
        assert!(matches!(err, AeroError::DuplicateFile));
        assert_eq!(n.local_device().await.files.len(), 1);

        assert!(matches!(
            n.remove_file_at(5).await,
            Err(AeroError::IndexOutOfBounds { index: 5, len: 1 })
        ));
        n.remove_file_at(0).await.unwrap();
        assert!(n.local_device().await.files.is_empty());
    }

    #[tokio::test]
    async fn test_add_missing_file_is_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        let n = node("p", Role::Peer, dir.path());
        assert!(matches!(
            n.add_file(dir.path().join("missing")).await,
            Err(AeroError::Metadata { .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_without_master() {
        let dir = tempfile::tempdir().unwrap();
        let n = node("p", Role::Peer, dir.path());
        assert!(matches!(n.list().await, Err(AeroError::NoMaster)));
        // Not joined yet: changes stay local.
        n.set_active(false).await.unwrap();
        assert!(!n.devices().await[0].active);
    }

    #[tokio::test]
    async fn test_fetch_check_index_out_of_range_does_not_dial() {
        let dir = tempfile::tempdir().unwrap();
        let n = node("p", Role::Peer, dir.path());
        // Port 1 would refuse; the check must not get that far.
        let remote = Device::new("r", "r", "127.0.0.1", 1, 1);
        let resp = n.fetch_check(&remote, 0).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error, "file doesn't exist in the device");

        assert!(matches!(
            n.request_file(&remote, 0).await,
            Err(AeroError::IndexOutOfBounds { .. })
        ));
        assert!(n.download(&remote, 3).await.is_err());
        assert!(n.downloads().is_empty());
    }

    #[tokio::test]
    async fn test_download_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let n = node("p", Role::Peer, dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut remote = Device::new("r", "r", "127.0.0.1", 0, port);
        remote.files.push(File {
            name: "gone.bin".into(),
            hash: "aGFzaA==".into(),
            size: 4,
            ..File::default()
        });
        let id = n.download(&remote, 0).await.unwrap();

        let snap = loop {
            let snap = n.download_progress(id).unwrap();
            if snap.done {
                break snap;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert!(!snap.hash_matched);
        assert!(snap.error.is_some());
    }
}
