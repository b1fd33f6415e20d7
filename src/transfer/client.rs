//! Transfer client: requests a file by content hash and verifies what arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::downloads::DownloadProgress;
use super::{COPY_BUF_SIZE, MAX_REQUEST_LEN};
use crate::error::TransferError;
use crate::hasher;
use crate::messages::{MessageSink, Severity};
use crate::model::{Device, File};

/// Downloads files from peers into `download_dir`.
#[derive(Clone)]
pub struct TransferClient {
    download_dir: PathBuf,
    messages: Arc<dyn MessageSink>,
}

impl TransferClient {
    pub fn new(download_dir: impl Into<PathBuf>, messages: Arc<dyn MessageSink>) -> Self {
        Self {
            download_dir: download_dir.into(),
            messages,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Fetch `file` from `device`, blocking until the peer closes the stream.
    ///
    /// The output is written to `download_dir/<file.name>`, overwriting any
    /// existing file of that name. On hash mismatch the written file is left
    /// in place and [`TransferError::Integrity`] is returned.
    pub async fn request_file(&self, device: &Device, file: &File) -> Result<PathBuf, TransferError> {
        self.fetch(device, file, None).await
    }

    pub(crate) async fn fetch(
        &self,
        device: &Device,
        file: &File,
        progress: Option<&DownloadProgress>,
    ) -> Result<PathBuf, TransferError> {
        if file.hash.is_empty() || file.hash.len() > MAX_REQUEST_LEN {
            return Err(TransferError::Protocol(format!(
                "hash must be 1..={MAX_REQUEST_LEN} bytes, got {}",
                file.hash.len()
            )));
        }
        let dest = self.destination(&file.name)?;

        let mut stream = TcpStream::connect(device.transfer_addr())
            .await
            .map_err(TransferError::Connection)?;
        stream
            .write_all(file.hash.as_bytes())
            .await
            .map_err(TransferError::Connection)?;

        let io_err = |source| TransferError::Io {
            path: dest.clone(),
            source,
        };
        let mut out = tokio::fs::File::create(&dest).await.map_err(io_err)?;

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(TransferError::Connection)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await.map_err(io_err)?;
            written += n as u64;
            if let Some(p) = progress {
                p.record(n);
            }
        }
        out.flush().await.map_err(io_err)?;
        drop(out);

        let actual = hasher::hash_file(&dest).await.map_err(io_err)?;
        if actual != file.hash {
            warn!(
                file = %file.name,
                expected = %file.hash,
                %actual,
                written,
                "transfer integrity check failed"
            );
            let err = TransferError::Integrity {
                expected: file.hash.clone(),
                actual,
                path: dest,
            };
            self.messages.add(&err.to_string(), Severity::Error);
            return Err(err);
        }

        info!(file = %file.name, bytes = written, from = %device.name, "file received");
        self.messages.add(
            &format!("received file: {} from: {} {}", file.name, device.name, device.ip),
            Severity::Msg,
        );
        Ok(dest)
    }

    /// `download_dir/<name>`, refusing names that would escape the directory.
    fn destination(&self, name: &str) -> Result<PathBuf, TransferError> {
        let base = Path::new(name)
            .file_name()
            .filter(|n| *n == std::ffi::OsStr::new(name))
            .ok_or_else(|| TransferError::Protocol(format!("unusable file name: {name:?}")))?;
        Ok(self.download_dir.join(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MemorySink;
    use tokio::net::TcpListener;

    fn client(dir: &Path) -> (TransferClient, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (TransferClient::new(dir, sink.clone()), sink)
    }

    /// A peer that reads one request and replies with `reply` regardless.
    async fn fake_peer(reply: Vec<u8>) -> Device {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; MAX_REQUEST_LEN];
            let _ = s.read(&mut buf).await.unwrap();
            s.write_all(&reply).await.unwrap();
        });
        Device::new("peer", "peer", "127.0.0.1", 0, port)
    }

    fn remote_file(name: &str, data: &[u8]) -> File {
        File {
            name: name.into(),
            hash: hasher::hash_bytes(data),
            size: data.len() as u64,
            ..File::default()
        }
    }

    #[test]
    fn test_destination_rejects_traversal() {
        let (c, _) = client(Path::new("/downloads"));
        assert_eq!(c.destination("a.txt").unwrap(), PathBuf::from("/downloads/a.txt"));
        assert!(c.destination("../etc/passwd").is_err());
        assert!(c.destination("sub/a.txt").is_err());
        assert!(c.destination("..").is_err());
        assert!(c.destination("").is_err());
    }

    #[tokio::test]
    async fn test_request_file_verifies_hash() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"exact bytes".to_vec();
        let peer = fake_peer(data.clone()).await;
        let (c, sink) = client(dir.path());

        let path = c.request_file(&peer, &remote_file("x.bin", &data)).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert!(sink.read_since(0, 10)[0].text.starts_with("received file: x.bin"));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"the whole file content".to_vec();
        let peer = fake_peer(data[..5].to_vec()).await;
        let (c, _) = client(dir.path());

        let err = c
            .request_file(&peer, &remote_file("t.bin", &data))
            .await
            .unwrap_err();
        match err {
            TransferError::Integrity { expected, actual, path } => {
                assert_eq!(expected, hasher::hash_bytes(&data));
                assert_ne!(actual, expected);
                assert_eq!(std::fs::read(path).unwrap(), &data[..5]);
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![42u8; 3 * COPY_BUF_SIZE + 11];
        let peer = fake_peer(data.clone()).await;
        let (c, _) = client(dir.path());
        let file = remote_file("big.bin", &data);
        let progress = DownloadProgress::new(&file);

        c.fetch(&peer, &file, Some(&progress)).await.unwrap();
        let snap = progress.snapshot(1);
        assert_eq!(snap.received, data.len() as u64);
        assert_eq!(snap.progress, 100);
    }

    #[tokio::test]
    async fn test_oversized_hash_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _) = client(dir.path());
        let peer = Device::new("p", "p", "127.0.0.1", 0, 1);
        let file = File {
            name: "a".into(),
            hash: "x".repeat(MAX_REQUEST_LEN + 1),
            ..File::default()
        };
        assert!(matches!(
            c.request_file(&peer, &file).await,
            Err(TransferError::Protocol(_))
        ));
    }
}
