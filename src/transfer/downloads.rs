//! Progress records for detached downloads.
//!
//! A detached download is identified by a monotonically increasing id. The
//! transfer task updates its [`DownloadProgress`]; callers poll
//! [`DownloadTracker::get`] for a [`DownloadSnapshot`]. There is no callback,
//! join, or cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::TransferError;
use crate::model::File;

/// Live state of one download, shared between the transfer task and the tracker.
#[derive(Debug)]
pub struct DownloadProgress {
    file_name: String,
    hash: String,
    total: u64,
    received: AtomicU64,
    hash_matched: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<String>>,
    path: Mutex<Option<PathBuf>>,
}

/// Point-in-time view of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSnapshot {
    pub id: u64,
    pub file_name: String,
    pub hash: String,
    pub received: u64,
    pub total: u64,
    /// `received * 100 / total`, capped at 100.
    pub progress: u8,
    pub done: bool,
    pub hash_matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl DownloadProgress {
    pub fn new(file: &File) -> Self {
        Self {
            file_name: file.name.clone(),
            hash: file.hash.clone(),
            total: file.size,
            received: AtomicU64::new(0),
            hash_matched: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            path: Mutex::new(None),
        }
    }

    pub(crate) fn record(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record the outcome. `done` is set last so a poller that sees it also
    /// sees the error or match flag.
    pub(crate) fn finish(&self, result: &Result<PathBuf, TransferError>) {
        match result {
            Ok(path) => {
                *self.path.lock() = Some(path.clone());
                self.hash_matched.store(true, Ordering::Release);
            }
            Err(e) => {
                if let TransferError::Integrity { path, .. } = e {
                    *self.path.lock() = Some(path.clone());
                }
                *self.error.lock() = Some(e.to_string());
            }
        }
        self.done.store(true, Ordering::Release);
    }

    pub fn snapshot(&self, id: u64) -> DownloadSnapshot {
        let done = self.done.load(Ordering::Acquire);
        let received = self.received.load(Ordering::Relaxed);
        let progress = if self.total == 0 {
            if done {
                100
            } else {
                0
            }
        } else {
            (received.saturating_mul(100) / self.total).min(100) as u8
        };
        DownloadSnapshot {
            id,
            file_name: self.file_name.clone(),
            hash: self.hash.clone(),
            received,
            total: self.total,
            progress,
            done,
            hash_matched: self.hash_matched.load(Ordering::Acquire),
            error: self.error.lock().clone(),
            path: self.path.lock().clone(),
        }
    }
}

/// Registry of download records keyed by id. Records are kept for the life
/// of the tracker.
#[derive(Debug)]
pub struct DownloadTracker {
    next_id: AtomicU64,
    downloads: RwLock<HashMap<u64, Arc<DownloadProgress>>>,
}

impl Default for DownloadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            downloads: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate an id and a fresh progress record for `file`.
    pub fn begin(&self, file: &File) -> (u64, Arc<DownloadProgress>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let progress = Arc::new(DownloadProgress::new(file));
        self.downloads.write().insert(id, progress.clone());
        (id, progress)
    }

    pub fn get(&self, id: u64) -> Option<DownloadSnapshot> {
        self.downloads.read().get(&id).map(|p| p.snapshot(id))
    }

    /// All records, ordered by id.
    pub fn all(&self) -> Vec<DownloadSnapshot> {
        let mut out: Vec<_> = self
            .downloads
            .read()
            .iter()
            .map(|(id, p)| p.snapshot(*id))
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64) -> File {
        File {
            name: "movie.mkv".into(),
            hash: "h".into(),
            size,
            ..File::default()
        }
    }

    #[test]
    fn test_ids_increase() {
        let tracker = DownloadTracker::new();
        let (a, _) = tracker.begin(&file(10));
        let (b, _) = tracker.begin(&file(10));
        assert!(b > a);
        assert_eq!(tracker.all().iter().map(|s| s.id).collect::<Vec<_>>(), vec![a, b]);
        assert!(tracker.get(b + 1).is_none());
    }

    #[test]
    fn test_progress_percentage() {
        let tracker = DownloadTracker::new();
        let (id, p) = tracker.begin(&file(200));
        p.record(50);
        let s = tracker.get(id).unwrap();
        assert_eq!((s.received, s.progress, s.done), (50, 25, false));

        p.record(150);
        p.finish(&Ok(PathBuf::from("/tmp/movie.mkv")));
        let s = tracker.get(id).unwrap();
        assert_eq!(s.progress, 100);
        assert!(s.done && s.hash_matched);
        assert_eq!(s.error, None);
    }

    #[test]
    fn test_progress_capped_and_zero_size() {
        let tracker = DownloadTracker::new();
        let (id, p) = tracker.begin(&file(10));
        p.record(25);
        assert_eq!(tracker.get(id).unwrap().progress, 100);

        let (id, p) = tracker.begin(&file(0));
        assert_eq!(tracker.get(id).unwrap().progress, 0);
        p.finish(&Ok(PathBuf::from("empty")));
        assert_eq!(tracker.get(id).unwrap().progress, 100);
    }

    #[test]
    fn test_integrity_failure_recorded() {
        let tracker = DownloadTracker::new();
        let (id, p) = tracker.begin(&file(10));
        p.finish(&Err(TransferError::Integrity {
            expected: "a".into(),
            actual: "b".into(),
            path: PathBuf::from("/tmp/movie.mkv"),
        }));
        let s = tracker.get(id).unwrap();
        assert!(s.done);
        assert!(!s.hash_matched);
        assert!(s.error.unwrap().contains("hash mismatch"));
        assert_eq!(s.path, Some(PathBuf::from("/tmp/movie.mkv")));
    }
}
