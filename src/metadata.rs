//! File metadata extraction for files this node offers.

use std::io;
use std::path::Path;

use crate::hasher;
use crate::model::File;

/// Describes a local file: name, extension, MIME type, size, content hash.
/// The returned [`File`] carries `path` so the transfer server can open it.
///
/// Blocking; the orchestrator calls it from `spawn_blocking`.
pub trait FileMetadataProvider: Send + Sync {
    fn describe(&self, path: &Path) -> io::Result<File>;
}

/// Reads metadata from the local filesystem. MIME type is guessed from the
/// extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMetadataProvider;

impl FileMetadataProvider for LocalMetadataProvider {
    fn describe(&self, path: &Path) -> io::Result<File> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let hash = hasher::hash_reader(std::fs::File::open(path)?)?;

        Ok(File {
            name,
            hash,
            mime_type,
            ext,
            size: meta.len(),
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello aero").unwrap();

        let f = LocalMetadataProvider.describe(&path).unwrap();
        assert_eq!(f.name, "notes.txt");
        assert_eq!(f.ext, ".txt");
        assert_eq!(f.mime_type, "text/plain");
        assert_eq!(f.size, 10);
        assert_eq!(f.hash, hasher::hash_bytes(b"hello aero"));
        assert_eq!(f.path, path);
    }

    #[test]
    fn test_describe_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();

        let f = LocalMetadataProvider.describe(&path).unwrap();
        assert_eq!(f.ext, "");
        assert_eq!(f.mime_type, "application/octet-stream");
    }

    #[test]
    fn test_describe_rejects_directory_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalMetadataProvider.describe(dir.path()).is_err());
        assert!(LocalMetadataProvider.describe(&dir.path().join("nope")).is_err());
    }
}
