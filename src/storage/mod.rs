//! Storage module
//!
//! Local file handling for both roles:
//! - `StorageRoot`: the flat directory the server writes uploads into
//! - `StoredFile`: one destination file being written chunk by chunk
//! - `SourceFile`: one file the client reads chunk by chunk

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default directory the server stores uploads in
pub const DEFAULT_SERVER_DIR: &str = "server-storage";

/// Default directory the client resolves filenames against
pub const DEFAULT_CLIENT_DIR: &str = "client-storage";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create storage directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Flat directory of received files
#[derive(Debug, Clone)]
pub struct StorageRoot {
    path: PathBuf,
}

impl StorageRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory (and parents) if missing
    pub async fn ensure(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.path)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.path.clone(),
                source,
            })
    }

    /// Path a file with this base name is stored at
    pub fn destination(&self, base_name: &str) -> PathBuf {
        self.path.join(base_name)
    }

    /// Create or truncate the destination file.
    ///
    /// `base_name` must already be normalized. Concurrent creates of the same
    /// name are not coordinated: the last writer's bytes win.
    pub async fn create(&self, base_name: &str) -> StorageResult<StoredFile> {
        let path = self.destination(base_name);
        let file = File::create(&path)
            .await
            .map_err(|source| StorageError::Create {
                path: path.clone(),
                source,
            })?;

        Ok(StoredFile {
            path,
            file,
            written: 0,
        })
    }
}

/// A destination file receiving streamed bytes
pub struct StoredFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl StoredFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_chunk(&mut self, buf: &[u8]) -> StorageResult<()> {
        self.file
            .write_all(buf)
            .await
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Flush pending writes so the bytes are on disk before the handle drops
    pub async fn finish(mut self) -> StorageResult<u64> {
        self.file.flush().await.map_err(|source| StorageError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.written)
    }
}

/// A local file opened read-only for one send
pub struct SourceFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl SourceFile {
    /// Open `path` and capture its size once
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let file = File::open(&path).await.map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?
            .len();

        Ok(Self { path, file, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size reported by the filesystem at open time
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Final path component, if it is valid UTF-8
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// Read up to `buf.len()` bytes; 0 means end of file
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        self.file.read(buf).await.map_err(|source| StorageError::Read {
            path: self.path.clone(),
            source,
        })
    }
}

/// Resolve a client-supplied filename against the client storage directory
pub fn source_path(client_dir: &Path, filename: &str) -> PathBuf {
    client_dir.join(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let dir = tempdir().unwrap();
        let root = StorageRoot::new(dir.path().join("a/b/server-storage"));

        root.ensure().await.unwrap();
        root.ensure().await.unwrap();
        assert!(root.path().is_dir());
    }

    #[tokio::test]
    async fn test_create_truncates_existing() {
        let dir = tempdir().unwrap();
        let root = StorageRoot::new(dir.path());
        std::fs::write(root.destination("car.jpg"), b"old contents").unwrap();

        let mut file = root.create("car.jpg").await.unwrap();
        file.write_chunk(&[1, 2, 3]).await.unwrap();
        assert_eq!(file.finish().await.unwrap(), 3);

        assert_eq!(std::fs::read(dir.path().join("car.jpg")).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_create_missing_root_fails() {
        let dir = tempdir().unwrap();
        let root = StorageRoot::new(dir.path().join("missing"));

        match root.create("x.bin").await.err().unwrap() {
            StorageError::Create { path, source } => {
                assert_eq!(path, dir.path().join("missing/x.bin"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_source_file_reads_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let mut source = SourceFile::open(&path).await.unwrap();
        assert_eq!(source.size(), 11);
        assert_eq!(source.file_name(), Some("notes.txt"));

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = source.read_chunk(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_source_file_missing() {
        let dir = tempdir().unwrap();
        let err = SourceFile::open(dir.path().join("nope.bin")).await.err().unwrap();
        assert!(matches!(
            err,
            StorageError::Open { ref source, .. } if source.kind() == std::io::ErrorKind::NotFound
        ));
    }

    #[test]
    fn test_source_path() {
        assert_eq!(
            source_path(Path::new(DEFAULT_CLIENT_DIR), "car.jpg"),
            PathBuf::from("client-storage/car.jpg")
        );
    }
}
