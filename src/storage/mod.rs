//! Local file storage
//!
//! Transfers never touch the file system directly; they go through a
//! `FileIoProvider` so that embedders can redirect file access. The default
//! provider is backed by `tokio::fs`.

pub mod hash;

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite};

pub use hash::sha256_file;

/// Boxed reader handed out by a provider
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writer handed out by a provider
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Source of local file handles
#[async_trait]
pub trait FileIoProvider: Send + Sync {
    /// Open an existing file for reading
    async fn open_read(&self, path: &Path) -> io::Result<FileReader>;

    /// Create or truncate a file for writing
    async fn open_write(&self, path: &Path) -> io::Result<FileWriter>;

    /// Size of a file in bytes
    async fn size(&self, path: &Path) -> io::Result<u64>;
}

/// Provider over the local file system
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileIoProvider;

#[async_trait]
impl FileIoProvider for LocalFileIoProvider {
    async fn open_read(&self, path: &Path) -> io::Result<FileReader> {
        let file = File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &Path) -> io::Result<FileWriter> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Box::new(file))
    }

    async fn size(&self, path: &Path) -> io::Result<u64> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let provider = LocalFileIoProvider;

        let mut writer = provider.open_write(&path).await.unwrap();
        writer.write_all(b"hello mission").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(provider.size(&path).await.unwrap(), 13);
        let mut reader = provider.open_read(&path).await.unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "hello mission");
    }

    #[tokio::test]
    async fn test_size_of_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFileIoProvider.size(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(LocalFileIoProvider.open_read(&missing).await.is_err());
    }
}
