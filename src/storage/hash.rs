//! Package hashing

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::FileIoProvider;

const HASH_BUFFER_SIZE: usize = 4096;

/// Lowercase hex SHA-256 of a file read through `provider`
pub async fn sha256_file(provider: &dyn FileIoProvider, path: &Path) -> io::Result<String> {
    let mut reader = provider.open_read(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalFileIoProvider;

    #[tokio::test]
    async fn test_sha256_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        let hash = sha256_file(&LocalFileIoProvider, &path).await.unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
