use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Chunk size for streamed hashing.
const HASH_CHUNK: usize = 64 * 1024;

/// A local file prepared for offering.
///
/// The content identifier is computed up front, before any peer is found,
/// so the sender can populate the request and, optionally, both sides can
/// confirm integrity after the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    /// File name as offered to the peer (no directory components).
    pub name: String,
    pub size: u64,
    /// `sha256:<hex>` over the full content.
    pub content_id: String,
}

impl FileRecord {
    /// Opens and fingerprints the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the path is missing or unreadable, or names a directory
    /// (transferring directories is not supported).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        if metadata.is_dir() {
            bail!("{} is a directory; only single files can be sent", path.display());
        }

        let name = path
            .file_name()
            .map_or_else(|| "unnamed".to_string(), |n| n.to_string_lossy().to_string());

        let content_id = hash_contents(path).await?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            content_id,
        })
    }
}

/// Streams the file through SHA-256 and returns `sha256:<hex>`.
///
/// # Errors
///
/// Fails on I/O errors while reading.
pub async fn hash_contents(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("read error on {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn when_opening_file_expect_size_name_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"drip test content").await.unwrap();

        let record = FileRecord::open(&path).await.unwrap();
        assert_eq!(record.name, "notes.txt");
        assert_eq!(record.size, 17);

        let expected = Sha256::digest(b"drip test content");
        assert_eq!(record.content_id, format!("sha256:{}", hex::encode(expected)));
    }

    #[tokio::test]
    async fn when_content_changes_expect_different_id() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::write(&a, b"one").await.unwrap();
        tokio::fs::write(&b, b"two").await.unwrap();

        let ra = FileRecord::open(&a).await.unwrap();
        let rb = FileRecord::open(&b).await.unwrap();
        assert_ne!(ra.content_id, rb.content_id);
    }

    #[tokio::test]
    async fn when_path_is_directory_expect_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileRecord::open(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("directory"));
    }

    #[tokio::test]
    async fn when_path_is_missing_expect_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileRecord::open(dir.path().join("nope")).await.is_err());
    }
}
