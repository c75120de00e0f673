//! Object storage for attachment bytes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helpdesk_common::config::StorageConfig;
use helpdesk_common::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// File storage trait
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store a file and return its path
    async fn store(&self, path: &str, data: &[u8]) -> Result<String>;

    /// Read a file
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a file exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file size
    async fn size(&self, path: &str) -> Result<u64>;

    /// Retrievable URL of a stored object
    fn public_url(&self, path: &str) -> String;

    /// URL that stops being accepted after `ttl`
    fn signed_url(&self, path: &str, ttl: Duration) -> Result<String>;
}

/// Local filesystem storage
pub struct LocalStorage {
    base_path: PathBuf,
    public_base_url: String,
    signing_secret: String,
}

impl LocalStorage {
    /// Create a new local storage instance from config
    pub fn new(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.path)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        if config.signing_secret.is_empty() {
            warn!("No storage signing secret configured; signed URLs are disabled");
        }

        info!(path = %config.path.display(), "Initialized local file storage");

        Ok(Self {
            base_path: config.path.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            signing_secret: config.signing_secret.clone(),
        })
    }

    /// Get full path for a relative path, with path traversal protection
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        if path.contains("..") {
            return Err(Error::Storage(
                "Path traversal detected: '..' is not allowed".to_string(),
            ));
        }

        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::Storage(
                "Absolute paths are not allowed".to_string(),
            ));
        }

        let full = self.base_path.join(path);

        let canonical_base = self
            .base_path
            .canonicalize()
            .map_err(|e| Error::Storage(format!("Failed to canonicalize base path: {}", e)))?;

        // New files have no canonical form yet; check the parent instead
        let canonical_full = if full.exists() {
            full.canonicalize()
                .map_err(|e| Error::Storage(format!("Failed to canonicalize path: {}", e)))?
        } else {
            match (full.parent(), full.file_name()) {
                (Some(parent), Some(name)) if parent.exists() => parent
                    .canonicalize()
                    .map_err(|e| {
                        Error::Storage(format!("Failed to canonicalize parent path: {}", e))
                    })?
                    .join(name),
                _ => canonical_base.join(path),
            }
        };

        if !canonical_full.starts_with(&canonical_base) {
            return Err(Error::Storage(
                "Path traversal detected: resolved path is outside storage directory".to_string(),
            ));
        }

        Ok(full)
    }

    fn signature(&self, path: &str, expires: i64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|e| Error::Internal(format!("Invalid signing key: {}", e)))?;
        mac.update(format!("{}:{}", path, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a signed URL's `expires` and `signature` parameters
    pub fn verify_signature(
        &self,
        path: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if self.signing_secret.is_empty() || expires < now.timestamp() {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.signing_secret.as_bytes()) else {
            return false;
        };
        mac.update(format!("{}:{}", path, expires).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn store(&self, path: &str, data: &[u8]) -> Result<String> {
        let full_path = self.full_path(path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create file: {}", e)))?;

        file.write_all(data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;

        debug!(path = %path, size = data.len(), "Stored file");

        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;

        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to open file: {}", e)))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read file: {}", e)))?;

        Ok(data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;

        fs::remove_file(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete file: {}", e)))?;

        debug!(path = %path, "Deleted file");

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(full_path.exists())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full_path = self.full_path(path)?;

        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to get file metadata: {}", e)))?;

        Ok(metadata.len())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path)
    }

    fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        if self.signing_secret.is_empty() {
            return Err(Error::Config(
                "Storage signing secret is not configured".to_string(),
            ));
        }
        self.full_path(path)?;

        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.signature(path, expires)?;
        Ok(format!(
            "{}?expires={}&signature={}",
            self.public_url(path),
            expires,
            signature
        ))
    }
}

/// Create file storage from configuration
pub fn create_storage(config: &StorageConfig) -> Result<Box<dyn FileStorage>> {
    match config.backend.as_str() {
        "fs" => Ok(Box::new(LocalStorage::new(config)?)),
        other => Err(Error::Config(format!(
            "Unsupported storage backend: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            backend: "fs".to_string(),
            path: dir.path().to_path_buf(),
            public_base_url: "https://files.example.com/".to_string(),
            signing_secret: "s3cret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(&config(&temp_dir)).unwrap();

        let data = b"%PDF-1.4";
        let path = storage.store("tickets/a/b/1_invoice.pdf", data).await.unwrap();
        assert_eq!(path, "tickets/a/b/1_invoice.pdf");

        assert!(storage.exists(&path).await.unwrap());
        assert!(!storage.exists("nonexistent.pdf").await.unwrap());
        assert_eq!(storage.read(&path).await.unwrap(), data);
        assert_eq!(storage.size(&path).await.unwrap(), data.len() as u64);
        assert_eq!(
            storage.public_url(&path),
            "https://files.example.com/tickets/a/b/1_invoice.pdf"
        );

        storage.delete(&path).await.unwrap();
        assert!(!storage.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_path_traversal_prevention() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(&config(&temp_dir)).unwrap();

        assert!(storage.store("../../../etc/passwd", b"evil").await.is_err());
        assert!(storage.read("../../../etc/passwd").await.is_err());
        assert!(storage.delete("../../sensitive").await.is_err());
        assert!(storage.store("/etc/passwd", b"evil").await.is_err());
        assert!(storage.store("safe/path/file.txt", b"ok").await.is_ok());
    }

    #[test]
    fn test_signed_url_verification() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(&config(&temp_dir)).unwrap();

        let url = storage
            .signed_url("tickets/x/report.csv", Duration::from_secs(60))
            .unwrap();
        let query = url.split_once('?').unwrap().1;
        let mut expires = 0i64;
        let mut signature = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("signature", v) => signature = v.to_string(),
                _ => {}
            }
        }

        let now = Utc::now();
        assert!(storage.verify_signature("tickets/x/report.csv", expires, &signature, now));
        assert!(!storage.verify_signature("tickets/x/other.csv", expires, &signature, now));
        let later = now + chrono::Duration::seconds(120);
        assert!(!storage.verify_signature("tickets/x/report.csv", expires, &signature, later));
    }

    #[test]
    fn test_signed_url_requires_secret() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = config(&temp_dir);
        cfg.signing_secret.clear();
        let storage = LocalStorage::new(&cfg).unwrap();
        assert!(storage.signed_url("a.txt", Duration::from_secs(60)).is_err());
    }
}
