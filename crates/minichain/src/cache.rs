//! Content addressable on-disk memoization.
//!
//! Each entry is one JSON blob named by the SHA-256 of its key. Entries represent pure
//! computations, so concurrent writers of the same key may race freely: every write goes
//! through a temporary file and an atomic rename, and the last writer wins.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CACHE_DIR: &str = "./.cache";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache io error: {0}")]
    Io(#[from] io::Error),

    #[error("Cache entry could not be encoded or decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: Arc<PathBuf>,
}

impl DiskCache {
    /// Open a cache rooted at `dir`, creating the directory if needed
    pub fn open<P: AsRef<Path>>(dir: P) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir: Arc::new(dir) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Derive the key of a call from the function identity and its arguments.
    ///
    /// The encoding is canonical JSON (object keys sorted), so equal arguments always hash
    /// to the same key regardless of how they were built.
    pub fn key<A, K>(function: &str, args: &A, kwargs: &K) -> CacheResult<String>
    where
        A: Serialize + ?Sized,
        K: Serialize + ?Sized,
    {
        let encoded = serde_json::to_string(&json!({
            "f": function,
            "args": serde_json::to_value(args)?,
            "kwargs": serde_json::to_value(kwargs)?,
        }))?;
        Ok(hash_string(&encoded))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hash_string(key)))
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let mut file = NamedTempFile::new_in(self.dir.as_path())?;
        file.write_all(&bytes)?;
        file.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove an entry. Removing a missing entry is not an error.
    pub fn invalidate(&self, key: &str) -> CacheResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the cached value for `key`, computing and storing it on a miss
    pub async fn get_or_insert_with<T, F, Fut, E>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = self.load(key)? {
            debug!(key, "cache hit");
            return Ok(value);
        }
        debug!(key, "cache miss");
        let value = compute().await?;
        self.save(key, &value)?;
        Ok(value)
    }

    /// Flush the directory entry so saved blobs survive a crash
    pub fn close(self) -> CacheResult<()> {
        #[cfg(unix)]
        fs::File::open(self.dir.as_path())?.sync_all()?;
        Ok(())
    }
}

fn hash_string(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}
