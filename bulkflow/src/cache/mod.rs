//! Content-addressable artifact cache.
//!
//! Expensive artifacts (generated images, rendered documents) are stored
//! under a key derived from the content and style that produced them, so the
//! same request is never paid for twice. Entries are never evicted.

use crate::errors::{BulkflowError, Result};
use crate::storage::{read_json, write_bytes_atomic, write_json_atomic};
use crate::utils::{Clock, SystemClock, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the index file inside the cache directory.
pub const INDEX_FILE: &str = "cache_index.json";

/// Style used when the caller has none.
pub const DEFAULT_STYLE: &str = "default";

/// An index record; created once per unique `(content, style)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The content key.
    pub key: String,
    /// Artifact file name inside the cache directory.
    pub filename: String,
    /// Where the artifact was published, if anywhere.
    #[serde(default, alias = "url")]
    pub remote_ref: Option<String>,
    /// Style the artifact was produced with.
    pub style: String,
    /// When the entry was recorded.
    pub created_at: Timestamp,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    /// The content key.
    pub key: String,
    /// Absolute or cache-relative path of the artifact file.
    pub path: PathBuf,
    /// Where the artifact was published, if anywhere.
    pub remote_ref: Option<String>,
    /// When the entry was recorded.
    pub created_at: Timestamp,
}

/// Computes the cache key of `(content, style)`.
///
/// The first 16 hex characters of `sha256("{content}:{style}")`.
#[must_use]
pub fn cache_key(content: &str, style: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(b":");
    hasher.update(style.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Hash-keyed store of artifacts backed by a directory.
#[derive(Debug)]
pub struct ContentAddressableCache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    index: RwLock<HashMap<String, CacheEntry>>,
}

impl ContentAddressableCache {
    /// Opens the cache rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| BulkflowError::persistence(&dir, e))?;
        let index: HashMap<String, CacheEntry> =
            read_json(&dir.join(INDEX_FILE))?.unwrap_or_default();
        debug!(dir = %dir.display(), entries = index.len(), "Opened artifact cache");
        Ok(Self {
            dir,
            clock: Arc::new(SystemClock),
            index: RwLock::new(index),
        })
    }

    /// Sets the clock used for entry timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Looks up the artifact for `(content, style)`.
    ///
    /// An index entry whose file has gone missing is a miss.
    #[must_use]
    pub fn get(&self, content: &str, style: &str) -> Option<CachedArtifact> {
        let key = cache_key(content, style);
        let index = self.index.read();
        let entry = index.get(&key)?;
        let path = self.dir.join(&entry.filename);
        if !path.exists() {
            debug!(key = %key, "Cache entry without artifact file");
            return None;
        }
        info!(key = %key, "Cache hit");
        Some(CachedArtifact {
            key,
            path,
            remote_ref: entry.remote_ref.clone(),
            created_at: entry.created_at,
        })
    }

    /// Returns true if `(content, style)` has a usable entry.
    #[must_use]
    pub fn contains(&self, content: &str, style: &str) -> bool {
        let key = cache_key(content, style);
        self.index
            .read()
            .get(&key)
            .is_some_and(|entry| self.dir.join(&entry.filename).exists())
    }

    /// Copies the artifact at `artifact_path` into the cache.
    ///
    /// If `(content, style)` is already cached the existing entry is
    /// returned and nothing is copied.
    pub fn put(
        &self,
        content: &str,
        style: &str,
        artifact_path: &Path,
        remote_ref: Option<&str>,
    ) -> Result<CacheEntry> {
        let extension = artifact_path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        self.insert(content, style, extension, remote_ref, |target| {
            std::fs::copy(artifact_path, target)
                .map(|_| ())
                .map_err(|e| BulkflowError::persistence(artifact_path, e))
        })
    }

    /// Stores an artifact produced in memory.
    pub fn put_bytes(
        &self,
        content: &str,
        style: &str,
        bytes: &[u8],
        extension: &str,
        remote_ref: Option<&str>,
    ) -> Result<CacheEntry> {
        self.insert(content, style, extension, remote_ref, |target| {
            write_bytes_atomic(target, bytes)
        })
    }

    /// Returns the number of index entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    fn insert(
        &self,
        content: &str,
        style: &str,
        extension: &str,
        remote_ref: Option<&str>,
        store: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<CacheEntry> {
        let key = cache_key(content, style);
        let mut index = self.index.write();

        if let Some(existing) = index.get(&key) {
            if self.dir.join(&existing.filename).exists() {
                debug!(key = %key, "Artifact already cached");
                return Ok(existing.clone());
            }
        }

        let filename = if extension.is_empty() {
            key.clone()
        } else {
            format!("{key}.{extension}")
        };
        let target = self.dir.join(&filename);
        if !target.exists() {
            store(&target)?;
        }

        let entry = CacheEntry {
            key: key.clone(),
            filename,
            remote_ref: remote_ref.map(str::to_string),
            style: style.to_string(),
            created_at: self.clock.now(),
        };
        let mut next = index.clone();
        next.insert(key.clone(), entry.clone());
        write_json_atomic(&self.dir.join(INDEX_FILE), &next)?;
        *index = next;

        info!(key = %key, "Artifact cached");
        Ok(entry)
    }
}
