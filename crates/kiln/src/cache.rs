//! Content-addressed build cache
//!
//! Each artifact lives in its own directory named after the [`SourceHash`]
//! of the source that produced it. Artifacts are published by writing to a
//! temporary sibling directory and renaming it into place, so a reader only
//! ever sees complete entries. The in-memory index (sizes and last use) sits
//! behind a mutex held only for metadata updates.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, Language};

const TMP_MARKER: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to cache an artifact without files")]
    EmptyArtifact,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Hex SHA-256 of a language id and source text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SourceHash(String);

impl SourceHash {
    /// The language takes part in the key, so identical text submitted as C
    /// and as C++ never shares an artifact
    pub fn of(language: Language, source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(language.id().as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for logs
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    fn parse(name: &str) -> Option<Self> {
        (name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())).then(|| Self(name.to_owned()))
    }
}

impl fmt::Display for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counters and size of the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    bytes: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<SourceHash, Entry>,
    total_bytes: u64,
    clock: u64,
}

impl Index {
    fn insert(&mut self, hash: SourceHash, bytes: u64) {
        self.clock += 1;
        let entry = Entry {
            bytes,
            last_used: self.clock,
        };
        if let Some(old) = self.entries.insert(hash, entry) {
            self.total_bytes -= old.bytes;
        }
        self.total_bytes += bytes;
    }

    fn touch(&mut self, hash: &SourceHash) -> bool {
        self.clock += 1;
        let clock = self.clock;
        match self.entries.get_mut(hash) {
            Some(entry) => {
                entry.last_used = clock;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, hash: &SourceHash) {
        if let Some(old) = self.entries.remove(hash) {
            self.total_bytes -= old.bytes;
        }
    }

    /// Pop least recently used entries until both bounds hold
    fn evict(&mut self, max_entries: usize, max_bytes: u64) -> Vec<SourceHash> {
        let mut victims = Vec::new();
        while self.entries.len() > max_entries || self.total_bytes > max_bytes {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(hash, _)| hash.clone())
            else {
                break;
            };
            self.remove(&oldest);
            victims.push(oldest);
        }
        victims
    }
}

/// On-disk artifact store keyed by [`SourceHash`]
#[derive(Debug)]
pub struct BuildCache {
    root: PathBuf,
    max_entries: usize,
    max_bytes: u64,
    index: Mutex<Index>,
    store_locks: Mutex<HashMap<SourceHash, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BuildCache {
    /// Open the cache configured in `config`
    pub fn open(config: &Config) -> Result<Self, CacheError> {
        Self::open_at(config.cache_dir(), config.cache.max_entries, config.cache.max_bytes)
    }

    /// Open (creating if needed) the cache at `root` and rebuild its index
    /// from the entries already on disk
    pub fn open_at(root: impl Into<PathBuf>, max_entries: usize, max_bytes: u64) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_error(&root))?;

        let cache = Self {
            root,
            max_entries,
            max_bytes,
            index: Mutex::new(Index::default()),
            store_locks: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };
        cache.rebuild_index()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an artifact for `hash` is published to
    pub fn path_for(&self, hash: &SourceHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    /// Look up a published artifact and mark it as recently used
    pub fn lookup(&self, hash: &SourceHash) -> Option<PathBuf> {
        let path = self.path_for(hash);
        let known = self.lock_index().touch(hash);
        if known && path.is_dir() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(path);
        }
        if known {
            // Removed behind our back
            self.lock_index().remove(hash);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Copy a cached artifact into `dest`.
    ///
    /// Returns `false` on a miss, including an entry evicted or damaged
    /// since it was indexed. Holds the hash's store lock while copying, so
    /// eviction of the same entry waits for the copy to finish.
    #[instrument(skip(self, hash, dest), fields(hash = hash.short()))]
    pub async fn checkout(&self, hash: &SourceHash, dest: &Path) -> bool {
        let lock = self.store_lock(hash);
        let found = {
            let _guard = lock.lock().await;
            self.copy_out(hash, dest).await
        };
        self.release_store_lock(hash, lock);
        found
    }

    async fn copy_out(&self, hash: &SourceHash, dest: &Path) -> bool {
        let Some(source) = self.lookup(hash) else {
            return false;
        };
        let expected = self.lock_index().entries.get(hash).map(|entry| entry.bytes);

        let error = match copy_dir_files(&source, dest).await {
            Ok(bytes) if expected.is_none_or(|expected| expected == bytes) => {
                debug!(bytes, "checked out cached artifact");
                return true;
            }
            Ok(bytes) => {
                warn!(bytes, expected = ?expected, "cached artifact is incomplete, discarding it");
                self.lock_index().remove(hash);
                if let Err(e) = tokio::fs::remove_dir_all(&source).await {
                    warn!(error = %e, "failed to remove incomplete artifact");
                }
                None
            }
            Err(e) => Some(e),
        };
        if let Some(e) = error {
            warn!(error = %e, "failed to check out cached artifact, treating as miss");
        }
        let _ = tokio::fs::remove_dir_all(dest).await;
        self.hits.fetch_sub(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Publish `files` as the artifact for `hash`.
    ///
    /// Stores of the same hash are serialized; a hash that is already
    /// published is left untouched.
    #[instrument(skip(self, hash, files), fields(hash = hash.short()))]
    pub async fn store(&self, hash: &SourceHash, files: &[PathBuf]) -> Result<PathBuf, CacheError> {
        if files.is_empty() {
            return Err(CacheError::EmptyArtifact);
        }

        let lock = self.store_lock(hash);
        let result = {
            let _guard = lock.lock().await;
            self.publish(hash, files).await
        };
        self.release_store_lock(hash, lock);

        let path = result?;
        self.enforce_bounds().await;
        Ok(path)
    }

    async fn publish(&self, hash: &SourceHash, files: &[PathBuf]) -> Result<PathBuf, CacheError> {
        let target = self.path_for(hash);
        if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            let mut index = self.lock_index();
            if !index.touch(hash) {
                // Evicted from the index but not yet from disk
                index.insert(hash.clone(), dir_size(&target));
            }
            debug!("artifact already cached");
            return Ok(target);
        }

        let staging = self.root.join(format!("{hash}{TMP_MARKER}{}", Uuid::new_v4()));
        tokio::fs::create_dir(&staging).await.map_err(io_error(&staging))?;

        let mut bytes = 0;
        for file in files {
            let Some(name) = file.file_name() else { continue };
            let dest = staging.join(name);
            match tokio::fs::copy(file, &dest).await {
                Ok(copied) => bytes += copied,
                Err(e) => {
                    let _ = tokio::fs::remove_dir_all(&staging).await;
                    return Err(CacheError::Io { path: file.clone(), source: e });
                }
            }
        }

        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            // Another process published the same content first
            if !target.is_dir() {
                return Err(CacheError::Io { path: target, source: e });
            }
        }

        self.lock_index().insert(hash.clone(), bytes);
        info!(bytes, "artifact cached");
        Ok(target)
    }

    /// Evict least recently used entries beyond the count or size bound
    async fn enforce_bounds(&self) {
        let victims = self.lock_index().evict(self.max_entries, self.max_bytes);
        for hash in victims {
            let lock = self.store_lock(&hash);
            {
                let _guard = lock.lock().await;
                self.remove_evicted(&hash).await;
            }
            self.release_store_lock(&hash, lock);
        }
    }

    /// Delete an evicted entry unless a store published it again meanwhile
    async fn remove_evicted(&self, hash: &SourceHash) {
        if self.lock_index().entries.contains_key(hash) {
            debug!(hash = hash.short(), "evicted artifact was republished, keeping it");
            return;
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_dir_all(self.path_for(hash)).await {
            Ok(()) => debug!(hash = hash.short(), "evicted artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(hash = hash.short(), error = %e, "failed to remove evicted artifact"),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.lock_index();
        CacheStats {
            entries: index.entries.len(),
            bytes: index.total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn rebuild_index(&self) -> Result<(), CacheError> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(io_error(&self.root))? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.contains(TMP_MARKER) {
                // Left behind by an interrupted store
                let _ = std::fs::remove_dir_all(&path);
                continue;
            }
            let Some(hash) = SourceHash::parse(&name) else { continue };
            if !path.is_dir() {
                continue;
            }

            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, hash, dir_size(&path)));
        }

        found.sort_by_key(|(modified, _, _)| *modified);
        {
            let mut index = self.lock_index();
            for (_, hash, bytes) in found {
                index.insert(hash, bytes);
            }
            debug!(entries = index.entries.len(), bytes = index.total_bytes, "rebuilt cache index");
        }

        let victims = self.lock_index().evict(self.max_entries, self.max_bytes);
        for hash in victims {
            let _ = std::fs::remove_dir_all(self.path_for(&hash));
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn store_lock(&self, hash: &SourceHash) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.store_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(hash.clone()).or_default().clone()
    }

    fn release_store_lock(&self, hash: &SourceHash, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.store_locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this caller still hold it
        if Arc::strong_count(&lock) == 2 {
            locks.remove(hash);
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Copy every regular file of `source` into `dest`, returning bytes copied
async fn copy_dir_files(source: &Path, dest: &Path) -> io::Result<u64> {
    tokio::fs::create_dir_all(dest).await?;
    let mut entries = tokio::fs::read_dir(source).await?;
    let mut bytes = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            bytes += tokio::fs::copy(entry.path(), dest.join(entry.file_name())).await?;
        }
    }
    Ok(bytes)
}

fn dir_size(path: &Path) -> u64 {
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|entry| entry.metadata().ok())
                .filter(|meta| meta.is_file())
                .map(|meta| meta.len())
                .sum()
        })
        .unwrap_or(0)
}
