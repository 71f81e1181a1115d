// SPDX-License-Identifier: AGPL-3.0-or-later
//! Small key/value blob store for the certificate cache and the request
//! counter.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::error::StoreError;

pub const REQUEST_COUNT_KEY: &str = "request-count";

pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when nothing was ever stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

fn check_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok { Ok(()) } else { Err(StoreError::InvalidKey(key.to_string())) }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        check_key(key)?;
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// One file per key inside a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("blob store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        check_key(key)?;
        Ok(self.dir.join(key))
    }
}

impl BlobStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path(key)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key)?;
        // Readers never see a half-written value.
        let tmp = self.dir.join(format!(".{key}.tmp"));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// A directory-backed store when `path` is set, in-memory otherwise.
pub fn open_store(path: Option<&Path>) -> Result<Arc<dyn BlobStore>, StoreError> {
    Ok(match path {
        Some(dir) => Arc::new(FileStore::open(dir)?),
        None => Arc::new(MemoryStore::new()),
    })
}

/// Total number of requests the relay has seen, across restarts.
///
/// Counting is in memory; [`RequestCounter::flush`] persists it.
pub struct RequestCounter {
    store: Arc<dyn BlobStore>,
    count: AtomicU64,
    flushed: AtomicU64,
}

impl RequestCounter {
    pub fn load(store: Arc<dyn BlobStore>) -> Result<Self, StoreError> {
        let start = match store.get(REQUEST_COUNT_KEY)? {
            None => 0,
            Some(raw) => String::from_utf8_lossy(&raw).trim().parse::<u64>().map_err(|e| {
                StoreError::Corrupt { key: REQUEST_COUNT_KEY.to_string(), reason: e.to_string() }
            })?,
        };
        Ok(Self {
            store,
            count: AtomicU64::new(start),
            flushed: AtomicU64::new(start),
        })
    }

    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Writes the count if it moved since the last flush.
    pub fn flush(&self) -> Result<(), StoreError> {
        let now = self.get();
        if self.flushed.load(Ordering::Relaxed) == now {
            return Ok(());
        }
        // Only a successful write counts; a failed one is retried next flush.
        self.store.set(REQUEST_COUNT_KEY, now.to_string().as_bytes())?;
        self.flushed.store(now, Ordering::Relaxed);
        Ok(())
    }
}
