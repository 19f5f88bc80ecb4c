//! Durable [`Store`] for ratekeeper backed by a write-ahead log.
//!
//! Committed values live in memory and every commit is appended to an fsynced log
//! before it becomes visible. Opening a directory replays the log; a torn or
//! corrupt tail is dropped and the log is compacted to one record per key.
//!
//! ```no_run
//! use ratekeeper::{RateLimitService, ReduceRequest};
//! use ratekeeper_wal::WalStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = WalStore::open("./db")?;
//! let service = RateLimitService::new(store.clone());
//! let resp = service.reduce(&ReduceRequest::new("api:42", 100, 10, 60)).await?;
//! println!("{} {}", resp.status, resp.remaining);
//! store.close()?;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod log;

pub use log::{ReplayStats, WalEntry, WriteAheadLog};

use async_trait::async_trait;
use dashmap::DashMap;
use ratekeeper::{KeyGuard, KeyLocks, Store, StoreError, Transaction};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Writes per record when compacting.
const COMPACT_CHUNK: usize = 256;

/// Options for [`WalStore::open_with`].
#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    /// Refuse to open a log whose replay was not clean.
    pub strict: bool,
    /// Rewrite the log as one record per key after replay.
    pub compact_on_open: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self { strict: false, compact_on_open: true }
    }
}

struct Inner {
    data: Arc<DashMap<String, Vec<u8>>>,
    locks: KeyLocks,
    log: WriteAheadLog,
    closed: AtomicBool,
}

/// Store whose commits survive process restarts.
#[derive(Clone)]
pub struct WalStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalStore")
            .field("path", &self.inner.log.path())
            .field("keys", &self.inner.data.len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl WalStore {
    /// Open `dir` with default options.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(dir, WalOptions::default())
    }

    pub fn open_with(dir: impl AsRef<Path>, options: WalOptions) -> Result<Self, StoreError> {
        let log = WriteAheadLog::open(dir.as_ref())?;
        let (entries, stats) = log.replay()?;
        if !stats.is_clean() {
            tracing::warn!(
                success = stats.success,
                skipped = stats.skipped,
                crc_errors = stats.crc_errors,
                truncated = stats.truncated,
                "WAL replay was not clean"
            );
            if options.strict {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unclean WAL replay: {:?}", stats),
                )));
            }
        }

        let data = Arc::new(DashMap::new());
        for WalEntry::Commit { writes } in entries {
            for (key, value) in writes {
                data.insert(key, value);
            }
        }
        tracing::info!(path = %log.path().display(), keys = data.len(), records = stats.success, "WAL store opened");

        let store = Self {
            inner: Arc::new(Inner {
                data,
                locks: KeyLocks::new(),
                log,
                closed: AtomicBool::new(false),
            }),
        };
        // A dirty tail must be cut off before new appends land behind it.
        if options.compact_on_open || !stats.is_clean() {
            store.compact()?;
        }
        Ok(store)
    }

    /// Rewrite the log so it holds exactly the committed state.
    pub fn compact(&self) -> Result<(), StoreError> {
        let data = &self.inner.data;
        self.inner.log.rewrite(|| {
            let mut entries = Vec::new();
            let mut writes = Vec::with_capacity(COMPACT_CHUNK);
            for entry in data.iter() {
                writes.push((entry.key().clone(), entry.value().clone()));
                if writes.len() == COMPACT_CHUNK {
                    entries.push(WalEntry::Commit { writes: std::mem::take(&mut writes) });
                }
            }
            if !writes.is_empty() {
                entries.push(WalEntry::Commit { writes });
            }
            entries
        })?;
        tracing::debug!(keys = data.len(), "WAL compacted");
        Ok(())
    }

    /// Flush the log and refuse new transactions.
    ///
    /// Transactions already begun may still commit.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.log.sync()?;
        tracing::info!("WAL store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }
}

#[async_trait]
impl Store for WalStore {
    type Tx = WalTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Unavailable("store is closed".into()));
        }
        if self.inner.log.is_poisoned() {
            return Err(StoreError::Unavailable("write-ahead log is poisoned; compact to recover".into()));
        }
        Ok(WalTransaction {
            inner: self.inner.clone(),
            held: HashMap::new(),
            staged: HashMap::new(),
        })
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.data.get(key).map(|entry| entry.value().clone()))
    }
}

/// Transaction over a [`WalStore`].
///
/// Commit queues the staged writes on the log's writer thread together with this
/// transaction's key locks. Once queued, the commit completes (or fails) as a
/// whole even if the caller stops waiting, and the locks are released only after
/// the writes are applied.
pub struct WalTransaction {
    inner: Arc<Inner>,
    held: HashMap<String, KeyGuard>,
    staged: HashMap<String, Vec<u8>>,
}

impl WalTransaction {
    async fn acquire(&mut self, key: &str) {
        if !self.held.contains_key(key) {
            let guard = self.inner.locks.lock(key).await;
            self.held.insert(key.to_owned(), guard);
        }
    }
}

#[async_trait]
impl Transaction for WalTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.acquire(key).await;
        if let Some(value) = self.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.inner.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.acquire(key).await;
        self.staged.insert(key.to_owned(), value);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let held = std::mem::take(&mut self.held);
        if self.staged.is_empty() {
            return Ok(());
        }
        let entry = WalEntry::Commit { writes: self.staged.drain().collect() };
        let data = Arc::clone(&self.inner.data);
        self.inner
            .log
            .append(entry, move |WalEntry::Commit { writes }| {
                for (key, value) in writes {
                    data.insert(key, value);
                }
                drop(held);
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "WAL append failed");
                StoreError::Io(e)
            })
    }

    fn abort(&mut self) {
        self.staged.clear();
        self.held.clear();
    }
}
