use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StoreError;

/// Transactional key-value storage for bucket records.
///
/// Values are opaque bytes; the facade owns encoding. Backends must serialize
/// overlapping transactions per key so a get followed by a set is atomic with
/// respect to every other transaction on that key, while leaving unrelated keys
/// independent.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: Transaction;

    /// Open a read-write transaction.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Read the committed value for `key` outside any transaction.
    ///
    /// Does not wait for in-flight transactions on the key.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// One read-write transaction.
///
/// Implementations lock a key the first time the transaction touches it and hold
/// the lock until [`commit`](Transaction::commit) or [`abort`](Transaction::abort).
/// Transactions touching several keys must touch them in a consistent order.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stage `value` under `key`; nothing is visible to others before commit.
    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Publish staged writes and release locks.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard staged writes and release locks. Must be safe to call at any point.
    fn abort(&mut self);
}

/// Scope guard around a [`Transaction`].
///
/// `commit` consumes the guard and marks it finished; a guard dropped without a
/// successful commit (early return, error, cancelled future) aborts.
pub struct ScopedTransaction<T: Transaction> {
    inner: T,
    finished: bool,
}

impl<T: Transaction> ScopedTransaction<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, finished: false }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    pub async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.inner.commit().await?;
        self.finished = true;
        Ok(())
    }
}

impl<T: Transaction> Drop for ScopedTransaction<T> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("aborting uncommitted transaction");
            self.inner.abort();
        }
    }
}

/// Per-key async locks shared by the backends in this workspace.
///
/// Entries are created on demand and dropped once no transaction holds or waits
/// on them, so the table only grows with concurrently active keys.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Cancel-safe.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = self.table.entry(key.to_owned()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyGuard { key: key.to_owned(), guard: Some(guard), table: self.table.clone() }
    }

    /// Number of keys currently locked or awaited.
    pub fn active(&self) -> usize {
        self.table.len()
    }
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table's own handle left: nobody holds or waits on this key.
        self.table.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// In-memory store. Durable only for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    data: Arc<DashMap<String, Vec<u8>>>,
    locks: KeyLocks,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrite a committed value directly, bypassing transactions.
    pub fn insert_raw(&self, key: impl Into<String>, value: Vec<u8>) {
        self.data.insert(key.into(), value);
    }

    /// Keys currently locked by open transactions.
    pub fn locked_keys(&self) -> usize {
        self.locks.active()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction {
            data: self.data.clone(),
            locks: self.locks.clone(),
            held: HashMap::new(),
            staged: HashMap::new(),
        })
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }
}

/// Transaction over an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    data: Arc<DashMap<String, Vec<u8>>>,
    locks: KeyLocks,
    held: HashMap<String, KeyGuard>,
    staged: HashMap<String, Vec<u8>>,
}

impl InMemoryTransaction {
    async fn acquire(&mut self, key: &str) {
        if !self.held.contains_key(key) {
            let guard = self.locks.lock(key).await;
            self.held.insert(key.to_owned(), guard);
        }
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.acquire(key).await;
        if let Some(value) = self.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.acquire(key).await;
        self.staged.insert(key.to_owned(), value);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        for (key, value) in self.staged.drain() {
            self.data.insert(key, value);
        }
        self.held.clear();
        Ok(())
    }

    fn abort(&mut self) {
        self.staged.clear();
        self.held.clear();
    }
}
