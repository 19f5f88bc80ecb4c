#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratekeeper::{
    InMemoryStore, ManualClock, MemorySink, RateLimitService, Store, StoreError, Transaction,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub type TestService<S = InMemoryStore> = RateLimitService<S, ManualClock, MemorySink>;

pub fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

pub fn service_over<S: Store>(store: S) -> (TestService<S>, ManualClock) {
    let clock = ManualClock::new(start());
    let service =
        RateLimitService::new(store).with_clock(clock.clone()).with_sink(MemorySink::new());
    (service, clock)
}

/// Wraps an [`InMemoryStore`] and injects faults into its transactions.
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: InMemoryStore,
    pub stall_commit: Arc<AtomicBool>,
    pub fail_set: Arc<AtomicBool>,
    pub aborts: Arc<AtomicUsize>,
}

pub struct FaultyTx {
    inner: <InMemoryStore as Store>::Tx,
    store: FaultyStore,
}

#[async_trait]
impl Store for FaultyStore {
    type Tx = FaultyTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(FaultyTx { inner: self.inner.begin().await?, store: self.clone() })
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.read(key).await
    }
}

#[async_trait]
impl Transaction for FaultyTx {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if self.store.fail_set.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected set failure".into()));
        }
        self.inner.set(key, value).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.store.stall_commit.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.inner.commit().await
    }

    fn abort(&mut self) {
        self.store.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort();
    }
}
