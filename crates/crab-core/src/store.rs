//! The `RecordStore` trait: everything the sync pipeline needs from the
//! datastore holding cities, streets and addresses.
//!
//! Implementations live next to their backend (`PgRecordStore` in
//! `crab-sync`, [`MemoryRecordStore`](crate::MemoryRecordStore) here).

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::{Address, AddressFields, City, NewCity, NewStreet, RecordId, Street};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} with crab_id {crab_id:?} already exists")]
    Duplicate { entity: &'static str, crab_id: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: RecordId },

    #[error("stored row is invalid: {0}")]
    InvalidRow(String),

    #[error("storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Datastore seam for the CRAB tables. Writes are individual and immediately
/// visible; the run lock admits one holder at a time.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_cities(&self) -> StoreResult<Vec<City>>;

    async fn load_streets(&self) -> StoreResult<Vec<Street>>;

    async fn load_addresses(&self) -> StoreResult<Vec<Address>>;

    async fn insert_city(&self, city: &NewCity) -> StoreResult<City>;

    async fn insert_street(&self, street: &NewStreet) -> StoreResult<Street>;

    async fn insert_address(&self, address: &AddressFields) -> StoreResult<Address>;

    async fn update_address(&self, address: &Address) -> StoreResult<()>;

    async fn try_acquire_run_lock(&self) -> StoreResult<bool>;

    async fn release_run_lock(&self) -> StoreResult<()>;

    // Must not block; called from `RunLock::drop`.
    fn abandon_run_lock(&self);
}

/// Holds the run lock for the lifetime of one run.
pub struct RunLock<'a> {
    store: &'a dyn RecordStore,
    held: bool,
}

impl<'a> RunLock<'a> {
    pub async fn acquire(store: &'a dyn RecordStore) -> StoreResult<Option<RunLock<'a>>> {
        if store.try_acquire_run_lock().await? {
            Ok(Some(RunLock { store, held: true }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(mut self) -> StoreResult<()> {
        let result = self.store.release_run_lock().await;
        if result.is_ok() {
            self.held = false;
        }
        result
    }
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        if self.held {
            warn!("run ended without releasing its lock; abandoning it");
            self.store.abandon_run_lock();
        }
    }
}
