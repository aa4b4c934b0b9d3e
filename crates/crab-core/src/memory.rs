use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::store::{RecordStore, StoreError, StoreResult};
use crate::{Address, AddressFields, City, NewCity, NewStreet, RecordId, Street};

/// Number of writes a store has accepted since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub inserts: usize,
    pub updates: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: RecordId,
    cities: BTreeMap<RecordId, City>,
    streets: BTreeMap<RecordId, Street>,
    addresses: BTreeMap<RecordId, Address>,
    stats: WriteStats,
    run_locked: bool,
}

impl MemoryState {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store for tests and dry runs. Enforces the same uniqueness and
/// reference constraints as the SQL schema.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cities(&self) -> Vec<City> {
        self.lock().cities.values().cloned().collect()
    }

    pub fn streets(&self) -> Vec<Street> {
        self.lock().streets.values().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.lock().addresses.values().cloned().collect()
    }

    pub fn address_by_crab_id(&self, crab_id: &str) -> Option<Address> {
        self.lock()
            .addresses
            .values()
            .find(|a| a.fields.crab_id == crab_id)
            .cloned()
    }

    pub fn street(&self, id: RecordId) -> Option<Street> {
        self.lock().streets.get(&id).cloned()
    }

    pub fn write_stats(&self) -> WriteStats {
        self.lock().stats
    }

    pub fn reset_write_stats(&self) {
        self.lock().stats = WriteStats::default();
    }

    pub fn is_run_locked(&self) -> bool {
        self.lock().run_locked
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-write; the maps are
        // still structurally valid.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_cities(&self) -> StoreResult<Vec<City>> {
        Ok(self.cities())
    }

    async fn load_streets(&self) -> StoreResult<Vec<Street>> {
        Ok(self.streets())
    }

    async fn load_addresses(&self) -> StoreResult<Vec<Address>> {
        Ok(self.addresses())
    }

    async fn insert_city(&self, city: &NewCity) -> StoreResult<City> {
        let mut state = self.lock();
        let id = state.allocate_id();
        let city = City {
            id,
            name: city.name.clone(),
        };
        state.cities.insert(id, city.clone());
        state.stats.inserts += 1;
        debug!(id, name = %city.name, "memory store: inserted city");
        Ok(city)
    }

    async fn insert_street(&self, street: &NewStreet) -> StoreResult<Street> {
        let mut state = self.lock();
        if !state.cities.contains_key(&street.city_id) {
            return Err(StoreError::NotFound {
                entity: "city",
                id: street.city_id,
            });
        }
        if state.streets.values().any(|s| s.fields.crab_id == street.crab_id) {
            return Err(StoreError::Duplicate {
                entity: "street",
                crab_id: street.crab_id.clone(),
            });
        }
        let id = state.allocate_id();
        let street = Street {
            id,
            fields: street.clone(),
        };
        state.streets.insert(id, street.clone());
        state.stats.inserts += 1;
        Ok(street)
    }

    async fn insert_address(&self, address: &AddressFields) -> StoreResult<Address> {
        let mut state = self.lock();
        if !state.streets.contains_key(&address.street_id) {
            return Err(StoreError::NotFound {
                entity: "street",
                id: address.street_id,
            });
        }
        if state.addresses.values().any(|a| a.fields.crab_id == address.crab_id) {
            return Err(StoreError::Duplicate {
                entity: "address",
                crab_id: address.crab_id.clone(),
            });
        }
        let id = state.allocate_id();
        let address = Address {
            id,
            fields: address.clone(),
        };
        state.addresses.insert(id, address.clone());
        state.stats.inserts += 1;
        Ok(address)
    }

    async fn update_address(&self, address: &Address) -> StoreResult<()> {
        let mut state = self.lock();
        if !state.streets.contains_key(&address.fields.street_id) {
            return Err(StoreError::NotFound {
                entity: "street",
                id: address.fields.street_id,
            });
        }
        let Some(stored) = state.addresses.get_mut(&address.id) else {
            return Err(StoreError::NotFound {
                entity: "address",
                id: address.id,
            });
        };
        stored.fields = address.fields.clone();
        state.stats.updates += 1;
        Ok(())
    }

    async fn try_acquire_run_lock(&self) -> StoreResult<bool> {
        let mut state = self.lock();
        if state.run_locked {
            return Ok(false);
        }
        state.run_locked = true;
        Ok(true)
    }

    async fn release_run_lock(&self) -> StoreResult<()> {
        self.lock().run_locked = false;
        Ok(())
    }

    fn abandon_run_lock(&self) {
        self.lock().run_locked = false;
    }
}
