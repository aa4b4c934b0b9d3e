use std::collections::{HashMap, HashSet};

use crab_core::{Address, City, RecordStore, StoreError, Street, TraceSink};
use tracing::{info, warn};

/// In-memory view of every persisted record, keyed the way features refer to
/// them: cities by name, streets and addresses by `crab_id`.
#[derive(Debug, Default)]
pub struct Indexes {
    pub cities: HashMap<String, City>,
    pub streets: HashMap<String, Street>,
    pub addresses: HashMap<String, Address>,
    seen: HashSet<String>,
}

impl Indexes {
    /// When two stored cities share a name the one loaded first is kept.
    pub fn from_records(cities: Vec<City>, streets: Vec<Street>, addresses: Vec<Address>) -> Self {
        let mut index = Self::default();
        for city in cities {
            if let Some(existing) = index.cities.get(&city.name) {
                warn!(name = %city.name, kept = existing.id, ignored = city.id, "duplicate city name in store");
                continue;
            }
            index.cities.insert(city.name.clone(), city);
        }
        index.streets = streets
            .into_iter()
            .map(|street| (street.crab_id().to_string(), street))
            .collect();
        index.addresses = addresses
            .into_iter()
            .map(|address| (address.crab_id().to_string(), address))
            .collect();
        index
    }

    pub fn mark_seen(&mut self, crab_id: &str) {
        if !self.seen.contains(crab_id) {
            self.seen.insert(crab_id.to_string());
        }
    }

    pub fn is_seen(&self, crab_id: &str) -> bool {
        self.seen.contains(crab_id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Addresses never matched by a feature during this run, ordered by id.
    pub fn unseen_addresses(&self) -> Vec<&Address> {
        let mut unseen: Vec<&Address> = self
            .addresses
            .iter()
            .filter(|(crab_id, _)| !self.seen.contains(crab_id.as_str()))
            .map(|(_, address)| address)
            .collect();
        unseen.sort_by_key(|address| address.id);
        unseen
    }
}

pub async fn build_indexes(store: &dyn RecordStore, trace: &dyn TraceSink) -> Result<Indexes, StoreError> {
    let cities = store.load_cities().await?;
    let streets = store.load_streets().await?;
    let addresses = store.load_addresses().await?;
    info!(
        cities = cities.len(),
        streets = streets.len(),
        addresses = addresses.len(),
        "loaded existing CRAB records"
    );

    let index = Indexes::from_records(cities, streets, addresses);
    trace.trace(&format!("# known cities: {}", index.cities.len()));
    trace.trace(&format!("# known streets: {}", index.streets.len()));
    trace.trace(&format!("# known addresses: {}", index.addresses.len()));
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crab_core::{AddressFields, CrabStatus, MemoryRecordStore, MemorySink, NewCity, NewStreet};

    fn address(id: i64, crab_id: &str) -> Address {
        Address {
            id,
            fields: AddressFields {
                crab_id: crab_id.to_string(),
                street_id: 1,
                house_number: "1".to_string(),
                apartment_number: None,
                sub_number: None,
                status: CrabStatus::InUse,
                geom: "POINT(0 0)".to_string(),
            },
        }
    }

    #[test]
    fn first_loaded_city_wins_on_duplicate_names() {
        let index = Indexes::from_records(
            vec![
                City { id: 1, name: "Izegem".into() },
                City { id: 2, name: "Izegem".into() },
                City { id: 3, name: "izegem".into() },
            ],
            vec![],
            vec![],
        );
        assert_eq!(index.cities.len(), 2);
        assert_eq!(index.cities["Izegem"].id, 1);
        assert_eq!(index.cities["izegem"].id, 3);
    }

    #[test]
    fn unseen_addresses_exclude_marked_ones() {
        let mut index = Indexes::from_records(
            vec![],
            vec![],
            vec![address(3, "A3"), address(1, "A1"), address(2, "A2")],
        );
        index.mark_seen("A2");
        index.mark_seen("A2");
        assert!(index.is_seen("A2"));
        assert_eq!(index.seen_count(), 1);
        let unseen: Vec<i64> = index.unseen_addresses().iter().map(|a| a.id).collect();
        assert_eq!(unseen, vec![1, 3]);
    }

    #[tokio::test]
    async fn build_indexes_loads_everything_and_traces_counts() {
        let store = MemoryRecordStore::new();
        let city = store.insert_city(&NewCity { name: "Springfield".into() }).await.unwrap();
        store
            .insert_street(&NewStreet {
                name: "Main St".into(),
                crab_id: "S1".into(),
                city_id: city.id,
                status: CrabStatus::InUse,
            })
            .await
            .unwrap();
        let sink = MemorySink::new();

        let index = build_indexes(&store, &sink).await.unwrap();

        assert!(index.cities.contains_key("Springfield"));
        assert_eq!(index.streets["S1"].fields.city_id, city.id);
        assert!(index.addresses.is_empty());
        assert!(sink.contains("# known cities: 1"));
        assert!(sink.contains("# known addresses: 0"));
    }
}
