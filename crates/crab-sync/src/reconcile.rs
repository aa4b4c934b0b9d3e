use crab_core::{Address, AddressFields, CrabStatus, NewCity, NewStreet, RecordStore, TraceSink};
use crab_geo::Feature;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::index::Indexes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressOutcome {
    Created,
    Updated,
    Unchanged,
    // an earlier feature in the same input claimed this id
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureOutcome {
    pub city_created: bool,
    pub street_created: bool,
    pub address: AddressOutcome,
}

/// Ensures the city and street exist, then inserts or updates the address.
/// Streets are write-once. A crab id repeated within one input keeps its
/// first row.
pub async fn reconcile_feature(
    store: &dyn RecordStore,
    indexes: &mut Indexes,
    feature: &Feature,
    trace: &dyn TraceSink,
) -> Result<FeatureOutcome, SyncError> {
    if indexes.is_seen(&feature.crab_id) {
        warn!(
            index = feature.index,
            crab_id = %feature.crab_id,
            "crab id already seen in this input; keeping the first row"
        );
        trace.trace(&format!("Duplicate CrabAddress ignored: {}", feature.label()));
        return Ok(FeatureOutcome {
            city_created: false,
            street_created: false,
            address: AddressOutcome::Duplicate,
        });
    }

    let status = CrabStatus::InUse;
    debug!(
        index = feature.index,
        crab_id = %feature.crab_id,
        street_crab_id = %feature.street_crab_id,
        city = %feature.city_name,
        "reconciling feature"
    );

    let (city_id, city_created) = match indexes.cities.get(&feature.city_name) {
        Some(city) => (city.id, false),
        None => {
            trace.trace(&format!("Create CrabCity: {}", feature.city_name));
            let city = store
                .insert_city(&NewCity {
                    name: feature.city_name.clone(),
                })
                .await?;
            let id = city.id;
            indexes.cities.insert(feature.city_name.clone(), city);
            (id, true)
        }
    };

    let street_created = !indexes.streets.contains_key(&feature.street_crab_id);
    if street_created {
        trace.trace(&format!(
            "Create CrabStreet: {} - Crab ID {}",
            feature.street_name, feature.street_crab_id
        ));
        let street = store
            .insert_street(&NewStreet {
                name: feature.street_name.clone(),
                crab_id: feature.street_crab_id.clone(),
                city_id,
                status,
            })
            .await?;
        indexes.streets.insert(feature.street_crab_id.clone(), street);
    }

    let street_id = indexes
        .streets
        .get(&feature.street_crab_id)
        .map(|street| street.id)
        .ok_or_else(|| SyncError::UnresolvedStreet {
            address_crab_id: feature.crab_id.clone(),
            street_crab_id: feature.street_crab_id.clone(),
        })?;

    let candidate = AddressFields {
        crab_id: feature.crab_id.clone(),
        street_id,
        house_number: feature.house_number.clone(),
        apartment_number: feature.apartment_number.clone(),
        sub_number: feature.sub_number.clone(),
        status,
        geom: feature.geom_wkt(),
    };

    let address = match indexes.addresses.get_mut(&feature.crab_id) {
        None => {
            trace.trace(&format!("Create CrabAddress: {}", feature.label()));
            let stored = store.insert_address(&candidate).await?;
            indexes.addresses.insert(feature.crab_id.clone(), stored);
            AddressOutcome::Created
        }
        Some(existing) if existing.fingerprint() != candidate.fingerprint() => {
            trace.trace(&format!("Update CrabAddress: {}", feature.label()));
            let updated = Address {
                id: existing.id,
                fields: candidate,
            };
            store.update_address(&updated).await?;
            *existing = updated;
            AddressOutcome::Updated
        }
        Some(_) => {
            debug!(crab_id = %feature.crab_id, "address unchanged");
            AddressOutcome::Unchanged
        }
    };
    indexes.mark_seen(&feature.crab_id);

    Ok(FeatureOutcome {
        city_created,
        street_created,
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crab_core::{MemoryRecordStore, MemorySink};

    fn feature(crab_id: &str, street: &str, city: &str, house_number: &str) -> Feature {
        Feature {
            index: 1,
            crab_id: crab_id.to_string(),
            street_crab_id: street.to_string(),
            house_number: house_number.to_string(),
            apartment_number: None,
            sub_number: None,
            city_name: city.to_string(),
            street_name: format!("{street} street"),
            x: 4.0,
            y: 51.0,
        }
    }

    fn next_run(store: &MemoryRecordStore) -> Indexes {
        Indexes::from_records(store.cities(), store.streets(), store.addresses())
    }

    #[tokio::test]
    async fn first_feature_creates_city_street_and_address() {
        let store = MemoryRecordStore::new();
        let sink = MemorySink::new();
        let mut indexes = Indexes::default();

        let outcome = reconcile_feature(&store, &mut indexes, &feature("A1", "S1", "Springfield", "10"), &sink)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FeatureOutcome {
                city_created: true,
                street_created: true,
                address: AddressOutcome::Created,
            }
        );
        let address = store.address_by_crab_id("A1").unwrap();
        assert_eq!(address.fields.geom, "POINT(4 51)");
        assert_eq!(address.fields.status, CrabStatus::InUse);
        assert_eq!(store.street(address.fields.street_id).unwrap().crab_id(), "S1");
        assert!(indexes.is_seen("A1"));
        assert!(sink.contains("Create CrabCity: Springfield"));
    }

    #[tokio::test]
    async fn same_feature_twice_is_unchanged() {
        let store = MemoryRecordStore::new();
        let sink = MemorySink::new();
        let mut indexes = Indexes::default();
        let f = feature("A1", "S1", "Springfield", "10");

        reconcile_feature(&store, &mut indexes, &f, &sink).await.unwrap();
        store.reset_write_stats();
        let mut indexes = next_run(&store);
        let outcome = reconcile_feature(&store, &mut indexes, &f, &sink).await.unwrap();

        assert_eq!(outcome.address, AddressOutcome::Unchanged);
        assert!(!outcome.city_created && !outcome.street_created);
        assert_eq!(store.write_stats().inserts + store.write_stats().updates, 0);
    }

    #[tokio::test]
    async fn changed_house_number_updates_in_place() {
        let store = MemoryRecordStore::new();
        let sink = MemorySink::new();
        let mut indexes = Indexes::default();
        reconcile_feature(&store, &mut indexes, &feature("A1", "S1", "Springfield", "10"), &sink)
            .await
            .unwrap();
        let before = store.address_by_crab_id("A1").unwrap();
        let mut indexes = next_run(&store);

        let outcome = reconcile_feature(&store, &mut indexes, &feature("A1", "S1", "Springfield", "12"), &sink)
            .await
            .unwrap();

        assert_eq!(outcome.address, AddressOutcome::Updated);
        let after = store.address_by_crab_id("A1").unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.fields.house_number, "12");
        assert_eq!(store.addresses().len(), 1);
    }

    #[tokio::test]
    async fn repeated_crab_id_keeps_the_first_row() {
        let store = MemoryRecordStore::new();
        let sink = MemorySink::new();
        let mut indexes = Indexes::default();
        reconcile_feature(&store, &mut indexes, &feature("A1", "S1", "Springfield", "10"), &sink)
            .await
            .unwrap();
        store.reset_write_stats();

        let mut repeat = feature("A1", "S2", "Shelbyville", "11");
        repeat.index = 2;
        let outcome = reconcile_feature(&store, &mut indexes, &repeat, &sink).await.unwrap();

        assert_eq!(outcome.address, AddressOutcome::Duplicate);
        assert!(!outcome.city_created && !outcome.street_created);
        assert_eq!(store.write_stats().inserts + store.write_stats().updates, 0);
        assert_eq!(store.address_by_crab_id("A1").unwrap().fields.house_number, "10");
        assert_eq!(store.cities().len(), 1);
        assert!(sink.contains("Duplicate CrabAddress ignored"));
    }

    #[tokio::test]
    async fn existing_street_is_never_corrected() {
        let store = MemoryRecordStore::new();
        let sink = MemorySink::new();
        let mut indexes = Indexes::default();
        reconcile_feature(&store, &mut indexes, &feature("A1", "S1", "Springfield", "10"), &sink)
            .await
            .unwrap();

        let mut renamed = feature("A2", "S1", "Shelbyville", "11");
        renamed.street_name = "Renamed St".to_string();
        let outcome = reconcile_feature(&store, &mut indexes, &renamed, &sink).await.unwrap();

        assert!(outcome.city_created);
        assert!(!outcome.street_created);
        let streets = store.streets();
        assert_eq!(streets.len(), 1);
        assert_eq!(streets[0].fields.name, "S1 street");
        assert_eq!(streets[0].fields.city_id, store.cities()[0].id);
    }

    #[tokio::test]
    async fn city_names_match_case_sensitively() {
        let store = MemoryRecordStore::new();
        let sink = MemorySink::new();
        let mut indexes = Indexes::default();
        reconcile_feature(&store, &mut indexes, &feature("A1", "S1", "Izegem", "1"), &sink)
            .await
            .unwrap();
        reconcile_feature(&store, &mut indexes, &feature("A2", "S2", "IZEGEM", "2"), &sink)
            .await
            .unwrap();
        assert_eq!(store.cities().len(), 2);
    }
}
