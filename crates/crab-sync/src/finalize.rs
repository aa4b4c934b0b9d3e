use chrono::{DateTime, Utc};
use crab_core::{CrabStatus, RecordStore, TraceSink};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::index::Indexes;
use crate::reconcile::{AddressOutcome, FeatureOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    pub features_processed: usize,
    pub features_skipped: usize,
    pub cities_created: usize,
    pub streets_created: usize,
    pub addresses_created: usize,
    pub addresses_updated: usize,
    pub addresses_unchanged: usize,
    pub duplicates_ignored: usize,
}

impl RunTally {
    pub fn record(&mut self, outcome: &FeatureOutcome) {
        self.features_processed += 1;
        self.cities_created += usize::from(outcome.city_created);
        self.streets_created += usize::from(outcome.street_created);
        match outcome.address {
            AddressOutcome::Created => self.addresses_created += 1,
            AddressOutcome::Updated => self.addresses_updated += 1,
            AddressOutcome::Unchanged => self.addresses_unchanged += 1,
            AddressOutcome::Duplicate => self.duplicates_ignored += 1,
        }
    }

    pub fn record_skipped(&mut self) {
        self.features_skipped += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub tally: RunTally,
    pub addresses_staled: usize,
    // skipped features make absence untrustworthy
    pub staleness_skipped: bool,
}

impl RunSummary {
    pub fn write_count(&self) -> usize {
        self.tally.cities_created
            + self.tally.streets_created
            + self.tally.addresses_created
            + self.tally.addresses_updated
            + self.addresses_staled
    }
}

/// Marks every pre-existing address no feature matched as
/// [`CrabStatus::NotFound`]. Only the status changes.
pub async fn finalize(
    store: &dyn RecordStore,
    indexes: &Indexes,
    tally: RunTally,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    trace: &dyn TraceSink,
) -> Result<RunSummary, SyncError> {
    let mut addresses_staled = 0usize;
    let staleness_skipped = tally.features_skipped > 0;

    if staleness_skipped {
        warn!(
            skipped = tally.features_skipped,
            "malformed features were skipped; not marking unseen addresses as not found"
        );
        trace.trace(&format!(
            "Skipped {} malformed features; unseen addresses keep their status this run.",
            tally.features_skipped
        ));
    } else {
        for address in indexes.unseen_addresses() {
            if address.fields.status == CrabStatus::NotFound {
                continue;
            }
            let mut stale = address.clone();
            stale.fields.status = CrabStatus::NotFound;
            store.update_address(&stale).await?;
            addresses_staled += 1;
        }
    }

    trace.trace("Finished processing GeoJSON.");
    trace.trace("New items:");
    trace.trace(&format!("- {} cities", tally.cities_created));
    trace.trace(&format!("- {} streets", tally.streets_created));
    trace.trace(&format!("- {} addresses", tally.addresses_created));
    trace.trace(&format!("Updated addresses: {}", tally.addresses_updated));
    trace.trace(&format!("Addresses no longer found: {addresses_staled}"));

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        tally,
        addresses_staled,
        staleness_skipped,
    };
    info!(
        %run_id,
        features = tally.features_processed,
        created = tally.addresses_created,
        updated = tally.addresses_updated,
        staled = addresses_staled,
        "CRAB import finished"
    );
    Ok(summary)
}
