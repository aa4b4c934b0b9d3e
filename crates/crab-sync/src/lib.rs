//! CRAB address sync: downloads the Flemish CRAB address list, converts it to
//! GeoJSON and reconciles it into the city, street and address tables.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use crab_core::{RecordStore, RunLock, TraceSink, TracingSink};
use crab_geo::{
    describe_properties, stream_features, Feature, FeatureStream, Ogr2OgrConverter, RowFilter,
    ShapefileConverter,
};
use crab_storage::{BackoffPolicy, DatasetFetcher, FetcherConfig, WorkDir};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod finalize;
pub mod index;
pub mod pg;
pub mod reconcile;

pub use config::{ConfigError, CrabConfig, MalformedFeaturePolicy};
pub use error::SyncError;
pub use finalize::{finalize, RunSummary, RunTally};
pub use index::{build_indexes, Indexes};
pub use pg::PgRecordStore;
pub use reconcile::{reconcile_feature, AddressOutcome, FeatureOutcome};

pub const CRATE_NAME: &str = "crab-sync";

pub struct SyncPipeline {
    config: CrabConfig,
    store: Arc<dyn RecordStore>,
    fetcher: DatasetFetcher,
    converter: Box<dyn ShapefileConverter>,
    trace: Arc<dyn TraceSink>,
}

impl SyncPipeline {
    pub fn new(config: CrabConfig, store: Arc<dyn RecordStore>) -> anyhow::Result<Self> {
        let fetcher = DatasetFetcher::new(FetcherConfig {
            url: config.dataset_url.clone(),
            archive_name: config.archive_name.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        })
        .context("building dataset fetcher")?;
        let converter = Ogr2OgrConverter::new(config.ogr2ogr_path.clone());
        Ok(Self {
            config,
            store,
            fetcher,
            converter: Box::new(converter),
            trace: Arc::new(TracingSink),
        })
    }

    pub fn with_converter(mut self, converter: Box<dyn ShapefileConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let mut fetcher_config = self.fetcher.config().clone();
        fetcher_config.backoff = backoff;
        self.fetcher = DatasetFetcher::new(fetcher_config).context("building dataset fetcher")?;
        Ok(self)
    }

    pub fn config(&self) -> &CrabConfig {
        &self.config
    }

    /// The time budget is accepted but not enforced; a run always completes.
    pub async fn process(&self, time_budget: Option<Duration>) -> Result<RunSummary, SyncError> {
        if let Some(budget) = time_budget {
            info!(?budget, "time budget is not enforced; the import runs to completion");
        }
        self.trace.trace("Processing Crab...");
        self.run_once().await
    }

    /// The working directory is removed on every exit path once the run lock
    /// is held.
    pub async fn run_once(&self) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("crab_sync", %run_id);
        self.locked(self.run_stages(run_id, started_at))
            .instrument(span)
            .await
    }

    pub async fn import_geojson(&self, geojson: &Path) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("crab_import", %run_id, path = %geojson.display());
        self.locked(self.import(run_id, started_at, geojson))
            .instrument(span)
            .await
    }

    async fn locked<F>(&self, run: F) -> Result<RunSummary, SyncError>
    where
        F: Future<Output = Result<RunSummary, SyncError>>,
    {
        let Some(lock) = RunLock::acquire(&*self.store).await? else {
            let err = SyncError::RunInProgress;
            self.trace.trace(&format!("CRAB sync not started: {err}"));
            warn!("{err}");
            return Err(err);
        };

        // Dropping this future mid-run abandons the lock through the guard.
        let result = run.await;

        if let Err(err) = lock.release().await {
            warn!(error = %err, "failed to release CRAB run lock");
        }
        if let Err(err) = &result {
            self.trace.trace(&format!("CRAB sync failed: {err}"));
            error!(error = %err, "CRAB sync failed");
        }
        result
    }

    async fn run_stages(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<RunSummary, SyncError> {
        let filter = RowFilter::parse(&self.config.shapefile_query)?;
        let workdir = WorkDir::new(&self.config.download_dir).cleanup_on_drop();

        if self.config.download_enabled {
            self.fetcher
                .download_dataset(&workdir, &*self.trace)
                .await?;
        } else {
            self.trace.trace(&format!(
                "Download disabled; using shapefile in {}",
                workdir.root().display()
            ));
            workdir.ensure().map_err(|source| SyncError::WorkDir {
                path: workdir.root().to_path_buf(),
                source,
            })?;
        }

        let geojson = self
            .converter
            .convert_to_geojson(
                &self.config.shapefile(),
                &self.config.geojson_output(),
                &filter,
                &*self.trace,
            )
            .await?;

        let summary = self.import(run_id, started_at, &geojson).await?;

        drop(workdir);
        self.trace
            .trace("Cleaned up download directory (all geodata including converted GeoJSON).");
        Ok(summary)
    }

    async fn import(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        geojson: &Path,
    ) -> Result<RunSummary, SyncError> {
        let store = &*self.store;
        let trace = &*self.trace;
        self.trace.trace(&format!("Processing GeoJSON {}", geojson.display()));

        let mut indexes = build_indexes(store, trace).await?;
        let mut tally = RunTally::default();

        let FeatureStream {
            mut features,
            reader,
        } = stream_features(geojson, self.config.feature_buffer);

        let mut position = 0usize;
        let reconciled: Result<(), SyncError> = async {
            while let Some(raw) = features.recv().await {
                position += 1;
                if position == 1 {
                    let (mapped, unmapped) = describe_properties(&raw);
                    trace.trace(&format!("Mapped properties: {}", mapped.join(", ")));
                    trace.trace(&format!("Unmapped properties: {}", unmapped.join(", ")));
                }
                let feature = match Feature::from_raw(position, raw) {
                    Ok(feature) => feature,
                    Err(err) => match self.config.on_malformed_feature {
                        MalformedFeaturePolicy::Fail => return Err(err.into()),
                        MalformedFeaturePolicy::Skip => {
                            warn!(error = %err, "skipping malformed feature");
                            tally.record_skipped();
                            continue;
                        }
                    },
                };
                let outcome = reconcile_feature(store, &mut indexes, &feature, trace).await?;
                tally.record(&outcome);
            }
            Ok(())
        }
        .await;

        drop(features);
        let read = FeatureStream::finish(reader).await;
        reconciled?;
        let total = read?;
        info!(features = total, "GeoJSON fully read");

        finalize(store, &indexes, tally, run_id, started_at, trace).await
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.process(None).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        writes = summary.write_count(),
                        "scheduled CRAB sync finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled CRAB sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once(config: CrabConfig) -> anyhow::Result<RunSummary> {
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let pipeline = SyncPipeline::new(config, Arc::new(store))?;
    Ok(pipeline.process(None).await?)
}
