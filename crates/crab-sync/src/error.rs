use std::path::PathBuf;

use crab_core::StoreError;
use crab_geo::{ConvertError, FeatureError, ReadError};
use crab_storage::FetchError;
use thiserror::Error;

use crate::config::ConfigError;

/// Everything that can end a sync run. Each stage keeps its own error type;
/// this enum only aggregates them.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("another CRAB sync run is already in progress")]
    RunInProgress,

    #[error("preparing working directory {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("malformed feature: {0}")]
    MalformedFeature(#[from] FeatureError),

    #[error("address {address_crab_id} refers to street {street_crab_id}, which could not be resolved")]
    UnresolvedStreet {
        address_crab_id: String,
        street_crab_id: String,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}
