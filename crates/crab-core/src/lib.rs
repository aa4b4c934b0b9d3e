//! Core domain model for the CRAB address sync: cities, streets, addresses,
//! their status codes, and the storage/trace seams the pipeline talks to.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod fingerprint;
pub mod memory;
pub mod store;
pub mod trace;

pub use fingerprint::fingerprint_excluding;
pub use memory::{MemoryRecordStore, WriteStats};
pub use store::{RecordStore, RunLock, StoreError};
pub use trace::{MemorySink, TraceSink, TracingSink};

pub const CRATE_NAME: &str = "crab-core";

pub type RecordId = i64;

/// CRAB status codes. `NotFound` is not an official CRAB status: it marks
/// addresses that were absent from the most recent import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum CrabStatus {
    Proposed,
    Reserved,
    InUse,
    NoLongerInUse,
    NotFound,
}

impl CrabStatus {
    pub fn code(self) -> i16 {
        match self {
            CrabStatus::Proposed => 1,
            CrabStatus::Reserved => 2,
            CrabStatus::InUse => 3,
            CrabStatus::NoLongerInUse => 4,
            CrabStatus::NotFound => 99,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(CrabStatus::Proposed),
            2 => Some(CrabStatus::Reserved),
            3 => Some(CrabStatus::InUse),
            4 => Some(CrabStatus::NoLongerInUse),
            99 => Some(CrabStatus::NotFound),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CrabStatus::Proposed => "proposed",
            CrabStatus::Reserved => "reserved",
            CrabStatus::InUse => "in_use",
            CrabStatus::NoLongerInUse => "no_longer_in_use",
            CrabStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for CrabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CrabStatus> for i16 {
    fn from(status: CrabStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i16> for CrabStatus {
    type Error = UnknownStatus;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(UnknownStatus(code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown CRAB status code {0}")]
pub struct UnknownStatus(pub i16);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub id: RecordId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCity {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStreet {
    pub name: String,
    pub crab_id: String,
    pub city_id: RecordId,
    pub status: CrabStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Street {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: NewStreet,
}

impl Street {
    pub fn crab_id(&self) -> &str {
        &self.fields.crab_id
    }
}

/// `street_id` is the internal street id, never the street's `crab_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFields {
    pub crab_id: String,
    pub street_id: RecordId,
    pub house_number: String,
    pub apartment_number: Option<String>,
    pub sub_number: Option<String>,
    pub status: CrabStatus,
    pub geom: String,
}

impl AddressFields {
    pub fn fingerprint(&self) -> String {
        fingerprint_excluding(self, &["id"])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: AddressFields,
}

impl Address {
    pub fn crab_id(&self) -> &str {
        &self.fields.crab_id
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_excluding(self, &["id"])
    }
}

pub fn point_wkt(x: f64, y: f64) -> String {
    format!("POINT({x} {y})")
}
