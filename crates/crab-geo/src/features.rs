//! GeoJSON features as produced by `ogr2ogr` from the CRAB address list.
//!
//! The collection is read incrementally: a blocking task walks the
//! `features` array one element at a time and hands each feature to the
//! async side over a bounded channel, so the whole document never has to be
//! resident at once. Output order equals file order.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// GeoJSON property → address attribute. `STATUS` and `GEOM` are not in the
/// dataset; the reconciler synthesizes them.
pub const ADDRESS_PROPERTY_MAPPING: [(&str, &str); 7] = [
    ("ID", "crab_id"),
    ("STRAATNMID", "street_id"),
    ("HUISNR", "house_number"),
    ("APPTNR", "apartment_number"),
    ("BUSNR", "sub_number"),
    ("STATUS", "status"),
    ("GEOM", "geom"),
];

pub const CITY_PROPERTY: &str = "GEMEENTE";
pub const STREET_NAME_PROPERTY: &str = "STRAATNM";

const READ_BUFFER_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Deserialize)]
pub struct RawGeometry {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub coordinates: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub geometry: Option<RawGeometry>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    // 1-based
    pub index: usize,
    pub crab_id: String,
    pub street_crab_id: String,
    pub house_number: String,
    pub apartment_number: Option<String>,
    pub sub_number: Option<String>,
    pub city_name: String,
    pub street_name: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("feature {index}: missing required property {property}")]
    MissingProperty { index: usize, property: &'static str },

    #[error("feature {index}: property {property} has unsupported value {value}")]
    InvalidProperty {
        index: usize,
        property: &'static str,
        value: String,
    },

    #[error("feature {index}: invalid geometry: {reason}")]
    InvalidGeometry { index: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("opening {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("feature reader task failed: {0}")]
    Task(String),
}

impl Feature {
    pub fn from_raw(index: usize, raw: RawFeature) -> Result<Self, FeatureError> {
        let properties = raw.properties.unwrap_or_default();
        let (x, y) = coordinates(index, raw.geometry.as_ref())?;

        Ok(Self {
            index,
            crab_id: required_id(index, &properties, "ID")?,
            street_crab_id: required_id(index, &properties, "STRAATNMID")?,
            house_number: required_text(index, &properties, "HUISNR")?,
            apartment_number: optional_text(index, &properties, "APPTNR")?,
            sub_number: optional_text(index, &properties, "BUSNR")?,
            city_name: required_id(index, &properties, CITY_PROPERTY)?,
            street_name: required_id(index, &properties, STREET_NAME_PROPERTY)?,
            x,
            y,
        })
    }

    pub fn geom_wkt(&self) -> String {
        crab_core::point_wkt(self.x, self.y)
    }

    pub fn label(&self) -> String {
        format!(
            "{} {}{}{}",
            self.street_name,
            self.house_number,
            self.apartment_number.as_deref().unwrap_or_default(),
            self.sub_number.as_deref().unwrap_or_default()
        )
    }
}

pub fn describe_properties(raw: &RawFeature) -> (Vec<String>, Vec<String>) {
    let used = |key: &str| {
        key == CITY_PROPERTY
            || key == STREET_NAME_PROPERTY
            || ADDRESS_PROPERTY_MAPPING.iter().any(|(property, _)| *property == key)
    };
    let mut keys: Vec<String> = raw
        .properties
        .as_ref()
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys.into_iter().partition(|key| used(key.as_str()))
}

fn coordinates(index: usize, geometry: Option<&RawGeometry>) -> Result<(f64, f64), FeatureError> {
    let invalid = |reason: &str| FeatureError::InvalidGeometry {
        index,
        reason: reason.to_string(),
    };
    let geometry = geometry.ok_or_else(|| invalid("geometry is missing"))?;
    if let Some(kind) = &geometry.kind {
        if kind != "Point" {
            return Err(invalid(&format!("expected a Point, got {kind}")));
        }
    }
    let pair = geometry
        .coordinates
        .as_array()
        .ok_or_else(|| invalid("coordinates are not an array"))?;
    if pair.len() != 2 {
        return Err(invalid(&format!("expected 2 coordinates, got {}", pair.len())));
    }
    let x = pair[0].as_f64().filter(|v| v.is_finite());
    let y = pair[1].as_f64().filter(|v| v.is_finite());
    match (x, y) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(invalid("coordinates are not finite numbers")),
    }
}

// `12345.0` and `12345` must name the same id.
fn property_text(value: &Value) -> Option<Option<String>> {
    match value {
        Value::Null => Some(None),
        Value::String(s) => Some(Some(s.clone())),
        Value::Bool(b) => Some(Some(b.to_string())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Some(i.to_string()))
            } else if let Some(u) = n.as_u64() {
                Some(Some(u.to_string()))
            } else {
                let f = n.as_f64()?;
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(Some(format!("{}", f as i64)))
                } else {
                    Some(Some(n.to_string()))
                }
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn lookup(
    index: usize,
    properties: &Map<String, Value>,
    property: &'static str,
) -> Result<Option<String>, FeatureError> {
    let Some(value) = properties.get(property) else {
        return Err(FeatureError::MissingProperty { index, property });
    };
    property_text(value).ok_or_else(|| FeatureError::InvalidProperty {
        index,
        property,
        value: value.to_string(),
    })
}

fn required_text(
    index: usize,
    properties: &Map<String, Value>,
    property: &'static str,
) -> Result<String, FeatureError> {
    lookup(index, properties, property)?.ok_or(FeatureError::MissingProperty { index, property })
}

fn required_id(
    index: usize,
    properties: &Map<String, Value>,
    property: &'static str,
) -> Result<String, FeatureError> {
    let text = required_text(index, properties, property)?;
    if text.trim().is_empty() {
        return Err(FeatureError::MissingProperty { index, property });
    }
    Ok(text)
}

fn optional_text(
    index: usize,
    properties: &Map<String, Value>,
    property: &'static str,
) -> Result<Option<String>, FeatureError> {
    Ok(lookup(index, properties, property)?.filter(|s| !s.is_empty()))
}

pub struct FeatureStream {
    pub features: mpsc::Receiver<RawFeature>,
    pub reader: JoinHandle<Result<usize, ReadError>>,
}

impl FeatureStream {
    pub async fn finish(reader: JoinHandle<Result<usize, ReadError>>) -> Result<usize, ReadError> {
        reader
            .await
            .map_err(|err| ReadError::Task(err.to_string()))?
    }
}

/// Starts reading `path` on the blocking pool. Dropping the receiver stops
/// the reader early without an error.
pub fn stream_features(path: impl Into<PathBuf>, capacity: usize) -> FeatureStream {
    let path = path.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let reader = tokio::task::spawn_blocking(move || read_collection(&path, &tx));
    FeatureStream {
        features: rx,
        reader,
    }
}

fn read_collection(path: &Path, tx: &mpsc::Sender<RawFeature>) -> Result<usize, ReadError> {
    let file = File::open(path).map_err(|source| ReadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);
    let mut de = serde_json::Deserializer::from_reader(reader);
    let mut sent = 0usize;

    let parsed = CollectionSeed { tx, sent: &mut sent }
        .deserialize(&mut de)
        .and_then(|()| de.end());

    match parsed {
        Ok(()) => {
            debug!(features = sent, path = %path.display(), "feature collection read");
            Ok(sent)
        }
        Err(_) if tx.is_closed() => {
            debug!(features = sent, "feature consumer went away, reader stopped");
            Ok(sent)
        }
        Err(source) => Err(ReadError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

struct CollectionSeed<'a> {
    tx: &'a mpsc::Sender<RawFeature>,
    sent: &'a mut usize,
}

impl<'de> DeserializeSeed<'de> for CollectionSeed<'_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for CollectionSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a GeoJSON FeatureCollection")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let CollectionSeed { tx, sent } = self;
        let mut saw_features = false;
        while let Some(key) = map.next_key::<String>()? {
            if key == "features" {
                map.next_value_seed(FeaturesSeed {
                    tx,
                    sent: &mut *sent,
                })?;
                saw_features = true;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        if !saw_features {
            return Err(de::Error::missing_field("features"));
        }
        Ok(())
    }
}

struct FeaturesSeed<'a> {
    tx: &'a mpsc::Sender<RawFeature>,
    sent: &'a mut usize,
}

impl<'de> DeserializeSeed<'de> for FeaturesSeed<'_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for FeaturesSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of GeoJSON features")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(feature) = seq.next_element::<RawFeature>()? {
            self.tx
                .blocking_send(feature)
                .map_err(|_| de::Error::custom("feature consumer closed"))?;
            *self.sent += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn raw(value: Value) -> RawFeature {
        serde_json::from_value(value).unwrap()
    }

    fn springfield() -> Value {
        json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [4.0, 51.0] },
            "properties": {
                "ID": "A1", "STRAATNMID": "S1", "STRAATNM": "Main St",
                "GEMEENTE": "Springfield", "HUISNR": "10",
                "APPTNR": null, "BUSNR": "", "POSTCODE": 8870
            }
        })
    }

    #[test]
    fn maps_required_and_optional_properties() {
        let feature = Feature::from_raw(1, raw(springfield())).unwrap();
        assert_eq!(feature.crab_id, "A1");
        assert_eq!(feature.street_crab_id, "S1");
        assert_eq!(feature.city_name, "Springfield");
        assert_eq!(feature.street_name, "Main St");
        assert_eq!(feature.house_number, "10");
        assert_eq!(feature.apartment_number, None);
        assert_eq!(feature.sub_number, None);
        assert_eq!(feature.geom_wkt(), "POINT(4 51)");
        assert_eq!(feature.label(), "Main St 10");
    }

    #[test]
    fn numeric_ids_render_without_fraction() {
        let mut value = springfield();
        value["properties"]["ID"] = json!(1234567.0);
        value["properties"]["STRAATNMID"] = json!(42);
        let feature = Feature::from_raw(1, raw(value)).unwrap();
        assert_eq!(feature.crab_id, "1234567");
        assert_eq!(feature.street_crab_id, "42");
    }

    #[test]
    fn missing_city_is_malformed() {
        let mut value = springfield();
        value["properties"].as_object_mut().unwrap().remove("GEMEENTE");
        let err = Feature::from_raw(7, raw(value)).unwrap_err();
        assert_eq!(
            err,
            FeatureError::MissingProperty {
                index: 7,
                property: "GEMEENTE"
            }
        );
    }

    #[test]
    fn three_dimensional_points_are_rejected() {
        let mut value = springfield();
        value["geometry"]["coordinates"] = json!([4.0, 51.0, 12.0]);
        assert!(matches!(
            Feature::from_raw(1, raw(value)),
            Err(FeatureError::InvalidGeometry { index: 1, .. })
        ));
    }

    #[test]
    fn describes_mapped_and_unmapped_properties() {
        let (mapped, unmapped) = describe_properties(&raw(springfield()));
        assert_eq!(
            mapped,
            vec!["APPTNR", "BUSNR", "GEMEENTE", "HUISNR", "ID", "STRAATNM", "STRAATNMID"]
        );
        assert_eq!(unmapped, vec!["POSTCODE"]);
    }

    #[tokio::test]
    async fn streams_features_in_file_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output.geojson");
        let mut second = springfield();
        second["properties"]["ID"] = json!("A2");
        let doc = json!({
            "type": "FeatureCollection",
            "name": "CrabAdr",
            "features": [springfield(), second],
            "crs": { "type": "name" }
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let FeatureStream {
            mut features,
            reader,
        } = stream_features(&path, 1);
        let mut ids = Vec::new();
        while let Some(raw) = features.recv().await {
            ids.push(raw.properties.unwrap()["ID"].clone());
        }

        assert_eq!(FeatureStream::finish(reader).await.unwrap(), 2);
        assert_eq!(ids, vec![json!("A1"), json!("A2")]);
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_the_reader_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output.geojson");
        let doc = json!({
            "type": "FeatureCollection",
            "features": vec![springfield(); 50]
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let FeatureStream {
            mut features,
            reader,
        } = stream_features(&path, 1);
        assert!(features.recv().await.is_some());
        drop(features);

        let sent = FeatureStream::finish(reader).await.unwrap();
        assert!(sent < 50);
    }

    #[tokio::test]
    async fn truncated_document_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output.geojson");
        std::fs::write(&path, br#"{"type":"FeatureCollection","features":[{"type":"Feature""#).unwrap();

        let FeatureStream {
            mut features,
            reader,
        } = stream_features(&path, 4);
        while features.recv().await.is_some() {}

        assert!(matches!(
            FeatureStream::finish(reader).await,
            Err(ReadError::Parse { .. })
        ));
    }
}
