//! Shapefile → GeoJSON conversion and incremental GeoJSON feature reading.

pub mod convert;
pub mod features;

pub use convert::{
    ConvertError, Ogr2OgrConverter, RowFilter, ShapefileConverter, SOURCE_SRS, TARGET_SRS,
};
pub use features::{
    describe_properties, stream_features, Feature, FeatureError, FeatureStream, RawFeature,
    ReadError, ADDRESS_PROPERTY_MAPPING, CITY_PROPERTY, STREET_NAME_PROPERTY,
};

pub const CRATE_NAME: &str = "crab-geo";
