//! `ogr2ogr` invocation: reprojects the CRAB shapefile from Belgian Lambert 72
//! to Web Mercator and writes GeoJSON.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use crab_core::TraceSink;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// EPSG:31370 spelled out; the short code is not registered everywhere.
pub const SOURCE_SRS: &str = "+proj=lcc +lat_1=51.16666723333333 +lat_2=49.8333339 +lat_0=90 +lon_0=4.367486666666666 +x_0=150000.013 +y_0=5400088.438 +ellps=intl +towgs84=-106.8686,52.2978,-103.7239,0.3366,-0.457,1.8422,-1.2747 +units=m +no_defs";

/// EPSG:3857 spelled out.
pub const TARGET_SRS: &str = "+proj=merc +a=6378137 +b=6378137 +lat_ts=0.0 +lon_0=0.0 +x_0=0.0 +y_0=0 +k=1.0 +units=m +nadgrids=@null +wktext +no_defs";

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("conversion tool {program} is unavailable: {reason}")]
    ToolUnavailable { program: String, reason: String },

    #[error("no shapefile found at {}", path.display())]
    InputMissing { path: PathBuf },

    #[error("unable to convert shapefile to GeoJSON ({status}): {stderr}")]
    Conversion { status: String, stderr: String },

    #[error("invalid row filter: {0}")]
    InvalidFilter(String),

    #[error("preparing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Optional OGR SQL row selection. Only one plain `SELECT` without control
/// characters is accepted; it reaches `ogr2ogr` as a single argv entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter(Option<String>);

impl RowFilter {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn parse(raw: &str) -> Result<Self, ConvertError> {
        let sql = raw.trim();
        if sql.is_empty() {
            return Ok(Self(None));
        }
        if sql.chars().any(char::is_control) {
            return Err(ConvertError::InvalidFilter(
                "control characters are not allowed".to_string(),
            ));
        }
        if sql.contains(';') {
            return Err(ConvertError::InvalidFilter(
                "only a single statement is allowed".to_string(),
            ));
        }
        let starts_with_select = sql
            .get(..7)
            .map(|head| head.eq_ignore_ascii_case("select "))
            .unwrap_or(false);
        if !starts_with_select {
            return Err(ConvertError::InvalidFilter(
                "the filter must be a SELECT statement".to_string(),
            ));
        }
        Ok(Self(Some(sql.to_string())))
    }

    pub fn as_sql(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

#[async_trait]
pub trait ShapefileConverter: Send + Sync {
    async fn convert_to_geojson(
        &self,
        shapefile: &Path,
        output: &Path,
        filter: &RowFilter,
        trace: &dyn TraceSink,
    ) -> Result<PathBuf, ConvertError>;
}

#[derive(Debug, Clone)]
pub struct Ogr2OgrConverter {
    program: Option<PathBuf>,
}

impl Ogr2OgrConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            program: (!program.as_os_str().is_empty()).then_some(program),
        }
    }

    pub fn disabled() -> Self {
        Self { program: None }
    }

    pub fn build_args(shapefile: &Path, output: &Path, filter: &RowFilter) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            "GeoJSON".into(),
            output.as_os_str().to_owned(),
            shapefile.as_os_str().to_owned(),
            "-s_srs".into(),
            SOURCE_SRS.into(),
            "-t_srs".into(),
            TARGET_SRS.into(),
        ];
        if let Some(sql) = filter.as_sql() {
            args.push("-sql".into());
            args.push(sql.into());
        }
        args
    }
}

impl Default for Ogr2OgrConverter {
    fn default() -> Self {
        Self::new("ogr2ogr")
    }
}

#[async_trait]
impl ShapefileConverter for Ogr2OgrConverter {
    async fn convert_to_geojson(
        &self,
        shapefile: &Path,
        output: &Path,
        filter: &RowFilter,
        trace: &dyn TraceSink,
    ) -> Result<PathBuf, ConvertError> {
        let Some(program) = &self.program else {
            return Err(ConvertError::ToolUnavailable {
                program: "ogr2ogr".to_string(),
                reason: "disabled by configuration".to_string(),
            });
        };

        if !shapefile.is_file() {
            return Err(ConvertError::InputMissing {
                path: shapefile.to_path_buf(),
            });
        }

        match tokio::fs::remove_file(output).await {
            Ok(()) => debug!(output = %output.display(), "removed previous conversion output"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ConvertError::Io {
                    path: output.to_path_buf(),
                    source,
                })
            }
        }

        trace.trace(&format!(
            "Reprojecting dataset to EPSG:3857 and applying this filter: {}",
            filter.as_sql().unwrap_or("(none)")
        ));

        let args = Self::build_args(shapefile, output, filter);
        info!(program = %program.display(), ?args, "running ogr2ogr");
        let result = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ConvertError::ToolUnavailable {
                program: program.display().to_string(),
                reason: err.to_string(),
            })?;

        let stderr = stderr_tail(&result.stderr);
        if !result.status.success() || !output.is_file() {
            return Err(ConvertError::Conversion {
                status: result.status.to_string(),
                stderr: if stderr.is_empty() {
                    "no output file was written".to_string()
                } else {
                    stderr
                },
            });
        }

        debug!(stderr = %stderr, "ogr2ogr finished");
        Ok(output.to_path_buf())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crab_core::MemorySink;
    use tempfile::tempdir;

    #[test]
    fn empty_filter_means_no_sql_argument() {
        let filter = RowFilter::parse("   ").unwrap();
        assert!(filter.is_empty());
        let args = Ogr2OgrConverter::build_args(
            Path::new("/w/Shapefile/CrabAdr.shp"),
            Path::new("/w/output.geojson"),
            &filter,
        );
        assert_eq!(args.len(), 8);
        assert_eq!(args[0], "-f");
        assert_eq!(args[2], "/w/output.geojson");
        assert_eq!(args[3], "/w/Shapefile/CrabAdr.shp");
        assert_eq!(args[5], SOURCE_SRS);
        assert_eq!(args[7], TARGET_SRS);
    }

    #[test]
    fn filter_is_passed_as_a_single_argument() {
        let sql = r#"SELECT * FROM CrabAdr WHERE GEMEENTE = "Izegem" ORDER BY STRAATNM"#;
        let filter = RowFilter::parse(sql).unwrap();
        let args = Ogr2OgrConverter::build_args(Path::new("in.shp"), Path::new("out.geojson"), &filter);
        assert_eq!(args[8], "-sql");
        assert_eq!(args[9], sql);
    }

    #[test]
    fn rejects_suspicious_filters() {
        for bad in [
            "DROP TABLE CrabAdr",
            "SELECT * FROM CrabAdr; DELETE FROM CrabAdr",
            "SELECT * FROM CrabAdr\n-- comment",
        ] {
            assert!(
                matches!(RowFilter::parse(bad), Err(ConvertError::InvalidFilter(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(RowFilter::parse("select * from CrabAdr").is_ok());
    }

    #[tokio::test]
    async fn missing_shapefile_is_reported_before_running_the_tool() {
        let dir = tempdir().unwrap();
        let err = Ogr2OgrConverter::default()
            .convert_to_geojson(
                &dir.path().join("Shapefile/CrabAdr.shp"),
                &dir.path().join("output.geojson"),
                &RowFilter::none(),
                &MemorySink::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::InputMissing { .. }));
    }

    #[tokio::test]
    async fn unknown_program_is_tool_unavailable() {
        let dir = tempdir().unwrap();
        let shp = dir.path().join("CrabAdr.shp");
        std::fs::write(&shp, b"").unwrap();
        let err = Ogr2OgrConverter::new(dir.path().join("no-such-ogr2ogr"))
            .convert_to_geojson(&shp, &dir.path().join("out.geojson"), &RowFilter::none(), &MemorySink::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::ToolUnavailable { .. }));
    }

    #[tokio::test]
    async fn disabled_converter_is_tool_unavailable() {
        let dir = tempdir().unwrap();
        let err = Ogr2OgrConverter::new("")
            .convert_to_geojson(
                &dir.path().join("CrabAdr.shp"),
                &dir.path().join("out.geojson"),
                &RowFilter::none(),
                &MemorySink::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::ToolUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_that_writes_nothing_is_a_conversion_error() {
        let dir = tempdir().unwrap();
        let shp = dir.path().join("CrabAdr.shp");
        std::fs::write(&shp, b"").unwrap();
        let out = dir.path().join("out.geojson");
        std::fs::write(&out, b"stale output from an earlier run").unwrap();

        let err = Ogr2OgrConverter::new("true")
            .convert_to_geojson(&shp, &out, &RowFilter::none(), &MemorySink::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ConvertError::Conversion { .. }));
        assert!(!out.exists(), "stale output must not be mistaken for fresh output");
    }
}
