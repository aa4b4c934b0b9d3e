use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("opening archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading archive {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("unable to unzip file to directory {target}: {source}")]
    Extract {
        target: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Extracts every entry of `archive` below `target`. Entries whose names
/// would escape `target` are rejected by the zip reader.
pub fn extract_archive_blocking(archive: &Path, target: &Path) -> Result<usize, ArchiveError> {
    let file = File::open(archive).map_err(|source| ArchiveError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = ZipArchive::new(file).map_err(|source| ArchiveError::Corrupt {
        path: archive.to_path_buf(),
        source,
    })?;
    let entries = zip.len();
    zip.extract(target).map_err(|source| ArchiveError::Extract {
        target: target.to_path_buf(),
        source,
    })?;
    debug!(entries, target = %target.display(), "archive extracted");
    Ok(entries)
}

pub async fn extract_archive(archive: &Path, target: &Path) -> Result<usize, ArchiveError> {
    let archive = archive.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive_blocking(&archive, &target))
        .await
        .map_err(|err| ArchiveError::Task(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn extracts_nested_entries() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("crab.zip");
        {
            let mut writer = zip::ZipWriter::new(File::create(&archive).unwrap());
            writer
                .start_file("Shapefile/CrabAdr.shp", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"shp").unwrap();
            writer.finish().unwrap();
        }

        let out = dir.path().join("out");
        let entries = extract_archive_blocking(&archive, &out).unwrap();

        assert_eq!(entries, 1);
        assert_eq!(std::fs::read(out.join("Shapefile/CrabAdr.shp")).unwrap(), b"shp");
    }

    #[test]
    fn missing_archive_fails_to_open() {
        let dir = tempdir().unwrap();
        let err = extract_archive_blocking(&dir.path().join("absent.zip"), dir.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }));
    }
}
