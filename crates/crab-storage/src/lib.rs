//! Working-directory management and dataset download for the CRAB sync.

use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use crab_core::TraceSink;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod archive;

pub use archive::{extract_archive, extract_archive_blocking, ArchiveError};

pub const CRATE_NAME: &str = "crab-storage";

pub const DEFAULT_DATASET_URL: &str =
    "https://downloadagiv.blob.core.windows.net/crab-adressenlijst/Shapefile/CRAB_Adressenlijst_Shapefile.zip";
pub const DEFAULT_ARCHIVE_NAME: &str = "CRAB_Adressenlijst_Shapefile.zip";

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn reset(&self) -> io::Result<()> {
        self.remove()?;
        create_restricted_dir(&self.root)
    }

    pub fn ensure(&self) -> io::Result<()> {
        if self.root.is_dir() {
            return Ok(());
        }
        create_restricted_dir(&self.root)
    }

    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn cleanup_on_drop(self) -> WorkDirGuard {
        WorkDirGuard { dir: self }
    }
}

/// Removes the working directory on every exit path, including errors and
/// panics unwinding through the run.
#[derive(Debug)]
pub struct WorkDirGuard {
    dir: WorkDir,
}

impl Deref for WorkDirGuard {
    type Target = WorkDir;

    fn deref(&self) -> &WorkDir {
        &self.dir
    }
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        match self.dir.remove() {
            Ok(()) => info!(dir = %self.dir.root.display(), "removed working directory"),
            Err(err) => warn!(
                dir = %self.dir.root.display(),
                error = %err,
                "failed to remove working directory"
            ),
        }
    }
}

#[cfg(unix)]
fn create_restricted_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)
}

#[cfg(not(unix))]
fn create_restricted_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub url: String,
    pub archive_name: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATASET_URL.to_string(),
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
            timeout: Duration::from_secs(1800),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> DownloadError + '_ {
        move |source| DownloadError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Request(err) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            DownloadError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            DownloadError::Io { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub final_url: String,
    pub byte_size: u64,
    pub sha256: String,
}

#[derive(Debug)]
pub struct DatasetFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl DatasetFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub async fn download_dataset(
        &self,
        workdir: &WorkDir,
        trace: &dyn TraceSink,
    ) -> Result<PathBuf, FetchError> {
        workdir.reset().map_err(DownloadError::io(workdir.root()))?;

        let target = workdir.path(&self.config.archive_name);
        trace.trace("Downloading file...");
        trace.trace(&format!(". From {}", self.config.url));
        trace.trace(&format!(". To {}", target.display()));

        let downloaded = self.download_to(&self.config.url, &target).await?;
        trace.trace(&format!(
            "Downloaded {} bytes from {} (sha256 {})",
            downloaded.byte_size, downloaded.final_url, downloaded.sha256
        ));

        trace.trace("Unzipping file...");
        let entries = extract_archive(&target, workdir.root()).await?;
        trace.trace(&format!(
            "Extracted {entries} entries to {}",
            workdir.root().display()
        ));

        Ok(target)
    }

    /// Streams `url` into `dest`, following redirects and retrying transient
    /// failures. The body lands in a temp file that is renamed on success.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<DownloadedFile, DownloadError> {
        let span = info_span!("dataset_download", url, dest = %dest.display());
        async {
            let mut attempt = 0usize;
            loop {
                match self.try_download(url, dest).await {
                    Ok(file) => return Ok(file),
                    Err(err) if err.is_retryable() && attempt < self.config.backoff.max_retries => {
                        let delay = self.config.backoff.delay_for_attempt(attempt);
                        warn!(attempt, error = %err, ?delay, "download failed, retrying");
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_download(&self, url: &str, dest: &Path) -> Result<DownloadedFile, DownloadError> {
        let mut resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.part", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(DownloadError::io(&temp_path))?;

        let mut hasher = Sha256::new();
        let mut byte_size = 0u64;
        let streamed: Result<(), DownloadError> = async {
            while let Some(chunk) = resp.chunk().await? {
                hasher.update(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(DownloadError::io(&temp_path))?;
                byte_size += chunk.len() as u64;
            }
            file.flush().await.map_err(DownloadError::io(&temp_path))
        }
        .await;
        drop(file);

        if let Err(err) = streamed {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, dest).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DownloadError::Io {
                path: dest.to_path_buf(),
                source: err,
            });
        }

        info!(bytes = byte_size, %final_url, "download complete");
        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            final_url,
            byte_size,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}
