//! Model downloads with normalized progress reporting
//!
//! The `Downloader` drives an `AssetFetcher` file by file and turns raw byte
//! counts into `DownloadProgress` events: a fraction in `[0, 1]` plus a human
//! readable message. Within one download the fraction never decreases, stays
//! at or below 0.99 while files are still arriving, and ends with exactly one
//! 1.0 event once everything is on disk.
//!
//! Failures are not retried; the first fetch error ends the download.

use crate::error::{ModelError, Result};
use crate::store::{ModelStore, PARTIAL_SUFFIX};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum spacing between byte-level progress events
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Highest fraction reported before the download has fully completed
const MAX_PENDING_FRACTION: f64 = 0.99;

const BYTES_PER_GB: f64 = 1e9;

/// One progress event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub fraction: f64,
    pub message: String,
}

/// A file in a remote model repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub size: Option<u64>,
}

/// Source of model files
pub trait AssetFetcher: Send + Sync {
    /// List every file of the repository with its size, when known
    fn list_files(&self, repo_id: &str) -> Result<Vec<RemoteFile>>;

    /// Fetch one file to `dest`, calling `on_bytes` with each chunk length
    fn fetch_file(
        &self,
        repo_id: &str,
        file: &RemoteFile,
        dest: &Path,
        on_bytes: &mut dyn FnMut(u64),
    ) -> Result<()>;
}

/// Wording used in progress messages
#[derive(Debug, Clone, Copy)]
pub struct ProgressLabels {
    pub fetching_info: &'static str,
    pub downloading: &'static str,
    pub complete: &'static str,
}

pub const MODEL_LABELS: ProgressLabels = ProgressLabels {
    fetching_info: "Fetching model info...",
    downloading: "Downloading...",
    complete: "Download complete",
};

pub const TTS_LABELS: ProgressLabels = ProgressLabels {
    fetching_info: "Fetching TTS model info...",
    downloading: "Downloading TTS...",
    complete: "TTS model download complete",
};

/// Enforces the progress contract on top of a caller's callback
struct ProgressReporter<'a> {
    sink: &'a mut dyn FnMut(DownloadProgress),
    labels: ProgressLabels,
    last_fraction: f64,
    last_report: Option<Instant>,
    interval: Duration,
}

impl<'a> ProgressReporter<'a> {
    fn emit(&mut self, fraction: f64, message: String) {
        let fraction = fraction.clamp(0.0, 1.0).max(self.last_fraction);
        self.last_fraction = fraction;
        self.last_report = Some(Instant::now());
        (self.sink)(DownloadProgress { fraction, message });
    }

    fn transferred(&mut self, done: u64, total: u64) {
        let fraction = (done as f64 / total as f64).min(MAX_PENDING_FRACTION);
        let message = format!(
            "{} {:.1}/{:.1} GB",
            self.labels.downloading,
            done as f64 / BYTES_PER_GB,
            total as f64 / BYTES_PER_GB
        );
        self.emit(fraction, message);
    }

    fn transferred_throttled(&mut self, done: u64, total: u64) {
        let due = self
            .last_report
            .map(|at| at.elapsed() >= self.interval)
            .unwrap_or(true);
        if due {
            self.transferred(done, total);
        }
    }
}

/// Download orchestrator
pub struct Downloader {
    fetcher: Arc<dyn AssetFetcher>,
    store: ModelStore,
    report_interval: Duration,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn AssetFetcher>, store: ModelStore) -> Self {
        Self {
            fetcher,
            store,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    /// Override the byte-level reporting interval
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Fetch every file of `repo_id` into the store
    ///
    /// Returns the local directory holding the repository.
    pub fn download(
        &self,
        repo_id: &str,
        labels: ProgressLabels,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<PathBuf> {
        let mut reporter = ProgressReporter {
            sink: on_progress,
            labels,
            last_fraction: 0.0,
            last_report: None,
            interval: self.report_interval,
        };
        reporter.emit(0.0, labels.fetching_info.to_string());

        let files = self.fetcher.list_files(repo_id)?;
        let total: u64 = files.iter().filter_map(|f| f.size).sum();
        tracing::info!(
            "Downloading {} ({} files, {:.1} GB)",
            repo_id,
            files.len(),
            total as f64 / BYTES_PER_GB
        );

        if let Some(file) = files.iter().find(|f| !is_contained(&f.name)) {
            return Err(ModelError::DownloadFailure(format!(
                "{}: refusing file name outside the repository: {}",
                repo_id, file.name
            )));
        }

        let dir = self.store.repo_dir(repo_id);
        fs::create_dir_all(&dir).map_err(|e| local_failure(&dir, e))?;

        let mut completed: u64 = 0;
        for file in &files {
            let dest = dir.join(&file.name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| local_failure(parent, e))?;
            }

            if total > 0 {
                let mut file_bytes: u64 = 0;
                let mut on_bytes = |n: u64| {
                    file_bytes += n;
                    reporter.transferred_throttled(completed + file_bytes, total);
                };
                self.fetcher.fetch_file(repo_id, file, &dest, &mut on_bytes)?;
                if let Some(size) = file.size {
                    completed += size;
                    reporter.transferred(completed, total);
                }
            } else {
                self.fetcher.fetch_file(repo_id, file, &dest, &mut |_| {})?;
            }
            tracing::debug!("Fetched {}/{}", repo_id, file.name);
        }

        reporter.emit(1.0, labels.complete.to_string());
        Ok(dir)
    }
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Fetches model repositories from a Hugging Face compatible hub
pub struct HubFetcher {
    endpoint: String,
    agent: ureq::Agent,
    metadata_timeout: Duration,
}

impl HubFetcher {
    pub fn new(endpoint: impl Into<String>, metadata_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().build(),
            metadata_timeout,
        }
    }

    fn file_url(&self, repo_id: &str, name: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.endpoint, repo_id, name)
    }
}

impl AssetFetcher for HubFetcher {
    fn list_files(&self, repo_id: &str) -> Result<Vec<RemoteFile>> {
        let url = format!("{}/api/models/{}?blobs=true", self.endpoint, repo_id);
        let info: RepoInfo = self
            .agent
            .get(&url)
            .timeout(self.metadata_timeout)
            .call()
            .map_err(|e| ModelError::DownloadFailure(format!("{}: {}", repo_id, e)))?
            .into_json()
            .map_err(|e| ModelError::DownloadFailure(format!("{}: bad metadata: {}", repo_id, e)))?;

        Ok(info
            .siblings
            .into_iter()
            .map(|s| RemoteFile {
                name: s.rfilename,
                size: s.size,
            })
            .collect())
    }

    fn fetch_file(
        &self,
        repo_id: &str,
        file: &RemoteFile,
        dest: &Path,
        on_bytes: &mut dyn FnMut(u64),
    ) -> Result<()> {
        if let (Some(size), Ok(meta)) = (file.size, fs::metadata(dest)) {
            if meta.is_file() && meta.len() == size {
                tracing::debug!("{} already present, skipping", dest.display());
                return Ok(());
            }
        }

        let url = self.file_url(repo_id, &file.name);
        let partial = partial_path(dest);
        let result = (|| -> Result<()> {
            let response = self
                .agent
                .get(&url)
                .call()
                .map_err(|e| ModelError::DownloadFailure(format!("{}: {}", url, e)))?;
            let mut reader = response.into_reader();
            let mut out = fs::File::create(&partial).map_err(|e| local_failure(&partial, e))?;
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                let n = reader
                    .read(&mut buffer)
                    .map_err(|e| ModelError::DownloadFailure(format!("{}: read failed: {}", url, e)))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buffer[..n])
                    .map_err(|e| local_failure(&partial, e))?;
                on_bytes(n as u64);
            }
            out.flush().map_err(|e| local_failure(&partial, e))?;
            drop(out);
            fs::rename(&partial, dest).map_err(|e| local_failure(dest, e))?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}

/// Relative path made only of normal components
fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn local_failure(path: &Path, err: std::io::Error) -> ModelError {
    ModelError::DownloadFailure(format!("{}: {}", path.display(), err))
}

/// `<dest>.part`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
