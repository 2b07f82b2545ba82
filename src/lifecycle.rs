//! Per-model lifecycle state machine
//!
//! ```text
//! NotDownloaded --download ok--> Downloaded --load ok--> Ready
//!       |                            |                    |
//!       +--download err--> Error <---+--load err          +--switch away--> Downloaded
//! Error --download retry--> Downloading
//! any   --integrity check fails on load--> NotDownloaded
//! ```
//!
//! `Downloading` and `Loading` are transient: whoever enters one must leave
//! it through `finish_download`/`mark_ready` or `fail`. The error message
//! lives inside the `Error` phase, so it exists exactly when the status is
//! `Error`.

use crate::catalog::CatalogEntry;
use crate::error::{ModelError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Externally visible model status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotDownloaded,
    Downloading,
    Downloaded,
    Loading,
    Ready,
    Error,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::NotDownloaded => "not_downloaded",
            ModelStatus::Downloading => "downloading",
            ModelStatus::Downloaded => "downloaded",
            ModelStatus::Loading => "loading",
            ModelStatus::Ready => "ready",
            ModelStatus::Error => "error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ModelStatus::Downloading | ModelStatus::Loading)
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    NotDownloaded,
    Downloading,
    Downloaded,
    Loading,
    Ready,
    Error(String),
}

/// Whether a model in `Error` may be loaded again without re-downloading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecovery {
    /// Only a fresh download leaves `Error`
    RequireDownload,
    /// A load retry is allowed as long as local assets are still known
    AllowReload,
}

/// Lifecycle state of a single model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelState {
    phase: Phase,
    local_path: Option<PathBuf>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self::not_downloaded()
    }
}

impl ModelState {
    pub fn not_downloaded() -> Self {
        Self {
            phase: Phase::NotDownloaded,
            local_path: None,
        }
    }

    /// State for a model found complete on disk at startup
    pub fn downloaded(path: PathBuf) -> Self {
        Self {
            phase: Phase::Downloaded,
            local_path: Some(path),
        }
    }

    pub fn status(&self) -> ModelStatus {
        match self.phase {
            Phase::NotDownloaded => ModelStatus::NotDownloaded,
            Phase::Downloading => ModelStatus::Downloading,
            Phase::Downloaded => ModelStatus::Downloaded,
            Phase::Loading => ModelStatus::Loading,
            Phase::Ready => ModelStatus::Ready,
            Phase::Error(_) => ModelStatus::Error,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            Phase::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    /// Enter `Downloading`
    ///
    /// Rejected while another transient operation is in flight.
    pub fn begin_download(&mut self) -> Result<()> {
        if self.status().is_transient() {
            return Err(ModelError::InvalidState(format!(
                "Model is busy ({})",
                self.status()
            )));
        }
        self.phase = Phase::Downloading;
        Ok(())
    }

    /// Leave `Downloading` with the completed snapshot
    pub fn finish_download(&mut self, path: PathBuf) {
        self.phase = Phase::Downloaded;
        self.local_path = Some(path);
    }

    /// Enter `Loading`, returning the local path to load from
    pub fn begin_load(&mut self, recovery: ErrorRecovery) -> Result<PathBuf> {
        let loadable = match &self.phase {
            Phase::Downloaded | Phase::Ready => true,
            Phase::Error(_) => recovery == ErrorRecovery::AllowReload,
            _ => false,
        };
        let path = match (&self.local_path, loadable) {
            (Some(path), true) => path.clone(),
            _ => {
                return Err(ModelError::InvalidState(
                    "Model is not downloaded yet".to_string(),
                ))
            }
        };
        self.phase = Phase::Loading;
        Ok(path)
    }

    /// Leave `Loading` successfully
    pub fn mark_ready(&mut self) {
        self.phase = Phase::Ready;
    }

    /// The worker backing this model was stopped
    ///
    /// `Ready` and `Loading` fall back to `Downloaded`; other phases are kept.
    pub fn demote(&mut self) {
        if matches!(self.phase, Phase::Ready | Phase::Loading) {
            self.phase = Phase::Downloaded;
        }
    }

    /// Record a failure; an empty message is replaced so `Error` always
    /// carries text
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            message
        };
        self.phase = Phase::Error(message);
    }

    /// Local assets are gone or incomplete: forget them
    pub fn invalidate(&mut self) {
        self.phase = Phase::NotDownloaded;
        self.local_path = None;
    }
}

/// Catalog entry joined with its live state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    pub repo_id: String,
    pub ram_gb: u32,
    pub description: String,
    pub status: ModelStatus,
    pub error: Option<String>,
    pub local_path: Option<PathBuf>,
}

impl ModelRecord {
    pub fn new(entry: &CatalogEntry, state: &ModelState) -> Self {
        Self {
            id: entry.id.to_string(),
            name: entry.name.to_string(),
            repo_id: entry.repo_id.to_string(),
            ram_gb: entry.ram_gb,
            description: entry.description.to_string(),
            status: state.status(),
            error: state.error().map(str::to_string),
            local_path: state.local_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_then_load_path() {
        let mut state = ModelState::not_downloaded();
        assert_eq!(state.status(), ModelStatus::NotDownloaded);
        assert!(state.begin_load(ErrorRecovery::RequireDownload).is_err());

        state.begin_download().unwrap();
        assert_eq!(state.status(), ModelStatus::Downloading);
        state.finish_download(PathBuf::from("/models/4b"));
        assert_eq!(state.status(), ModelStatus::Downloaded);

        let path = state.begin_load(ErrorRecovery::RequireDownload).unwrap();
        assert_eq!(path, PathBuf::from("/models/4b"));
        assert_eq!(state.status(), ModelStatus::Loading);
        state.mark_ready();
        assert_eq!(state.status(), ModelStatus::Ready);

        // Reload of a ready model is allowed
        assert!(state.begin_load(ErrorRecovery::RequireDownload).is_ok());
    }

    #[test]
    fn test_error_carries_message_and_clears() {
        let mut state = ModelState::downloaded(PathBuf::from("/m"));
        state.fail("");
        assert_eq!(state.status(), ModelStatus::Error);
        assert_eq!(state.error(), Some("Unknown error"));

        state.begin_download().unwrap();
        assert_eq!(state.error(), None);
        state.fail("connection reset");
        assert_eq!(state.error(), Some("connection reset"));
    }

    #[test]
    fn test_error_recovery_policy() {
        let mut state = ModelState::downloaded(PathBuf::from("/m"));
        state.fail("load failed");
        assert!(matches!(
            state.begin_load(ErrorRecovery::RequireDownload),
            Err(ModelError::InvalidState(_))
        ));
        assert_eq!(state.status(), ModelStatus::Error);

        assert!(state.begin_load(ErrorRecovery::AllowReload).is_ok());
        assert_eq!(state.status(), ModelStatus::Loading);

        // Without local assets even a reload-tolerant caller is refused
        let mut state = ModelState::not_downloaded();
        state.fail("download failed");
        assert!(state.begin_load(ErrorRecovery::AllowReload).is_err());
    }

    #[test]
    fn test_transient_states_reject_new_download() {
        let mut state = ModelState::not_downloaded();
        state.begin_download().unwrap();
        assert!(state.begin_download().is_err());

        let mut state = ModelState::downloaded(PathBuf::from("/m"));
        state.begin_load(ErrorRecovery::RequireDownload).unwrap();
        assert!(state.begin_download().is_err());
    }

    #[test]
    fn test_demote_and_invalidate() {
        let mut state = ModelState::downloaded(PathBuf::from("/m"));
        state.begin_load(ErrorRecovery::RequireDownload).unwrap();
        state.mark_ready();
        state.demote();
        assert_eq!(state.status(), ModelStatus::Downloaded);
        assert_eq!(state.local_path(), Some(Path::new("/m")));

        state.fail("boom");
        state.demote();
        assert_eq!(state.status(), ModelStatus::Error);

        state.invalidate();
        assert_eq!(state.status(), ModelStatus::NotDownloaded);
        assert_eq!(state.local_path(), None);
        assert_eq!(state.error(), None);
    }

    #[test]
    fn test_record_joins_catalog_and_state() {
        let entry = crate::catalog::TRANSLATION_MODELS[0];
        let mut state = ModelState::not_downloaded();
        state.fail("disk full");
        let json = serde_json::to_value(ModelRecord::new(&entry, &state)).unwrap();
        assert_eq!(json["repoId"], entry.repo_id);
        assert_eq!(json["ramGb"], entry.ram_gb);
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "disk full");
        assert!(json["localPath"].is_null());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ModelStatus::NotDownloaded).unwrap(),
            r#""not_downloaded""#
        );
        assert_eq!(ModelStatus::Ready.to_string(), "ready");
    }
}
