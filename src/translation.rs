//! Translation model manager
//!
//! Tracks the lifecycle of every catalog model and supervises at most one
//! translation worker. Loading a model stops the worker of whichever model
//! was active before, so one model per domain is ever backed by a live
//! process.
//!
//! Two locks guard the manager:
//! - the registry lock covers statuses and the active id, and is only held
//!   for short transitions, so status queries never wait on inference
//! - the worker lock owns the `WorkerProcess` and serializes commands
//!
//! When both are needed the worker lock is always taken first.

use crate::catalog::{find_translation_model, language_name, CatalogEntry, TRANSLATION_MODELS};
use crate::download::{DownloadProgress, Downloader, MODEL_LABELS};
use crate::error::{ModelError, Result};
use crate::lifecycle::{ErrorRecovery, ModelRecord, ModelState, ModelStatus};
use crate::store::safetensors_complete;
use crate::worker::{LiveWorker, Request, WorkerProcess, WorkerSpec, DEFAULT_MAX_TOKENS};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Worker and timeout settings for the translation domain
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub worker: WorkerSpec,
    pub load_timeout: Duration,
    pub translate_timeout: Duration,
}

/// Status of one model plus the domain's active model
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub model_id: String,
    pub status: ModelStatus,
    pub error: Option<String>,
    pub current_model_id: Option<String>,
}

#[derive(Debug, Default)]
struct Registry {
    models: HashMap<&'static str, ModelState>,
    active: Option<&'static str>,
}

impl Registry {
    fn state_mut(&mut self, id: &'static str) -> &mut ModelState {
        self.models.entry(id).or_default()
    }

    fn report(&mut self, id: &'static str) -> StatusReport {
        let active = self.active.map(str::to_string);
        let state = self.state_mut(id);
        StatusReport {
            model_id: id.to_string(),
            status: state.status(),
            error: state.error().map(str::to_string),
            current_model_id: active,
        }
    }
}

pub struct TranslationManager {
    downloader: Downloader,
    config: TranslationConfig,
    registry: Mutex<Registry>,
    worker: Mutex<Option<WorkerProcess>>,
    live: LiveWorker,
}

impl TranslationManager {
    /// Create the manager, seeding each model's status from the local store
    pub fn new(downloader: Downloader, config: TranslationConfig) -> Self {
        let mut registry = Registry::default();
        for entry in TRANSLATION_MODELS {
            let state = match downloader.store().local_snapshot(entry.repo_id) {
                Some(path) => {
                    tracing::debug!("Found {} at {}", entry.id, path.display());
                    ModelState::downloaded(path)
                }
                None => ModelState::not_downloaded(),
            };
            registry.models.insert(entry.id, state);
        }

        Self {
            downloader,
            config,
            registry: Mutex::new(registry),
            worker: Mutex::new(None),
            live: LiveWorker::default(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<WorkerProcess>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(id: &str) -> Result<&'static CatalogEntry> {
        find_translation_model(id).ok_or_else(|| ModelError::UnknownModel(id.to_string()))
    }

    /// Static catalog joined with live status
    pub fn list_catalog(&self) -> Vec<ModelRecord> {
        let mut registry = self.registry();
        TRANSLATION_MODELS
            .iter()
            .map(|entry| ModelRecord::new(entry, registry.state_mut(entry.id)))
            .collect()
    }

    pub fn status(&self, id: &str) -> Result<StatusReport> {
        let entry = Self::entry(id)?;
        Ok(self.registry().report(entry.id))
    }

    /// Id of the model currently backed by a live worker
    pub fn active_id(&self) -> Option<String> {
        self.registry().active.map(str::to_string)
    }

    /// Process id of the live worker, if any
    pub fn worker_pid(&self) -> Option<u32> {
        self.live.pid()
    }

    /// Download a model's files into the local store
    pub fn download(&self, id: &str, on_progress: &mut dyn FnMut(DownloadProgress)) -> Result<()> {
        let entry = Self::entry(id)?;
        {
            let mut registry = self.registry();
            if registry.active == Some(entry.id) {
                return Err(ModelError::InvalidState(
                    "Cannot download the currently loaded model".to_string(),
                ));
            }
            registry.state_mut(entry.id).begin_download()?;
        }

        tracing::info!("Downloading model {} ({})", entry.id, entry.repo_id);
        let outcome = self
            .downloader
            .download(entry.repo_id, MODEL_LABELS, on_progress);

        let mut registry = self.registry();
        let state = registry.state_mut(entry.id);
        match outcome {
            Ok(path) => {
                tracing::info!("Model {} downloaded to {}", entry.id, path.display());
                state.finish_download(path);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Download of {} failed: {}", entry.id, e);
                state.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Load a downloaded model into a fresh worker, replacing any active one
    pub fn load(&self, id: &str) -> Result<()> {
        let entry = Self::entry(id)?;
        let mut slot = self.worker_slot();

        let path = {
            let mut registry = self.registry();
            let path = registry
                .state_mut(entry.id)
                .begin_load(ErrorRecovery::RequireDownload)
                .map_err(|_| {
                    ModelError::InvalidState(format!("Model {} is not downloaded yet", entry.id))
                })?;

            if !safetensors_complete(&path) {
                tracing::warn!("Model {} cache at {} is incomplete", entry.id, path.display());
                registry.state_mut(entry.id).invalidate();
                if registry.active == Some(entry.id) {
                    registry.active = None;
                    drop(registry);
                    if let Some(mut stale) = slot.take() {
                        stale.terminate();
                    }
                    self.live.set(None);
                }
                return Err(ModelError::IntegrityFailure(format!(
                    "Model {} cache is incomplete (missing safetensors shards). Please re-download the model.",
                    entry.id
                )));
            }

            if let Some(previous) = registry.active.take() {
                if previous != entry.id {
                    tracing::info!("Switching translation model {} -> {}", previous, entry.id);
                    registry.state_mut(previous).demote();
                }
            }
            path
        };

        if let Some(mut previous) = slot.take() {
            tracing::debug!("Stopping translation worker (pid {})", previous.pid());
            previous.terminate();
            self.live.set(None);
        }

        match self.start_worker(&path) {
            Ok(worker) => {
                tracing::info!("Model {} ready (worker pid {})", entry.id, worker.pid());
                self.live.set(Some(worker.pid()));
                *slot = Some(worker);
                let mut registry = self.registry();
                registry.state_mut(entry.id).mark_ready();
                registry.active = Some(entry.id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to load model {}: {}", entry.id, e);
                self.registry().state_mut(entry.id).fail(e.to_string());
                Err(e)
            }
        }
    }

    fn start_worker(&self, model_path: &Path) -> Result<WorkerProcess> {
        let mut worker = WorkerProcess::spawn(&self.config.worker)?;
        worker.send(
            &Request::Load {
                model_path: model_path.to_string_lossy().into_owned(),
            },
            self.config.load_timeout,
        )?;
        Ok(worker)
    }

    /// Like `load`, but refuses models that were never downloaded
    pub fn switch_to(&self, id: &str) -> Result<()> {
        let entry = Self::entry(id)?;
        if self.registry().state_mut(entry.id).status() == ModelStatus::NotDownloaded {
            return Err(ModelError::InvalidState(format!(
                "Model {} is not downloaded",
                entry.id
            )));
        }
        self.load(id)
    }

    /// Remove a model's cached files
    pub fn delete(&self, id: &str) -> Result<()> {
        let entry = Self::entry(id)?;
        let mut registry = self.registry();
        if registry.active == Some(entry.id) {
            return Err(ModelError::InvalidState(
                "Cannot delete the currently loaded model".to_string(),
            ));
        }

        let state = registry.state_mut(entry.id);
        match state.status() {
            ModelStatus::NotDownloaded => {
                return Err(ModelError::InvalidState(format!(
                    "Model {} is not downloaded",
                    entry.id
                )))
            }
            status if status.is_transient() => {
                return Err(ModelError::InvalidState(format!(
                    "Model {} is busy ({})",
                    entry.id, status
                )))
            }
            _ => {}
        }

        self.downloader.store().remove(entry.repo_id)?;
        state.invalidate();
        tracing::info!("Deleted model {}", entry.id);
        Ok(())
    }

    /// Translate `text` with the active model
    pub fn translate(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<String> {
        let mut slot = self.worker_slot();
        let active = self.registry().active;
        let (Some(active), Some(worker)) = (active, slot.as_mut()) else {
            return Err(ModelError::WorkerUnavailable("No model loaded".to_string()));
        };

        let request = Request::Translate {
            prompt: translation_prompt(text, source_lang, target_lang),
            max_tokens: DEFAULT_MAX_TOKENS,
        };
        tracing::debug!("Translating {} chars {} -> {} with {}", text.len(), source_lang, target_lang, active);

        match worker.send(&request, self.config.translate_timeout) {
            Ok(reply) => reply
                .result
                .map(|result| result.trim().to_string())
                .ok_or_else(|| ModelError::WorkerReported {
                    message: "Translation failed".to_string(),
                    fatal: false,
                }),
            Err(e) => {
                if e.is_worker_loss() {
                    tracing::warn!("Lost translation worker for {}: {}", active, e);
                    slot.take();
                    self.live.set(None);
                    let mut registry = self.registry();
                    registry.active = None;
                    registry.state_mut(active).fail(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Stop the worker and demote the active model
    pub fn shutdown(&self) {
        let mut slot = self.worker_slot();
        if let Some(mut worker) = slot.take() {
            worker.terminate();
        }
        self.live.set(None);
        let mut registry = self.registry();
        if let Some(active) = registry.active.take() {
            registry.state_mut(active).demote();
        }
    }

    /// Kill the live worker without waiting for the command lock
    pub fn abort(&self) {
        self.live.kill();
    }
}

/// Instruction prompt for the translation model
///
/// Unknown language codes are used verbatim in place of the name.
pub fn translation_prompt(text: &str, source_lang: &str, target_lang: &str) -> String {
    let src = language_name(source_lang).unwrap_or(source_lang);
    let tgt = language_name(target_lang).unwrap_or(target_lang);
    format!(
        "<bos><start_of_turn>user\n\
         You are a professional {src} ({source_lang}) to {tgt} ({target_lang}) translator. \
         Your goal is to accurately convey the meaning and nuances of the original {src} text \
         while adhering to {tgt} grammar, vocabulary, and cultural sensitivities.\n\
         Produce only the {tgt} translation, without any additional explanations or commentary. \
         Please translate the following {src} text into {tgt}:\n\n\n\
         {text}<end_of_turn>\n\
         <start_of_turn>model\n",
        text = text.trim()
    )
}
