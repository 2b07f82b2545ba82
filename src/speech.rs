//! Text-to-speech manager
//!
//! Supervises the single built-in TTS model. The underlying generation
//! routine hangs when invoked a second time inside one process, so every
//! `synthesize` call starts a fresh worker and loads the model again before
//! sending the request. The worker stays up afterwards and is replaced by the
//! next call.

use crate::catalog::{tts_language, tts_supports_language, tts_voice, TTS_MODEL};
use crate::download::{DownloadProgress, Downloader, TTS_LABELS};
use crate::error::{ModelError, Result};
use crate::lifecycle::{ErrorRecovery, ModelRecord, ModelState, ModelStatus};
use crate::store::safetensors_complete;
use crate::worker::{LiveWorker, Request, WorkerProcess, WorkerSpec};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Worker and timeout settings for speech synthesis
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub worker: WorkerSpec,
    pub load_timeout: Duration,
    pub synthesize_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsStatusReport {
    pub status: ModelStatus,
    pub error: Option<String>,
}

pub struct SpeechManager {
    downloader: Downloader,
    config: SpeechConfig,
    state: Mutex<ModelState>,
    worker: Mutex<Option<WorkerProcess>>,
    live: LiveWorker,
}

impl SpeechManager {
    pub fn new(downloader: Downloader, config: SpeechConfig) -> Self {
        let state = match downloader.store().local_snapshot(TTS_MODEL.repo_id) {
            Some(path) => ModelState::downloaded(path),
            None => ModelState::not_downloaded(),
        };
        Self {
            downloader,
            config,
            state: Mutex::new(state),
            worker: Mutex::new(None),
            live: LiveWorker::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<WorkerProcess>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TtsStatusReport {
        let state = self.state();
        TtsStatusReport {
            status: state.status(),
            error: state.error().map(str::to_string),
        }
    }

    pub fn record(&self) -> ModelRecord {
        ModelRecord::new(&TTS_MODEL, &self.state())
    }

    pub fn supports_language(&self, code: &str) -> bool {
        tts_supports_language(code)
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.live.pid()
    }

    pub fn download(&self, on_progress: &mut dyn FnMut(DownloadProgress)) -> Result<()> {
        {
            let mut state = self.state();
            if state.status() == ModelStatus::Ready {
                return Err(ModelError::InvalidState(
                    "Cannot download the TTS model while it is loaded".to_string(),
                ));
            }
            state.begin_download()?;
        }

        tracing::info!("Downloading TTS model ({})", TTS_MODEL.repo_id);
        let outcome = self
            .downloader
            .download(TTS_MODEL.repo_id, TTS_LABELS, on_progress);

        let mut state = self.state();
        match outcome {
            Ok(path) => {
                state.finish_download(path);
                Ok(())
            }
            Err(e) => {
                tracing::error!("TTS download failed: {}", e);
                state.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Start a worker with the TTS model loaded
    ///
    /// A model left in `Error` by an earlier load may be loaded again.
    pub fn load(&self) -> Result<()> {
        let mut slot = self.worker_slot();
        self.restart(&mut slot)
    }

    /// Synthesize `text`, returning base64 encoded audio
    pub fn synthesize(&self, text: &str, language: &str) -> Result<String> {
        let mut slot = self.worker_slot();
        self.restart(&mut slot)?;

        let request = Request::Synthesize {
            text: text.to_string(),
            language: tts_language(language).to_string(),
            voice: tts_voice(language).map(str::to_string),
        };
        let Some(worker) = slot.as_mut() else {
            return Err(ModelError::WorkerUnavailable(
                "TTS worker process is not running".to_string(),
            ));
        };

        match worker.send(&request, self.config.synthesize_timeout) {
            Ok(reply) => reply.audio.ok_or_else(|| ModelError::WorkerReported {
                message: "TTS synthesis failed".to_string(),
                fatal: false,
            }),
            Err(e) => {
                if e.is_worker_loss() {
                    tracing::warn!("Lost TTS worker: {}", e);
                    slot.take();
                    self.live.set(None);
                    self.state().fail(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Replace whatever worker is in `slot` with a freshly loaded one
    fn restart(&self, slot: &mut Option<WorkerProcess>) -> Result<()> {
        let path = {
            let mut state = self.state();
            let path = state
                .begin_load(ErrorRecovery::AllowReload)
                .map_err(|_| ModelError::InvalidState("TTS model is not downloaded yet".to_string()))?;
            if !safetensors_complete(&path) {
                tracing::warn!("TTS model cache at {} is incomplete", path.display());
                state.invalidate();
                drop(state);
                if let Some(mut stale) = slot.take() {
                    stale.terminate();
                }
                self.live.set(None);
                return Err(ModelError::IntegrityFailure(
                    "TTS model cache is incomplete (missing safetensors shards). Please re-download the model."
                        .to_string(),
                ));
            }
            path
        };

        if let Some(mut previous) = slot.take() {
            tracing::debug!("Recycling TTS worker (pid {})", previous.pid());
            previous.terminate();
            self.live.set(None);
        }

        match self.start_worker(&path) {
            Ok(worker) => {
                tracing::info!("TTS model ready (worker pid {})", worker.pid());
                self.live.set(Some(worker.pid()));
                *slot = Some(worker);
                self.state().mark_ready();
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to load TTS model: {}", e);
                self.state().fail(e.to_string());
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

    pub fn shutdown(&self) {
        let mut slot = self.worker_slot();
        if let Some(mut worker) = slot.take() {
            worker.terminate();
        }
        self.live.set(None);
        self.state().demote();
    }

    /// Kill the live worker without waiting for the command lock
    pub fn abort(&self) {
        self.live.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ModelStore;
    use crate::testing::{self, StubFetcher};
    use crate::worker::ReadStrategy;
    use std::sync::Arc;

    const VOICE_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"cmd":"load"'*) echo '{"status":"ok"}' ;;
    *'"voice":"Chelsie"'*) echo '{"status":"ok","audio":"chelsie"}' ;;
    *'"language":"German"'*) echo '{"status":"ok","audio":"german"}' ;;
    *'"language":"auto"'*) echo '{"status":"ok","audio":"auto"}' ;;
    *'"cmd":"quit"'*) exit 0 ;;
  esac
done
"#;

    const FLAKY_LOAD_WORKER: &str = r#"
read -r line
if [ -f "$0.loaded" ]; then
  echo '{"status":"ok"}'
else
  touch "$0.loaded"
  echo '{"status":"error","message":"Metal device busy"}'
fi
while IFS= read -r line; do
  case "$line" in
    *'"cmd":"quit"'*) exit 0 ;;
    *) echo '{"status":"ok","audio":"UklGRg=="}' ;;
  esac
done
"#;

    const HANGING_SYNTH_WORKER: &str = r#"
read -r line
echo '{"status":"ok"}'
read -r line
exec sleep 30
"#;

    fn manager(dir: &Path, worker_body: &str, seeded: bool) -> SpeechManager {
        let models = dir.join("models");
        if seeded {
            testing::seed_snapshot(&models, TTS_MODEL.repo_id);
        }
        let script = testing::write_script(dir, "tts.sh", worker_body);
        let downloader = Downloader::new(
            Arc::new(StubFetcher::two_shards(500_000_000)),
            ModelStore::new(models),
        );
        SpeechManager::new(
            downloader,
            SpeechConfig {
                worker: testing::sh_spec(&script, ReadStrategy::Queue),
                load_timeout: Duration::from_secs(5),
                synthesize_timeout: Duration::from_millis(500),
            },
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_each_synthesis_uses_fresh_worker() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), testing::PID_TTS_WORKER, true);

        let first = manager.synthesize("Hello", "en").unwrap();
        let second = manager.synthesize("Hello again", "en").unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.worker_pid().map(|pid| pid.to_string()), Some(second));
        assert_eq!(manager.status().status, ModelStatus::Ready);
    }

    #[cfg(unix)]
    #[test]
    fn test_language_and_voice_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), VOICE_WORKER, true);

        assert_eq!(manager.synthesize("hi", "en").unwrap(), "chelsie");
        assert_eq!(manager.synthesize("hallo", "de").unwrap(), "german");
        assert_eq!(manager.synthesize("hoi", "nl").unwrap(), "auto");
        assert!(manager.supports_language("de"));
        assert!(!manager.supports_language("nl"));
    }

    #[test]
    fn test_synthesize_before_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), VOICE_WORKER, false);

        match manager.synthesize("hi", "en") {
            Err(ModelError::InvalidState(message)) => {
                assert_eq!(message, "TTS model is not downloaded yet")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(manager.status().status, ModelStatus::NotDownloaded);
    }

    #[test]
    fn test_download_uses_tts_wording() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), VOICE_WORKER, false);

        let mut events = Vec::new();
        manager.download(&mut |p| events.push(p)).unwrap();
        assert_eq!(events.first().unwrap().message, "Fetching TTS model info...");
        assert_eq!(events[1].message, "Downloading TTS... 0.5/1.0 GB");
        let last = events.last().unwrap();
        assert_eq!(last.fraction, 1.0);
        assert_eq!(last.message, "TTS model download complete");
        assert_eq!(manager.status().status, ModelStatus::Downloaded);
        assert_eq!(manager.record().id, "tts");
    }

    #[cfg(unix)]
    #[test]
    fn test_load_retry_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FLAKY_LOAD_WORKER, true);

        assert!(manager.load().is_err());
        let report = manager.status();
        assert_eq!(report.status, ModelStatus::Error);
        assert_eq!(report.error.as_deref(), Some("Metal device busy"));

        manager.load().unwrap();
        assert_eq!(manager.status(), TtsStatusReport {
            status: ModelStatus::Ready,
            error: None,
        });
        manager.shutdown();
        assert_eq!(manager.status().status, ModelStatus::Downloaded);
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_synthesis_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), HANGING_SYNTH_WORKER, true);

        let err = manager.synthesize("hi", "en").unwrap_err();
        assert!(matches!(err, ModelError::WorkerTimeout(_)));
        assert_eq!(manager.worker_pid(), None);
        assert_eq!(manager.status().status, ModelStatus::Error);

        // Error is recoverable by reloading
        assert!(manager.load().is_ok());
    }
}
