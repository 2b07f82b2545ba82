//! Command boundary
//!
//! One async function per operation a frontend dispatcher exposes. Blocking
//! manager calls run on tokio's blocking pool so the caller's executor never
//! stalls behind a download or an inference. Request and response types use
//! camelCase field names; errors serialize to their message.

use crate::catalog::SUPPORTED_LANGUAGES;
use crate::config::Config;
use crate::download::{DownloadProgress, Downloader, HubFetcher};
use crate::error::{CommandError, ConfigError, ModelError};
use crate::lifecycle::ModelRecord;
use crate::speech::{SpeechConfig, SpeechManager, TtsStatusReport};
use crate::store::ModelStore;
use crate::translation::{StatusReport, TranslationConfig, TranslationManager};
use crate::worker::{ReadStrategy, WorkerSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Owns the long-lived managers; built once at startup
pub struct Services {
    translation: TranslationManager,
    speech: SpeechManager,
}

impl Services {
    pub fn new(translation: TranslationManager, speech: SpeechManager) -> Self {
        Self {
            translation,
            speech,
        }
    }

    /// Wire up managers from configuration
    pub fn from_config(config: &Config) -> Result<Arc<Self>, ConfigError> {
        let executable = config.resolve_executable()?;
        tracing::debug!("Worker runtime: {}", executable.display());

        let fetcher = Arc::new(HubFetcher::new(
            config.hub.endpoint.clone(),
            Duration::from_secs(config.hub.metadata_timeout_secs),
        ));
        let store = ModelStore::new(config.models_dir()?);
        let timeouts = &config.timeouts;

        let translation = TranslationManager::new(
            Downloader::new(fetcher.clone(), store.clone()),
            TranslationConfig {
                worker: WorkerSpec {
                    label: "translation".to_string(),
                    executable: executable.clone(),
                    script: config.translate_worker()?,
                    strategy: ReadStrategy::Direct,
                    quit_grace: timeouts.quit_grace(),
                },
                load_timeout: timeouts.translate_load(),
                translate_timeout: timeouts.translate(),
            },
        );

        // The TTS stack prints to stdout behind the worker's back
        let speech = SpeechManager::new(
            Downloader::new(fetcher, store),
            SpeechConfig {
                worker: WorkerSpec {
                    label: "TTS".to_string(),
                    executable,
                    script: config.tts_worker()?,
                    strategy: ReadStrategy::Queue,
                    quit_grace: timeouts.quit_grace(),
                },
                load_timeout: timeouts.tts_load(),
                synthesize_timeout: timeouts.synthesize(),
            },
        );

        Ok(Arc::new(Self::new(translation, speech)))
    }

    pub fn translation(&self) -> &TranslationManager {
        &self.translation
    }

    pub fn speech(&self) -> &SpeechManager {
        &self.speech
    }

    /// Stop all workers gracefully
    pub fn shutdown(&self) {
        self.translation.shutdown();
        self.speech.shutdown();
    }

    /// Kill all workers immediately, even mid-command
    pub fn abort(&self) {
        self.translation.abort();
        self.speech.abort();
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeRequest {
    pub text: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageInfo {
    pub code: String,
    pub name: String,
}

async fn blocking<T, F>(services: &Arc<Services>, call: F) -> Result<T, CommandError>
where
    T: Send + 'static,
    F: FnOnce(&Services) -> Result<T, ModelError> + Send + 'static,
{
    let services = Arc::clone(services);
    tokio::task::spawn_blocking(move || call(&services))
        .await
        .map_err(|e| CommandError::Join(e.to_string()))?
        .map_err(CommandError::from)
}

/// Forward progress events to a channel; a closed receiver is ignored
fn progress_sink(progress: UnboundedSender<DownloadProgress>) -> impl FnMut(DownloadProgress) {
    move |event| {
        let _ = progress.send(event);
    }
}

pub async fn translate(
    services: &Arc<Services>,
    request: TranslateRequest,
) -> Result<String, CommandError> {
    blocking(services, move |s| {
        s.translation()
            .translate(&request.text, &request.source_lang, &request.target_lang)
    })
    .await
}

/// Supported languages sorted by name
pub async fn list_languages() -> Vec<LanguageInfo> {
    let mut languages: Vec<LanguageInfo> = SUPPORTED_LANGUAGES
        .iter()
        .map(|(code, name)| LanguageInfo {
            code: code.to_string(),
            name: name.to_string(),
        })
        .collect();
    languages.sort_by(|a, b| a.name.cmp(&b.name));
    languages
}

pub async fn list_models(services: &Services) -> Vec<ModelRecord> {
    services.translation().list_catalog()
}

pub async fn get_model_status(services: &Services, model_id: &str) -> Result<StatusReport, CommandError> {
    Ok(services.translation().status(model_id)?)
}

pub async fn download_model(
    services: &Arc<Services>,
    model_id: String,
    progress: UnboundedSender<DownloadProgress>,
) -> Result<(), CommandError> {
    blocking(services, move |s| {
        let mut sink = progress_sink(progress);
        s.translation().download(&model_id, &mut sink)
    })
    .await
}

pub async fn load_model(
    services: &Arc<Services>,
    model_id: String,
) -> Result<StatusReport, CommandError> {
    blocking(services, move |s| {
        s.translation().load(&model_id)?;
        s.translation().status(&model_id)
    })
    .await
}

pub async fn switch_model(
    services: &Arc<Services>,
    model_id: String,
) -> Result<StatusReport, CommandError> {
    blocking(services, move |s| {
        s.translation().switch_to(&model_id)?;
        s.translation().status(&model_id)
    })
    .await
}

pub async fn delete_model(services: &Arc<Services>, model_id: String) -> Result<(), CommandError> {
    blocking(services, move |s| s.translation().delete(&model_id)).await
}

pub async fn get_tts_status(services: &Services) -> TtsStatusReport {
    services.speech().status()
}

pub async fn download_tts_model(
    services: &Arc<Services>,
    progress: UnboundedSender<DownloadProgress>,
) -> Result<(), CommandError> {
    blocking(services, move |s| {
        let mut sink = progress_sink(progress);
        s.speech().download(&mut sink)
    })
    .await
}

pub async fn load_tts_model(services: &Arc<Services>) -> Result<TtsStatusReport, CommandError> {
    blocking(services, |s| {
        s.speech().load()?;
        Ok(s.speech().status())
    })
    .await
}

/// Returns base64 encoded WAV audio
pub async fn synthesize_speech(
    services: &Arc<Services>,
    request: SynthesizeRequest,
) -> Result<String, CommandError> {
    blocking(services, move |s| {
        s.speech().synthesize(&request.text, &request.language)
    })
    .await
}

pub async fn tts_supports_language(services: &Services, code: &str) -> bool {
    services.speech().supports_language(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TTS_MODEL;
    use crate::testing::{self, StubFetcher};
    use std::path::Path;

    fn services(dir: &Path) -> Arc<Services> {
        let store = ModelStore::new(dir.join("models"));
        let fetcher = Arc::new(StubFetcher::two_shards(1_000_000_000));
        let translate_script = testing::write_script(dir, "translate.sh", testing::TRANSLATE_WORKER);
        let tts_script = testing::write_script(dir, "tts.sh", testing::PID_TTS_WORKER);

        let translation = TranslationManager::new(
            Downloader::new(fetcher.clone(), store.clone()),
            TranslationConfig {
                worker: testing::sh_spec(&translate_script, ReadStrategy::Direct),
                load_timeout: Duration::from_secs(5),
                translate_timeout: Duration::from_secs(5),
            },
        );
        let speech = SpeechManager::new(
            Downloader::new(fetcher, store),
            SpeechConfig {
                worker: testing::sh_spec(&tts_script, ReadStrategy::Queue),
                load_timeout: Duration::from_secs(5),
                synthesize_timeout: Duration::from_secs(5),
            },
        );
        Arc::new(Services::new(translation, speech))
    }

    #[tokio::test]
    async fn test_languages_sorted_by_name() {
        let languages = list_languages().await;
        assert_eq!(languages.len(), SUPPORTED_LANGUAGES.len());
        assert!(languages.windows(2).all(|pair| pair[0].name <= pair[1].name));
        assert_eq!(languages[0].name, "Afrikaans");
    }

    #[test]
    fn test_requests_use_camel_case() {
        let request: TranslateRequest =
            serde_json::from_str(r#"{"text":"Hola","sourceLang":"es","targetLang":"en"}"#).unwrap();
        assert_eq!(request.source_lang, "es");
        assert_eq!(request.target_lang, "en");
    }

    #[tokio::test]
    async fn test_download_streams_progress() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        download_model(&services, "4b".to_string(), tx).await.unwrap();

        let mut fractions = Vec::new();
        while let Some(event) = rx.recv().await {
            fractions.push(event.fraction);
        }
        assert_eq!(fractions, vec![0.0, 0.5, 0.99, 1.0]);

        let status = serde_json::to_value(get_model_status(&services, "4b").await.unwrap()).unwrap();
        assert_eq!(status["modelId"], "4b");
        assert_eq!(status["status"], "downloaded");
        assert!(status["currentModelId"].is_null());
    }

    #[tokio::test]
    async fn test_errors_serialize_as_messages() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());

        let err = load_model(&services, "9b".to_string()).await.unwrap_err();
        assert_eq!(serde_json::to_value(&err).unwrap(), "Unknown model: 9b");

        let err = translate(
            &services,
            TranslateRequest {
                text: "Hola".into(),
                source_lang: "es".into(),
                target_lang: "en".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "No model loaded");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_translate_and_speech_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        testing::seed_snapshot(&models, "mlx-community/translategemma-4b-it-4bit");
        testing::seed_snapshot(&models, TTS_MODEL.repo_id);
        let services = services(dir.path());

        let status = load_model(&services, "4b".to_string()).await.unwrap();
        assert_eq!(status.current_model_id.as_deref(), Some("4b"));

        let text = translate(
            &services,
            TranslateRequest {
                text: "Hola".into(),
                source_lang: "es".into(),
                target_lang: "en".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(text, "Hello");

        assert!(tts_supports_language(&services, "en").await);
        let audio = synthesize_speech(
            &services,
            SynthesizeRequest {
                text: "Hello".into(),
                language: "en".into(),
            },
        )
        .await
        .unwrap();
        assert!(!audio.is_empty());
        assert_eq!(
            serde_json::to_value(get_tts_status(&services).await).unwrap()["status"],
            "ready"
        );

        let s = Arc::clone(&services);
        tokio::task::spawn_blocking(move || s.shutdown()).await.unwrap();
        assert_eq!(list_models(&services).await[0].status, crate::lifecycle::ModelStatus::Downloaded);
    }
}
