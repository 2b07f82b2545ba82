//! Configuration loading
//!
//! Settings come from a TOML file (by default `config.toml` in the platform
//! config directory). Every section is optional and a missing file means
//! defaults throughout.
//!
//! ```toml
//! [runtime]
//! executable = "/opt/homebrew/bin/python3"
//! translate_worker = "/usr/share/local-translate/mlx_worker.py"
//! tts_worker = "/usr/share/local-translate/tts_worker.py"
//!
//! [storage]
//! models_dir = "/Volumes/models"
//!
//! [hub]
//! endpoint = "https://huggingface.co"
//! metadata_timeout_secs = 30
//!
//! [timeouts]
//! translate_load_secs = 300
//! translate_secs = 300
//! tts_load_secs = 300
//! synthesize_secs = 120
//! quit_grace_secs = 5
//! ```

use crate::error::ConfigError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the worker runtime executable
pub const RUNTIME_ENV: &str = "LOCAL_TRANSLATE_PYTHON";

const DEFAULT_RUNTIME: &str = "python3";
const TRANSLATE_WORKER_FILE: &str = "mlx_worker.py";
const TTS_WORKER_FILE: &str = "tts_worker.py";

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("com", "local-translate", "local-translate").ok_or(ConfigError::NoProjectDirs)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
    pub hub: HubConfig,
    pub timeouts: TimeoutConfig,
}

/// Worker runtime and entry points
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub executable: Option<PathBuf>,
    pub translate_worker: Option<PathBuf>,
    pub tts_worker: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub models_dir: Option<PathBuf>,
}

/// Model hub access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub endpoint: String,
    pub metadata_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            metadata_timeout_secs: 30,
        }
    }
}

/// Worker command deadlines, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub translate_load_secs: u64,
    pub translate_secs: u64,
    pub tts_load_secs: u64,
    pub synthesize_secs: u64,
    pub quit_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            translate_load_secs: 300,
            translate_secs: 300,
            tts_load_secs: 300,
            synthesize_secs: 120,
            quit_grace_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn translate_load(&self) -> Duration {
        Duration::from_secs(self.translate_load_secs)
    }

    pub fn translate(&self) -> Duration {
        Duration::from_secs(self.translate_secs)
    }

    pub fn tts_load(&self) -> Duration {
        Duration::from_secs(self.tts_load_secs)
    }

    pub fn synthesize(&self) -> Duration {
        Duration::from_secs(self.synthesize_secs)
    }

    pub fn quit_grace(&self) -> Duration {
        Duration::from_secs(self.quit_grace_secs)
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&contents, &path)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Directory holding downloaded model repositories
    pub fn models_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.models_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("models")),
        }
    }

    pub fn translate_worker(&self) -> Result<PathBuf, ConfigError> {
        self.worker_script(self.runtime.translate_worker.as_ref(), TRANSLATE_WORKER_FILE)
    }

    pub fn tts_worker(&self) -> Result<PathBuf, ConfigError> {
        self.worker_script(self.runtime.tts_worker.as_ref(), TTS_WORKER_FILE)
    }

    fn worker_script(&self, configured: Option<&PathBuf>, file: &str) -> Result<PathBuf, ConfigError> {
        match configured {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("workers").join(file)),
        }
    }

    /// Resolve the executable that runs worker scripts
    ///
    /// `LOCAL_TRANSLATE_PYTHON` wins when it names an existing file, then
    /// `runtime.executable`, then `python3` on `PATH`.
    pub fn resolve_executable(&self) -> Result<PathBuf, ConfigError> {
        self.resolve_executable_with(std::env::var_os(RUNTIME_ENV))
    }

    fn resolve_executable_with(&self, env: Option<OsString>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = env.filter(|value| !value.is_empty()).map(PathBuf::from) {
            if path.is_file() {
                return Ok(path);
            }
            tracing::warn!("{} points at {}, which is not a file", RUNTIME_ENV, path.display());
        }

        if let Some(path) = &self.runtime.executable {
            return Ok(path.clone());
        }

        which::which(DEFAULT_RUNTIME).map_err(|e| {
            ConfigError::RuntimeNotFound(format!(
                "{} ({}); set {} or runtime.executable",
                DEFAULT_RUNTIME, e, RUNTIME_ENV
            ))
        })
    }

    /// Create the directories the application writes to
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        let models_dir = self
            .models_dir()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
        std::fs::create_dir_all(&models_dir)?;
        tracing::debug!("Models directory: {}", models_dir.display());
        Ok(())
    }
}
