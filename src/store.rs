//! Local model asset store
//!
//! Each source repository gets one directory under the models root,
//! `models--<org>--<name>`, holding the repository files flat. Files are
//! written as `<name>.part` and renamed when complete, so an interrupted
//! download never produces a file that looks finished.

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Suffix used for files still being downloaded
pub const PARTIAL_SUFFIX: &str = "part";

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// On-disk cache of downloaded model repositories
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the files of `repo_id`
    pub fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.root
            .join(format!("models--{}", repo_id.replace('/', "--")))
    }

    /// The repository directory, if it holds a complete set of weights
    pub fn local_snapshot(&self, repo_id: &str) -> Option<PathBuf> {
        let dir = self.repo_dir(repo_id);
        if dir.is_dir() && safetensors_complete(&dir) {
            Some(dir)
        } else {
            None
        }
    }

    /// Delete every cached file of `repo_id`
    pub fn remove(&self, repo_id: &str) -> io::Result<()> {
        let dir = self.repo_dir(repo_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("Removed cached model {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn shard_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^model-\d+-of-(\d+)\.safetensors$").expect("valid shard pattern")
    })
}

/// Check that every expected safetensors weight file is present
///
/// Three layouts are recognized:
/// 1. An index file: every shard in its `weight_map` must exist.
/// 2. Sharded files `model-XXXXX-of-NNNNN.safetensors` without an index:
///    exactly NNNNN shards must exist.
/// 3. Anything else: at least one `*.safetensors` file.
pub fn safetensors_complete(model_dir: &Path) -> bool {
    let index_file = model_dir.join(SAFETENSORS_INDEX);
    if index_file.exists() {
        return index_shards_present(model_dir, &index_file);
    }

    let names = match fs::read_dir(model_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<_>>(),
        Err(_) => return false,
    };

    let mut shards: Vec<&String> = names
        .iter()
        .filter(|name| shard_pattern().is_match(name))
        .collect();
    shards.sort();
    if let Some(first) = shards.first() {
        let expected = shard_pattern()
            .captures(first)
            .and_then(|caps| caps.get(1))
            .and_then(|total| total.as_str().parse::<usize>().ok());
        if let Some(expected) = expected {
            return shards.len() == expected;
        }
    }

    names.iter().any(|name| name.ends_with(".safetensors"))
}

fn index_shards_present(model_dir: &Path, index_file: &Path) -> bool {
    let index: serde_json::Value = match fs::read_to_string(index_file)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
    {
        Some(index) => index,
        None => {
            tracing::warn!("Unreadable safetensors index {}", index_file.display());
            return false;
        }
    };

    let Some(weight_map) = index.get("weight_map").and_then(|m| m.as_object()) else {
        return true;
    };
    weight_map
        .values()
        .filter_map(|shard| shard.as_str())
        .all(|shard| model_dir.join(shard).exists())
}
