//! Shared fixtures for unit tests: shell-script workers and a stub hub

use crate::download::{AssetFetcher, RemoteFile};
use crate::error::{ModelError, Result};
use crate::worker::{ReadStrategy, WorkerSpec};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write a shell script worker body into `dir`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

/// Spec that runs `script` under `/bin/sh`
pub fn sh_spec(script: &Path, strategy: ReadStrategy) -> WorkerSpec {
    WorkerSpec {
        label: "test".into(),
        executable: PathBuf::from("/bin/sh"),
        script: script.to_path_buf(),
        strategy,
        quit_grace: Duration::from_secs(2),
    }
}

/// Worker answering `load` and `translate`, echoing a fixed padded result
pub const TRANSLATE_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"cmd":"load"'*) echo '{"status":"ok"}' ;;
    *'"cmd":"translate"'*) echo '{"status":"ok","result":"  Hello  "}' ;;
    *'"cmd":"quit"'*) exit 0 ;;
    *) echo '{"status":"error","message":"Unknown command"}' ;;
  esac
done
"#;

/// Worker that loads and then exits without answering the next command
pub const CRASHING_WORKER: &str = r#"
read -r line
echo '{"status":"ok"}'
read -r line
echo 'CUDA error: device lost' >&2
exit 1
"#;

/// Worker that refuses to load
pub const FAILING_LOAD_WORKER: &str = r#"
read -r line
echo '{"status":"error","message":"Weights are corrupt"}'
read -r line
"#;

/// Noisy TTS worker answering `synthesize` with its own pid as the audio
pub const PID_TTS_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"cmd":"load"'*) echo 'Fetching 2 files'; echo '{"status":"ok"}' ;;
    *'"cmd":"synthesize"'*) printf 'generating...'; echo "{\"status\":\"ok\",\"audio\":\"$$\"}" ;;
    *'"cmd":"quit"'*) exit 0 ;;
  esac
done
"#;

/// Create a complete single-file snapshot for `repo_id` under `root`
pub fn seed_snapshot(root: &Path, repo_id: &str) -> PathBuf {
    let dir = crate::store::ModelStore::new(root).repo_dir(repo_id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.json"), b"{}").unwrap();
    fs::write(dir.join("model.safetensors"), b"weights").unwrap();
    dir
}

/// In-memory hub: serves a fixed file list and writes placeholder files
pub struct StubFetcher {
    files: Vec<RemoteFile>,
    fail_on: Option<String>,
    chunk: Option<u64>,
}

impl StubFetcher {
    pub fn new(files: Vec<RemoteFile>) -> Self {
        Self {
            files,
            fail_on: None,
            chunk: None,
        }
    }

    /// Two complete shards of `size` bytes each
    pub fn two_shards(size: u64) -> Self {
        Self::new(vec![
            RemoteFile {
                name: "model-00001-of-00002.safetensors".into(),
                size: Some(size),
            },
            RemoteFile {
                name: "model-00002-of-00002.safetensors".into(),
                size: Some(size),
            },
        ])
    }

    /// Report byte progress in chunks of `chunk`
    pub fn with_chunk(mut self, chunk: u64) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Fail when fetching the named file
    pub fn failing_on(mut self, name: &str) -> Self {
        self.fail_on = Some(name.to_string());
        self
    }
}

impl AssetFetcher for StubFetcher {
    fn list_files(&self, _repo_id: &str) -> Result<Vec<RemoteFile>> {
        Ok(self.files.clone())
    }

    fn fetch_file(
        &self,
        _repo_id: &str,
        file: &RemoteFile,
        dest: &Path,
        on_bytes: &mut dyn FnMut(u64),
    ) -> Result<()> {
        if self.fail_on.as_deref() == Some(file.name.as_str()) {
            return Err(ModelError::DownloadFailure(format!(
                "{}: connection reset",
                file.name
            )));
        }
        if let (Some(chunk), Some(size)) = (self.chunk, file.size) {
            let mut sent = 0;
            while sent < size {
                let n = chunk.min(size - sent);
                on_bytes(n);
                sent += n;
            }
        }
        fs::write(dest, b"stub")?;
        Ok(())
    }
}
