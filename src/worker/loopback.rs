//! Loopback backend for `local-translate worker`
//!
//! Runs the full supervision path without an inference runtime: `load`
//! performs the same weight-file check the managers do, `translate` echoes
//! the source text out of the prompt, and `synthesize` returns silence sized
//! to the text. Point `runtime.executable` at the `local-translate` binary
//! and the worker scripts at `worker` to use it.

use super::runtime::InferenceBackend;
use crate::store::safetensors_complete;
use base64::Engine;
use std::io::Cursor;
use std::path::Path;

const SAMPLE_RATE: u32 = 24_000;

/// Silence per input character
const SAMPLES_PER_CHAR: usize = 1_200;

#[derive(Debug, Default)]
pub struct LoopbackBackend {
    model: Option<String>,
}

impl LoopbackBackend {
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

impl InferenceBackend for LoopbackBackend {
    fn load(&mut self, model_path: &str) -> Result<(), String> {
        let dir = Path::new(model_path);
        if !dir.is_dir() {
            return Err(format!("Model directory not found: {}", model_path));
        }
        if !safetensors_complete(dir) {
            return Err(format!("Incomplete model files in {}", model_path));
        }
        tracing::info!("Loopback worker loaded {}", model_path);
        self.model = Some(model_path.to_string());
        Ok(())
    }

    fn translate(&mut self, prompt: &str, _max_tokens: u32) -> Result<String, String> {
        Ok(source_text(prompt).to_string())
    }

    fn synthesize(
        &mut self,
        text: &str,
        _language: &str,
        _voice: Option<&str>,
    ) -> Result<String, String> {
        let samples = text.chars().count().max(1) * SAMPLES_PER_CHAR;
        let wav = silent_wav(samples).map_err(|e| format!("WAV encoding failed: {}", e))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(wav))
    }
}

/// The user text inside a chat-template prompt, or the whole prompt
fn source_text(prompt: &str) -> &str {
    let body = prompt.rsplit_once("\n\n\n").map(|(_, rest)| rest).unwrap_or(prompt);
    body.split("<end_of_turn>").next().unwrap_or(body).trim()
}

fn silent_wav(samples: usize) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for _ in 0..samples {
            writer.write_sample(0i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
