//! Line-delimited JSON protocol spoken between the supervisor and a worker
//!
//! Every message is one JSON object terminated by a single `\n`. Requests are
//! tagged by `cmd`, responses by `status`.
//!
//! Workers share their output stream with native libraries that cannot always
//! be silenced. Decoding therefore scans each line for the first `{` and
//! parses from there; a line that never yields a JSON object is noise and is
//! dropped without error.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Token budget for a single translation generation
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

/// Command sent from the supervisor to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Load model weights from a local directory
    Load { model_path: String },
    /// Run a text generation over a fully templated prompt
    Translate {
        prompt: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
    /// Synthesize speech; `audio` in the reply is base64
    Synthesize {
        text: String,
        language: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
    },
    /// Ask the worker to exit; no reply is sent
    Quit,
}

impl Request {
    /// Protocol name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Request::Load { .. } => "load",
            Request::Translate { .. } => "translate",
            Request::Synthesize { .. } => "synthesize",
            Request::Quit => "quit",
        }
    }
}

/// Reply sent from a worker to the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    /// The command succeeded
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
    },
    /// The command failed; the worker is still usable
    Error {
        #[serde(default)]
        message: String,
    },
    /// The worker cannot continue and must be torn down
    Fatal {
        #[serde(default)]
        message: String,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok {
            result: None,
            audio: None,
        }
    }

    pub fn with_result(result: impl Into<String>) -> Self {
        Response::Ok {
            result: Some(result.into()),
            audio: None,
        }
    }

    pub fn with_audio(audio: impl Into<String>) -> Self {
        Response::Ok {
            result: None,
            audio: Some(audio.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Response::Fatal {
            message: message.into(),
        }
    }
}

/// Serialize a message to one protocol line, including the trailing newline
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(ProtocolError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line of worker output
///
/// Returns `Ok(None)` for noise: lines without a `{`, lines that do not parse
/// as a JSON object from the first `{` onwards, and objects without a
/// `status` key. An object whose `status` is not a known tag is an error.
pub fn decode_line(line: &str) -> Result<Option<Response>, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(start) = line.find('{') else {
        return Ok(None);
    };
    let candidate = &line[start..];

    let value: serde_json::Value = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    if value.get("status").is_none() {
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::UnrecognizedFrame(format!("{} ({})", candidate, e)))
}

/// Decode one request line on the worker side
pub fn decode_request(line: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_single_line() {
        let line = encode(&Request::Load {
            model_path: "/tmp/models/4b".to_string(),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(line, "{\"cmd\":\"load\",\"model_path\":\"/tmp/models/4b\"}\n");
    }

    #[test]
    fn test_encode_quit_and_optional_voice() {
        assert_eq!(encode(&Request::Quit).unwrap(), "{\"cmd\":\"quit\"}\n");

        let line = encode(&Request::Synthesize {
            text: "hi".into(),
            language: "auto".into(),
            voice: None,
        })
        .unwrap();
        assert!(!line.contains("voice"));

        let line = encode(&Request::Synthesize {
            text: "hi".into(),
            language: "English".into(),
            voice: Some("Chelsie".into()),
        })
        .unwrap();
        assert!(line.contains(r#""voice":"Chelsie""#));
    }

    #[test]
    fn test_decode_clean_frames() {
        assert_eq!(
            decode_line("{\"status\":\"ok\"}\n").unwrap(),
            Some(Response::ok())
        );
        assert_eq!(
            decode_line(r#"{"status":"ok","result":"Hello"}"#).unwrap(),
            Some(Response::with_result("Hello"))
        );
        assert_eq!(
            decode_line(r#"{"status":"error","message":"No model loaded"}"#).unwrap(),
            Some(Response::error("No model loaded"))
        );
        assert_eq!(
            decode_line(r#"{"status":"fatal","message":"Traceback"}"#).unwrap(),
            Some(Response::fatal("Traceback"))
        );
    }

    #[test]
    fn test_decode_skips_leading_noise() {
        let line = "ggml_metal_init: allocating{\"status\":\"ok\",\"audio\":\"UklGRg==\"}\n";
        assert_eq!(
            decode_line(line).unwrap(),
            Some(Response::with_audio("UklGRg=="))
        );
    }

    #[test]
    fn test_decode_discards_noise_lines() {
        assert_eq!(decode_line("Fetching 12 files: 100%").unwrap(), None);
        assert_eq!(decode_line("").unwrap(), None);
        assert_eq!(decode_line("{not json at all").unwrap(), None);
        assert_eq!(decode_line(r#"{"progress": 0.5}"#).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let err = decode_line(r#"{"status":"maybe"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnrecognizedFrame(_)));
    }

    #[test]
    fn test_decode_request_defaults_budget() {
        let req = decode_request(r#"{"cmd":"translate","prompt":"p"}"#).unwrap();
        assert_eq!(
            req,
            Request::Translate {
                prompt: "p".into(),
                max_tokens: DEFAULT_MAX_TOKENS
            }
        );
        assert!(decode_request(r#"{"cmd":"dance"}"#).is_err());
    }
}
