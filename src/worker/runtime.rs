//! Worker-side protocol loop
//!
//! The counterpart of `WorkerProcess`: a worker binary wraps its inference
//! library in an `InferenceBackend` and hands it to `serve`, which answers
//! one reply per request line until `quit` or end of input.
//!
//! Inference libraries are free to print whatever they like. Call
//! `protocol_output` before initializing them so frames go to a private copy
//! of stdout while descriptor 1 itself points at `/dev/null`.

use super::protocol::{self, Request, Response};
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};

const KNOWN_COMMANDS: &[&str] = &["load", "translate", "synthesize", "quit"];

/// The inference library as seen by the worker loop
///
/// Failures are plain messages; they are sent back as `error` frames and the
/// worker keeps serving. A backend that only serves one command kind leaves
/// the other method at its default, which refuses the command.
pub trait InferenceBackend {
    fn load(&mut self, model_path: &str) -> Result<(), String>;

    fn translate(&mut self, _prompt: &str, _max_tokens: u32) -> Result<String, String> {
        Err("Unknown command: translate".to_string())
    }

    /// Returns base64 encoded audio
    fn synthesize(
        &mut self,
        _text: &str,
        _language: &str,
        _voice: Option<&str>,
    ) -> Result<String, String> {
        Err("Unknown command: synthesize".to_string())
    }
}

/// Run the request loop until `quit`, end of input, or a backend panic
///
/// A panic inside the backend is reported as a `fatal` frame and ends the
/// loop. Only I/O errors on the protocol streams are returned.
pub fn serve<B, R, W>(backend: &mut B, input: R, output: &mut W) -> io::Result<()>
where
    B: InferenceBackend,
    R: BufRead,
    W: Write,
{
    let mut loaded = false;

    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                respond(output, &Response::error(format!("Invalid JSON: {}", e)))?;
                continue;
            }
        };

        let request = match protocol::decode_request(line) {
            Ok(request) => request,
            Err(e) => {
                let cmd = value.get("cmd").and_then(|c| c.as_str()).unwrap_or("null");
                let message = if KNOWN_COMMANDS.contains(&cmd) {
                    format!("Invalid {} request: {}", cmd, e)
                } else {
                    format!("Unknown command: {}", cmd)
                };
                respond(output, &Response::error(message))?;
                continue;
            }
        };

        if request == Request::Quit {
            tracing::debug!("Worker received quit");
            return Ok(());
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(backend, &request, &mut loaded)));
        match outcome {
            Ok(response) => respond(output, &response)?,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("Backend panicked during {}: {}", request.name(), message);
                respond(output, &Response::fatal(message))?;
                return Ok(());
            }
        }
    }

    Ok(())
}

fn dispatch<B: InferenceBackend>(backend: &mut B, request: &Request, loaded: &mut bool) -> Response {
    match request {
        Request::Load { model_path } => match backend.load(model_path) {
            Ok(()) => {
                *loaded = true;
                Response::ok()
            }
            Err(message) => Response::error(message),
        },
        Request::Translate { .. } | Request::Synthesize { .. } if !*loaded => {
            Response::error("No model loaded")
        }
        Request::Translate { prompt, max_tokens } => match backend.translate(prompt, *max_tokens) {
            Ok(result) => Response::with_result(result),
            Err(message) => Response::error(message),
        },
        Request::Synthesize {
            text,
            language,
            voice,
        } => match backend.synthesize(text, language, voice.as_deref()) {
            Ok(audio) => Response::with_audio(audio),
            Err(message) => Response::error(message),
        },
        Request::Quit => Response::ok(),
    }
}

fn respond<W: Write>(output: &mut W, response: &Response) -> io::Result<()> {
    let line = protocol::encode(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    output.write_all(line.as_bytes())?;
    output.flush()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Take over stdout for protocol frames
///
/// Returns a handle to a duplicate of the original stdout descriptor and
/// points descriptor 1 at `/dev/null`, so anything else the process prints
/// is discarded.
#[cfg(unix)]
pub fn protocol_output() -> io::Result<std::fs::File> {
    use std::os::unix::io::{AsRawFd, FromRawFd};

    io::stdout().flush()?;

    // SAFETY: dup on a descriptor we own; the result is checked before use
    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by dup and nothing else owns it
    let protocol = unsafe { std::fs::File::from_raw_fd(fd) };

    let devnull = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
    // SAFETY: both descriptors are valid for the duration of the call
    if unsafe { libc::dup2(devnull.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(protocol)
}
