//! Inference worker subprocesses
//!
//! Each inference runtime runs in its own process so its GPU context never
//! shares a process with the host application. This module holds both sides
//! of that arrangement:
//! - `protocol`: the line-delimited JSON messages
//! - `process`: the supervisor-side handle owning one child
//! - `runtime`: the worker-side request loop
//! - `loopback`: a backend without inference, served by `local-translate worker`

pub mod loopback;
pub mod process;
pub mod protocol;
pub mod runtime;

pub use process::{LiveWorker, ReadStrategy, Reply, WorkerProcess, WorkerSpec};
pub use protocol::{Request, Response, DEFAULT_MAX_TOKENS};
pub use loopback::LoopbackBackend;
#[cfg(unix)]
pub use runtime::protocol_output;
pub use runtime::{serve, InferenceBackend};
