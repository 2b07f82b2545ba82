//! Worker subprocess ownership
//!
//! A `WorkerProcess` owns exactly one child process running a worker entry
//! point with its own GPU context. Commands are written to the child's stdin
//! and replies read from its stdout, one line each way, strictly alternating.
//!
//! Two read strategies are supported:
//! - `Direct`: the caller reads stdout itself. Only for workers whose stdout
//!   carries nothing but protocol frames. A watchdog thread kills the child
//!   if no frame arrives before the deadline.
//! - `Queue`: a reader thread drains stdout continuously, drops noise, and
//!   forwards frames over a bounded channel. Required when the worker's
//!   native libraries write to descriptor 1 behind its back. The channel is
//!   created per spawn and owned by the handle, so a reader still draining a
//!   dead predecessor can never deliver into a new worker's queue.
//!
//! stderr is drained into a small rolling tail used for diagnostics when the
//! worker dies or times out. Dropping the handle terminates the child.

use super::protocol::{self, Request, Response};
use crate::error::{ModelError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Frames buffered between the reader thread and the caller
const RESPONSE_QUEUE_DEPTH: usize = 32;

/// Lines of stderr kept for diagnostics
const STDERR_TAIL_LINES: usize = 40;

/// How long to wait for the stderr drain to catch up after the child died
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// How worker stdout is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Direct,
    Queue,
}

/// Everything needed to start one kind of worker
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Name used in logs and error messages ("translation", "TTS")
    pub label: String,
    /// Resolved interpreter or runtime binary
    pub executable: PathBuf,
    /// Worker entry point passed as the first argument
    pub script: PathBuf,
    pub strategy: ReadStrategy,
    /// Time allowed for a graceful exit after `quit`
    pub quit_grace: Duration,
}

/// Payload of a successful reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub result: Option<String>,
    pub audio: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Running,
    /// Killed after a crash, timeout or fatal frame; no longer usable
    Broken,
    Stopped,
}

enum ResponseSource {
    Direct(BufReader<ChildStdout>),
    Queue(Receiver<std::result::Result<Response, String>>),
}

enum ReadOutcome {
    Frame(Response),
    Malformed(String),
    Closed,
    TimedOut,
}

/// Handle to one live worker subprocess
pub struct WorkerProcess {
    label: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    source: ResponseSource,
    stderr: StderrTail,
    quit_grace: Duration,
    state: HandleState,
}

impl WorkerProcess {
    /// Start a worker with stdin, stdout and stderr on separate pipes
    pub fn spawn(spec: &WorkerSpec) -> Result<Self> {
        tracing::debug!(
            "Spawning {} worker: {} {}",
            spec.label,
            spec.executable.display(),
            spec.script.display()
        );

        let mut command = Command::new(&spec.executable);
        command
            .arg(&spec.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a kill also reaches helpers the worker forked
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| {
                ModelError::WorkerUnavailable(format!(
                    "Failed to spawn {} worker: {}",
                    spec.label, e
                ))
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            kill_process_tree(&mut child);
            let _ = child.wait();
            return Err(ModelError::WorkerUnavailable(format!(
                "{} worker pipes not available",
                spec.label
            )));
        };

        let source = match spec.strategy {
            ReadStrategy::Direct => ResponseSource::Direct(BufReader::new(stdout)),
            ReadStrategy::Queue => {
                let (tx, rx) = crossbeam_channel::bounded(RESPONSE_QUEUE_DEPTH);
                spawn_stdout_drain(&spec.label, pid, stdout, tx);
                ResponseSource::Queue(rx)
            }
        };

        tracing::info!("Started {} worker (pid {})", spec.label, pid);

        Ok(Self {
            label: spec.label.clone(),
            pid,
            child: Arc::new(Mutex::new(child)),
            stdin: Some(stdin),
            source,
            stderr: StderrTail::spawn(&spec.label, pid, stderr),
            quit_grace: spec.quit_grace,
            state: HandleState::Running,
        })
    }

    /// OS process id of the worker
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True while the handle can still accept commands
    pub fn is_running(&self) -> bool {
        self.state == HandleState::Running
    }

    /// Write one command and block for its reply
    ///
    /// Any failure that leaves the child unusable (exit, timeout, fatal
    /// frame) kills it; the handle must then be discarded.
    pub fn send(&mut self, request: &Request, timeout: Duration) -> Result<Reply> {
        if self.state != HandleState::Running {
            return Err(ModelError::WorkerUnavailable(format!(
                "{} worker process is not running",
                self.label
            )));
        }

        let line = protocol::encode(request)?;
        tracing::debug!("-> {} worker: {}", self.label, request.name());

        if let Err(e) = self.write_line(&line) {
            self.abort();
            let detail = self.stderr.render();
            return Err(ModelError::WorkerUnavailable(format!(
                "{} worker process crashed before receiving command: {}{}",
                self.label, e, detail
            )));
        }

        let outcome = match &mut self.source {
            ResponseSource::Direct(reader) => read_direct(reader, &self.child, timeout),
            ResponseSource::Queue(rx) => read_queue(rx, timeout),
        };

        match outcome {
            ReadOutcome::Frame(Response::Ok { result, audio }) => {
                tracing::debug!("<- {} worker: ok", self.label);
                Ok(Reply { result, audio })
            }
            ReadOutcome::Frame(Response::Error { message }) => {
                tracing::debug!("<- {} worker: error: {}", self.label, message);
                Err(ModelError::WorkerReported {
                    message: non_empty(message, &format!("{} worker command failed", self.label)),
                    fatal: false,
                })
            }
            ReadOutcome::Frame(Response::Fatal { message }) => {
                tracing::warn!("{} worker reported a fatal error", self.label);
                self.abort();
                Err(ModelError::WorkerReported {
                    message: non_empty(message, &format!("{} worker fatal error", self.label)),
                    fatal: true,
                })
            }
            ReadOutcome::Malformed(detail) => {
                // Replies carry no ids; after a stray frame the exchange is out of step
                tracing::warn!("{} worker sent an unrecognized reply, killing: {}", self.label, detail);
                self.abort();
                Err(ModelError::WorkerReported {
                    message: format!("Unrecognized reply from {} worker: {}", self.label, detail),
                    fatal: true,
                })
            }
            ReadOutcome::Closed => {
                self.abort();
                let detail = self.stderr.render();
                tracing::warn!("{} worker exited unexpectedly{}", self.label, detail);
                Err(ModelError::WorkerUnavailable(format!(
                    "{} worker process exited unexpectedly{}",
                    self.label, detail
                )))
            }
            ReadOutcome::TimedOut => {
                self.abort();
                let detail = self.stderr.render();
                tracing::warn!(
                    "{} worker unresponsive after {}s, killed{}",
                    self.label,
                    timeout.as_secs(),
                    detail
                );
                Err(ModelError::WorkerTimeout(timeout.as_secs()))
            }
        }
    }

    /// Ask the worker to quit, force-killing it if it does not exit in time
    ///
    /// Calling this on a stopped or broken handle is a no-op.
    pub fn terminate(&mut self) {
        if self.state != HandleState::Running {
            self.stdin = None;
            return;
        }
        self.state = HandleState::Stopped;

        let asked = protocol::encode(&Request::Quit)
            .ok()
            .map(|line| self.write_line(&line).is_ok())
            .unwrap_or(false);
        // Closing stdin is a second exit signal for workers reading to EOF
        self.stdin = None;

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if asked {
            let deadline = Instant::now() + self.quit_grace;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::info!("{} worker (pid {}) exited: {}", self.label, self.pid, status);
                        return;
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(20)),
                    Err(_) => break,
                }
            }
        }

        tracing::warn!("{} worker (pid {}) did not quit, killing", self.label, self.pid);
        kill_process_tree(&mut child);
        let _ = child.wait();
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin already closed")
        })?;
        stdin.write_all(line.as_bytes())?;
        stdin.flush()
    }

    /// Kill and reap the child without attempting a graceful quit
    fn abort(&mut self) {
        self.state = HandleState::Broken;
        self.stdin = None;
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        kill_process_tree(&mut child);
        let _ = child.wait();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .finish()
    }
}

/// Pid of a manager's live worker, readable without its command lock
///
/// Lets an interrupt handler kill a worker that is in the middle of a long
/// command, while the command lock is still held by the waiting caller.
#[derive(Debug, Default)]
pub struct LiveWorker(AtomicU32);

impl LiveWorker {
    pub fn set(&self, pid: Option<u32>) {
        self.0.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// SIGKILL the live worker's process group, if any
    pub fn kill(&self) {
        if let Some(pid) = self.pid() {
            tracing::warn!("Killing worker process group {}", pid);
            kill_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    if let Ok(pid) = libc::pid_t::try_from(pid) {
        // SAFETY: plain syscall on a process group created at spawn
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// SIGKILL the worker and its process group
///
/// Must run before the child is reaped: until then its pid (and so its
/// group id) cannot be reused.
fn kill_process_tree(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}

/// Read the next protocol frame, skipping noise
fn next_frame<R: BufRead>(reader: &mut R) -> ReadOutcome {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => return ReadOutcome::Closed,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf);
        match protocol::decode_line(&line) {
            Ok(Some(response)) => return ReadOutcome::Frame(response),
            Ok(None) => {
                if !line.trim().is_empty() {
                    tracing::debug!("Discarding worker output: {}", line.trim_end());
                }
            }
            Err(e) => return ReadOutcome::Malformed(e.to_string()),
        }
    }
}

fn read_direct(
    reader: &mut BufReader<ChildStdout>,
    child: &Arc<Mutex<Child>>,
    timeout: Duration,
) -> ReadOutcome {
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
    let fired = Arc::new(AtomicBool::new(false));

    let watchdog = {
        let child = Arc::clone(child);
        let fired = Arc::clone(&fired);
        thread::spawn(move || {
            if matches!(done_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)) {
                fired.store(true, Ordering::SeqCst);
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                kill_process_tree(&mut child);
            }
        })
    };

    let outcome = next_frame(reader);
    drop(done_tx);
    let _ = watchdog.join();

    if fired.load(Ordering::SeqCst) {
        ReadOutcome::TimedOut
    } else {
        outcome
    }
}

fn read_queue(
    rx: &Receiver<std::result::Result<Response, String>>,
    timeout: Duration,
) -> ReadOutcome {
    match rx.recv_timeout(timeout) {
        Ok(Ok(response)) => ReadOutcome::Frame(response),
        Ok(Err(detail)) => ReadOutcome::Malformed(detail),
        Err(RecvTimeoutError::Timeout) => ReadOutcome::TimedOut,
        Err(RecvTimeoutError::Disconnected) => ReadOutcome::Closed,
    }
}

/// Continuously drain worker stdout into the response queue
///
/// Exits when the pipe closes or the handle owning the receiver is gone.
/// Dropping the sender on exit is what the caller observes as "closed".
fn spawn_stdout_drain(
    label: &str,
    pid: u32,
    stdout: ChildStdout,
    tx: Sender<std::result::Result<Response, String>>,
) {
    let label = label.to_string();
    let spawned = thread::Builder::new()
        .name(format!("{}-worker-{}-stdout", label, pid))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let event = match next_frame(&mut reader) {
                    ReadOutcome::Frame(response) => Ok(response),
                    ReadOutcome::Malformed(detail) => Err(detail),
                    ReadOutcome::Closed | ReadOutcome::TimedOut => break,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            tracing::debug!("{} worker (pid {}) stdout reader exiting", label, pid);
        });

    if let Err(e) = spawned {
        // Without a reader the queue sender is dropped here; the first send
        // then observes a closed worker.
        tracing::error!("Failed to start worker stdout reader: {}", e);
    }
}

/// Rolling tail of a worker's stderr
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl StderrTail {
    fn spawn(label: &str, pid: u32, stderr: Option<std::process::ChildStderr>) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let Some(stderr) = stderr else {
            return Self {
                lines,
                reader: None,
            };
        };

        let sink = Arc::clone(&lines);
        let label = label.to_string();
        let reader = thread::Builder::new()
            .name(format!("{}-worker-{}-stderr", label, pid))
            .spawn(move || {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::trace!("[{} worker] {}", label, line);
                    let mut tail = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
            .ok();

        Self { lines, reader }
    }

    /// Render the collected tail as an error-message suffix
    ///
    /// Waits briefly for the drain thread so output written just before the
    /// child died is included.
    fn render(&mut self) -> String {
        if let Some(reader) = self.reader.take() {
            let deadline = Instant::now() + STDERR_SETTLE;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if reader.is_finished() {
                let _ = reader.join();
            }
        }

        let tail = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.is_empty() {
            String::new()
        } else {
            format!(": {}", tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}
