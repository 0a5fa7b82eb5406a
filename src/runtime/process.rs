/*!
 * Decoder runtime for a single language pair.
 *
 * A `RuntimeProcess` owns at most one external decoder process and talks to
 * it over a line protocol: one UTF-8 line in on stdin, one line out on
 * stdout. The decoder cannot interleave requests, so every exchange happens
 * under the runtime's own async mutex, which also guards the process handle.
 * Start, restart and stop go through the same mutex, so a teardown always
 * waits for the call in flight.
 */

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;

use crate::app_config::RuntimeSettings;
use crate::errors::RuntimeError;

use super::html;
use super::key::LanguagePairKey;
use super::model_files::ModelFiles;

/// Number of decoder stderr lines kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr of a decoder that died during startup
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    /// Never started
    Uninitialized,
    /// Decoder is being spawned
    Starting,
    /// Decoder is running and idle
    Ready,
    /// A translate call is in flight
    Busy,
    /// Decoder failed to start, died or stalled
    Crashed,
    /// Decoder was shut down
    Stopped,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A spawned decoder with its connected streams
struct DecoderProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr_tail: StderrTail,
    stderr_task: JoinHandle<()>,
}

enum ExchangeError {
    Io(std::io::Error),
    Closed,
    Decode(std::string::FromUtf8Error),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Closed => f.write_str("decoder closed its output stream"),
            Self::Decode(e) => write!(f, "decoder output is not valid UTF-8: {}", e),
        }
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

/// Outcome of one bounded exchange, detached from the process borrow
enum Exchange {
    Line(String),
    Undecodable(String),
    Broken(String),
    TimedOut,
}

impl DecoderProcess {
    /// Send one line and read one line back
    async fn exchange(&mut self, text: &str) -> Result<String, ExchangeError> {
        // A second line on stdin would shift every later response by one
        let line = text.replace(['\r', '\n'], " ");

        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let mut buffer = Vec::new();
        let read = self.stdout.read_until(b'\n', &mut buffer).await?;
        if read == 0 {
            return Err(ExchangeError::Closed);
        }

        String::from_utf8(buffer).map_err(ExchangeError::Decode)
    }

    fn stderr_excerpt(&self) -> String {
        self.stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Close stdin, give the decoder `grace` to exit, then kill it
    async fn terminate(self, key: &LanguagePairKey, grace: Duration) {
        let DecoderProcess { mut child, stdin, stdout, stderr_task, .. } = self;
        drop(stdin);
        drop(stdout);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Decoder for {} exited with {}", key, status),
            Ok(Err(e)) => warn!("Failed to wait for decoder {}: {}", key, e),
            Err(_) => {
                warn!("Decoder for {} did not exit within {:?}, killing it", key, grace);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill decoder for {}: {}", key, e);
                }
            }
        }

        stderr_task.abort();
    }

    /// Kill a decoder stuck mid-line; it would not notice a closed stdin
    async fn kill(self, key: &LanguagePairKey) {
        let DecoderProcess { mut child, stderr_task, .. } = self;
        if let Err(e) = child.kill().await {
            warn!("Failed to kill decoder for {}: {}", key, e);
        }
        stderr_task.abort();
    }
}

/// Forward decoder stderr to the debug log, keeping the last lines around
async fn drain_stderr(stderr: ChildStderr, tail: StderrTail, key: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("[{}] {}", key, line);
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading stderr of {}: {}", key, e);
                break;
            }
        }
    }
}

/// One decoder process for one language pair
pub struct RuntimeProcess {
    key: LanguagePairKey,
    model_dir: PathBuf,
    settings: RuntimeSettings,
    process: AsyncMutex<Option<DecoderProcess>>,
    state: Mutex<RuntimeState>,
    loaded_at: Mutex<Option<DateTime<Utc>>>,
    retired: AtomicBool,
}

impl fmt::Debug for RuntimeProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeProcess")
            .field("key", &self.key)
            .field("model_dir", &self.model_dir)
            .field("state", &self.state())
            .field("loaded_at", &self.loaded_at())
            .finish()
    }
}

impl RuntimeProcess {
    /// Create a runtime bound to `model_dir`; nothing is spawned yet
    pub fn new(key: LanguagePairKey, model_dir: PathBuf, settings: RuntimeSettings) -> Self {
        Self {
            key,
            model_dir,
            settings,
            process: AsyncMutex::new(None),
            state: Mutex::new(RuntimeState::Uninitialized),
            loaded_at: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    /// Language pair this runtime translates
    pub fn key(&self) -> &LanguagePairKey {
        &self.key
    }

    /// Directory the model files are loaded from
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Current lifecycle state
    pub fn state(&self) -> RuntimeState {
        *self.state.lock()
    }

    /// When the current decoder process finished starting
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        *self.loaded_at.lock()
    }

    /// Whether a decoder process is currently up
    pub fn is_running(&self) -> bool {
        matches!(self.state(), RuntimeState::Ready | RuntimeState::Busy)
    }

    /// Whether the runtime was removed from its cache
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// OS process id of the running decoder
    pub async fn process_id(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|process| process.child.id())
    }

    /// Mark the runtime as removed; it will not start a decoder again
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn set_state(&self, state: RuntimeState) {
        *self.state.lock() = state;
    }

    fn startup_failure(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::StartupFailure { key: self.key.to_string(), message: message.into() }
    }

    fn runtime_failure(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::RuntimeFailure { key: self.key.to_string(), message: message.into() }
    }

    /// Start the decoder if it is not running yet
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let mut slot = self.process.lock().await;
        self.ensure_started(&mut slot).await
    }

    /// Start the decoder while holding a permit from `limiter`
    ///
    /// The runtime lock is taken before waiting for the permit, so callers of
    /// `translate` on the same runtime queue behind this start instead of
    /// spawning a decoder outside the limit. A failed start retires the
    /// runtime before the lock is released, so nothing retries it unlimited.
    pub(crate) async fn start_limited(&self, limiter: &Semaphore) -> Result<(), RuntimeError> {
        let mut slot = self.process.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let result = match limiter.acquire().await {
            Ok(_permit) => self.ensure_started(&mut slot).await,
            Err(_) => Err(self.startup_failure("load limiter was closed")),
        };
        if result.is_err() {
            self.retire();
        }
        result
    }

    async fn ensure_started(&self, slot: &mut Option<DecoderProcess>) -> Result<(), RuntimeError> {
        if self.is_retired() {
            return Err(self.runtime_failure("runtime was unloaded"));
        }
        if slot.is_none() {
            *slot = Some(self.spawn().await?);
        }
        Ok(())
    }

    async fn spawn(&self) -> Result<DecoderProcess, RuntimeError> {
        self.set_state(RuntimeState::Starting);
        let result = self.spawn_decoder().await;
        match &result {
            Ok(process) => {
                *self.loaded_at.lock() = Some(Utc::now());
                self.set_state(RuntimeState::Ready);
                info!(
                    "Started decoder for {} (pid {})",
                    self.key,
                    process.child.id().map(|id| id.to_string()).unwrap_or_else(|| "?".to_string())
                );
            }
            Err(e) => {
                self.set_state(RuntimeState::Crashed);
                warn!("Could not start decoder for {}: {}", self.key, e);
            }
        }
        result
    }

    async fn spawn_decoder(&self) -> Result<DecoderProcess, RuntimeError> {
        let files = ModelFiles::locate(&self.model_dir)?;
        debug!(
            "Spawning {} for {} with {:?}",
            self.settings.decoder_path.display(),
            self.key,
            files
        );

        let mut child = Command::new(&self.settings.decoder_path)
            .args(files.decoder_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.startup_failure(format!(
                    "failed to spawn {}: {}",
                    self.settings.decoder_path.display(),
                    e
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| self.startup_failure("stdin was not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| self.startup_failure("stdout was not captured"))?;
        let stderr = child.stderr.take().ok_or_else(|| self.startup_failure("stderr was not captured"))?;

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut stderr_task = tokio::spawn(drain_stderr(stderr, stderr_tail.clone(), self.key.to_string()));

        tokio::time::sleep(self.settings.startup_grace).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut stderr_task).await;
                stderr_task.abort();
                let diagnostics = stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
                let diagnostics = if diagnostics.trim().is_empty() {
                    "no error output".to_string()
                } else {
                    diagnostics
                };
                return Err(self.startup_failure(format!("decoder exited with {}: {}", status, diagnostics)));
            }
            Err(e) => {
                stderr_task.abort();
                return Err(self.startup_failure(format!("failed to poll decoder: {}", e)));
            }
        }

        Ok(DecoderProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr_tail,
            stderr_task,
        })
    }

    /// Translate one line of text, starting the decoder first if needed
    ///
    /// On a timeout or a broken decoder the runtime restarts itself before
    /// returning the error, so the next call on the same runtime can succeed.
    pub async fn translate(&self, text: &str) -> Result<String, RuntimeError> {
        let mut slot = self.process.lock().await;
        self.ensure_started(&mut slot).await?;

        let exchange = {
            let process = slot
                .as_mut()
                .ok_or_else(|| self.runtime_failure("decoder is not running"))?;
            self.set_state(RuntimeState::Busy);
            debug!("[{}] >> {}", self.key, text);

            match tokio::time::timeout(self.settings.translate_timeout, process.exchange(text)).await {
                Ok(Ok(line)) => Exchange::Line(line),
                Ok(Err(ExchangeError::Decode(e))) => {
                    Exchange::Undecodable(ExchangeError::Decode(e).to_string())
                }
                Ok(Err(e)) => {
                    let mut message = match process.child.try_wait() {
                        Ok(Some(status)) => format!("{} (decoder exited with {})", e, status),
                        _ => e.to_string(),
                    };
                    let excerpt = process.stderr_excerpt();
                    if !excerpt.is_empty() {
                        message.push_str(": ");
                        message.push_str(&excerpt);
                    }
                    Exchange::Broken(message)
                }
                Err(_) => Exchange::TimedOut,
            }
        };

        match exchange {
            Exchange::Line(line) => {
                self.set_state(RuntimeState::Ready);
                let translated = html::unescape(line.trim());
                debug!("[{}] << {}", self.key, translated);
                Ok(translated)
            }
            Exchange::Undecodable(message) => {
                self.set_state(RuntimeState::Ready);
                Err(self.runtime_failure(message))
            }
            Exchange::Broken(message) => {
                warn!("Decoder for {} failed mid-call: {}", self.key, message);
                self.set_state(RuntimeState::Crashed);
                self.restart(&mut slot, false).await?;
                Err(self.runtime_failure(message))
            }
            Exchange::TimedOut => {
                let seconds = self.settings.translate_timeout.as_secs();
                warn!("Decoder for {} timed out after {:?}, restarting", self.key, self.settings.translate_timeout);
                self.set_state(RuntimeState::Crashed);
                self.restart(&mut slot, true).await?;
                Err(RuntimeError::Timeout { key: self.key.to_string(), seconds })
            }
        }
    }

    /// Replace the decoder; a `stalled` one is killed without a grace period
    async fn restart(&self, slot: &mut Option<DecoderProcess>, stalled: bool) -> Result<(), RuntimeError> {
        if stalled {
            if let Some(process) = slot.take() {
                process.kill(&self.key).await;
            }
            self.set_state(RuntimeState::Stopped);
        } else {
            self.shutdown(slot).await;
        }
        if self.is_retired() {
            return Ok(());
        }

        info!("Restarting decoder for {}", self.key);
        match self.spawn().await {
            Ok(process) => {
                *slot = Some(process);
                Ok(())
            }
            Err(e) => {
                error!("Failed to restart decoder for {}: {}", self.key, e);
                Err(e)
            }
        }
    }

    async fn shutdown(&self, slot: &mut Option<DecoderProcess>) {
        if let Some(process) = slot.take() {
            info!("Stopping decoder for {}", self.key);
            process.terminate(&self.key, self.settings.stop_grace).await;
        }
        self.set_state(RuntimeState::Stopped);
    }

    /// Stop the decoder, waiting for any call in flight first
    ///
    /// Safe to call repeatedly; a stopped runtime starts again on the next
    /// translate unless it was retired.
    pub async fn stop(&self) {
        let mut slot = self.process.lock().await;
        self.shutdown(&mut slot).await;
    }
}
