//! JSON-lines subprocess bridge to an LLM provider script.
//!
//! Spawns `<cmd> run <script>`, waits for `{"type":"ready"}`, then exchanges
//! one request line for one response line. The script owns prompting and the
//! provider API; this side only shapes requests and parses the answers.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use genie_shared::{AmbiguityContext, BridgeSection, GenieError, Result};

use crate::proposer::{FieldProposer, FieldRefiner, Proposal, Refinement, parse_mapping_response};

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Request message sent to the bridge.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage<'a> {
    #[serde(rename = "propose")]
    Propose {
        id: String,
        model: &'a str,
        documents: &'a [String],
        hints: &'a [String],
    },
    #[serde(rename = "refine")]
    Refine {
        id: String,
        model: &'a str,
        fields: &'a BTreeMap<String, AmbiguityContext>,
    },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result {
        id: String,
        text: String,
        #[serde(default)]
        tokens_in: u64,
        #[serde(default)]
        tokens_out: u64,
        #[serde(default)]
        model: String,
    },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: Option<String>,
        error: String,
    },
}

/// Completion returned by the bridge.
#[derive(Debug, Clone, PartialEq)]
struct BridgeResult {
    text: String,
    tokens_in: u64,
    tokens_out: u64,
}

impl BridgeResult {
    fn tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// How long `shutdown` waits for the bridge to exit before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle to the spawned bridge subprocess.
///
/// Stdout is drained by a reader thread so every read can carry a deadline.
/// A bridge still running when the handle is dropped is killed and reaped.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
    timeout: Duration,
    request_counter: u64,
}

impl BridgeHandle {
    fn spawn(config: &BridgeSection) -> Result<Self> {
        info!(cmd = %config.cmd, script = %config.script, "spawning proposer bridge");

        let mut child = Command::new(&config.cmd)
            .arg("run")
            .arg(&config.script)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .spawn()
            .map_err(|e| {
                GenieError::Proposer(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GenieError::Proposer("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GenieError::Proposer("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            lines: spawn_reader(stdout)?,
            timeout: Duration::from_secs(config.timeout_secs),
            request_counter: 0,
        };
        handle.wait_for_ready()?;
        Ok(handle)
    }

    fn read_message(&mut self) -> Result<ResponseMessage> {
        let line = match self.lines.recv_timeout(self.timeout) {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => return Err(GenieError::Proposer(format!("bridge read error: {e}"))),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(GenieError::Proposer("bridge closed stdout unexpectedly".into()));
            }
            Err(RecvTimeoutError::Timeout) => {
                // A late answer would desynchronize the protocol.
                warn!(secs = self.timeout.as_secs(), "bridge timed out, killing it");
                self.kill();
                return Err(GenieError::Proposer(format!(
                    "bridge did not answer within {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        serde_json::from_str(line.trim()).map_err(|e| {
            let preview: String = line.chars().take(200).collect();
            GenieError::Proposer(format!("invalid bridge message: {e} (got: {preview})"))
        })
    }

    fn wait_for_ready(&mut self) -> Result<()> {
        match self.read_message()? {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            other => Err(GenieError::Proposer(format!(
                "expected ready message, got: {other:?}"
            ))),
        }
    }

    fn next_id(&mut self) -> String {
        self.request_counter += 1;
        format!("req-{}", self.request_counter)
    }

    fn write_line(&mut self, json: &str) -> std::io::Result<()> {
        writeln!(self.stdin, "{json}")?;
        self.stdin.flush()
    }

    /// Send one request and wait for its response.
    fn send(&mut self, id: &str, request: &RequestMessage<'_>) -> Result<BridgeResult> {
        let json = serde_json::to_string(request)
            .map_err(|e| GenieError::Proposer(format!("failed to serialize request: {e}")))?;
        self.write_line(&json)
            .map_err(|e| GenieError::Proposer(format!("failed to write to bridge stdin: {e}")))?;

        match self.read_message()? {
            ResponseMessage::Result {
                id: resp_id,
                text,
                tokens_in,
                tokens_out,
                model,
            } if resp_id == id => {
                debug!(id, %model, tokens_in, tokens_out, "bridge result");
                Ok(BridgeResult {
                    text,
                    tokens_in,
                    tokens_out,
                })
            }
            ResponseMessage::Result { id: resp_id, .. } => Err(GenieError::Proposer(format!(
                "bridge answered {resp_id}, expected {id}"
            ))),
            ResponseMessage::Error { error, .. } => Err(GenieError::Proposer(error)),
            ResponseMessage::Ready => Err(GenieError::Proposer(
                "unexpected ready message during request".into(),
            )),
        }
    }

    /// Send shutdown and wait for the bridge to exit, killing it after
    /// [`SHUTDOWN_GRACE`].
    fn shutdown(&mut self) {
        if self.has_exited() {
            return;
        }
        match serde_json::to_string(&RequestMessage::Shutdown) {
            Ok(json) => {
                if let Err(e) = self.write_line(&json) {
                    debug!(error = %e, "could not send shutdown to bridge");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize shutdown request"),
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(?status, "bridge exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => {
                    warn!("bridge ignored shutdown, killing it");
                    self.kill();
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "bridge wait error");
                    return;
                }
            }
        }
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "bridge kill failed");
        }
        match self.child.wait() {
            Ok(status) => debug!(?status, "bridge reaped"),
            Err(e) => warn!(error = %e, "bridge wait error"),
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if !self.has_exited() {
            warn!("bridge still running on drop, killing it");
            self.kill();
        }
    }
}

/// Forward stdout lines to a channel until EOF, a read error, or the
/// receiver going away.
fn spawn_reader(stdout: ChildStdout) -> Result<Receiver<std::io::Result<String>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("genie-bridge-reader".into())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                let message = match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => Ok(line),
                    Err(e) => Err(e),
                };
                let failed = message.is_err();
                if tx.send(message).is_err() || failed {
                    break;
                }
            }
        })
        .map_err(|e| GenieError::Proposer(format!("failed to start bridge reader: {e}")))?;
    Ok(rx)
}

// ---------------------------------------------------------------------------
// BridgeClient
// ---------------------------------------------------------------------------

/// Proposer and refiner backed by the bridge subprocess.
///
/// Requests are serialized through a mutex; the protocol is strictly one
/// request in flight at a time.
pub struct BridgeClient {
    handle: Mutex<BridgeHandle>,
    model: String,
}

impl BridgeClient {
    /// Spawn the bridge and wait until it reports ready.
    pub fn spawn(config: &BridgeSection) -> Result<Self> {
        Ok(Self {
            handle: Mutex::new(BridgeHandle::spawn(config)?),
            model: config.model.clone(),
        })
    }

    fn request<'a>(
        &'a self,
        build: impl FnOnce(String, &'a str) -> RequestMessage<'a>,
    ) -> Result<BridgeResult> {
        let mut handle = self
            .handle
            .lock()
            .map_err(|_| GenieError::Proposer("bridge handle poisoned".into()))?;
        let id = handle.next_id();
        let request = build(id.clone(), &self.model);
        handle.send(&id, &request)
    }

    /// Ask the bridge to exit and reap it.
    pub fn shutdown(self) {
        let mut handle = match self.handle.into_inner() {
            Ok(handle) => handle,
            Err(poisoned) => poisoned.into_inner(),
        };
        handle.shutdown();
    }
}

impl FieldProposer for BridgeClient {
    fn propose(&self, documents: &[String], hints: &[String]) -> Result<Proposal> {
        let result = self.request(|id, model| RequestMessage::Propose {
            id,
            model,
            documents,
            hints,
        })?;
        Ok(Proposal {
            mapping: parse_mapping_response(&result.text)?,
            tokens_used: result.tokens(),
        })
    }
}

impl FieldRefiner for BridgeClient {
    fn refine(&self, fields: &BTreeMap<String, AmbiguityContext>) -> Result<Refinement> {
        let result = self
            .request(|id, model| RequestMessage::Refine { id, model, fields })
            .map_err(as_refiner_error)?;
        let replacements = parse_mapping_response(&result.text).map_err(as_refiner_error)?;
        Ok(Refinement {
            replacements,
            tokens_used: result.tokens(),
        })
    }
}

fn as_refiner_error(e: GenieError) -> GenieError {
    match e {
        GenieError::Proposer(message) => GenieError::Refiner(message),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
