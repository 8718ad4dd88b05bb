//! Long-running plugin process and its stdio invocation channel
//!
//! Requests and responses are newline-delimited JSON. The daemon writes
//!
//! ```text
//! {"session_id":"..","event":"request","data":{"method":"tool.invoke","payload":{..}}}
//! ```
//!
//! and the plugin answers with any number of `stream` messages followed by
//! `end` or `error` for the same session. Messages without a session
//! (`heartbeat`, `log`) are traced and otherwise ignored.
//!
//! Session channels are unbounded: the reader never waits on a caller, so one
//! stalled consumer cannot hold back the other sessions of the same process.

use crate::error::{Result, RuntimeError};
use crate::identity::PluginIdentity;
use crate::supervisor::terminate;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// One capability call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRequest {
    /// Capability method, e.g. `tool.invoke` or `llm.invoke`
    pub method: String,
    #[serde(default)]
    pub payload: Value,
}

/// Item of an invocation's result stream
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationEvent {
    Chunk(Value),
    Error(String),
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    session_id: &'a str,
    event: &'static str,
    data: &'a InvocationRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PluginEvent {
    Stream,
    End,
    Error,
    Heartbeat,
    Log,
}

#[derive(Debug, Deserialize)]
struct PluginMessage {
    #[serde(default)]
    session_id: Option<String>,
    event: PluginEvent,
    #[serde(default)]
    data: Value,
}

type Sessions = Arc<DashMap<String, mpsc::UnboundedSender<InvocationEvent>>>;

/// Running plugin process
pub struct PluginProcess {
    identity: PluginIdentity,
    pid: Option<u32>,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    sessions: Sessions,
    readers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl PluginProcess {
    /// Launch `<interpreter> -m <entrypoint>` inside `working_path`.
    pub async fn spawn(
        identity: PluginIdentity,
        interpreter: &Path,
        working_path: &Path,
        entrypoint: &str,
    ) -> Result<Self> {
        let mut command = Command::new(interpreter);
        command.args(["-m", entrypoint]);
        Self::spawn_command(identity, command, working_path).await
    }

    /// Launch an arbitrary command speaking the stdio protocol.
    pub async fn spawn_command(
        identity: PluginIdentity,
        mut command: Command,
        working_path: &Path,
    ) -> Result<Self> {
        command
            .current_dir(working_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| RuntimeError::ProcessStart {
            command: format!("plugin {identity}"),
            source,
        })?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            terminate(&mut child, identity.as_str()).await;
            return Err(RuntimeError::Invocation(format!(
                "plugin {identity} started without piped stdio"
            )));
        };

        let sessions: Sessions = Arc::new(DashMap::new());

        let stdout_reader =
            tokio::spawn(read_responses(identity.clone(), stdout, sessions.clone()));
        let stderr_identity = identity.clone();
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("plugin {} - {}", stderr_identity, line);
            }
        });

        info!("Plugin {} process started (pid {:?})", identity, pid);

        Ok(Self {
            identity,
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            sessions,
            readers: SyncMutex::new(vec![stdout_reader, stderr_reader]),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Number of invocations awaiting their `end`.
    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Send a request; results arrive on the returned channel, which closes
    /// after `end` or `error`.
    pub async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<mpsc::UnboundedReceiver<InvocationEvent>> {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(session_id.clone(), tx);

        let message = OutboundMessage {
            session_id: &session_id,
            event: "request",
            data: &request,
        };
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                self.sessions.remove(&session_id);
                return Err(RuntimeError::Invocation(format!("encode request: {e}")));
            }
        };
        line.push(b'\n');

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(&line).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            self.sessions.remove(&session_id);
            return Err(RuntimeError::Invocation(format!(
                "write to plugin {}: {}",
                self.identity, e
            )));
        }

        debug!("Plugin {} session {} -> {}", self.identity, session_id, request.method);
        Ok(rx)
    }

    /// Exit status if the process is gone.
    pub async fn try_exited(&self) -> Option<String> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    /// Kill the process and stop its readers. Idempotent.
    pub async fn kill(&self) {
        {
            let mut child = self.child.lock().await;
            terminate(&mut child, self.identity.as_str()).await;
        }
        let readers = std::mem::take(&mut *self.readers.lock());
        for reader in readers {
            reader.abort();
            let _ = reader.await;
        }
        fail_pending(&self.sessions, "plugin process stopped");
    }
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("identity", &self.identity)
            .field("pid", &self.pid)
            .field("pending_sessions", &self.sessions.len())
            .finish()
    }
}

async fn read_responses(
    identity: PluginIdentity,
    stdout: tokio::process::ChildStdout,
    sessions: Sessions,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Plugin {} stdout read error: {}", identity, e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let message: PluginMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(_) => {
                // plain prints from plugin code
                debug!("plugin {} - {}", identity, line);
                continue;
            }
        };

        let Some(session_id) = message.session_id else {
            trace!("Plugin {} {:?}", identity, message.event);
            continue;
        };

        match message.event {
            PluginEvent::Stream => {
                let sender = sessions.get(&session_id).map(|s| s.value().clone());
                if let Some(sender) = sender {
                    if sender.send(InvocationEvent::Chunk(message.data)).is_err() {
                        // caller went away
                        sessions.remove(&session_id);
                    }
                }
            }
            PluginEvent::End => {
                sessions.remove(&session_id);
            }
            PluginEvent::Error => {
                if let Some((_, sender)) = sessions.remove(&session_id) {
                    let text = message
                        .data
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| message.data.to_string());
                    let _ = sender.send(InvocationEvent::Error(text));
                }
            }
            PluginEvent::Heartbeat | PluginEvent::Log => {}
        }
    }

    debug!("Plugin {} stdout closed", identity);
    fail_pending(&sessions, "plugin process exited");
}

fn fail_pending(sessions: &Sessions, reason: &str) {
    let pending: Vec<String> = sessions.iter().map(|e| e.key().clone()).collect();
    for session_id in pending {
        if let Some((_, sender)) = sessions.remove(&session_id) {
            let _ = sender.send(InvocationEvent::Error(reason.to_string()));
        }
    }
}
