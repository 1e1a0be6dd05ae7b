//! One chat session: the socket state machine and the agent subprocess it
//! drives.

use crate::scan;
use crate::{RelayConfig, RunState, ServerMessage};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use scriptforge_error::{Error, ErrorKind, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Incoming frame. Anything that is not `input` asks for a run.
#[derive(Debug, Default, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    agent_script: String,
    #[serde(default)]
    scripts_dir: Option<String>,
    #[serde(default)]
    agent_dir: Option<String>,
    #[serde(default)]
    llm_model: Option<String>,
    #[serde(default)]
    openai_base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Input(String),
    Run(RunRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub agent_script: String,
    pub scripts_dir: Option<String>,
    pub agent_dir: Option<String>,
    /// Model picked by the client, exported as `LLM_MODEL`
    pub llm_model: Option<String>,
    /// Exported as `OPENAI_BASE_URL`
    pub openai_base_url: Option<String>,
}

impl RunRequest {
    /// Environment the agent process gets on top of the relay's own.
    pub fn env(&self) -> Vec<(&'static str, &str)> {
        let mut env = vec![("PYTHONUNBUFFERED", "1")];
        if let Some(model) = &self.llm_model {
            env.push(("LLM_MODEL", model));
        }
        if let Some(base) = &self.openai_base_url {
            env.push(("OPENAI_BASE_URL", base));
        }
        env
    }
}

impl ClientRequest {
    pub fn parse(raw: &str) -> Result<Self> {
        let frame: ClientFrame = serde_json::from_str(raw).map_err(|e| {
            Error::parse_failed(format!("invalid client message: {}", e)).set_source(e)
        })?;
        if frame.kind == "input" {
            return Ok(ClientRequest::Input(frame.text));
        }
        Ok(ClientRequest::Run(RunRequest {
            agent_script: frame.agent_script,
            scripts_dir: frame.scripts_dir.filter(|s| !s.is_empty()),
            agent_dir: frame.agent_dir.filter(|s| !s.is_empty()),
            llm_model: frame.llm_model.filter(|s| !s.is_empty()),
            openai_base_url: frame.openai_base_url.filter(|s| !s.is_empty()),
        }))
    }
}

/// Argument vector for a run: interpreter for `.py` scripts, the program
/// itself otherwise.
pub fn build_command(python: &str, request: &RunRequest) -> Vec<String> {
    let mut cmd = Vec::new();
    if request.agent_script.ends_with(".py") {
        cmd.push(python.to_string());
    }
    cmd.push(request.agent_script.clone());
    if request.agent_script.to_lowercase().contains("interactive") {
        cmd.push("--interactive".to_string());
    }
    if let Some(dir) = &request.scripts_dir {
        cmd.push("--scripts".to_string());
        cmd.push(dir.clone());
    }
    cmd
}

/// State that outlives a single connection, keyed by session id
#[derive(Default)]
pub struct Session {
    stdin: Mutex<Option<ChildStdin>>,
    /// Held only for take/store, never across an await
    run: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Abort the current run and wait until its process is gone. The agent
    /// is killed when the aborted task drops it.
    pub(crate) async fn cancel_run(&self) {
        let Some(run) = self.run_slot().take() else {
            return;
        };
        if !run.is_finished() {
            info!("cancelling previous run");
        }
        run.abort();
        let _ = run.await;
        self.stdin.lock().await.take();
    }

    async fn start_run(self: &Arc<Self>, config: Arc<RelayConfig>, request: RunRequest, out: Outbox) {
        self.cancel_run().await;
        let handle = tokio::spawn(run_agent(config, self.clone(), request, out));
        *self.run_slot() = Some(handle);
    }

    fn run_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forward a line to the running process. Dropped when nothing runs.
    async fn send_input(&self, text: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            debug!("input with no running process");
            return Ok(());
        };
        stdin.write_all(format!("{}\n", text).as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Socket loop
// ============================================================================

pub(crate) async fn handle_socket(
    socket: WebSocket,
    session_id: String,
    session: Arc<Session>,
    config: Arc<RelayConfig>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut send_task: JoinHandle<Result<()>> = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = serde_json::to_string(&message).map_err(|e| {
                Error::serialization_failed(format!("failed to encode message: {}", e))
            })?;
            sender
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| Error::network_failed(format!("failed to send to socket: {}", e)))?;
        }
        Ok(())
    });

    let recv_session = session.clone();
    let mut recv_task: JoinHandle<Result<()>> = tokio::spawn(async move {
        let session = recv_session;
        loop {
            let message = match receiver.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(Error::network_failed(format!("socket receive failed: {}", e)))
                }
                None => return Ok(()),
            };
            match message {
                Message::Text(text) => match ClientRequest::parse(text.as_str()) {
                    Ok(ClientRequest::Input(line)) => {
                        if let Err(e) = session.send_input(&line).await {
                            let _ = tx.send(ServerMessage::Error {
                                text: format!("Failed to send input: {}", e.message()),
                            });
                        }
                    }
                    Ok(ClientRequest::Run(request)) => {
                        session.start_run(config.clone(), request, tx.clone()).await;
                    }
                    Err(e) => {
                        warn!("{}", e);
                        let _ = tx.send(ServerMessage::Error { text: e.message().to_string() });
                    }
                },
                Message::Close(_) => return Ok(()),
                Message::Binary(_) => {
                    return Err(Error::protocol_failed("binary frames are not supported"))
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    let send_ended = tokio::select! {
        rv = (&mut send_task) => {
            debug!("session {} send task ended: {:?}", session_id, rv);
            true
        },
        rv = (&mut recv_task) => {
            debug!("session {} receive task ended: {:?}", session_id, rv);
            false
        }
    };
    if send_ended {
        // A run started by the receive task must be in the slot before cancelling
        recv_task.abort();
        let _ = recv_task.await;
    } else {
        send_task.abort();
    }
    // Whichever side ended first, the agent does not outlive the socket
    session.cancel_run().await;
    info!("session {} disconnected", session_id);
}

// ============================================================================
// Agent run
// ============================================================================

async fn send_scripts(out: &Outbox, dir: &Path) {
    for script in scan::python_scripts(dir) {
        let _ = out.send(ServerMessage::Script {
            filename: script.filename,
            content: script.content,
        });
    }
}

fn pump_lines<R>(reader: R, lines: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).is_err() {
                break;
            }
        }
    })
}

async fn run_agent(config: Arc<RelayConfig>, session: Arc<Session>, request: RunRequest, out: Outbox) {
    let run_dir = request
        .agent_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.agent_dir.clone());
    let code = match run_process(&config, &session, &request, &run_dir, &out).await {
        Ok(code) => Some(code),
        Err(e) => {
            warn!("run failed: {}", e);
            let _ = out.send(ServerMessage::Error { text: format!("Error: {}", e.message()) });
            None
        }
    };
    session.stdin.lock().await.take();
    let _ = out.send(ServerMessage::Status { state: RunState::Done, code });
}

async fn run_process(
    config: &RelayConfig,
    session: &Session,
    request: &RunRequest,
    run_dir: &Path,
    out: &Outbox,
) -> Result<i32> {
    let cmd = build_command(&config.python, request);
    let _ = out.send(ServerMessage::Log { text: format!("started: {}", cmd.join(" ")) });
    let _ = out.send(ServerMessage::Status { state: RunState::Started, code: None });

    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| Error::invalid_argument("empty command"))?;
    let mut child = Command::new(program)
        .args(args)
        .current_dir(run_dir)
        .envs(request.env())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            Error::new(ErrorKind::ScriptFailed, format!("failed to start {}: {}", program, e))
                .with_operation("relay::run")
                .set_source(e)
        })?;
    info!("started {:?} in {}", cmd, run_dir.display());

    *session.stdin.lock().await = child.stdin.take();

    // stdout and stderr share one queue so lines reach the socket in arrival order
    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        pump_lines(stdout, lines_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump_lines(stderr, lines_tx.clone());
    }
    drop(lines_tx);

    let scripts_dir = run_dir.join("generated_scripts");
    while let Some(line) = lines.recv().await {
        let saved = line.contains("Saved:");
        let _ = out.send(ServerMessage::Log { text: line });
        if saved {
            send_scripts(out, &scripts_dir).await;
        }
    }

    let status = child.wait().await?;
    let code = status.code().unwrap_or(-1);
    let _ = out.send(ServerMessage::Log { text: format!("\nProcess exited with code {}", code) });
    send_scripts(out, &scripts_dir).await;
    Ok(code)
}
