//! # scriptforge relay
//!
//! A small axum service that runs an agent as a subprocess and streams its
//! output to a chat client over a WebSocket. Lines typed in the client are
//! forwarded to the agent's stdin, which is how interactive reviews work
//! remotely.
//!
//! Routes:
//! - `GET /ws/{session_id}`: the session socket
//! - `GET /api/agents`, `/api/script-dirs`, `/api/versions`, `/api/scripts`:
//!   listings for the client's pickers

pub mod scan;
pub mod session;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use scriptforge_error::Result;
use serde::{Deserialize, Serialize};
use session::Session;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub use session::{build_command, ClientRequest, RunRequest};

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    /// Working directory for runs that do not name one
    pub agent_dir: PathBuf,
    /// Interpreter for `.py` agents
    pub python: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            agent_dir: PathBuf::from("."),
            python: "python".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Started,
    Done,
}

/// Envelope sent to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Log {
        text: String,
    },
    Script {
        filename: String,
        content: String,
    },
    Error {
        text: String,
    },
    Status {
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
}

#[derive(Clone)]
struct RelayState {
    config: Arc<RelayConfig>,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl RelayState {
    fn session(&self, id: &str) -> Arc<Session> {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.entry(id.to_string()).or_default().clone()
    }
}

/// Optional directory override for the listing endpoints
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    dir: Option<PathBuf>,
    version: Option<String>,
}

impl ListQuery {
    /// The configured agent directory, or `dir` when it resolves inside it.
    fn agent_dir(&self, state: &RelayState) -> std::result::Result<PathBuf, StatusCode> {
        let root = &state.config.agent_dir;
        let Some(dir) = &self.dir else {
            return Ok(root.clone());
        };
        scan::contained(root, &root.join(dir)).ok_or_else(|| {
            warn!("listing outside {} refused: {}", root.display(), dir.display());
            StatusCode::FORBIDDEN
        })
    }
}

type Listing<T> = std::result::Result<Json<Vec<T>>, StatusCode>;

pub fn router(config: RelayConfig) -> Router {
    let state = RelayState {
        config: Arc::new(config),
        sessions: Arc::default(),
    };
    Router::new()
        .route("/ws/{session_id}", get(ws_handler))
        .route("/api/agents", get(list_agents))
        .route("/api/script-dirs", get(list_script_dirs))
        .route("/api/versions", get(list_versions))
        .route("/api/scripts", get(list_scripts))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: RelayConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!("relay listening on {}", listener.local_addr()?);
    axum::serve(listener, router(config)).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    UrlPath(session_id): UrlPath<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    info!("session {} connected", session_id);
    let session = state.session(&session_id);
    let config = state.config.clone();
    ws.on_upgrade(move |socket| session::handle_socket(socket, session_id, session, config))
}

async fn list_agents(State(state): State<RelayState>, Query(q): Query<ListQuery>) -> Listing<String> {
    Ok(Json(scan::agent_scripts(&q.agent_dir(&state)?)))
}

async fn list_script_dirs(State(state): State<RelayState>, Query(q): Query<ListQuery>) -> Listing<String> {
    Ok(Json(scan::script_dirs(&q.agent_dir(&state)?.join("tests"))))
}

async fn list_versions(State(state): State<RelayState>, Query(q): Query<ListQuery>) -> Listing<String> {
    Ok(Json(scan::versions(&q.agent_dir(&state)?)))
}

async fn list_scripts(
    State(state): State<RelayState>,
    Query(q): Query<ListQuery>,
) -> Listing<scan::ScriptEntry> {
    Ok(Json(scan::version_scripts(&q.agent_dir(&state)?, q.version.as_deref())))
}
