//! # MCP client
//!
//! Talks to the external script generator over newline-delimited JSON-RPC 2.0
//! on a child process's stdin/stdout. Only the client half of the protocol
//! is implemented: `initialize`, `tools/list` and `tools/call`.
//!
//! The transport is generic over any async reader/writer pair so tests can
//! drive it through an in-memory pipe.

use crate::provider::ToolDefinition;
use scriptforge_error::{Error, ErrorKind, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name of the generator tool exposed by `mcp_server.mjs`
pub const GENERATOR_TOOL: &str = "CreateLibEnsembleScripts";

pub const SERVER_FILE: &str = "mcp_server.mjs";

/// Arguments the model is not allowed to pass to the generator.
const BLOCKED_GENERATOR_ARGS: &[&str] = &["custom_set_objective", "set_objective_code"];

/// Something that can execute tool calls on behalf of the agent.
#[allow(async_fn_in_trait)]
pub trait ToolBackend {
    /// Tools offered to the model
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Run one tool call and return its text output
    async fn call(&mut self, name: &str, arguments: Value) -> Result<String>;
}

/// A tool as advertised by `tools/list`
#[derive(Debug, Clone, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

impl From<&McpTool> for ToolDefinition {
    fn from(tool: &McpTool) -> Self {
        let def = ToolDefinition::new(&tool.name, tool.description.clone().unwrap_or_default());
        match &tool.input_schema {
            Some(schema) => def.with_parameters(schema.clone()),
            None => def,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Result of `tools/call`
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// The first text block, or a stock message when the tool returned none.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .find_map(|c| match c {
                ToolContent::Text { text } => Some(text.clone()),
                ToolContent::Other => None,
            })
            .unwrap_or_else(|| "Scripts created".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpTool>,
}

/// Drop arguments the generator must never receive from the model.
pub fn sanitize_generator_arguments(mut arguments: Value) -> Value {
    if let Some(map) = arguments.as_object_mut() {
        for key in BLOCKED_GENERATOR_ARGS {
            if map.remove(*key).is_some() {
                debug!("dropped generator argument {}", key);
            }
        }
    }
    arguments
}

/// JSON-RPC client for one MCP server connection
pub struct McpClient<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
    next_id: u64,
    tools: Vec<McpTool>,
    child: Option<Child>,
}

impl McpClient<ChildStdout, ChildStdin> {
    /// Launch the server. `.mjs`/`.js` files run under `node`; anything else
    /// is executed directly.
    pub fn spawn(server: &Path) -> Result<Self> {
        let is_node = matches!(
            server.extension().and_then(|e| e.to_str()),
            Some("mjs") | Some("js")
        );
        let mut command = if is_node {
            let mut c = Command::new("node");
            c.arg(server);
            c
        } else {
            Command::new(server)
        };

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::new(ErrorKind::ToolFailed, format!("failed to start MCP server: {}", e))
                    .with_operation("mcp::spawn")
                    .with_context("server", server.display().to_string())
                    .set_source(e)
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::channel_closed("mcp stdin").with_operation("mcp::spawn"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::channel_closed("mcp stdout").with_operation("mcp::spawn"))?;

        let mut client = McpClient::new(stdout, stdin);
        client.child = Some(child);
        Ok(client)
    }
}

impl<R, W> McpClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
            tools: Vec::new(),
            child: None,
        }
    }

    /// Handshake: `initialize` followed by the `initialized` notification.
    pub async fn initialize(&mut self) -> Result<Value> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(result)
    }

    pub async fn list_tools(&mut self) -> Result<&[McpTool]> {
        let result = self.request("tools/list", json!({})).await?;
        let listing: ListToolsResult = serde_json::from_value(result).map_err(|e| {
            Error::protocol_failed(format!("bad tools/list result: {}", e))
                .with_operation("mcp::list_tools")
                .set_source(e)
        })?;
        self.tools = listing.tools;
        Ok(&self.tools)
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        let result: CallToolResult = serde_json::from_value(result).map_err(|e| {
            Error::protocol_failed(format!("bad tools/call result: {}", e))
                .with_operation("mcp::call_tool")
                .set_source(e)
        })?;
        if result.is_error {
            return Err(Error::tool_failed(name, result.text()).with_operation("mcp::call_tool"));
        }
        Ok(result)
    }

    /// Close the server's stdin and give it a moment to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(status) => debug!("MCP server exited: {:?}", status?),
                Err(_) => {
                    warn!("MCP server did not exit, killing it");
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }

    async fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message).map_err(|e| {
            Error::serialization_failed(e.to_string())
                .with_operation("mcp::send")
                .set_source(e)
        })?;
        trace!("mcp -> {}", line);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        self.send(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;

        loop {
            let line = self.lines.next_line().await?.ok_or_else(|| {
                Error::channel_closed("mcp stdout")
                    .with_operation("mcp::request")
                    .with_context("method", method)
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!("mcp <- {}", line);

            let message: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => {
                    debug!("skipping non-JSON line from MCP server: {}", line);
                    continue;
                }
            };

            // Notifications and server-initiated requests carry a method
            if message.get("method").is_some() || message.get("id") != Some(&json!(id)) {
                continue;
            }

            if let Some(error) = message.get("error") {
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::protocol_failed(text.to_string())
                    .with_operation("mcp::request")
                    .with_context("method", method)
                    .with_context("code", error.get("code").map(Value::to_string).unwrap_or_default()));
            }

            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }
}

impl<R, W> ToolBackend for McpClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// The agent is handed the first tool the server lists.
    fn tools(&self) -> Vec<ToolDefinition> {
        self.tools.first().map(ToolDefinition::from).into_iter().collect()
    }

    async fn call(&mut self, name: &str, arguments: Value) -> Result<String> {
        Ok(self.call_tool(name, arguments).await?.text())
    }
}

/// Places searched for the server script, in priority order.
pub fn server_candidates(
    explicit: Option<&Path>,
    env_path: Option<&str>,
    exe_dir: Option<&Path>,
    cwd: &Path,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some(path) = env_path.filter(|p| !p.is_empty()) {
        candidates.push(PathBuf::from(path));
    }
    if let Some(dir) = exe_dir {
        candidates.push(dir.join("..").join(SERVER_FILE));
    }
    candidates.push(cwd.join(SERVER_FILE));
    candidates
}

/// Locate `mcp_server.mjs`: `--mcp-server`, `GENERATOR_MCP_SERVER`, next to
/// the binary's parent directory, then the working directory.
pub fn find_server(explicit: Option<&Path>, env_path: Option<&str>) -> Result<PathBuf> {
    let exe = std::env::current_exe().ok();
    let exe_dir = exe.as_deref().and_then(Path::parent);
    let cwd = std::env::current_dir()?;
    locate_server(server_candidates(explicit, env_path, exe_dir, &cwd))
}

fn locate_server(candidates: Vec<PathBuf>) -> Result<PathBuf> {
    if let Some(found) = candidates.iter().find(|p| p.exists()) {
        return Ok(found.clone());
    }

    let searched = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(Error::new(
        ErrorKind::FileNotFound,
        format!(
            "Cannot find {}\nSearched: {}\nSet GENERATOR_MCP_SERVER or use --mcp-server flag",
            SERVER_FILE, searched
        ),
    )
    .with_operation("mcp::find_server"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type TestClient = McpClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    /// A scripted MCP server on the other end of an in-memory pipe. Records
    /// every message it receives.
    fn fake_server(tool_result: Value) -> (TestClient, tokio::task::JoinHandle<Vec<Value>>) {
        let (client_end, server_end) = duplex(64 * 1024);
        let (read, write) = split(client_end);

        let handle = tokio::spawn(async move {
            let (read, mut write) = split(server_end);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: Value = serde_json::from_str(&line).unwrap();
                seen.push(msg.clone());
                let Some(id) = msg.get("id").cloned() else {
                    continue;
                };
                let result = match msg["method"].as_str().unwrap() {
                    "initialize" => json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "script-creator", "version": "1.0.0"}
                    }),
                    "tools/list" => json!({
                        "tools": [{
                            "name": GENERATOR_TOOL,
                            "description": "Create libEnsemble scripts",
                            "inputSchema": {"type": "object", "properties": {"num_workers": {"type": "string"}}}
                        }]
                    }),
                    "tools/call" => tool_result.clone(),
                    other => {
                        let reply = json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": format!("no method {}", other)}});
                        write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
                        continue;
                    }
                };
                // Noise the client must skip before the real reply
                write
                    .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{}}\n")
                    .await
                    .unwrap();
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
                write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            }
            seen
        });

        (McpClient::new(read, write), handle)
    }

    #[tokio::test]
    async fn test_handshake_list_and_call() {
        let (mut client, server) = fake_server(json!({
            "content": [{"type": "text", "text": "=== run_libe.py ===\nprint('hi')"}]
        }));

        let init = client.initialize().await.unwrap();
        assert_eq!(init["serverInfo"]["name"], "script-creator");

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, GENERATOR_TOOL);

        let defs = client.tools();
        assert_eq!(defs[0].parameters["properties"]["num_workers"]["type"], "string");

        let text = client.call(GENERATOR_TOOL, json!({"num_workers": "4"})).await.unwrap();
        assert!(text.starts_with("=== run_libe.py ==="));

        client.shutdown().await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen[0]["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(seen[1]["method"], "notifications/initialized");
        assert!(seen[1].get("id").is_none());
        assert_eq!(seen[3]["params"]["name"], GENERATOR_TOOL);
        assert_eq!(seen[3]["params"]["arguments"]["num_workers"], "4");
    }

    #[tokio::test]
    async fn test_empty_content_defaults() {
        let (mut client, _server) = fake_server(json!({"content": []}));
        let text = client.call(GENERATOR_TOOL, json!({})).await.unwrap();
        assert_eq!(text, "Scripts created");
    }

    #[tokio::test]
    async fn test_tool_error_result() {
        let (mut client, _server) = fake_server(json!({
            "content": [{"type": "text", "text": "template not found"}],
            "isError": true
        }));
        let err = client.call_tool(GENERATOR_TOOL, json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolFailed);
        assert_eq!(err.message(), "template not found");
        assert_eq!(err.context_value("tool"), Some(GENERATOR_TOOL));
    }

    #[tokio::test]
    async fn test_rpc_error_is_protocol_failure() {
        let (mut client, _server) = fake_server(json!({}));
        let err = client.request("resources/list", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolFailed);
        assert!(err.message().contains("resources/list"));
    }

    #[tokio::test]
    async fn test_eof_is_channel_closed() {
        let (client_end, server_end) = duplex(1024);
        drop(server_end);
        let (read, write) = split(client_end);
        let mut client = McpClient::new(read, write);
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ChannelClosed | ErrorKind::IoFailed));
    }

    #[test]
    fn test_sanitize_generator_arguments() {
        let args = sanitize_generator_arguments(json!({
            "num_workers": "4",
            "custom_set_objective": true,
            "set_objective_code": "def f(): pass"
        }));
        assert_eq!(args, json!({"num_workers": "4"}));

        assert_eq!(sanitize_generator_arguments(json!("raw")), json!("raw"));
    }

    #[test]
    fn test_server_candidates_order() {
        let candidates = server_candidates(
            Some(Path::new("/opt/custom.mjs")),
            Some("/env/mcp_server.mjs"),
            Some(Path::new("/usr/local/bin")),
            Path::new("/work"),
        );
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/opt/custom.mjs"),
                PathBuf::from("/env/mcp_server.mjs"),
                PathBuf::from("/usr/local/bin/../mcp_server.mjs"),
                PathBuf::from("/work/mcp_server.mjs"),
            ]
        );

        let candidates = server_candidates(None, Some(""), None, Path::new("/work"));
        assert_eq!(candidates, vec![PathBuf::from("/work/mcp_server.mjs")]);
    }

    #[test]
    fn test_find_server_explicit_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let server = dir.path().join("gen.mjs");
        std::fs::write(&server, "// server").unwrap();
        assert_eq!(find_server(Some(&server), None).unwrap(), server);

        let missing = dir.path().join("nope.mjs");
        let env_missing = dir.path().join("env.mjs");
        let empty = dir.path().join("empty");
        std::fs::create_dir(&empty).unwrap();
        let candidates = server_candidates(Some(&missing), env_missing.to_str(), Some(&empty), &empty);
        let err = locate_server(candidates).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert!(err.message().contains("nope.mjs"));
        assert!(err.message().contains("env.mjs"));
        assert!(err.message().contains("GENERATOR_MCP_SERVER"));
    }
}
