//! Terminal client for the relay.

use futures_util::{Sink, SinkExt, StreamExt};
use scriptforge_error::{Error, Result};
use scriptforge_relay::{RunState, ServerMessage};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub struct ChatOptions {
    pub url: String,
    pub session: String,
    pub agent_script: String,
    pub scripts_dir: Option<String>,
    pub agent_dir: Option<String>,
    /// Print script bodies, not just their names
    pub show_scripts: bool,
    /// Exported to the agent as `LLM_MODEL`
    pub llm_model: Option<String>,
    /// Exported to the agent as `OPENAI_BASE_URL`
    pub openai_base_url: Option<String>,
}

pub fn session_url(base: &str, session: &str) -> String {
    format!("{}/ws/{}", base.trim_end_matches('/'), session)
}

pub fn run_frame(options: &ChatOptions) -> String {
    json!({
        "type": "run",
        "agent_script": options.agent_script,
        "scripts_dir": options.scripts_dir.as_deref().unwrap_or(""),
        "agent_dir": options.agent_dir,
        "llm_model": options.llm_model,
        "openai_base_url": options.openai_base_url,
    })
    .to_string()
}

pub fn input_frame(text: &str) -> String {
    json!({ "type": "input", "text": text }).to_string()
}

/// Start a run and relay the terminal until it finishes. Returns the agent's
/// exit code.
pub async fn run(options: ChatOptions) -> Result<i32> {
    let url = session_url(&options.url, &options.session);
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::network_failed(format!("cannot connect to {}: {}", url, e)).set_source(e))?;
    info!("connected to {}", url);

    let (mut write, mut read) = stream.split();
    send(&mut write, run_frame(&options)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            frame = read.next() => {
                let frame = match frame {
                    Some(frame) => frame.map_err(|e| Error::network_failed(e.to_string()))?,
                    None => return Err(Error::channel_closed("relay")),
                };
                let Message::Text(text) = frame else {
                    debug!("ignoring non-text frame");
                    continue;
                };
                let message: ServerMessage = match serde_json::from_str(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("unreadable frame: {}", e);
                        continue;
                    }
                };
                match message {
                    ServerMessage::Log { text } => println!("{}", text),
                    ServerMessage::Error { text } => eprintln!("{}", text),
                    ServerMessage::Script { filename, content } => {
                        if options.show_scripts {
                            println!("\n--- {} ---\n{}", filename, content);
                        } else {
                            println!("[script] {} ({} bytes)", filename, content.len());
                        }
                    }
                    ServerMessage::Status { state: RunState::Started, .. } => {}
                    ServerMessage::Status { state: RunState::Done, code } => {
                        return Ok(code.unwrap_or(1));
                    }
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line? {
                    Some(line) => send(&mut write, input_frame(&line)).await?,
                    None => stdin_open = false,
                }
            }
        }
    }
}

async fn send<S>(write: &mut S, text: String) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| Error::network_failed(format!("failed to send: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ChatOptions {
        ChatOptions {
            url: "ws://127.0.0.1:8000/".into(),
            session: "abc".into(),
            agent_script: "libe_agent_interactive.py".into(),
            scripts_dir: None,
            agent_dir: Some("/work".into()),
            show_scripts: false,
            llm_model: None,
            openai_base_url: None,
        }
    }

    #[test]
    fn test_session_url() {
        assert_eq!(session_url("ws://127.0.0.1:8000/", "abc"), "ws://127.0.0.1:8000/ws/abc");
    }

    #[test]
    fn test_frames_parse_on_the_relay_side() {
        let run = scriptforge_relay::ClientRequest::parse(&run_frame(&options())).unwrap();
        assert_eq!(
            run,
            scriptforge_relay::ClientRequest::Run(scriptforge_relay::RunRequest {
                agent_script: "libe_agent_interactive.py".into(),
                scripts_dir: None,
                agent_dir: Some("/work".into()),
                ..Default::default()
            })
        );
        let input = scriptforge_relay::ClientRequest::parse(&input_frame("edit")).unwrap();
        assert_eq!(input, scriptforge_relay::ClientRequest::Input("edit".into()));
    }

    #[test]
    fn test_run_frame_carries_model_selection() {
        let options = ChatOptions {
            llm_model: Some("gpt-4o".into()),
            openai_base_url: Some("http://127.0.0.1:8001/v1".into()),
            ..options()
        };
        let scriptforge_relay::ClientRequest::Run(run) =
            scriptforge_relay::ClientRequest::parse(&run_frame(&options)).unwrap()
        else {
            panic!("expected a run request");
        };
        assert_eq!(run.llm_model.as_deref(), Some("gpt-4o"));
        assert_eq!(run.openai_base_url.as_deref(), Some("http://127.0.0.1:8001/v1"));
    }
}
