// Stdio relay: client control messages in as JSON lines on stdin, protocol
// events out as JSON lines on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use kodegen_claude_relay::retry::classify_error;
use kodegen_claude_relay::{
    ChannelConnection, ClaudeCliLauncher, ClientMessage, Connection, InMemorySessionStore,
    Orchestrator, ProtocolEvent, RelayConfig, SessionStreamManager,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config =
        RelayConfig::load(config_path.as_deref()).context("Failed to load relay configuration")?;
    let working_directory =
        std::env::current_dir().context("Failed to resolve the working directory")?;

    let store = Arc::new(InMemorySessionStore::new());
    let launcher = Arc::new(ClaudeCliLauncher::from_config(&config));
    let relay = Orchestrator::new(config, store.clone(), launcher)?;

    let (connection, mut frames) = ChannelConnection::new();
    let connection: Arc<dyn Connection> = connection;

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = frames.recv().await {
            let written = async {
                stdout.write_all(frame.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if let Err(e) = written.await {
                log::error!("Failed to write to stdout: {e}");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            log::info!("stdin closed, shutting down");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: ClientMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring malformed client message: {e}");
                continue;
            }
        };
        let session_id = message.session_id().cloned();
        if let ClientMessage::Chat { session_id, .. } = &message {
            store.ensure_session(session_id, &working_directory);
        }

        if let Err(e) = relay.handle(message, &connection).await {
            log::warn!("Client message failed: {e}");
            if let Some(session_id) = session_id {
                SessionStreamManager::send_to(connection.as_ref(), &session_id, &ProtocolEvent::Error {
                    message: e.to_string(),
                    error_type: Some(classify_error(&e).kind.as_str().to_string()),
                    request_id: None,
                });
            }
        }
    }

    relay.shutdown().await;
    drop(connection);
    drop(relay);
    let _ = writer.await;
    Ok(())
}
