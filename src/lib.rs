//! # Claude relay
//!
//! Session-scoped relay between client connections and long-lived Claude
//! Code agent processes.
//!
//! A client sends control messages (`chat`, `stop_generation`,
//! `set_permission_mode`, `approve_plan`, `kill_background_process`) for a
//! session. The relay keeps at most one agent invocation per session,
//! streams its output back as protocol events, retries transient failures,
//! watches for stalled turns, and runs shell commands the agent wants in the
//! background outside the agent process so they survive it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kodegen_claude_relay::{
//!     ChannelConnection, ClaudeCliLauncher, ClientMessage, Connection, InMemorySessionStore,
//!     Orchestrator, RelayConfig, SessionId,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::load(None)?;
//! let store = Arc::new(InMemorySessionStore::new());
//! let launcher = Arc::new(ClaudeCliLauncher::from_config(&config));
//! let relay = Orchestrator::new(config, store.clone(), launcher)?;
//!
//! let session = SessionId::new("demo");
//! store.ensure_session(&session, &std::env::current_dir()?);
//!
//! let (connection, mut frames) = ChannelConnection::new();
//! let connection: Arc<dyn Connection> = connection;
//! relay
//!     .handle(
//!         ClientMessage::Chat {
//!             content: "What is 2 + 2?".into(),
//!             session_id: session,
//!             model: None,
//!         },
//!         &connection,
//!     )
//!     .await?;
//!
//! while let Some(frame) = frames.recv().await {
//!     println!("{frame}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`manager`]: per-session message queues, cancellation, connection
//!   tracking and the idle reaper ([`SessionStreamManager`])
//! - [`engine`]: the turn drain loop ([`TurnProtocolEngine`])
//! - [`background`]: detached shell processes ([`BackgroundProcessManager`])
//! - [`retry`] and [`timeout`]: failure classification, backoff and the turn
//!   watchdog
//! - [`agent`]: the seam between the engine and an agent implementation
//! - [`client`], [`transport`], [`control`], [`message`]: the Claude CLI
//!   implementation of that seam
//! - [`orchestrator`]: wires everything together
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, ClaudeError>`](Result).
//! Failures inside a turn are classified with [`retry::classify_error`] and
//! surface to the client as `error` events rather than as return values.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod background;
pub mod client;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod message;
pub mod orchestrator;
pub mod persistence;
pub mod retry;
pub mod timeout;
pub mod transport;
pub mod types;

// Re-export main types
pub use agent::{AgentEvent, AgentInvocation, AgentLauncher, InvocationControl, LaunchRequest};
pub use background::BackgroundProcessManager;
pub use client::ClaudeCliLauncher;
pub use config::RelayConfig;
pub use engine::TurnProtocolEngine;
pub use error::{ClaudeError, Result};
pub use manager::{ChannelConnection, CleanupReason, Connection, SessionStreamManager};
pub use orchestrator::Orchestrator;
pub use persistence::{InMemorySessionStore, SessionStore};
pub use retry::{RetryController, RetryPolicy};
pub use timeout::TimeoutController;
pub use transport::{SubprocessTransport, Transport};
pub use types::{
    BashId, ClientMessage, ContentBlock, MessageId, PermissionMode, ProtocolEvent, SessionId,
};

/// Version of the relay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
