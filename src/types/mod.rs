//! Type definitions for the Claude relay
//!
//! This module contains the type definitions used throughout the crate,
//! organized into logical submodules:
//!
//! - [`identifiers`] - Type-safe ID wrappers (`SessionId`, `RequestId`, `BashId`, `MessageId`)
//! - [`permissions`] - Permission modes and hook decisions
//! - [`hooks`] - `PreToolUse` hook replies
//! - [`messages`] - Claude CLI `stream-json` message and content block types
//! - [`session`] - Records exchanged with the persistence collaborator
//! - [`events`] - Client-facing outbound events and inbound control messages

pub mod events;
pub mod hooks;
pub mod identifiers;
pub mod messages;
pub mod permissions;
pub mod session;

// Re-export commonly used types
pub use events::{ClientMessage, OutboundEnvelope, ProtocolEvent};
pub use hooks::{HookEvent, HookOutput, PreToolUseOutput};
pub use identifiers::{BashId, MessageId, RequestId, SessionId};
pub use messages::{ContentBlock, ContentValue, Message};
pub use permissions::{PermissionDecision, PermissionMode};
pub use session::{ContextUsage, MessageRole, SessionRecord, StoredMessage, UsageSource};
