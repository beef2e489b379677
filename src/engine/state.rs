//! Per-turn accumulation

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::types::identifiers::MessageId;
use crate::types::messages::ContentBlock;

/// Counters read by the timeout warning to describe a stalled turn
#[derive(Debug, Default)]
pub struct TurnDiagnostics {
    tool_invocations: AtomicU32,
    last_event: Mutex<&'static str>,
}

impl TurnDiagnostics {
    /// Record that an event of `kind` was observed
    pub fn observe(&self, kind: &'static str) {
        *self.last_event.lock() = kind;
    }

    /// Count one tool invocation
    pub fn count_tool(&self) -> u32 {
        self.tool_invocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Tool invocations since the last reset
    pub fn tool_invocations(&self) -> u32 {
        self.tool_invocations.load(Ordering::Relaxed)
    }

    /// Kind of the last observed event
    pub fn last_event(&self) -> &'static str {
        *self.last_event.lock()
    }

    fn reset(&self) {
        self.tool_invocations.store(0, Ordering::Relaxed);
    }
}

/// Content accumulated over one turn of one invocation attempt
#[derive(Debug, Default)]
pub struct TurnState {
    /// Non-text assistant blocks in arrival order
    pub blocks: Vec<ContentBlock>,
    /// Assistant text
    pub text: String,
    /// Text characters not yet persisted
    pub unsaved_chars: usize,
    /// Whether anything changed since the last flush
    pub dirty: bool,
    /// Persisted message being updated incrementally
    pub message_id: Option<MessageId>,
    /// Whether the plan-exit notification went out this turn
    pub plan_exit_notified: bool,
    /// Whether text arrived as deltas, making full text blocks redundant
    pub streamed_text: bool,
}

impl TurnState {
    /// Append assistant text
    pub fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
        self.unsaved_chars += text.chars().count();
        self.dirty = true;
    }

    /// Append a non-text block
    pub fn push_block(&mut self, block: ContentBlock) {
        self.blocks.push(block);
        self.dirty = true;
    }

    /// Whether the turn produced anything
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.blocks.is_empty()
    }

    /// Blocks as persisted: the text first, then everything else
    #[must_use]
    pub fn persisted_blocks(&self) -> Vec<Value> {
        let text = (!self.text.is_empty()).then(|| ContentBlock::Text {
            text: self.text.clone(),
        });
        text.iter()
            .chain(self.blocks.iter())
            .filter_map(|block| serde_json::to_value(block).ok())
            .collect()
    }

    /// Mark the current content as persisted under `message_id`
    pub fn mark_saved(&mut self, message_id: MessageId) {
        self.message_id = Some(message_id);
        self.unsaved_chars = 0;
        self.dirty = false;
    }

    /// Start the next turn
    pub fn reset(&mut self, diagnostics: &TurnDiagnostics) {
        *self = Self::default();
        diagnostics.reset();
    }
}
