//! Failure classification
//!
//! A failed attempt is mapped onto a fixed taxonomy. Structured error bodies
//! win when present; otherwise message and stderr text is matched against an
//! ordered pattern table. Authentication and permission are checked before the
//! generic network and timeout kinds because their messages often mention both.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ClaudeError;

// ============================================================================
// Taxonomy
// ============================================================================

/// Fixed failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, invalid or expired credentials
    Authentication,
    /// Credentials valid but not allowed
    Permission,
    /// Too many requests
    RateLimit,
    /// Prompt or payload exceeds limits
    RequestTooLarge,
    /// Malformed request
    InvalidRequest,
    /// Upstream overloaded
    Overloaded,
    /// Generic 5xx
    ServerError,
    /// Connectivity
    Network,
    /// Deadline exceeded
    Timeout,
    /// Quota or credit balance exhausted
    InsufficientCredits,
    /// The agent subprocess died
    SubprocessExit,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Whether another attempt may succeed
    ///
    /// A dead subprocess is retried because the next attempt spawns a fresh
    /// one from the persisted resume token.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::Overloaded
                | Self::ServerError
                | Self::Network
                | Self::Timeout
                | Self::SubprocessExit
        )
    }

    /// Wire name used in `error` and `retry_attempt` events
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::RateLimit => "rate_limit",
            Self::RequestTooLarge => "request_too_large",
            Self::InvalidRequest => "invalid_request",
            Self::Overloaded => "overloaded",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::InsufficientCredits => "insufficient_credits",
            Self::SubprocessExit => "subprocess_exit",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    /// Taxonomy kind
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// Whether the retry controller may try again
    pub retryable: bool,
    /// Authoritative delay requested by the upstream
    pub retry_after_secs: Option<u64>,
    /// Upstream correlation id
    pub request_id: Option<String>,
    /// Raw diagnostic context (stderr tail, error body)
    pub raw: Option<String>,
}

impl ErrorClassification {
    fn new(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            retryable: kind.is_retryable(),
            retry_after_secs: None,
            request_id: None,
            raw: None,
        }
    }
}

// ============================================================================
// Pattern table
// ============================================================================

struct KindPattern {
    kind: ErrorKind,
    pattern: &'static str,
}

/// Checked in order; first match wins
const KIND_PATTERNS: &[KindPattern] = &[
    KindPattern {
        kind: ErrorKind::Authentication,
        pattern: r"\b401\b|unauthori[sz]ed|authentication|invalid (?:x-)?api[ _-]?key|not logged in|/login\b|oauth token (?:has )?expired",
    },
    KindPattern {
        kind: ErrorKind::Permission,
        pattern: r"\b403\b|forbidden|permission[ _]denied|permission_error|not allowed to",
    },
    KindPattern {
        kind: ErrorKind::InsufficientCredits,
        pattern: r"credit balance|insufficient[ _](?:credits?|quota|funds)|quota exceeded|billing",
    },
    KindPattern {
        kind: ErrorKind::RequestTooLarge,
        pattern: r"\b413\b|request[ _]too[ _]large|prompt is too long|too many tokens|maximum context length|context window exceeded",
    },
    KindPattern {
        kind: ErrorKind::InvalidRequest,
        pattern: r"\b(?:400|404|422)\b|invalid[ _]request|malformed|bad request",
    },
    KindPattern {
        kind: ErrorKind::RateLimit,
        pattern: r"\b429\b|rate[ _-]?limit|too many requests",
    },
    KindPattern {
        kind: ErrorKind::Overloaded,
        pattern: r"\b529\b|overloaded",
    },
    KindPattern {
        kind: ErrorKind::ServerError,
        pattern: r"\b(?:500|502|503)\b|internal server error|bad gateway|service unavailable|api_error",
    },
    KindPattern {
        kind: ErrorKind::Network,
        pattern: r"econnreset|econnrefused|enotfound|etimedout|eai_again|socket hang up|connection (?:reset|refused|closed)|network|fetch failed|broken pipe",
    },
    KindPattern {
        kind: ErrorKind::Timeout,
        pattern: r"timed? ?out|timeout|deadline exceeded",
    },
    KindPattern {
        kind: ErrorKind::SubprocessExit,
        pattern: r"exited (?:with|unexpectedly)|exit code|process error|process exited|stream ended",
    },
];

static COMPILED_PATTERNS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    KIND_PATTERNS
        .iter()
        .filter_map(|p| {
            Regex::new(&format!("(?i){}", p.pattern))
                .map(|re| (p.kind, re))
                .map_err(|e| log::error!("invalid error pattern for {}: {e}", p.kind))
                .ok()
        })
        .collect()
});

static RETRY_AFTER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)retry[-_ ]after["']?\s*[:=]?\s*["']?(\d+)"#).ok());

static REQUEST_ID_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:request[-_ ]?id["']?\s*[:=]\s*["']?([A-Za-z0-9_-]+))|\b(req_[A-Za-z0-9]+)"#)
        .ok()
});

// ============================================================================
// Classification
// ============================================================================

/// Classify an error produced by a spawn+drain attempt
#[must_use]
pub fn classify_error(error: &ClaudeError) -> ErrorClassification {
    let message = error.to_string();

    let payload = error
        .payload()
        .cloned()
        .or_else(|| embedded_json(&message))
        .or_else(|| error.stderr().and_then(embedded_json));

    if let Some(payload) = payload.as_ref()
        && let Some(mut classification) = classify_payload(payload, &message)
    {
        classification.raw = error.stderr().map(str::to_string);
        return classification;
    }

    let mut haystack = message.clone();
    if let Some(stderr) = error.stderr() {
        haystack.push('\n');
        haystack.push_str(stderr);
    }

    let kind = match match_kind(&haystack) {
        ErrorKind::Unknown => fallback_kind(error),
        kind => kind,
    };

    let mut classification = ErrorClassification::new(kind, message);
    classification.retry_after_secs = retry_after_from_text(&haystack);
    classification.request_id = request_id_from_text(&haystack);
    classification.raw = error.stderr().map(str::to_string);
    classification
}

/// Classify a bare error message
#[must_use]
pub fn classify_message(message: &str) -> ErrorClassification {
    if let Some(payload) = embedded_json(message)
        && let Some(classification) = classify_payload(&payload, message)
    {
        return classification;
    }
    let mut classification = ErrorClassification::new(match_kind(message), message.to_string());
    classification.retry_after_secs = retry_after_from_text(message);
    classification.request_id = request_id_from_text(message);
    classification
}

fn match_kind(text: &str) -> ErrorKind {
    COMPILED_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map_or(ErrorKind::Unknown, |(kind, _)| *kind)
}

fn fallback_kind(error: &ClaudeError) -> ErrorKind {
    match error {
        ClaudeError::Timeout(_) | ClaudeError::BackgroundTimeout { .. } => ErrorKind::Timeout,
        ClaudeError::Process { .. } => ErrorKind::SubprocessExit,
        ClaudeError::Connection(_) | ClaudeError::Transport(_) | ClaudeError::Io(_) => {
            ErrorKind::Network
        }
        _ => ErrorKind::Unknown,
    }
}

/// Classify a structured error body such as
/// `{"type":"error","error":{"type":"rate_limit_error","message":".."},"request_id":".."}`
fn classify_payload(payload: &serde_json::Value, fallback_message: &str) -> Option<ErrorClassification> {
    let error = payload.get("error").unwrap_or(payload);

    let type_kind = error
        .get("type")
        .and_then(serde_json::Value::as_str)
        .and_then(kind_from_error_type);

    let status_kind = ["status", "status_code", "statusCode"]
        .iter()
        .find_map(|key| {
            payload
                .get(*key)
                .or_else(|| error.get(*key))
                .and_then(serde_json::Value::as_u64)
        })
        .and_then(kind_from_status);

    let kind = type_kind.or(status_kind)?;

    let message = error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| fallback_message.to_string(), str::to_string);

    let mut classification = ErrorClassification::new(kind, message);
    classification.request_id = ["request_id", "requestId"]
        .iter()
        .find_map(|key| payload.get(*key).or_else(|| error.get(*key)))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .or_else(|| request_id_from_text(fallback_message));
    classification.retry_after_secs = retry_after_from_payload(payload)
        .or_else(|| retry_after_from_text(fallback_message));
    Some(classification)
}

fn kind_from_error_type(error_type: &str) -> Option<ErrorKind> {
    let kind = match error_type {
        "authentication_error" => ErrorKind::Authentication,
        "permission_error" => ErrorKind::Permission,
        "rate_limit_error" => ErrorKind::RateLimit,
        "request_too_large" => ErrorKind::RequestTooLarge,
        "invalid_request_error" | "not_found_error" => ErrorKind::InvalidRequest,
        "overloaded_error" => ErrorKind::Overloaded,
        "api_error" => ErrorKind::ServerError,
        "billing_error" => ErrorKind::InsufficientCredits,
        "timeout_error" => ErrorKind::Timeout,
        _ => return None,
    };
    Some(kind)
}

fn kind_from_status(status: u64) -> Option<ErrorKind> {
    let kind = match status {
        401 => ErrorKind::Authentication,
        402 => ErrorKind::InsufficientCredits,
        403 => ErrorKind::Permission,
        408 | 504 => ErrorKind::Timeout,
        413 => ErrorKind::RequestTooLarge,
        400 | 404 | 422 => ErrorKind::InvalidRequest,
        429 => ErrorKind::RateLimit,
        529 => ErrorKind::Overloaded,
        500..=599 => ErrorKind::ServerError,
        _ => return None,
    };
    Some(kind)
}

fn retry_after_from_payload(payload: &serde_json::Value) -> Option<u64> {
    let headers = payload.get("headers");
    ["retry_after", "retry-after", "retryAfter"]
        .iter()
        .find_map(|key| {
            payload
                .get(*key)
                .or_else(|| headers.and_then(|h| h.get(*key)))
        })
        .and_then(|value| match value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
}

fn retry_after_from_text(text: &str) -> Option<u64> {
    RETRY_AFTER_RE
        .as_ref()?
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn request_id_from_text(text: &str) -> Option<String> {
    let captures = REQUEST_ID_RE.as_ref()?.captures(text)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
}

/// Parse the first JSON object embedded in `text`
fn embedded_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&text[start..=end])
        .ok()
        .filter(serde_json::Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_wins_over_network_wording() {
        let c = classify_message("401 Unauthorized: network request rejected");
        assert_eq!(c.kind, ErrorKind::Authentication);
        assert!(!c.retryable);
    }

    #[test]
    fn status_codes_need_word_boundaries() {
        assert_eq!(match_kind("took 14012ms"), ErrorKind::Unknown);
        assert_eq!(match_kind("HTTP 429"), ErrorKind::RateLimit);
    }

    #[test]
    fn structured_body_is_preferred() {
        let c = classify_message(
            r#"API Error: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"},"request_id":"req_abc123"}"#,
        );
        assert_eq!(c.kind, ErrorKind::Overloaded);
        assert_eq!(c.message, "Overloaded");
        assert_eq!(c.request_id.as_deref(), Some("req_abc123"));
    }

    #[test]
    fn process_exit_falls_back_to_subprocess_kind() {
        let err = ClaudeError::process("agent went away", 1, None);
        assert_eq!(classify_error(&err).kind, ErrorKind::SubprocessExit);
    }

    #[test]
    fn stderr_participates_in_matching() {
        let err = ClaudeError::process(
            "Command failed",
            1,
            Some("Error: Invalid API key · Please run /login".to_string()),
        );
        let c = classify_error(&err);
        assert_eq!(c.kind, ErrorKind::Authentication);
        assert!(c.raw.is_some());
    }
}
