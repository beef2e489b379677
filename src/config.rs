//! Relay configuration
//!
//! Every field has a default, so an empty JSON object is a valid config file.
//! Environment variables prefixed with `KODEGEN_RELAY_` override file values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClaudeError, Result};
use crate::retry::RetryPolicy;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "KODEGEN_RELAY_";

// ============================================================================
// Settings groups
// ============================================================================

/// Stream registry limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Live sessions before the oldest is evicted
    pub max_sessions: usize,
    /// Inactivity after which the reaper removes a stream
    pub idle_timeout_secs: u64,
    /// Reaper tick
    pub reaper_interval_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout_secs: 2 * 60 * 60,
            reaper_interval_secs: 60,
        }
    }
}

impl StreamSettings {
    /// Idle window as a duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Reaper tick as a duration
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

/// Retry budget for spawn+drain attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Upper bound on computed delays
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 16_000,
        }
    }
}

/// Per-turn inactivity watchdog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnTimeoutSettings {
    /// Silence before a `timeout_warning` is sent
    pub warning_after_secs: u64,
    /// Silence before the turn is failed
    pub hard_timeout_secs: u64,
}

impl Default for TurnTimeoutSettings {
    fn default() -> Self {
        Self {
            warning_after_secs: 120,
            hard_timeout_secs: 900,
        }
    }
}

/// Background process manager tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSettings {
    /// Directory holding per-process log files
    pub log_dir: PathBuf,
    /// Liveness and log poll cadence
    pub poll_interval_ms: u64,
    /// Default total wait budget
    pub wait_timeout_secs: u64,
    /// Default no-output budget
    pub hang_timeout_secs: u64,
    /// Total budget for intercepted long-running commands
    pub long_running_timeout_secs: u64,
    /// No-output budget for intercepted long-running commands
    pub long_running_hang_secs: u64,
    /// Pause between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,
    /// Pause before the final log read after exit
    pub exit_drain_delay_ms: u64,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir().join("kodegen-claude-relay"),
            poll_interval_ms: 1_000,
            wait_timeout_secs: 600,
            hang_timeout_secs: 300,
            long_running_timeout_secs: 600,
            long_running_hang_secs: 120,
            kill_grace_ms: 1_500,
            exit_drain_delay_ms: 250,
        }
    }
}

impl BackgroundSettings {
    /// Poll cadence as a duration
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Grace window as a duration
    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Claude CLI launch settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// CLI binary; discovered on `PATH` when unset
    pub cli_path: Option<PathBuf>,
    /// Default model when a chat does not name one
    pub model: Option<String>,
    /// System prompt passed on every spawn
    pub system_prompt: Option<String>,
    /// Extra environment for the CLI process
    pub extra_env: HashMap<String, String>,
}

// ============================================================================
// RelayConfig
// ============================================================================

/// Top-level relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Stream registry limits
    pub streams: StreamSettings,
    /// Retry budget
    pub retry: RetrySettings,
    /// Turn watchdog
    pub turn_timeout: TurnTimeoutSettings,
    /// Background processes
    pub background: BackgroundSettings,
    /// Claude CLI
    pub agent: AgentSettings,
    /// Heartbeat cadence during a turn
    pub keepalive_interval_secs: u64,
    /// Streamed characters between incremental saves
    pub flush_threshold_chars: usize,
    /// Context window assumed when the agent does not report one
    pub default_context_window: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            streams: StreamSettings::default(),
            retry: RetrySettings::default(),
            turn_timeout: TurnTimeoutSettings::default(),
            background: BackgroundSettings::default(),
            agent: AgentSettings::default(),
            keepalive_interval_secs: 30,
            flush_threshold_chars: 500,
            default_context_window: 200_000,
        }
    }
}

impl RelayConfig {
    /// Start a builder from defaults
    #[must_use]
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Load from an optional JSON file, then apply process environment overrides
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or the result is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid JSON
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClaudeError::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ClaudeError::invalid_config(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Apply `KODEGEN_RELAY_*` overrides read through `lookup`
    ///
    /// # Errors
    /// Returns error if a numeric override does not parse
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("MAX_SESSIONS") {
            self.streams.max_sessions = parse_number("MAX_SESSIONS", &v)?;
        }
        if let Some(v) = var("IDLE_TIMEOUT_SECS") {
            self.streams.idle_timeout_secs = parse_number("IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_number("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("HARD_TIMEOUT_SECS") {
            self.turn_timeout.hard_timeout_secs = parse_number("HARD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("LOG_DIR") {
            self.background.log_dir = PathBuf::from(v);
        }
        if let Some(v) = var("CLI_PATH") {
            self.agent.cli_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MODEL") {
            self.agent.model = Some(v);
        }
        Ok(())
    }

    /// Reject settings that would stall or disable the relay
    ///
    /// # Errors
    /// Returns `ClaudeError::InvalidConfig` describing the first bad field
    pub fn validate(&self) -> Result<()> {
        if self.streams.max_sessions == 0 {
            return Err(ClaudeError::invalid_config("streams.max_sessions must be > 0"));
        }
        if self.streams.reaper_interval_secs == 0 {
            return Err(ClaudeError::invalid_config(
                "streams.reaper_interval_secs must be > 0",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ClaudeError::invalid_config("retry.max_attempts must be > 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ClaudeError::invalid_config("retry.multiplier must be >= 1.0"));
        }
        if self.background.poll_interval_ms == 0 {
            return Err(ClaudeError::invalid_config(
                "background.poll_interval_ms must be > 0",
            ));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(ClaudeError::invalid_config("keepalive_interval_secs must be > 0"));
        }
        if self.turn_timeout.hard_timeout_secs == 0 {
            return Err(ClaudeError::invalid_config(
                "turn_timeout.hard_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }

    /// Backoff policy derived from the retry settings
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Silence before a timeout warning
    #[must_use]
    pub const fn warning_after(&self) -> Duration {
        Duration::from_secs(self.turn_timeout.warning_after_secs)
    }

    /// Silence before the turn fails
    #[must_use]
    pub const fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout.hard_timeout_secs)
    }

    /// Heartbeat cadence
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ClaudeError::invalid_config(format!("{ENV_PREFIX}{name}: '{value}' is not a number"))
    })
}

// ============================================================================
// Builder for RelayConfig
// ============================================================================

/// Builder for [`RelayConfig`]
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Set the live session cap
    #[must_use]
    pub const fn max_sessions(mut self, max: usize) -> Self {
        self.config.streams.max_sessions = max;
        self
    }

    /// Set the idle reaping window
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.streams.idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the reaper tick
    #[must_use]
    pub const fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.streams.reaper_interval_secs = interval.as_secs();
        self
    }

    /// Replace the retry settings
    #[must_use]
    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set turn watchdog durations
    #[must_use]
    pub const fn turn_timeout(mut self, warning_after: Duration, hard_after: Duration) -> Self {
        self.config.turn_timeout.warning_after_secs = warning_after.as_secs();
        self.config.turn_timeout.hard_timeout_secs = hard_after.as_secs();
        self
    }

    /// Set the background log directory
    #[must_use]
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.background.log_dir = dir.into();
        self
    }

    /// Replace the background settings
    #[must_use]
    pub fn background(mut self, background: BackgroundSettings) -> Self {
        self.config.background = background;
        self
    }

    /// Set the CLI path
    #[must_use]
    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.agent.cli_path = Some(path.into());
        self
    }

    /// Set the default model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.agent.model = Some(model.into());
        self
    }

    /// Set the heartbeat cadence
    #[must_use]
    pub const fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval_secs = interval.as_secs();
        self
    }

    /// Set the incremental save threshold
    #[must_use]
    pub const fn flush_threshold_chars(mut self, chars: usize) -> Self {
        self.config.flush_threshold_chars = chars;
        self
    }

    /// Build the config
    #[must_use]
    pub fn build(self) -> RelayConfig {
        self.config
    }
}
