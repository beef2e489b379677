//! Configuration constants and types for subprocess transport

use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::permissions::PermissionMode;

/// Default maximum buffer size for JSON messages (1MB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Number of trailing stderr lines kept for error reports
pub const STDERR_TAIL_LINES: usize = 50;

/// Dangerous environment variables that should not be passed to subprocess
///
/// These variables can affect how the subprocess loads and executes code,
/// potentially creating security vulnerabilities.
pub const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "PATH",
    "NODE_OPTIONS",
    "PYTHONPATH",
    "PERL5LIB",
    "RUBYLIB",
];

/// How to start one Claude CLI process
#[derive(Debug, Clone)]
pub struct SubprocessOptions {
    /// Explicit CLI binary; discovered on `PATH` when unset
    pub cli_path: Option<PathBuf>,
    /// Working directory of the process
    pub cwd: PathBuf,
    /// Model override
    pub model: Option<String>,
    /// System prompt override
    pub system_prompt: Option<String>,
    /// Conversation to resume
    pub resume: Option<String>,
    /// Permission mode passed on the command line
    pub permission_mode: PermissionMode,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Largest JSON message accepted from stdout
    pub max_buffer_size: usize,
}

impl SubprocessOptions {
    /// Options for a process working in `cwd` with everything else defaulted
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: None,
            cwd: cwd.into(),
            model: None,
            system_prompt: None,
            resume: None,
            permission_mode: PermissionMode::BypassPermissions,
            env: HashMap::new(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}
