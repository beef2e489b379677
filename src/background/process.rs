//! Tracked process records and OS primitives

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ClaudeError, Result};
use crate::types::identifiers::{BashId, SessionId};

/// A detached process owned by the background manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundProcess {
    /// Registry id
    pub bash_id: BashId,
    /// Session that launched it
    pub session_id: SessionId,
    /// Shell command text
    pub command: String,
    /// Directory it runs in
    pub working_dir: PathBuf,
    /// OS process id; also the process group id
    pub pid: u32,
    /// File receiving stdout and stderr
    pub log_path: PathBuf,
    /// Short description supplied by the agent
    pub description: Option<String>,
    /// Launch time
    pub started_at: DateTime<Utc>,
}

/// Result of [`spawn`](super::BackgroundProcessManager::spawn)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// A new OS process was launched
    Spawned(BackgroundProcess),
    /// An identical command was already running for the session
    Existing(BackgroundProcess),
}

impl SpawnOutcome {
    /// The tracked process, new or reused
    #[must_use]
    pub const fn process(&self) -> &BackgroundProcess {
        match self {
            Self::Spawned(process) | Self::Existing(process) => process,
        }
    }

    /// Whether the spawn was short-circuited by deduplication
    #[must_use]
    pub const fn is_existing(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

/// Liveness as observed by a non-blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Still running
    Running,
    /// Exited; `None` when terminated by a signal
    Exited(Option<i32>),
}

/// Registry entry: public record plus the OS handle used for liveness checks
pub(super) struct Tracked {
    pub info: BackgroundProcess,
    pub child: Child,
}

impl Tracked {
    pub fn status(&mut self) -> ProcessStatus {
        match self.child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited(status.code()),
            Err(e) => {
                log::warn!("[{}] liveness check failed: {e}", self.info.bash_id);
                ProcessStatus::Exited(None)
            }
        }
    }
}

/// Launch `command` through `sh -c` in its own session, output going to `log_path`
pub(super) fn spawn_detached(command: &str, work_dir: &Path, log_path: &Path) -> Result<Child> {
    let log = File::create(log_path).map_err(|e| {
        ClaudeError::background(format!("cannot create log {}: {e}", log_path.display()))
    })?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.spawn().map_err(|e| {
        if work_dir.exists() {
            ClaudeError::background(format!("failed to spawn '{command}': {e}"))
        } else {
            ClaudeError::background(format!(
                "working directory does not exist: {}",
                work_dir.display()
            ))
        }
    })
}

/// Signal a whole process group
#[cfg(unix)]
pub(super) fn signal_group(pid: u32, signal: i32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: plain syscall; a negative pid addresses the process group.
    unsafe { libc::kill(-pid, signal) == 0 }
}

#[cfg(unix)]
pub(super) const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
pub(super) const SIGKILL: i32 = libc::SIGKILL;
