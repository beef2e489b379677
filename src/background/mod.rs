//! Background process manager
//!
//! Owns OS processes that must outlive a single tool call and must not share
//! pipes with the agent subprocess. Each process runs in its own session and
//! process group, writes stdout and stderr to a per-id log file, and is tracked
//! by [`BashId`] until it is killed, its session is cleaned up, or a wait
//! observes its exit.

mod process;
mod wait;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::config::BackgroundSettings;
use crate::error::{ClaudeError, Result};
use crate::types::identifiers::{BashId, SessionId};

pub use process::{BackgroundProcess, ProcessStatus, SpawnOutcome};
pub use wait::{CompletedProcess, WaitOptions};

use process::Tracked;

/// Poll cadence while waiting for a signalled group to disappear
#[cfg(unix)]
const KILL_POLL: Duration = Duration::from_millis(50);

/// Registry of detached processes
pub struct BackgroundProcessManager {
    processes: Mutex<HashMap<BashId, Tracked>>,
    settings: BackgroundSettings,
}

impl BackgroundProcessManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(settings: BackgroundSettings) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Active settings
    #[must_use]
    pub const fn settings(&self) -> &BackgroundSettings {
        &self.settings
    }

    /// Launch `command` detached, or return the live process already running
    /// the same command for `session_id`
    ///
    /// # Errors
    /// Returns error if the log file cannot be created or the process cannot
    /// be spawned
    pub fn spawn(
        &self,
        command: &str,
        work_dir: &Path,
        id: BashId,
        session_id: &SessionId,
        description: Option<&str>,
    ) -> Result<SpawnOutcome> {
        self.launch(command, work_dir, id, session_id, description, true)
    }

    /// Launch `command` detached as a new process, even when an identical
    /// command is already running for `session_id`
    ///
    /// # Errors
    /// Returns error if the log file cannot be created or the process cannot
    /// be spawned
    pub fn spawn_exclusive(
        &self,
        command: &str,
        work_dir: &Path,
        id: BashId,
        session_id: &SessionId,
    ) -> Result<BackgroundProcess> {
        match self.launch(command, work_dir, id, session_id, None, false)? {
            SpawnOutcome::Spawned(process) | SpawnOutcome::Existing(process) => Ok(process),
        }
    }

    fn launch(
        &self,
        command: &str,
        work_dir: &Path,
        id: BashId,
        session_id: &SessionId,
        description: Option<&str>,
        reuse: bool,
    ) -> Result<SpawnOutcome> {
        std::fs::create_dir_all(&self.settings.log_dir).map_err(|e| {
            ClaudeError::background(format!(
                "cannot create log directory {}: {e}",
                self.settings.log_dir.display()
            ))
        })?;

        let mut processes = self.processes.lock();

        if reuse {
            if let Some(existing) = find_live(&mut processes, session_id, command) {
                log::info!(
                    "[{session_id}] reusing background process {} for '{command}'",
                    existing.bash_id
                );
                return Ok(SpawnOutcome::Existing(existing));
            }
        }

        if processes.contains_key(&id) {
            return Err(ClaudeError::background(format!("duplicate background id {id}")));
        }

        let log_path = self.settings.log_dir.join(format!("{id}.log"));
        let child = process::spawn_detached(command, work_dir, &log_path)?;

        let info = BackgroundProcess {
            bash_id: id.clone(),
            session_id: session_id.clone(),
            command: command.to_string(),
            working_dir: work_dir.to_path_buf(),
            pid: child.id(),
            log_path,
            description: description.map(str::to_string),
            started_at: Utc::now(),
        };

        log::info!(
            "[{session_id}] spawned background process {id} (pid {}): {command}",
            info.pid
        );
        processes.insert(id, Tracked {
            info: info.clone(),
            child,
        });
        Ok(SpawnOutcome::Spawned(info))
    }

    /// Look up a tracked process
    #[must_use]
    pub fn get(&self, id: &BashId) -> Option<BackgroundProcess> {
        self.processes.lock().get(id).map(|t| t.info.clone())
    }

    /// Whether `id` is tracked
    #[must_use]
    pub fn has(&self, id: &BashId) -> bool {
        self.processes.lock().contains_key(id)
    }

    /// All processes launched by a session
    #[must_use]
    pub fn get_by_session(&self, session_id: &SessionId) -> Vec<BackgroundProcess> {
        self.processes
            .lock()
            .values()
            .filter(|t| &t.info.session_id == session_id)
            .map(|t| t.info.clone())
            .collect()
    }

    /// Live process running exactly `command` for `session_id`
    #[must_use]
    pub fn find_existing_process(
        &self,
        session_id: &SessionId,
        command: &str,
    ) -> Option<BackgroundProcess> {
        find_live(&mut self.processes.lock(), session_id, command)
    }

    /// Non-blocking liveness check; `None` when `id` is not tracked
    #[must_use]
    pub fn status(&self, id: &BashId) -> Option<ProcessStatus> {
        self.processes.lock().get_mut(id).map(Tracked::status)
    }

    /// Number of tracked processes
    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    /// SIGTERM the process group, wait out the grace window, SIGKILL whatever
    /// is left, then drop the registry entry
    ///
    /// Returns `false` only when `id` was not tracked.
    pub async fn kill(&self, id: &BashId) -> bool {
        let Some(pid) = self.processes.lock().get(id).map(|t| t.info.pid) else {
            return false;
        };

        #[cfg(unix)]
        {
            process::signal_group(pid, process::SIGTERM);
            let deadline = tokio::time::Instant::now() + self.settings.kill_grace();
            while self.group_alive(id, pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(KILL_POLL).await;
            }
            if self.group_alive(id, pid) {
                log::debug!("[{id}] still alive after grace window, sending SIGKILL");
                process::signal_group(pid, process::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            if let Some(tracked) = self.processes.lock().get_mut(id) {
                let _ = tracked.child.kill();
            }
        }

        if let Some(mut tracked) = self.processes.lock().remove(id) {
            tokio::task::spawn_blocking(move || {
                let _ = tracked.child.wait();
            });
        }
        log::info!("killed background process {id} (pid {pid})");
        true
    }

    /// Kill every process owned by `session_id`; returns how many were killed
    pub async fn cleanup_session(&self, session_id: &SessionId) -> usize {
        let ids: Vec<BashId> = self
            .get_by_session(session_id)
            .into_iter()
            .map(|p| p.bash_id)
            .collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.kill(id))).await;
        let killed = results.into_iter().filter(|killed| *killed).count();
        if killed > 0 {
            log::info!("[{session_id}] cleaned up {killed} background process(es)");
        }
        killed
    }

    /// Kill everything; used on shutdown
    pub async fn kill_all(&self) -> usize {
        let ids: Vec<BashId> = self.processes.lock().keys().cloned().collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.kill(id))).await;
        results.into_iter().filter(|killed| *killed).count()
    }

    pub(crate) fn remove(&self, id: &BashId) -> Option<BackgroundProcess> {
        self.processes.lock().remove(id).map(|t| t.info)
    }

    #[cfg(unix)]
    fn group_alive(&self, id: &BashId, pid: u32) -> bool {
        // Reap the leader first so a zombie does not keep the group visible.
        let _ = self.status(id);
        process::signal_group(pid, 0)
    }
}

fn find_live(
    processes: &mut HashMap<BashId, Tracked>,
    session_id: &SessionId,
    command: &str,
) -> Option<BackgroundProcess> {
    let command = command.trim();
    for tracked in processes.values_mut() {
        if &tracked.info.session_id == session_id
            && tracked.info.command.trim() == command
            && tracked.status() == ProcessStatus::Running
        {
            return Some(tracked.info.clone());
        }
    }
    None
}
