//! Lifecycle management for subprocess transport (connect, close)

use std::collections::{HashMap, VecDeque};
use std::env;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStderr;

use crate::VERSION;
use crate::error::{ClaudeError, Result};

use super::command::CommandBuilder;
use super::config::{DANGEROUS_ENV_VARS, STDERR_TAIL_LINES};
use super::transport::SubprocessTransport;

/// How long `close` waits for the CLI to exit after stdin closes
const CLOSE_GRACE: Duration = Duration::from_secs(5);

impl SubprocessTransport {
    /// Spawn the Claude Code CLI process and set up stdio pipes
    ///
    /// # Errors
    /// Returns error if process spawning fails or stdio handles cannot be obtained
    pub(super) async fn connect_impl(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }

        let cwd = &self.options.cwd;
        if !cwd.is_dir() {
            return Err(ClaudeError::connection(format!(
                "Working directory does not exist: {}",
                cwd.display()
            )));
        }

        let mut cmd = CommandBuilder::new(&self.cli_path, &self.options).build();

        let mut process_env = env::vars().collect::<HashMap<_, _>>();
        for (key, value) in &self.options.env {
            if DANGEROUS_ENV_VARS.contains(&key.as_str()) {
                log::warn!("Ignoring dangerous environment override {key}");
            } else {
                process_env.insert(key.clone(), value.clone());
            }
        }
        process_env.insert("CLAUDE_CODE_ENTRYPOINT".to_string(), "sdk-rust".to_string());
        process_env.insert("CLAUDE_AGENT_SDK_VERSION".to_string(), VERSION.to_string());
        process_env.insert("PWD".to_string(), cwd.to_string_lossy().to_string());

        cmd.envs(process_env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ClaudeError::connection(format!("Failed to start Claude Code: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClaudeError::connection("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClaudeError::connection("Failed to get stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClaudeError::connection("Failed to get stderr handle"))?;

        log::debug!(
            "Started Claude CLI (pid {:?}) in {}",
            child.id(),
            cwd.display()
        );

        self.stderr_task = Some(tokio::spawn(capture_stderr(
            stderr,
            Arc::clone(&self.stderr_tail),
        )));
        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout));
        self.process = Some(child);
        self.ready.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// Close the transport and clean up resources
    ///
    /// # Errors
    /// Returns error if waiting on the process fails
    pub(super) async fn close_impl(&mut self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);

        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        // The reader owns the child once started; aborting it drops the child,
        // which kills the process.
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.stdout = None;

        if let Some(mut child) = self.process.take() {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(_status)) => {}
                Ok(Err(e)) => return Err(ClaudeError::Io(e)),
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }

        Ok(())
    }

    /// Handle Drop cleanup
    pub(super) fn drop_impl(&mut self) {
        self.ready.store(false, Ordering::SeqCst);
        drop(self.stdin.take());

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
        }
    }
}

/// Keep the last lines of the CLI's stderr for error reports
async fn capture_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        log::debug!("claude stderr: {line}");
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
