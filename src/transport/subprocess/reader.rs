//! Message reading logic for subprocess transport

use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::error::{ClaudeError, Result};

use super::transport::{SubprocessTransport, join_tail};

/// How long to let stderr drain after the process exits
const STDERR_DRAIN: Duration = Duration::from_secs(1);

impl SubprocessTransport {
    /// Read messages from the subprocess output
    ///
    /// Spawns a background task that yields one JSON value per complete
    /// message. Lines that are not JSON (progress noise, warnings) are
    /// skipped. When stdout closes the task reaps the process and reports a
    /// non-zero exit as [`ClaudeError::Process`] carrying the stderr tail.
    pub(super) fn read_messages_impl(
        &mut self,
    ) -> mpsc::UnboundedReceiver<Result<serde_json::Value>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let stdout = self.stdout.take();
        let process = self.process.take();
        let stderr_task = self.stderr_task.take();
        let stderr_tail = self.stderr_tail.clone();
        let max_buffer_size = self.options.max_buffer_size;

        let task = tokio::spawn(async move {
            let Some(mut stdout) = stdout else {
                let _ = tx.send(Err(ClaudeError::connection(
                    "Not connected - stdout not available",
                )));
                return;
            };
            let mut json_buffer = String::new();

            loop {
                let mut line = String::new();
                match stdout.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if json_buffer.is_empty() && !line.starts_with('{') {
                            log::debug!("Skipping non-JSON CLI output: {line}");
                            continue;
                        }

                        // Accumulate partial JSON until we can parse it
                        json_buffer.push_str(line);

                        if json_buffer.len() > max_buffer_size {
                            let _ = tx.send(Err(ClaudeError::JsonDecode(
                                serde_json::Error::io(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    format!(
                                        "JSON message exceeded maximum buffer size of {max_buffer_size} bytes"
                                    ),
                                )),
                            )));
                            json_buffer.clear();
                            continue;
                        }

                        if let Ok(data) = serde_json::from_str::<serde_json::Value>(&json_buffer) {
                            json_buffer.clear();
                            if tx.send(Ok(data)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(ClaudeError::Io(e)));
                        break;
                    }
                }
            }

            let Some(mut child) = process else {
                return;
            };
            match child.wait().await {
                Ok(status) if !status.success() => {
                    if let Some(task) = stderr_task {
                        let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
                    }
                    let stderr = join_tail(&stderr_tail.lock());
                    let code = status.code().unwrap_or(-1);
                    log::warn!("Claude CLI exited with {status}");
                    let _ = tx.send(Err(ClaudeError::process(
                        format!("Claude CLI exited with {status}"),
                        code,
                        (!stderr.is_empty()).then_some(stderr),
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(Err(ClaudeError::Io(e)));
                }
            }
        });

        self.reader_task = Some(task);
        rx
    }
}
