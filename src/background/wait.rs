//! Completion polling for tracked processes
//!
//! The wait loop composes three timers with `select!`: a total deadline, a
//! no-output deadline that is pushed back whenever the log file grows, and the
//! poll tick that reads new output and checks liveness.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ClaudeError, Result, WaitFailure};
use crate::types::identifiers::BashId;

use super::BackgroundProcessManager;
use super::process::ProcessStatus;

type OutputCallback = Box<dyn FnMut(&str) + Send>;

/// Options for [`BackgroundProcessManager::wait_for_completion`]
#[derive(Default)]
pub struct WaitOptions {
    on_output: Option<OutputCallback>,
    timeout: Option<Duration>,
    hang_timeout: Option<Duration>,
    unbounded: bool,
    discard_output: bool,
}

impl WaitOptions {
    /// Stream newly appended output through `callback`
    #[must_use]
    pub fn on_output(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_output = Some(Box::new(callback));
        self
    }

    /// Total wait budget (defaults to the manager's setting)
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// No-output budget (defaults to the manager's setting)
    #[must_use]
    pub fn hang_timeout(mut self, hang_timeout: Duration) -> Self {
        self.hang_timeout = Some(hang_timeout);
        self
    }

    /// Disable both deadlines; wait until the process exits or is untracked
    #[must_use]
    pub fn unbounded(mut self) -> Self {
        self.unbounded = true;
        self
    }

    /// Do not accumulate output in [`CompletedProcess::output`]
    #[must_use]
    pub fn discard_output(mut self) -> Self {
        self.discard_output = true;
        self
    }
}

impl std::fmt::Debug for WaitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitOptions")
            .field("on_output", &self.on_output.as_ref().map(|_| "<callback>"))
            .field("timeout", &self.timeout)
            .field("hang_timeout", &self.hang_timeout)
            .field("unbounded", &self.unbounded)
            .field("discard_output", &self.discard_output)
            .finish()
    }
}

/// A process that exited while being waited on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedProcess {
    /// Registry id
    pub bash_id: BashId,
    /// Exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Full log contents read during the wait; empty when output was discarded
    pub output: String,
    /// Time spent waiting
    pub elapsed: Duration,
}

impl BackgroundProcessManager {
    /// Poll `id` until it exits, streaming new output through the callback
    ///
    /// On exit the log is read once more after a short delay, the registry
    /// entry is removed, and the exit status is returned with the full output.
    ///
    /// # Errors
    /// - `ClaudeError::BackgroundTimeout` when the total or no-output deadline passes
    /// - `ClaudeError::BackgroundProcess` when `id` is not tracked, or stops being
    ///   tracked (killed) during the wait
    pub async fn wait_for_completion(
        &self,
        id: &BashId,
        mut options: WaitOptions,
    ) -> Result<CompletedProcess> {
        let log_path = self
            .get(id)
            .map(|p| p.log_path)
            .ok_or_else(|| ClaudeError::background(format!("unknown background process {id}")))?;

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_secs(self.settings.wait_timeout_secs));
        let hang_timeout = options
            .hang_timeout
            .unwrap_or(Duration::from_secs(self.settings.hang_timeout_secs));

        let started = Instant::now();
        let deadline = tokio::time::sleep_until(deadline_after(started, timeout, options.unbounded));
        tokio::pin!(deadline);
        let hang = tokio::time::sleep_until(deadline_after(started, hang_timeout, options.unbounded));
        tokio::pin!(hang);

        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut log = LogTail::default();
        let mut output = String::new();

        loop {
            tokio::select! {
                () = &mut deadline => {
                    return Err(timeout_error(id, WaitFailure::Timeout, started, output));
                }
                () = &mut hang => {
                    return Err(timeout_error(id, WaitFailure::Hang, started, output));
                }
                _ = ticker.tick() => {
                    let chunk = log.read(&log_path).await;
                    if !chunk.is_empty() {
                        hang.as_mut()
                            .reset(deadline_after(Instant::now(), hang_timeout, options.unbounded));
                        if let Some(callback) = options.on_output.as_mut() {
                            callback(&chunk);
                        }
                        if !options.discard_output {
                            output.push_str(&chunk);
                        }
                    }

                    match self.status(id) {
                        None => {
                            return Err(ClaudeError::background(format!(
                                "background process {id} was killed"
                            )));
                        }
                        Some(ProcessStatus::Running) => {}
                        Some(ProcessStatus::Exited(exit_code)) => {
                            tokio::time::sleep(Duration::from_millis(
                                self.settings.exit_drain_delay_ms,
                            ))
                            .await;
                            let mut tail = log.read(&log_path).await;
                            tail.push_str(&log.finish());
                            if !tail.is_empty() {
                                if let Some(callback) = options.on_output.as_mut() {
                                    callback(&tail);
                                }
                                if !options.discard_output {
                                    output.push_str(&tail);
                                }
                            }
                            self.remove(id);
                            log::debug!("[{id}] exited with {exit_code:?}");
                            return Ok(CompletedProcess {
                                bash_id: id.clone(),
                                exit_code,
                                output,
                                elapsed: started.elapsed(),
                            });
                        }
                    }
                }
            }
        }
    }
}

fn deadline_after(from: Instant, budget: Duration, unbounded: bool) -> Instant {
    // About thirty years; far enough to never fire.
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    let budget = if unbounded { FAR_FUTURE } else { budget };
    from.checked_add(budget)
        .unwrap_or_else(|| from + FAR_FUTURE)
}

fn timeout_error(id: &BashId, kind: WaitFailure, started: Instant, output: String) -> ClaudeError {
    log::warn!("[{id}] wait ended: {kind}");
    ClaudeError::BackgroundTimeout {
        bash_id: id.clone(),
        kind,
        elapsed: started.elapsed(),
        output,
    }
}

/// Incremental reader over a growing log file
///
/// Bytes of a UTF-8 sequence split across two reads are held back until the
/// rest arrives.
#[derive(Debug, Default)]
struct LogTail {
    offset: u64,
    pending: Vec<u8>,
}

impl LogTail {
    /// Decoded text appended since the last read
    async fn read(&mut self, path: &Path) -> String {
        let Ok(mut file) = tokio::fs::File::open(path).await else {
            return String::new();
        };
        if file.seek(SeekFrom::Start(self.offset)).await.is_err() {
            return String::new();
        }
        match file.read_to_end(&mut self.pending).await {
            Ok(read) => {
                self.offset += read as u64;
                take_decoded(&mut self.pending)
            }
            Err(e) => {
                log::debug!("log read failed for {}: {e}", path.display());
                String::new()
            }
        }
    }

    /// Whatever is still held back, decoded lossily
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Decode the longest complete prefix of `bytes`, leaving an unfinished
/// trailing sequence in place; invalid sequences become U+FFFD
fn take_decoded(bytes: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut start = 0;
    while start < bytes.len() {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(valid) => {
                text.push_str(valid);
                start = bytes.len();
            }
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&bytes[start..valid_end]));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }
    bytes.drain(..start);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sequence_waits_for_its_tail() {
        let mut pending = b"caf\xc3".to_vec();
        assert_eq!(take_decoded(&mut pending), "caf");
        assert_eq!(pending, vec![0xc3]);

        pending.extend_from_slice(b"\xa9!\n");
        assert_eq!(take_decoded(&mut pending), "\u{e9}!\n");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced_without_stalling() {
        let mut pending = b"a\xffb".to_vec();
        assert_eq!(take_decoded(&mut pending), "a\u{fffd}b");
        assert!(pending.is_empty());
    }

    #[test]
    fn finish_flushes_an_unfinished_sequence() {
        let mut tail = LogTail {
            offset: 0,
            pending: vec![0xe2, 0x82],
        };
        assert_eq!(tail.finish(), "\u{fffd}");
        assert!(tail.pending.is_empty());
    }
}
