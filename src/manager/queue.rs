//! Inbound message queue
//!
//! A FIFO of pending user prompts with a single async consumer. A push while
//! the consumer is parked wakes it directly; a push with nobody waiting is
//! buffered. Completing the queue ends iteration once the buffer is drained.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    closed: bool,
}

/// FIFO of prompts waiting to be delivered to the agent invocation
#[derive(Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MessageQueue {
    /// Create an empty, open queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a prompt; returns `false` if the queue was already completed
    pub fn push(&self, message: String) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.pending.push_back(message);
        }
        self.notify.notify_waiters();
        true
    }

    /// Put a prompt back at the head, ahead of anything queued after it
    pub fn push_front(&self, message: String) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.pending.push_front(message);
        }
        self.notify.notify_waiters();
        true
    }

    /// Mark the queue complete; the consumer sees `None` after the buffer drains
    pub fn complete(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether [`complete`](Self::complete) was called
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.lock().closed
    }

    /// Buffered prompts
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Next prompt in FIFO order, or `None` once completed and drained
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(message) = state.pending.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }
}

type Observer = Arc<dyn Fn(&str) + Send + Sync>;

/// Consumer side of a session's queue, handed to the agent invocation
///
/// An optional observer sees every prompt at the moment it is taken, which is
/// how the turn engine learns which prompt is in flight.
#[derive(Clone)]
pub struct InboundMessages {
    queue: Arc<MessageQueue>,
    observer: Option<Observer>,
}

impl InboundMessages {
    /// Wrap a queue
    #[must_use]
    pub const fn new(queue: Arc<MessageQueue>) -> Self {
        Self {
            queue,
            observer: None,
        }
    }

    /// Attach an observer called with each prompt as it is taken
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// The underlying queue
    #[must_use]
    pub const fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Next prompt, or `None` when the session's queue is complete
    pub async fn next(&self) -> Option<String> {
        let message = self.queue.next().await?;
        if let Some(observer) = &self.observer {
            observer(&message);
        }
        Some(message)
    }

    /// Adapt into a `Stream` of prompts
    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        async_stream::stream! {
            while let Some(message) = self.next().await {
                yield message;
            }
        }
    }
}

impl std::fmt::Debug for InboundMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessages")
            .field("pending", &self.queue.len())
            .field("complete", &self.queue.is_complete())
            .finish_non_exhaustive()
    }
}
