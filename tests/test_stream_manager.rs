use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kodegen_claude_relay::config::StreamSettings;
use kodegen_claude_relay::types::{ProtocolEvent, SessionId};
use kodegen_claude_relay::{ChannelConnection, ClaudeError, CleanupReason, Connection, SessionStreamManager};

fn manager(max_sessions: usize) -> SessionStreamManager {
    SessionStreamManager::new(StreamSettings {
        max_sessions,
        idle_timeout_secs: 10,
        reaper_interval_secs: 1,
    })
}

fn recorded(manager: &SessionStreamManager) -> Arc<Mutex<Vec<(SessionId, CleanupReason)>>> {
    let log: Arc<Mutex<Vec<(SessionId, CleanupReason)>>> = Arc::default();
    let sink = Arc::clone(&log);
    manager.on_cleanup(move |id, reason| sink.lock().push((id.clone(), reason)));
    log
}

#[tokio::test]
async fn test_queue_is_fifo_and_stream_is_reused() {
    let manager = manager(10);
    let sid = SessionId::new("s1");

    let handle = manager.get_or_create_stream(&sid);
    assert!(handle.created);
    manager.send_message(&sid, "first").unwrap();
    manager.send_message(&sid, "second").unwrap();

    let again = manager.get_or_create_stream(&sid);
    assert!(!again.created);
    assert_eq!(again.generation, handle.generation);

    assert_eq!(handle.messages.next().await.as_deref(), Some("first"));
    assert_eq!(again.messages.next().await.as_deref(), Some("second"));
}

#[tokio::test]
async fn test_send_without_stream_fails() {
    let manager = manager(10);
    let err = manager.send_message(&SessionId::new("ghost"), "hello").unwrap_err();
    assert!(matches!(err, ClaudeError::StreamNotFound(_)));
}

#[tokio::test]
async fn test_oldest_stream_is_evicted_at_cap() {
    let manager = manager(2);
    let cleanups = recorded(&manager);

    let oldest = manager.get_or_create_stream(&SessionId::new("a"));
    manager.get_or_create_stream(&SessionId::new("b"));
    manager.get_or_create_stream(&SessionId::new("c"));

    assert_eq!(manager.len(), 2);
    assert!(!manager.has_stream(&SessionId::new("a")));
    assert!(oldest.cancel.is_cancelled());
    assert!(oldest.messages.queue().is_complete());
    assert_eq!(oldest.messages.next().await, None);
    assert_eq!(*cleanups.lock(), vec![(SessionId::new("a"), CleanupReason::Evicted)]);
}

#[tokio::test]
async fn test_abort_notifies_once() {
    let manager = manager(10);
    let sid = SessionId::new("s1");
    let (connection, mut frames) = ChannelConnection::new();
    let connection: Arc<dyn Connection> = connection;

    let handle = manager.get_or_create_stream(&sid);
    assert!(manager.update_connection(&sid, &connection));
    assert!(manager.is_live(&sid));

    assert!(manager.abort_session(&sid));
    assert!(manager.abort_session(&sid));
    assert!(handle.cancel.is_cancelled());
    assert!(!manager.is_live(&sid));
    assert!(manager.has_stream(&sid));

    let frame: serde_json::Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
    assert_eq!(frame, serde_json::json!({"sessionId": "s1", "type": "generation_stopped"}));
    assert!(frames.try_recv().is_err());

    assert!(!manager.abort_session(&SessionId::new("ghost")));
}

#[tokio::test]
async fn test_stale_generation_cannot_remove_its_successor() {
    let manager = manager(10);
    let sid = SessionId::new("s1");

    let first = manager.get_or_create_stream(&sid);
    assert!(manager.cleanup_session(&sid, CleanupReason::Replaced));
    assert!(!manager.cleanup_session(&sid, CleanupReason::Replaced));
    let second = manager.get_or_create_stream(&sid);
    assert!(second.generation > first.generation);

    assert!(!manager.cleanup_generation(&sid, first.generation, CleanupReason::Completed));
    assert_eq!(manager.generation(&sid), Some(second.generation));
    assert!(manager.cleanup_generation(&sid, second.generation, CleanupReason::Completed));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_dropped_connection_is_not_used() {
    let manager = manager(10);
    let sid = SessionId::new("s1");
    manager.get_or_create_stream(&sid);

    let (connection, frames) = ChannelConnection::new();
    let connection: Arc<dyn Connection> = connection;
    manager.update_connection(&sid, &connection);
    assert!(manager.safe_send(&sid, &ProtocolEvent::CompactLoading));

    drop(frames);
    assert!(!manager.safe_send(&sid, &ProtocolEvent::CompactLoading));
    drop(connection);
    assert!(manager.get_connection(&sid).is_none());
    assert!(!manager.safe_send(&sid, &ProtocolEvent::CompactLoading));
}

#[tokio::test(start_paused = true)]
async fn test_reaper_removes_idle_streams() {
    let manager = Arc::new(manager(10));
    let cleanups = recorded(&manager);
    let idle = SessionId::new("idle");
    let busy = SessionId::new("busy");
    manager.get_or_create_stream(&idle);
    manager.get_or_create_stream(&busy);
    manager.start_reaper();

    for _ in 0..15 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.touch(&busy);
    }

    assert!(!manager.has_stream(&idle));
    assert!(manager.has_stream(&busy));
    assert_eq!(*cleanups.lock(), vec![(idle, CleanupReason::IdleTimeout)]);
    manager.stop_reaper();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_and_cleanup_keep_one_entry() {
    let manager = Arc::new(manager(10));
    let cleanups = recorded(&manager);
    let sid = SessionId::new("contended");

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let sid = sid.clone();
            tokio::spawn(async move {
                let mut created = Vec::new();
                let mut removed = 0;
                for _ in 0..50 {
                    if i % 2 == 0 {
                        let handle = manager.get_or_create_stream(&sid);
                        if handle.created {
                            created.push(handle.generation);
                        }
                    } else if manager.cleanup_session(&sid, CleanupReason::Deleted) {
                        removed += 1;
                    }
                    tokio::task::yield_now().await;
                }
                (created, removed)
            })
        })
        .collect();

    let mut generations = Vec::new();
    let mut removed = 0;
    for task in tasks {
        let (created, count) = task.await.unwrap();
        generations.extend(created);
        removed += count;
    }

    assert!(manager.len() <= 1);
    assert_eq!(generations.len(), removed + manager.len());
    let distinct: std::collections::HashSet<_> = generations.iter().collect();
    assert_eq!(distinct.len(), generations.len());
    assert_eq!(cleanups.lock().len(), removed);
}
