use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kodegen_claude_relay::{ClaudeError, TimeoutController};

fn watchdog(warning: u64, hard: u64) -> (TimeoutController, Arc<Mutex<Vec<Duration>>>) {
    let warnings: Arc<Mutex<Vec<Duration>>> = Arc::default();
    let sink = Arc::clone(&warnings);
    let controller = TimeoutController::new(
        Duration::from_secs(warning),
        Duration::from_secs(hard),
        move |elapsed| sink.lock().push(elapsed),
    );
    (controller, warnings)
}

#[tokio::test(start_paused = true)]
async fn test_warning_then_hard_timeout() {
    let (controller, warnings) = watchdog(60, 300);
    let expired = controller.expired();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(*warnings.lock(), vec![Duration::from_secs(60)]);
    assert!(!controller.has_fired());
    assert!(controller.check_timeout().is_ok());

    tokio::time::timeout(Duration::from_secs(300), expired.cancelled())
        .await
        .expect("hard deadline fires");
    assert!(controller.has_fired());
    assert!(matches!(controller.check_timeout(), Err(ClaudeError::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_progress_pushes_deadlines_back() {
    let (controller, warnings) = watchdog(60, 120);

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(50)).await;
        controller.reset();
    }
    assert!(warnings.lock().is_empty());
    assert!(!controller.has_fired());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_both_deadlines() {
    let (controller, warnings) = watchdog(60, 120);
    controller.cancel();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(warnings.lock().is_empty());
    assert!(!controller.has_fired());

    controller.reset();
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(warnings.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_after_expiry_has_no_effect() {
    let (controller, _) = watchdog(10, 20);
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(controller.has_fired());

    controller.reset();
    assert!(controller.has_fired());
    assert!(controller.expired().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_no_warning_when_it_would_not_precede_the_deadline() {
    let (controller, warnings) = watchdog(30, 30);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(controller.has_fired());
    assert!(warnings.lock().is_empty());
}
