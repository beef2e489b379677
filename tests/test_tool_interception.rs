#![cfg(unix)]

mod common;

use std::path::Path;
use std::time::Duration;

use serde_json::json;

use common::{ScriptedLauncher, Step, TestClient, done, relay, relay_with, tool};
use kodegen_claude_relay::agent::ToolVerdict;
use kodegen_claude_relay::RelayConfig;
use kodegen_claude_relay::types::BashId;

const SILENT_BUILD: &str = "echo partial; make --version >/dev/null 2>&1; sleep 30";

fn quick_hang(log_dir: &Path) -> RelayConfig {
    let mut config = common::test_config(log_dir);
    config.background.long_running_hang_secs = 1;
    config
}

async fn verdict(relay: &common::Relay, launch: usize, index: usize) -> ToolVerdict {
    let receiver = {
        let record = relay.launcher.launch(launch);
        let mut verdicts = record.verdicts.lock();
        let (_, receiver) = verdicts.remove(index);
        receiver
    };
    tokio::time::timeout(common::FRAME_WAIT, receiver)
        .await
        .expect("verdict in time")
        .expect("verdict sent")
}

#[tokio::test]
async fn test_ordinary_tools_run_unchanged() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![
            tool("Read", json!({"file_path": "src/lib.rs"})),
            tool("Bash", json!({"command": "ls -la"})),
            done(),
        ]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "look".into(), None, &client.connection).await.unwrap();
    client.until("result").await;

    assert_eq!(verdict(&relay, 0, 0).await, ToolVerdict::Allow);
    assert_eq!(verdict(&relay, 0, 0).await, ToolVerdict::Allow);
    assert!(relay.orchestrator.background().is_empty());
}

#[tokio::test]
async fn test_background_command_is_tracked_and_deduplicated() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![
            tool(
                "Bash",
                json!({"command": "sleep 30", "run_in_background": true, "description": "nap"}),
            ),
            done(),
        ]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "serve".into(), None, &client.connection).await.unwrap();
    let frames = client.until("result").await;
    let started = common::of_type(&frames, "background_process_started");
    assert_eq!(started.len(), 1);
    assert_eq!(started[0]["command"], "sleep 30");
    assert_eq!(started[0]["description"], "nap");
    assert_eq!(started[0]["existing"], false);
    let bash_id = BashId::new(started[0]["bashId"].as_str().unwrap());

    match verdict(&relay, 0, 0).await {
        ToolVerdict::Substitute { output, exit_code } => {
            assert_eq!(exit_code, 0);
            assert!(output.contains("Command started in the background"));
            assert!(output.contains(bash_id.as_str()));
        }
        other => panic!("expected substitution, got {other:?}"),
    }
    assert!(relay.orchestrator.background().has(&bash_id));

    relay.orchestrator.chat(&sid, "serve again".into(), None, &client.connection).await.unwrap();
    let frames = client.until("result").await;
    let started = common::of_type(&frames, "background_process_started");
    assert_eq!(started[0]["existing"], true);
    assert_eq!(started[0]["bashId"], bash_id.as_str());
    match verdict(&relay, 0, 0).await {
        ToolVerdict::Substitute { output, .. } => assert!(output.contains("already running")),
        other => panic!("expected substitution, got {other:?}"),
    }
    assert_eq!(relay.orchestrator.background().len(), 1);

    relay
        .orchestrator
        .kill_background_process(&bash_id, &client.connection)
        .await
        .unwrap();
    let frames = client.until("background_process_killed").await;
    assert_eq!(frames.last().unwrap()["bashId"], bash_id.as_str());
    assert!(!relay.orchestrator.background().has(&bash_id));
}

#[tokio::test]
async fn test_long_running_command_blocks_until_exit() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![
            tool(
                "Bash",
                json!({"command": "echo building; make --version >/dev/null 2>&1; true"}),
            ),
            done(),
        ]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "build".into(), None, &client.connection).await.unwrap();
    let frames = client.until("long_running_command_completed").await;

    let started = common::of_type(&frames, "long_running_command_started");
    assert_eq!(started.len(), 1);
    let completed = frames.last().unwrap();
    assert_eq!(completed["bashId"], started[0]["bashId"]);
    assert_eq!(completed["exitCode"], 0);

    match verdict(&relay, 0, 0).await {
        ToolVerdict::Substitute { output, exit_code } => {
            assert_eq!(exit_code, 0);
            assert!(output.contains("building"));
        }
        other => panic!("expected substitution, got {other:?}"),
    }
    assert!(relay.orchestrator.background().is_empty());
}

#[tokio::test]
async fn test_silent_long_running_command_is_killed_with_partial_output() {
    let relay = relay_with(
        ScriptedLauncher::new(|_, _| vec![tool("Bash", json!({"command": SILENT_BUILD})), done()]),
        quick_hang,
    );
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "build".into(), None, &client.connection).await.unwrap();
    let frames = client.until("long_running_command_failed").await;

    let started = common::of_type(&frames, "long_running_command_started");
    assert_eq!(started.len(), 1);
    let failed = frames.last().unwrap();
    assert_eq!(failed["bashId"], started[0]["bashId"]);
    assert!(failed["error"].as_str().is_some_and(|e| !e.is_empty()));

    match verdict(&relay, 0, 0).await {
        ToolVerdict::Substitute { output, exit_code } => {
            assert_eq!(exit_code, 124);
            assert!(output.starts_with("partial"));
            assert!(output.ends_with("the process was killed]"));
        }
        other => panic!("expected substitution, got {other:?}"),
    }
    let bash_id = BashId::new(started[0]["bashId"].as_str().unwrap());
    assert!(!relay.orchestrator.background().has(&bash_id));
}

#[tokio::test]
async fn test_long_running_command_never_attaches_to_a_background_copy() {
    let relay = relay_with(
        ScriptedLauncher::new(|_, prompt| match prompt {
            "serve" => vec![
                tool("Bash", json!({"command": SILENT_BUILD, "run_in_background": true})),
                done(),
            ],
            _ => vec![tool("Bash", json!({"command": SILENT_BUILD})), done()],
        }),
        quick_hang,
    );
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "serve".into(), None, &client.connection).await.unwrap();
    let frames = client.until("background_process_started").await;
    let background_id = BashId::new(frames.last().unwrap()["bashId"].as_str().unwrap());
    verdict(&relay, 0, 0).await;

    relay.orchestrator.chat(&sid, "build".into(), None, &client.connection).await.unwrap();
    let frames = client.until("long_running_command_failed").await;
    let started = common::of_type(&frames, "long_running_command_started");
    assert_eq!(started.len(), 1);
    assert_ne!(started[0]["bashId"], background_id.as_str());
    assert!(matches!(
        verdict(&relay, 0, 0).await,
        ToolVerdict::Substitute { exit_code: 124, .. }
    ));

    assert!(relay.orchestrator.background().has(&background_id));
    assert_eq!(relay.orchestrator.background().len(), 1);
    relay.orchestrator.background().kill(&background_id).await;
}

#[tokio::test]
async fn test_command_output_keeps_the_turn_watchdog_quiet() {
    let relay = relay_with(
        ScriptedLauncher::new(|_, _| {
            vec![
                tool(
                    "Bash",
                    json!({"command": "make --version >/dev/null 2>&1; for i in 1 2 3 4 5 6 7 8 9 10; do echo tick; sleep 0.3; done"}),
                ),
                Step::Stall,
            ]
        }),
        |log_dir| {
            let mut config = common::test_config(log_dir);
            config.turn_timeout.warning_after_secs = 1;
            config.turn_timeout.hard_timeout_secs = 2;
            config
        },
    );
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "build".into(), None, &client.connection).await.unwrap();
    let frames = client.until("long_running_command_completed").await;

    let kinds = common::types(&frames);
    assert!(kinds.contains(&"command_output_chunk"));
    assert!(!kinds.contains(&"timeout_warning"));
    assert!(!kinds.contains(&"error"));
    assert_eq!(frames.last().unwrap()["exitCode"], 0);
    assert!(relay.orchestrator.streams().is_live(&sid));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!common::types(&client.drain()).contains(&"timeout_warning"));
    relay.orchestrator.stop_generation(&sid, &client.connection);
}

#[tokio::test]
async fn test_session_delete_kills_its_background_processes() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![
            tool("Bash", json!({"command": "sleep 30", "run_in_background": true})),
            done(),
        ]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "serve".into(), None, &client.connection).await.unwrap();
    client.until("result").await;
    assert_eq!(relay.orchestrator.background().get_by_session(&sid).len(), 1);

    relay.orchestrator.delete_session(&sid).await.unwrap();
    assert!(relay.orchestrator.background().is_empty());
}
