mod common;

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::json;

use common::{ScriptedLauncher, Step, TestClient, compact, done, init, of_type, relay, text, types};
use kodegen_claude_relay::agent::{AgentEvent, CompactTrigger};
use kodegen_claude_relay::orchestrator::{COMPACT_COMMAND, PLAN_APPROVED_PROMPT};
use kodegen_claude_relay::types::{
    ClientMessage, ContentBlock, MessageRole, PermissionMode, SessionId, SessionRecord,
};
use kodegen_claude_relay::{ClaudeError, SessionStore};

#[tokio::test]
async fn test_turn_streams_and_persists() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![init("resume-1"), text("Hi"), text(" there"), text("!"), done()]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay
        .orchestrator
        .chat(&sid, "hello".into(), None, &client.connection)
        .await
        .unwrap();
    let frames = client.until("result").await;

    assert_eq!(
        types(&frames),
        vec!["assistant_message", "assistant_message", "assistant_message", "context_usage", "result"]
    );
    let chunks: Vec<&str> = of_type(&frames, "assistant_message")
        .iter()
        .filter_map(|f| f["content"].as_str())
        .collect();
    assert_eq!(chunks, vec!["Hi", " there", "!"]);
    assert_eq!(frames[4]["success"], true);
    assert!(frames.iter().all(|f| f["sessionId"] == "s1"));

    let messages = relay.store.messages(&sid);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "Hi there!");

    let session = relay.store.session(&sid).unwrap();
    assert_eq!(session.resume_token.as_deref(), Some("resume-1"));
    assert!(session.context_usage.is_some());
}

#[tokio::test]
async fn test_follow_up_reuses_live_invocation() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "one".into(), None, &client.connection).await.unwrap();
    client.until("result").await;
    relay.orchestrator.chat(&sid, "two".into(), None, &client.connection).await.unwrap();
    let frames = client.until("result").await;

    assert_eq!(frames[0]["content"], "Echo: two");
    assert_eq!(relay.launcher.launch_count(), 1);
    assert_eq!(*relay.launcher.launch(0).prompts.lock(), vec!["one", "two"]);
    assert!(relay.orchestrator.streams().is_live(&sid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_chats_share_one_invocation() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    let (first, second) = tokio::join!(
        relay.orchestrator.chat(&sid, "one".into(), None, &client.connection),
        relay.orchestrator.chat(&sid, "two".into(), None, &client.connection),
    );
    first.unwrap();
    second.unwrap();

    let mut frames = client.until("result").await;
    frames.extend(client.until("result").await);
    let replies: HashSet<&str> = of_type(&frames, "assistant_message")
        .iter()
        .filter_map(|f| f["content"].as_str())
        .collect();
    assert_eq!(replies, HashSet::from(["Echo: one", "Echo: two"]));

    assert_eq!(relay.launcher.launch_count(), 1);
    assert_eq!(relay.launcher.launch(0).prompts.lock().len(), 2);
    assert_eq!(relay.orchestrator.streams().len(), 1);
}

#[tokio::test]
async fn test_client_message_dispatch() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    let message: ClientMessage =
        serde_json::from_value(json!({"type": "chat", "content": "hi", "sessionId": "s1"})).unwrap();
    assert_eq!(message.session_id(), Some(&sid));
    relay.orchestrator.handle(message, &client.connection).await.unwrap();

    let frames = client.until("result").await;
    assert_eq!(frames[0]["content"], "Echo: hi");
}

#[tokio::test]
async fn test_stop_generation_then_resend_respawns() {
    let relay = relay(ScriptedLauncher::new(|_, prompt| match prompt {
        "long" => vec![init("resume-1"), text("partial"), Step::Stall],
        other => vec![text(&format!("Echo: {other}")), done()],
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "long".into(), None, &client.connection).await.unwrap();
    client.until("assistant_message").await;

    assert!(relay.orchestrator.stop_generation(&sid, &client.connection));
    let frames = client.until("result").await;
    assert_eq!(types(&frames), vec!["generation_stopped", "result"]);
    assert_eq!(frames[1]["success"], true);

    let first = relay.launcher.launch(0);
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while *first.control.interrupts.lock() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("agent is asked to interrupt");
    assert_eq!(*first.control.interrupts.lock(), 1);

    let messages = relay.store.messages(&sid);
    assert_eq!(messages.last().unwrap().content, "partial");

    relay.orchestrator.chat(&sid, "again".into(), None, &client.connection).await.unwrap();
    let frames = client.until("result").await;
    assert_eq!(frames[0]["content"], "Echo: again");

    assert_eq!(relay.launcher.launch_count(), 2);
    let second = relay.launcher.launch(1);
    assert_eq!(second.resume_token.as_deref(), Some("resume-1"));
    assert_eq!(*second.prompts.lock(), vec!["again"]);
}

#[tokio::test]
async fn test_stop_without_stream_is_a_no_op() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    assert!(!relay.orchestrator.stop_generation(&sid, &client.connection));
    assert!(client.drain().is_empty());
}

fn plan_tool(id: &str) -> Step {
    Step::Event(AgentEvent::Assistant {
        blocks: vec![ContentBlock::ToolUse {
            id: id.to_string(),
            name: "ExitPlanMode".to_string(),
            input: json!({"plan": "1. write the parser"}),
        }],
        model: None,
    })
}

#[tokio::test]
async fn test_plan_mode_and_approval() {
    let relay = relay(ScriptedLauncher::new(|_, prompt| {
        if prompt == PLAN_APPROVED_PROMPT {
            vec![text("implementing"), done()]
        } else {
            vec![plan_tool("t1"), plan_tool("t2"), done()]
        }
    }));
    let sid = SessionId::new("plan");
    relay.store.insert_session(
        SessionRecord::new(sid.clone(), relay.workdir.path()).with_permission_mode(PermissionMode::Plan),
    );
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "plan it".into(), None, &client.connection).await.unwrap();
    let frames = client.until("result").await;

    let plans = of_type(&frames, "exit_plan_mode");
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0]["plan"], "1. write the parser");
    assert!(of_type(&frames, "tool_use").is_empty());

    let launch = relay.launcher.launch(0);
    assert_eq!(launch.permission_mode, PermissionMode::BypassPermissions);
    assert_eq!(*launch.control.modes.lock(), vec![PermissionMode::Plan]);

    relay.orchestrator.approve_plan(&sid, &client.connection).await.unwrap();
    let frames = client.until("result").await;
    assert_eq!(frames[0]["type"], "permission_mode_changed");
    assert_eq!(frames[0]["mode"], "bypassPermissions");
    assert_eq!(frames[1]["content"], "implementing");

    assert_eq!(relay.launcher.launch_count(), 1);
    assert_eq!(
        *launch.control.modes.lock(),
        vec![PermissionMode::Plan, PermissionMode::BypassPermissions]
    );
    assert_eq!(
        relay.store.session(&sid).unwrap().permission_mode,
        PermissionMode::BypassPermissions
    );
}

#[tokio::test]
async fn test_set_permission_mode_without_stream() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay
        .orchestrator
        .set_permission_mode(&sid, PermissionMode::AcceptEdits, &client.connection)
        .await
        .unwrap();

    let frame = client.next().await;
    assert_eq!(frame["type"], "permission_mode_changed");
    assert_eq!(frame["mode"], "acceptEdits");
    assert_eq!(relay.store.session(&sid).unwrap().permission_mode, PermissionMode::AcceptEdits);
}

#[tokio::test]
async fn test_automatic_compaction_writes_divider() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![compact(CompactTrigger::Auto, Some(1234)), text("ok"), done()]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "go".into(), None, &client.connection).await.unwrap();
    let frames = client.until("result").await;
    assert_eq!(frames[0]["type"], "compact_start");

    let messages = relay.store.messages(&sid);
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].role, MessageRole::System);
    assert_eq!(messages[1].content, "Conversation compacted automatically (1234 tokens before)");
    assert_eq!(messages[2].content, "ok");
}

#[tokio::test]
async fn test_manual_compact_command() {
    let relay = relay(ScriptedLauncher::new(|_, prompt| {
        if prompt == COMPACT_COMMAND {
            vec![compact(CompactTrigger::Manual, None), done()]
        } else {
            vec![done()]
        }
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay
        .orchestrator
        .chat(&sid, COMPACT_COMMAND.into(), None, &client.connection)
        .await
        .unwrap();
    let frames = client.until("result").await;
    assert_eq!(
        types(&frames),
        vec!["compact_loading", "compact_complete", "context_usage", "result"]
    );

    let messages = relay.store.messages(&sid);
    assert_eq!(messages.last().unwrap().role, MessageRole::System);
    assert_eq!(messages.last().unwrap().content, "Conversation compacted");
}

#[tokio::test]
async fn test_failed_attempt_replays_prompt() {
    let relay = relay(ScriptedLauncher::new(|launch, prompt| {
        if launch == 1 {
            vec![Step::Fail(ClaudeError::process(
                "Claude CLI exited with exit status: 1",
                1,
                Some("API Error: 529 overloaded_error".into()),
            ))]
        } else {
            vec![text(&format!("Echo: {prompt}")), done()]
        }
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "hello".into(), None, &client.connection).await.unwrap();
    let frames = client.until("result").await;

    assert_eq!(frames[0]["type"], "retry_attempt");
    assert_eq!(frames[0]["attempt"], 2);
    assert_eq!(frames[0]["maxAttempts"], 3);
    assert_eq!(frames[0]["delayMs"], 10);
    assert_eq!(frames[0]["errorType"], "overloaded");
    assert_eq!(frames[1]["content"], "Echo: hello");
    assert_eq!(frames.last().unwrap()["success"], true);

    assert_eq!(relay.launcher.launch_count(), 2);
    assert_eq!(*relay.launcher.launch(1).prompts.lock(), vec!["hello"]);
    let users = relay
        .store
        .messages(&sid)
        .into_iter()
        .filter(|m| m.role == MessageRole::User)
        .count();
    assert_eq!(users, 1);
}

#[tokio::test]
async fn test_retry_budget_starts_over_after_a_completed_turn() {
    // Every prompt fails once on the invocation that first sees it, then succeeds on respawn
    let seen: Mutex<HashSet<String>> = Mutex::default();
    let relay = relay(ScriptedLauncher::new(move |_, prompt| {
        if seen.lock().insert(prompt.to_string()) {
            vec![Step::Fail(ClaudeError::connection("read ECONNRESET"))]
        } else {
            vec![text(&format!("Echo: {prompt}")), done()]
        }
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    for prompt in ["flaky-1", "flaky-2", "flaky-3"] {
        relay.orchestrator.chat(&sid, prompt.into(), None, &client.connection).await.unwrap();
        let frames = client.until("result").await;

        let retries = of_type(&frames, "retry_attempt");
        assert_eq!(retries.len(), 1, "{prompt}: {frames:?}");
        assert_eq!(retries[0]["attempt"], 2);
        assert_eq!(retries[0]["delayMs"], 10);
        assert_eq!(retries[0]["errorType"], "network");
        assert!(of_type(&frames, "error").is_empty());
        assert_eq!(frames.last().unwrap()["success"], true);
        assert_eq!(of_type(&frames, "assistant_message")[0]["content"], format!("Echo: {prompt}"));
    }

    assert_eq!(relay.launcher.launch_count(), 4);
    assert!(relay.orchestrator.streams().is_live(&sid));
}

#[tokio::test]
async fn test_authentication_failure_is_not_retried() {
    let relay = relay(ScriptedLauncher::echo());
    relay.launcher.fail_next_launch(ClaudeError::process(
        "Claude CLI exited with exit status: 1",
        1,
        Some("Invalid API key · Please run /login".into()),
    ));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "hello".into(), None, &client.connection).await.unwrap();
    let frames = client.until("error").await;

    assert_eq!(types(&frames), vec!["error"]);
    assert_eq!(frames[0]["errorType"], "authentication");
    assert_eq!(relay.launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_retry_budget_runs_out() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![Step::Fail(ClaudeError::agent("API Error: 529 overloaded", None))]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "hello".into(), None, &client.connection).await.unwrap();
    let frames = client.until("error").await;

    assert_eq!(types(&frames), vec!["retry_attempt", "retry_attempt", "error"]);
    assert_eq!(frames[1]["delayMs"], 20);
    assert_eq!(frames[2]["errorType"], "overloaded");
    assert_eq!(relay.launcher.launch_count(), 3);
}

#[tokio::test]
async fn test_agent_reported_error_fails_the_turn() {
    let relay = relay(ScriptedLauncher::new(|_, _| {
        vec![common::failed_turn("API Error: 429 rate limit exceeded")]
    }));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "hello".into(), None, &client.connection).await.unwrap();
    let frames = client.until("error").await;

    assert_eq!(types(&frames), vec!["context_usage", "result", "error"]);
    assert_eq!(frames[1]["success"], false);
    assert_eq!(frames[2]["errorType"], "rate_limit");
    assert!(relay.orchestrator.streams().is_live(&sid));
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let relay = relay(ScriptedLauncher::echo());
    let client = TestClient::new();

    let err = relay
        .orchestrator
        .chat(&SessionId::new("missing"), "hello".into(), None, &client.connection)
        .await
        .unwrap_err();
    assert!(matches!(err, ClaudeError::SessionNotFound(_)));
    assert_eq!(relay.launcher.launch_count(), 0);
}

#[tokio::test]
async fn test_change_working_directory_starts_fresh() {
    let relay = relay(ScriptedLauncher::new(|_, _| vec![init("resume-1"), done()]));
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "one".into(), None, &client.connection).await.unwrap();
    client.until("result").await;

    let moved = relay.workdir.path().join("elsewhere");
    std::fs::create_dir(&moved).unwrap();
    relay
        .orchestrator
        .change_working_directory(&sid, moved.clone())
        .await
        .unwrap();

    let session = relay.store.session(&sid).unwrap();
    assert_eq!(session.working_directory, moved);
    assert_eq!(session.resume_token, None);
    assert!(!relay.orchestrator.streams().has_stream(&sid));

    relay.orchestrator.chat(&sid, "two".into(), None, &client.connection).await.unwrap();
    client.until("result").await;
    let second = relay.launcher.launch(1);
    assert_eq!(second.working_directory, moved);
    assert_eq!(second.resume_token, None);
}

#[tokio::test]
async fn test_change_working_directory_requires_existing_dir() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");

    let err = relay
        .orchestrator
        .change_working_directory(&sid, relay.workdir.path().join("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClaudeError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_change_conversation_mode_forces_respawn() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "one".into(), None, &client.connection).await.unwrap();
    client.until("result").await;
    relay
        .orchestrator
        .change_conversation_mode(&sid, Some("planning".into()))
        .await
        .unwrap();
    assert!(!relay.orchestrator.streams().has_stream(&sid));
    assert_eq!(
        relay.store.session(&sid).unwrap().conversation_mode.as_deref(),
        Some("planning")
    );

    relay.orchestrator.chat(&sid, "two".into(), None, &client.connection).await.unwrap();
    client.until("result").await;
    assert_eq!(relay.launcher.launch_count(), 2);
}

#[tokio::test]
async fn test_delete_session() {
    let relay = relay(ScriptedLauncher::echo());
    let sid = relay.session("s1");
    let mut client = TestClient::new();

    relay.orchestrator.chat(&sid, "one".into(), None, &client.connection).await.unwrap();
    client.until("result").await;
    relay.orchestrator.delete_session(&sid).await.unwrap();

    assert!(relay.store.session(&sid).is_none());
    assert!(!relay.orchestrator.streams().has_stream(&sid));
    assert!(relay.store.get_session(&sid).await.is_err());
}

#[tokio::test]
async fn test_kill_unknown_background_process() {
    let relay = relay(ScriptedLauncher::echo());
    let client = TestClient::new();

    let err = relay
        .orchestrator
        .kill_background_process(&"bash_missing".into(), &client.connection)
        .await
        .unwrap_err();
    assert!(matches!(err, ClaudeError::BackgroundProcess(_)));
}

#[tokio::test]
async fn test_shutdown_closes_every_stream() {
    let relay = relay(ScriptedLauncher::echo());
    let mut client = TestClient::new();
    for id in ["a", "b"] {
        let sid = relay.session(id);
        relay.orchestrator.chat(&sid, "hi".into(), None, &client.connection).await.unwrap();
        client.until("result").await;
    }
    assert_eq!(relay.orchestrator.streams().len(), 2);

    relay.orchestrator.shutdown().await;
    assert!(relay.orchestrator.streams().is_empty());
    assert!(relay.orchestrator.background().is_empty());
}
