// Integration tests for the daemon's wire protocol over real sockets

mod common;

use common::{test_config, CannedModel, TestDaemon};
use fazai::inference::WorkerExecutor;
use fazai::protocol::{Event, EventType};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GOOD_ANSWER: &str = "The root filesystem has 12G free out of 40G.";

#[tokio::test]
async fn test_local_answer_then_cache_hit() {
    let model = CannedModel::reply(GOOD_ANSWER);
    let daemon = TestDaemon::start(test_config(), model.clone()).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "a1", "input": "how much disk space is free?"}))
        .await;
    let first = client.terminal("a1").await;
    assert_eq!(first.event_type, EventType::Result);
    assert_eq!(first.result.as_deref(), Some(GOOD_ANSWER));
    assert_eq!(first.tier_used.as_deref(), Some("N2"));
    assert!(first.session_id.is_some());

    // Same question, different spacing and case
    client
        .send(json!({"action": "ask", "action_id": "a2", "input": "How much  disk space is FREE?"}))
        .await;
    let second = client.terminal("a2").await;
    assert_eq!(second.result.as_deref(), Some(GOOD_ANSWER));
    assert_eq!(second.tier_used.as_deref(), Some("N1"));
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_empty_ask_is_one_validation_error() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "e1", "input": "   "}))
        .await;
    let events = client.events_for("e1").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Error);
    assert_eq!(events[0].kind.as_deref(), Some("ValidationError"));
}

#[tokio::test]
async fn test_unknown_action_keeps_action_id() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "teleport", "action_id": "u1", "input": "mars"}))
        .await;
    let event = client.terminal("u1").await;
    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.kind.as_deref(), Some("ProtocolError"));
}

#[tokio::test]
async fn test_malformed_lines_close_connection_past_threshold() {
    let mut config = test_config();
    config.server.malformed_threshold = 2;
    let daemon = TestDaemon::start(config, CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    for _ in 0..2 {
        client.send_line("{not json").await;
        let event = client.next_event().await.unwrap();
        assert_eq!(event.kind.as_deref(), Some("ProtocolError"));
        assert!(event.action_id.is_none());
    }

    // Still usable at the threshold
    client.send(json!({"action": "status", "action_id": "s1"})).await;
    assert_eq!(client.terminal("s1").await.event_type, EventType::Result);

    client.send_line("still not json").await;
    let event = client.next_event().await.unwrap();
    assert_eq!(event.kind.as_deref(), Some("ProtocolError"));
    assert!(client.next_event().await.is_none());
}

#[tokio::test]
async fn test_oversized_line_is_rejected_and_closed() {
    let mut config = test_config();
    config.server.max_line_bytes = 256;
    let daemon = TestDaemon::start(config, CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    let input = "x".repeat(1024);
    client
        .send(json!({"action": "ask", "action_id": "big", "input": input}))
        .await;
    let event = client.next_event().await.unwrap();
    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.kind.as_deref(), Some("ProtocolError"));
    assert!(event.action_id.is_none());
    assert!(client.next_event().await.is_none());
}

#[tokio::test]
async fn test_commit_knowledge_twice_gives_distinct_ids() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    let mut ids = Vec::new();
    for action_id in ["k1", "k2"] {
        client
            .send(json!({
                "action": "commitKB",
                "action_id": action_id,
                "input": "nginx config lives in /etc/nginx",
            }))
            .await;
        let event = client.terminal(action_id).await;
        assert_eq!(event.event_type, EventType::Result);
        ids.push(event.result.unwrap());
    }

    assert_ne!(ids[0], ids[1]);
    assert_eq!(daemon.memory.len().await, 2);
}

#[tokio::test]
async fn test_session_create_use_close() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "create_session", "action_id": "c1"}))
        .await;
    let created = client.terminal("c1").await;
    assert_eq!(created.event_type, EventType::Result);
    let session_id = created.session_id.clone().unwrap();

    client
        .send(json!({
            "action": "ask",
            "action_id": "q1",
            "input": "free space?",
            "session_id": session_id,
        }))
        .await;
    let answer = client.terminal("q1").await;
    assert_eq!(answer.session_id.as_deref(), Some(session_id.as_str()));

    client
        .send(json!({"action": "close_session", "action_id": "c2", "session_id": session_id}))
        .await;
    assert_eq!(client.terminal("c2").await.event_type, EventType::Done);

    client
        .send(json!({"action": "close_session", "action_id": "c3", "session_id": session_id}))
        .await;
    let again = client.terminal("c3").await;
    assert_eq!(again.event_type, EventType::Error);
    assert_eq!(again.kind.as_deref(), Some("SessionNotFound"));

    client
        .send(json!({
            "action": "ask",
            "action_id": "q2",
            "input": "free space?",
            "session_id": session_id,
        }))
        .await;
    assert_eq!(
        client.terminal("q2").await.kind.as_deref(),
        Some("SessionNotFound")
    );
}

#[tokio::test]
async fn test_cancel_in_flight_action() {
    let daemon = TestDaemon::start(test_config(), CannedModel::stalled()).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "slow", "input": "summarise the logs"}))
        .await;
    client
        .send(json!({"action": "cancel", "action_id": "x1", "target": "slow"}))
        .await;

    let (cancel_result, stop) = cancel_outcome(&mut client, "x1", "slow").await;
    assert_eq!(cancel_result.result.as_deref(), Some("cancelled 1"));
    assert_eq!(stop.event_type, EventType::Stop);
}

/// The cancel request's result and the target's terminal event, in either order
async fn cancel_outcome<S>(
    client: &mut common::TestClient<S>,
    cancel_id: &str,
    target: &str,
) -> (Event, Event)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut cancel_result = None;
    let mut stop = None;
    while cancel_result.is_none() || stop.is_none() {
        let event = client.next_event().await.unwrap();
        match event.action_id.as_deref() {
            Some(id) if id == cancel_id => cancel_result = Some(event),
            Some(id) if id == target && event.is_terminal() => stop = Some(event),
            _ => {}
        }
    }
    (cancel_result.unwrap(), stop.unwrap())
}

#[tokio::test]
async fn test_cancel_unknown_target_is_validation_error() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "abort", "action_id": "x2", "target": "nothing"}))
        .await;
    assert_eq!(
        client.terminal("x2").await.kind.as_deref(),
        Some("ValidationError")
    );
}

#[tokio::test]
async fn test_duplicate_in_flight_id_is_rejected_with_its_id() {
    let daemon = TestDaemon::start(test_config(), CannedModel::stalled()).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "dup", "input": "summarise the logs"}))
        .await;
    client
        .send(json!({"action": "ask", "action_id": "dup", "input": "summarise them again"}))
        .await;

    let event = client.terminal("dup").await;
    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.kind.as_deref(), Some("ProtocolError"));
    assert!(event.error.unwrap().contains("already in flight"));

    // The first action is untouched and can still be cancelled
    client
        .send(json!({"action": "cancel", "action_id": "x1", "target": "dup"}))
        .await;
    let (cancel_result, stop) = cancel_outcome(&mut client, "x1", "dup").await;
    assert_eq!(cancel_result.result.as_deref(), Some("cancelled 1"));
    assert_eq!(stop.event_type, EventType::Stop);
}

#[tokio::test]
async fn test_cancel_cannot_reach_another_connection() {
    let daemon = TestDaemon::start(test_config(), CannedModel::stalled()).await;
    let mut owner = daemon.connect().await;
    let mut other = daemon.connect().await;

    owner
        .send(json!({"action": "ask", "action_id": "mine", "input": "summarise the logs"}))
        .await;
    // Make sure the action is registered before the foreign cancel arrives
    owner.send(json!({"action": "status", "action_id": "s0"})).await;
    owner.terminal("s0").await;

    other
        .send(json!({"action": "cancel", "action_id": "x1", "target": "mine"}))
        .await;
    assert_eq!(other.terminal("x1").await.kind.as_deref(), Some("ValidationError"));

    // An untargeted cancel only sweeps the sender's own actions
    other.send(json!({"action": "cancel", "action_id": "x2"})).await;
    assert_eq!(other.terminal("x2").await.result.as_deref(), Some("cancelled 0"));

    owner
        .send(json!({"action": "cancel", "action_id": "x3", "target": "mine"}))
        .await;
    let (cancel_result, stop) = cancel_outcome(&mut owner, "x3", "mine").await;
    assert_eq!(cancel_result.result.as_deref(), Some("cancelled 1"));
    assert_eq!(stop.event_type, EventType::Stop);
}

fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

async fn wait_for_file(path: &Path) -> String {
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(path) {
            if !text.trim().is_empty() {
                return text;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn test_disconnect_kills_worker_job_and_drops_session() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("worker.pid");
    let script = dir.path().join("worker.sh");
    std::fs::write(
        &script,
        format!(
            "while IFS= read -r line; do echo $$ > '{}'; sleep 30; done\n",
            pid_file.display()
        ),
    )
    .unwrap();

    let mut config = test_config();
    config.inference.worker_command = vec!["sh".to_string(), script.display().to_string()];
    let worker = Arc::new(WorkerExecutor::spawn(&config.inference).unwrap());
    let daemon = TestDaemon::start(config, worker).await;

    let mut client = daemon.connect().await;
    client
        .send(json!({"action": "ask", "action_id": "slow", "input": "summarise the logs"}))
        .await;

    // The worker picked the job up
    let pid: i32 = wait_for_file(&pid_file).await.trim().parse().unwrap();
    assert!(process_alive(pid));

    let mut observer = daemon.connect_tcp().await;
    observer.send(json!({"action": "status", "action_id": "s1"})).await;
    let before = observer.terminal("s1").await.data.unwrap();
    assert_eq!(before["sessions"], 1);

    drop(client);

    let mut killed = false;
    for _ in 0..100 {
        if !process_alive(pid) {
            killed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(killed, "worker {} survived the disconnect", pid);

    let mut sessions = serde_json::Value::Null;
    for i in 0..50 {
        let id = format!("s{}", i + 2);
        observer.send(json!({"action": "status", "action_id": id})).await;
        sessions = observer.terminal(&id).await.data.unwrap()["sessions"].clone();
        if sessions == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(sessions, 0);
}

#[tokio::test]
async fn test_shell_runs_direct_command() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply("unused")).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "shell", "action_id": "sh1", "input": "echo fazai-shell-ok"}))
        .await;
    let events = client.events_for("sh1").await;
    let result = events.last().unwrap();
    assert_eq!(result.event_type, EventType::Result);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.tier_used.as_deref(), Some("N/A"));
    assert!(result.result.as_deref().unwrap().contains("fazai-shell-ok"));
}

#[tokio::test]
async fn test_observe_status_is_local_snapshot() {
    let model = CannedModel::reply(GOOD_ANSWER);
    let daemon = TestDaemon::start(test_config(), model.clone()).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "observe", "action_id": "t1", "input": "status"}))
        .await;
    let event = client.terminal("t1").await;
    assert_eq!(event.event_type, EventType::Result);
    assert_eq!(event.tier_used.as_deref(), Some("N/A"));
    assert!(!event.result.unwrap().is_empty());
    assert!(event.data.is_some());
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_status_over_tcp() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect_tcp().await;

    client
        .send(json!({"action": "status", "action_id": "st", "params": {"metrics": true}}))
        .await;
    let event = client.terminal("st").await;
    assert_eq!(event.event_type, EventType::Result);
    let data = event.data.unwrap();
    assert_eq!(data["version"], env!("CARGO_PKG_VERSION"));
    assert!(data["prometheus"].is_string());
}

#[tokio::test]
async fn test_connection_limit_is_backpressure() {
    let mut config = test_config();
    config.server.max_connections = 1;
    let daemon = TestDaemon::start(config, CannedModel::reply(GOOD_ANSWER)).await;

    let mut first = daemon.connect().await;
    first.send(json!({"action": "status", "action_id": "s1"})).await;
    assert_eq!(first.terminal("s1").await.event_type, EventType::Result);

    let mut second = daemon.connect().await;
    let refused = second.next_event().await.unwrap();
    assert_eq!(refused.event_type, EventType::Error);
    assert_eq!(refused.kind.as_deref(), Some("Backpressure"));
    assert!(second.next_event().await.is_none());
}

#[tokio::test]
async fn test_every_request_gets_one_terminal_event() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let mut client = daemon.connect().await;

    let ids = ["t1", "t2", "t3", "t4"];
    client.send(json!({"action": "ask", "action_id": "t1", "input": "uptime?"})).await;
    client.send(json!({"action": "research", "action_id": "t2", "input": "nginx"})).await;
    client.send(json!({"action": "exec", "action_id": "t3", "input": "true"})).await;
    client.send(json!({"action": "ask", "action_id": "t4", "input": ""})).await;

    let mut terminals = std::collections::HashMap::new();
    while terminals.len() < ids.len() {
        let event = client.next_event().await.unwrap();
        if event.is_terminal() {
            let id = event.action_id.clone().unwrap();
            assert!(terminals.insert(id, event).is_none(), "duplicate terminal event");
        }
    }
    for id in ids {
        assert!(terminals.contains_key(id));
    }
}

#[tokio::test]
async fn test_shutdown_removes_socket() {
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(GOOD_ANSWER)).await;
    let socket = daemon.socket.clone();
    assert!(socket.exists());

    daemon.stop().await.unwrap();
    assert!(!socket.exists());
}
