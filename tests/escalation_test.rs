// End-to-end escalation: local model, a mocked N3 specialist and a mocked
// OpenAI-compatible N4 supervisor.

mod common;

use common::{test_config, CannedModel, TestDaemon};
use fazai::config::{Config, SpecialistEntry, SupervisorEntry, SupervisorProvider};
use fazai::inference::WorkerExecutor;
use fazai::protocol::EventType;
use mockito::{Mock, Server, ServerGuard};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const UNSURE: &str = "I don't know, sorry.";

fn completion_body(text: &str) -> String {
    json!({
        "model": "mock",
        "choices": [{"message": {"role": "assistant", "content": text}}],
    })
    .to_string()
}

async fn mock_completion(server: &mut ServerGuard, text: &str) -> Mock {
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body(text))
        .create_async()
        .await
}

fn with_team_and_supervisor(team_url: &str, supervisor_url: &str) -> Config {
    let mut config = test_config();
    config.team = vec![SpecialistEntry {
        name: "analyst".to_string(),
        base_url: team_url.to_string(),
        model: "local-analyst".to_string(),
        api_key: None,
        system_prompt: None,
    }];
    config.supervisor = Some(SupervisorEntry {
        provider: SupervisorProvider::Openai,
        api_key: "test-key".to_string(),
        model: Some("gpt-test".to_string()),
        base_url: Some(supervisor_url.to_string()),
    });
    config
}

#[tokio::test]
async fn test_team_answers_when_local_is_unsure() {
    let mut team = Server::new_async().await;
    let mut supervisor = Server::new_async().await;
    let team_mock = mock_completion(&mut team, "Nginx reads /etc/nginx/nginx.conf first.").await;
    let supervisor_mock = supervisor
        .mock("POST", "/v1/chat/completions")
        .expect(0)
        .create_async()
        .await;

    let config = with_team_and_supervisor(&team.url(), &supervisor.url());
    let daemon = TestDaemon::start(config, CannedModel::reply(UNSURE)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "b1", "input": "where is the nginx config?"}))
        .await;
    let event = client.terminal("b1").await;
    assert_eq!(event.event_type, EventType::Result);
    assert_eq!(event.tier_used.as_deref(), Some("N3"));
    assert_eq!(
        event.result.as_deref(),
        Some("Nginx reads /etc/nginx/nginx.conf first.")
    );

    // The N3 answer is now cached
    client
        .send(json!({"action": "ask", "action_id": "b2", "input": "where is the nginx config?"}))
        .await;
    assert_eq!(client.terminal("b2").await.tier_used.as_deref(), Some("N1"));

    team_mock.assert_async().await;
    supervisor_mock.assert_async().await;
}

#[tokio::test]
async fn test_hung_local_worker_times_out_into_team() {
    let mut team = Server::new_async().await;
    let mut supervisor = Server::new_async().await;
    mock_completion(&mut team, "Use journalctl -u nginx --since today.").await;

    let dir = TempDir::new().unwrap();
    let script = dir.path().join("worker.sh");
    std::fs::write(&script, "while IFS= read -r line; do sleep 30; done\n").unwrap();

    let mut config = with_team_and_supervisor(&team.url(), &supervisor.url());
    config.escalation.local_timeout_secs = 1;
    config.inference.worker_command = vec!["sh".to_string(), script.display().to_string()];
    let worker = Arc::new(WorkerExecutor::spawn(&config.inference).unwrap());

    let daemon = TestDaemon::start(config, worker).await;
    let mut client = daemon.connect().await;

    let started = Instant::now();
    client
        .send(json!({"action": "ask", "action_id": "t1", "input": "show nginx logs"}))
        .await;
    let events = client.events_for("t1").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Result);
    assert_eq!(events[0].tier_used.as_deref(), Some("N3"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_supervisor_answers_when_team_is_unsure() {
    let mut team = Server::new_async().await;
    let mut supervisor = Server::new_async().await;
    mock_completion(&mut team, "I'm not sure which unit that is.").await;
    let supervisor_mock = mock_completion(&mut supervisor, "Run: systemctl restart nginx").await;

    let config = with_team_and_supervisor(&team.url(), &supervisor.url());
    let daemon = TestDaemon::start(config, CannedModel::reply(UNSURE)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "c1", "input": "how do I restart nginx?"}))
        .await;
    let event = client.terminal("c1").await;
    assert_eq!(event.event_type, EventType::Result);
    assert_eq!(event.tier_used.as_deref(), Some("N4"));
    assert_eq!(event.result.as_deref(), Some("Run: systemctl restart nginx"));
    supervisor_mock.assert_async().await;
}

#[tokio::test]
async fn test_every_tier_unsure_is_exhausted() {
    let mut team = Server::new_async().await;
    let mut supervisor = Server::new_async().await;
    mock_completion(&mut team, UNSURE).await;
    mock_completion(&mut supervisor, UNSURE).await;

    let config = with_team_and_supervisor(&team.url(), &supervisor.url());
    let daemon = TestDaemon::start(config, CannedModel::reply(UNSURE)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "d1", "input": "what is the meaning of life?"}))
        .await;
    let events = client.events_for("d1").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Error);
    assert_eq!(events[0].kind.as_deref(), Some("Exhausted"));
}

#[tokio::test]
async fn test_supervisor_http_error_still_ends_in_one_error() {
    let mut team = Server::new_async().await;
    let mut supervisor = Server::new_async().await;
    mock_completion(&mut team, UNSURE).await;
    supervisor
        .mock("POST", "/v1/chat/completions")
        .with_status(500)
        .with_body("upstream down")
        .create_async()
        .await;

    let config = with_team_and_supervisor(&team.url(), &supervisor.url());
    let daemon = TestDaemon::start(config, CannedModel::reply(UNSURE)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "ask", "action_id": "h1", "input": "is the disk failing?"}))
        .await;
    let event = client.terminal("h1").await;
    assert_eq!(event.event_type, EventType::Error);
    assert_eq!(event.kind.as_deref(), Some("Exhausted"));
    assert!(event.error.unwrap().contains("N4"));
}

#[tokio::test]
async fn test_plan_returns_steps() {
    let plan = "1. Check disk usage with df -h\n2. Remove old logs from /var/log\n3. Verify free space again";
    let daemon = TestDaemon::start(test_config(), CannedModel::reply(plan)).await;
    let mut client = daemon.connect().await;

    client
        .send(json!({"action": "plan", "action_id": "p1", "input": "free up disk space"}))
        .await;
    let event = client.terminal("p1").await;
    assert_eq!(event.event_type, EventType::Result);
    assert_eq!(event.tier_used.as_deref(), Some("N2"));
    let steps = event.steps.unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0], "Check disk usage with df -h");
}
