//! E2E tests for the auto-reply poll cycle

mod common;

use common::{TestServer, envelope};
use modpatrol::data::AutoReplyRule;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

/// Rule ids derive from the response text so back-to-back inserts keep a
/// deterministic creation order for priority ties.
async fn seed_rule(server: &TestServer, keyword: Option<&str>, response: &str, priority: i64) {
    let now = chrono::Utc::now();
    server
        .state
        .db
        .insert_rule(&AutoReplyRule {
            id: format!("rule-{}", response),
            keyword: keyword.map(str::to_string),
            response: response.to_string(),
            priority,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

fn sessions_body(talker_id: i64, last_msg_ts: i64) -> serde_json::Value {
    serde_json::json!({
        "code": 0,
        "message": "0",
        "data": {
            "sessions": [
                { "talker_id": talker_id, "last_msg_ts": last_msg_ts, "unread_count": 1 }
            ]
        }
    })
}

fn history_body(messages: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "code": 0,
        "message": "0",
        "data": { "messages": messages }
    })
}

#[tokio::test]
async fn poll_cycle_replies_once_and_is_idempotent() {
    let server = TestServer::new().await;
    let account = server.seed_account("main").await;
    seed_rule(&server, Some("spam"), "rule-spam", 5).await;

    Mock::given(method("GET"))
        .and(path("/api/message/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sessions_body(9, 1_700_000_100)))
        .mount(&server.platform)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/message/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body(serde_json::json!([
            { "talker_id": 9, "msg_ts": 1_700_000_100, "from_self": false, "content": "is this spam?" }
        ]))))
        .mount(&server.platform)
        .await;

    // Exactly one reply across both cycles.
    Mock::given(method("POST"))
        .and(path("/api/message/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(0, "0")))
        .expect(1)
        .mount(&server.platform)
        .await;

    let cancel = CancellationToken::new();
    let report = server
        .state
        .engine
        .run_poll_cycle("test", &cancel)
        .await
        .unwrap();
    assert_eq!(report.accounts_polled, 1);
    assert_eq!(report.replies_sent, 1);
    assert_eq!(report.reply_failures, 0);

    let cursor = server
        .state
        .db
        .get_reply_cursor(&account.id, 9)
        .await
        .unwrap();
    assert_eq!(cursor, 1_700_000_100);

    // Second cycle with no new messages: a no-op.
    let report = server
        .state
        .engine
        .run_poll_cycle("test", &cancel)
        .await
        .unwrap();
    assert_eq!(report.replies_sent, 0);
    assert_eq!(
        server
            .state
            .db
            .get_reply_cursor(&account.id, 9)
            .await
            .unwrap(),
        1_700_000_100
    );
}

#[tokio::test]
async fn highest_priority_earliest_rule_wins_over_default() {
    let server = TestServer::new().await;
    server.seed_account("main").await;
    // Creation order matters for the tie at priority 5.
    seed_rule(&server, Some("spam"), "ruleA", 5).await;
    seed_rule(&server, Some("spam"), "ruleB", 5).await;
    seed_rule(&server, None, "ruleDefault", 0).await;

    Mock::given(method("GET"))
        .and(path("/api/message/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sessions_body(7, 1_700_000_200)))
        .mount(&server.platform)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/message/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body(serde_json::json!([
            { "talker_id": 7, "msg_ts": 1_700_000_200, "from_self": false, "content": "this is spam" }
        ]))))
        .mount(&server.platform)
        .await;

    // The earliest-created priority-5 rule, not the default.
    Mock::given(method("POST"))
        .and(path("/api/message/send"))
        .and(body_string_contains("content=ruleA"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(0, "0")))
        .expect(1)
        .mount(&server.platform)
        .await;

    let report = server
        .state
        .engine
        .run_poll_cycle("test", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.replies_sent, 1);
}

#[tokio::test]
async fn unmatched_message_gets_the_default_rule() {
    let server = TestServer::new().await;
    server.seed_account("main").await;
    seed_rule(&server, Some("refund"), "ruleRefund", 5).await;
    seed_rule(&server, None, "ruleDefault", 0).await;

    Mock::given(method("GET"))
        .and(path("/api/message/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sessions_body(3, 1_700_000_300)))
        .mount(&server.platform)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/message/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body(serde_json::json!([
            { "talker_id": 3, "msg_ts": 1_700_000_300, "from_self": false, "content": "hello" }
        ]))))
        .mount(&server.platform)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/message/send"))
        .and(body_string_contains("content=ruleDefault"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(0, "0")))
        .expect(1)
        .mount(&server.platform)
        .await;

    let report = server
        .state
        .engine
        .run_poll_cycle("test", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.replies_sent, 1);
}

#[tokio::test]
async fn own_messages_are_never_answered() {
    let server = TestServer::new().await;
    server.seed_account("main").await;
    seed_rule(&server, None, "ruleDefault", 0).await;

    Mock::given(method("GET"))
        .and(path("/api/message/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sessions_body(5, 1_700_000_400)))
        .mount(&server.platform)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/message/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body(serde_json::json!([
            { "talker_id": 5, "msg_ts": 1_700_000_400, "from_self": true, "content": "my own reply" }
        ]))))
        .mount(&server.platform)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/message/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(0, "0")))
        .expect(0)
        .mount(&server.platform)
        .await;

    let report = server
        .state
        .engine
        .run_poll_cycle("test", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.replies_sent, 0);
}

#[tokio::test]
async fn failed_send_leaves_the_cursor_for_a_retry() {
    let server = TestServer::new().await;
    let account = server.seed_account("main").await;
    seed_rule(&server, None, "ruleDefault", 0).await;

    Mock::given(method("GET"))
        .and(path("/api/message/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sessions_body(11, 1_700_000_500)))
        .mount(&server.platform)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/message/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body(serde_json::json!([
            { "talker_id": 11, "msg_ts": 1_700_000_500, "from_self": false, "content": "hello" }
        ]))))
        .mount(&server.platform)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/message/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(21046, "send failed")))
        .mount(&server.platform)
        .await;

    let report = server
        .state
        .engine
        .run_poll_cycle("test", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.replies_sent, 0);
    assert_eq!(report.reply_failures, 1);

    // Cursor untouched, so the next cycle sees the message again.
    assert_eq!(
        server
            .state
            .db
            .get_reply_cursor(&account.id, 11)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn toggle_endpoint_flips_the_standalone_loop() {
    let server = TestServer::new().await;

    // The spawned loop polls sessions; give it an empty inbox.
    Mock::given(method("GET"))
        .and(path("/api/message/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "code": 0, "message": "0", "data": { "sessions": [] }
        })))
        .mount(&server.platform)
        .await;

    let response = server
        .client
        .post(server.url("/api/autoreply/toggle"))
        .json(&serde_json::json!({ "enabled": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["enabled"], true);
    assert!(server.state.autoreply.is_enabled().await);

    let response = server
        .client
        .post(server.url("/api/autoreply/toggle"))
        .json(&serde_json::json!({ "enabled": false }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["enabled"], false);
    assert!(!server.state.autoreply.is_enabled().await);
}
