use super::*;
use crate::transport::{ScriptedReply, ScriptedTransport};
use serde::Deserialize;
use serde_json::json;
use vesper_core::observer::RecordingObserver;

fn setup(transport: &ScriptedTransport) -> (Executor, Arc<RecordingObserver>) {
    let recorder = Arc::new(RecordingObserver::new());
    let executor = Executor::new(
        Arc::new(transport.clone()),
        ObserverHandle::new(recorder.clone()),
    )
    .with_policy(
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_timeout(Duration::from_secs(2))
            .with_backoff_base(Duration::from_millis(500)),
    );
    (executor, recorder)
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_against_failing_server() {
    let transport = ScriptedTransport::new();
    for _ in 0..5 {
        transport.push(ScriptedReply::status(500, "boom"));
    }
    let (executor, recorder) = setup(&transport);

    let err = executor
        .execute(HttpRequest::get("/api/jobs/J1"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Server {
            status: 500,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(transport.call_count(), 3);

    let times = transport.call_times();
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert_eq!(first_gap, Duration::from_millis(500));
    assert_eq!(second_gap, Duration::from_millis(1000));
    assert!(second_gap > first_gap);

    let faults = recorder.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].status_code, Some(500));
    assert_eq!(faults[0].endpoint, "/api/jobs/J1");
    assert_eq!(faults[0].method, "GET");
    assert_eq!(faults[0].category, "transient-network");
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failure() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(503, ""))
        .push(ScriptedReply::json(&json!({"status": "queued"})));
    let (executor, recorder) = setup(&transport);

    let value = executor
        .execute(HttpRequest::get("/api/jobs/J1"))
        .await
        .unwrap();

    assert_eq!(value["status"], "queued");
    assert_eq!(transport.call_count(), 2);
    assert!(recorder.faults().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_is_retried() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(429, ""))
        .push(ScriptedReply::status(429, ""))
        .push(ScriptedReply::json(&json!({"ok": true})));
    let (executor, _) = setup(&transport);

    let value = executor.execute(HttpRequest::get("/x")).await.unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_exhausted() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push(ScriptedReply::status(429, ""));
    }
    let (executor, _) = setup(&transport);

    let err = executor.execute(HttpRequest::get("/x")).await.unwrap_err();
    assert!(matches!(err, Error::RateLimited { attempts: 3, .. }));
    assert_eq!(err.status_code(), Some(429));
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_is_never_retried() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(401, r#"{"detail":"token expired"}"#))
        .push(ScriptedReply::json(&json!({})))
        .push(ScriptedReply::json(&json!({})));
    let (executor, recorder) = setup(&transport);

    let err = executor
        .execute(HttpRequest::post("/api/chat", json!({"message": "Hi"})))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Unauthorized { .. }));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(transport.remaining(), 2);
    assert_eq!(recorder.faults()[0].category, "permanent-auth");
    assert_eq!(recorder.faults()[0].status_code, Some(401));
}

#[tokio::test(start_paused = true)]
async fn test_client_error_carries_detail() {
    let transport = ScriptedTransport::new();
    transport.push(ScriptedReply::status(
        404,
        r#"{"detail":"Conversation not found"}"#,
    ));
    let (executor, _) = setup(&transport);

    let err = executor
        .execute(HttpRequest::get("/api/conversations/c9/messages"))
        .await
        .unwrap_err();

    match err {
        Error::Api {
            endpoint,
            method,
            status,
            message,
        } => {
            assert_eq!(endpoint, "/api/conversations/c9/messages");
            assert_eq!(method, "GET");
            assert_eq!(status, 404);
            assert_eq!(message, "Conversation not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_body_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(200, "  \n"))
        .push(ScriptedReply::json(&json!({})));
    let (executor, _) = setup(&transport);

    let err = executor.execute(HttpRequest::get("/x")).await.unwrap_err();
    assert!(matches!(err, Error::EmptyResponse { .. }));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_body_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(200, "<html>oops</html>"))
        .push(ScriptedReply::json(&json!({})));
    let (executor, recorder) = setup(&transport);

    let err = executor.execute(HttpRequest::get("/x")).await.unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { .. }));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(recorder.faults()[0].category, "malformed-response");
}

#[tokio::test(start_paused = true)]
async fn test_timeout_exhausts_attempts() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push(ScriptedReply::Hang);
    }
    let (executor, _) = setup(&transport);
    let started = tokio::time::Instant::now();

    let err = executor.execute(HttpRequest::get("/slow")).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Timeout {
            timeout_ms: 2000,
            attempts: 3,
            ..
        }
    ));
    // three 2s timeouts plus 500ms and 1s of backoff
    assert_eq!(started.elapsed(), Duration::from_millis(7500));
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_is_retried() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::Fail("connection refused".to_string()))
        .push(ScriptedReply::json(&json!({"ok": 1})));
    let (executor, _) = setup(&transport);

    let value = executor.execute(HttpRequest::get("/x")).await.unwrap();
    assert_eq!(value["ok"], 1);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_breadcrumbs_bracket_each_attempt() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(502, ""))
        .push(ScriptedReply::json(&json!({})));
    let (executor, recorder) = setup(&transport);

    executor
        .execute(HttpRequest::post("/api/jobs/J1/cancel", json!({})))
        .await
        .unwrap();

    let crumbs = recorder.breadcrumbs();
    assert_eq!(crumbs.len(), 4);
    assert!(crumbs.iter().all(|c| c.category == "http"));
    assert!(crumbs
        .iter()
        .all(|c| c.method.as_deref() == Some("POST")
            && c.path.as_deref() == Some("/api/jobs/J1/cancel")));
    assert_eq!(crumbs[1].status, Some(502));
    assert_eq!(crumbs[1].attempt, Some(1));
    assert_eq!(crumbs[3].status, Some(200));
    assert_eq!(crumbs[3].attempt, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_execute_json_deserializes() {
    #[derive(Debug, Deserialize)]
    struct Cancel {
        success: bool,
    }

    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::json(&json!({"success": true, "message": "ok"})))
        .push(ScriptedReply::json(&json!({"unexpected": 1})));
    let (executor, _) = setup(&transport);

    let cancel: Cancel = executor
        .execute_json(HttpRequest::post("/c", json!({})))
        .await
        .unwrap();
    assert!(cancel.success);

    let err = executor
        .execute_json::<Cancel>(HttpRequest::post("/c", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_open_stream_makes_a_single_attempt() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(500, ""))
        .push(ScriptedReply::chunks(["{}\n"]));
    let (executor, recorder) = setup(&transport);

    let err = executor
        .open_stream(
            HttpRequest::post("/api/chat", json!({})),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Server { attempts: 1, .. }));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(recorder.faults().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_stream_returns_unread_body() {
    let transport = ScriptedTransport::new();
    transport.push(
        ScriptedReply::chunks(["{\"type\":\"chunk\",", "\"content\":\"Hi\"}\n"])
            .with_header("X-Conversation-Id", "c1"),
    );
    let (executor, _) = setup(&transport);

    let response = executor
        .open_stream(
            HttpRequest::post("/api/chat", json!({})),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(response.header("x-conversation-id"), Some("c1"));
    let body = response.bytes().await.unwrap();
    assert_eq!(body, Bytes::from("{\"type\":\"chunk\",\"content\":\"Hi\"}\n"));
}

#[tokio::test(start_paused = true)]
async fn test_open_stream_head_timeout() {
    let transport = ScriptedTransport::new();
    transport.push(ScriptedReply::Hang);
    let (executor, _) = setup(&transport);

    let err = executor
        .open_stream(HttpRequest::post("/api/chat", json!({})), Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { attempts: 1, .. }));
}

#[test]
fn test_error_message_extraction() {
    assert_eq!(
        error_message(br#"{"detail":"bad persona"}"#).as_deref(),
        Some("bad persona")
    );
    assert_eq!(
        error_message(br#"{"error":{"message":"quota"}}"#).as_deref(),
        Some("quota")
    );
    assert_eq!(
        error_message(br#"{"message":"nope"}"#).as_deref(),
        Some("nope")
    );
    assert_eq!(error_message(b"plain text").as_deref(), Some("plain text"));
    assert_eq!(error_message(b""), None);
}
