use super::*;
use crate::config::{AnalyticsConfig, DEFAULT_FLUSH_INTERVAL_SECS};
use crate::transport::{ScriptedReply, ScriptedTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vesper_core::observer::{FaultReport, Notification, ObserverHandle};

fn create_test_config(enabled: bool, batch_size: usize) -> AnalyticsConfig {
    AnalyticsConfig {
        enabled,
        endpoint_url: Some("https://events.example.com/batch".to_string()),
        batch_size,
        ..Default::default()
    }
}

fn event(n: u64) -> AnalyticsEvent {
    AnalyticsEvent::SendCompleted {
        duration_ms: n,
        success: true,
    }
}

#[test]
fn test_record_shape() {
    let record = AnalyticsRecord {
        timestamp: chrono::Utc::now(),
        session_id: "s1".to_string(),
        event: event(12),
    };
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["type"], "send_completed");
    assert_eq!(value["duration_ms"], 12);
    assert_eq!(value["session_id"], "s1");
}

#[tokio::test]
async fn test_disabled_does_not_queue() {
    let transport = ScriptedTransport::new();
    let analytics = Analytics::new(create_test_config(false, 1), Arc::new(transport.clone()));

    analytics.track(event(1)).await;

    assert_eq!(analytics.queued().await, 0);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_flushes_when_batch_full() {
    let transport = ScriptedTransport::new();
    transport.push(ScriptedReply::status(204, ""));
    let analytics = Analytics::new(create_test_config(true, 3), Arc::new(transport.clone()));

    analytics.track(event(1)).await;
    analytics.track(event(2)).await;
    assert_eq!(transport.call_count(), 0);
    analytics.track(event(3)).await;

    assert_eq!(transport.call_count(), 1);
    assert_eq!(analytics.queued().await, 0);
    let request = &transport.requests()[0];
    assert_eq!(request.path, "https://events.example.com/batch");
    let body = request.body.clone().unwrap();
    assert_eq!(body.as_array().map(Vec::len), Some(3));
    assert_eq!(body[2]["duration_ms"], 3);
}

#[tokio::test]
async fn test_failed_flush_requeues_in_order() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(503, ""))
        .push(ScriptedReply::status(200, "{}"));
    let analytics = Analytics::new(create_test_config(true, 2), Arc::new(transport.clone()));

    analytics.track(event(1)).await;
    analytics.track(event(2)).await;
    assert_eq!(analytics.queued().await, 2);

    analytics.track(event(3)).await;

    assert_eq!(transport.call_count(), 2);
    assert_eq!(analytics.queued().await, 0);
    let body = transport.requests()[1].body.clone().unwrap();
    let sent: Vec<u64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["duration_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(sent, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_queue_is_bounded() {
    let transport = ScriptedTransport::new();
    let config = AnalyticsConfig {
        endpoint_url: None,
        ..create_test_config(true, usize::MAX)
    };
    let analytics = Analytics::new(config, Arc::new(transport));

    for n in 0..(MAX_QUEUE_SIZE as u64 + 5) {
        analytics.track(event(n)).await;
    }

    assert_eq!(analytics.queued().await, MAX_QUEUE_SIZE);
}

#[tokio::test]
async fn test_no_endpoint_drops_batch() {
    let transport = ScriptedTransport::new();
    let config = AnalyticsConfig {
        endpoint_url: None,
        ..create_test_config(true, 10)
    };
    let analytics = Analytics::new(config, Arc::new(transport.clone()));

    analytics.track(event(1)).await;
    analytics.flush().await;

    assert_eq!(analytics.queued().await, 0);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_disabling_clears_queue() {
    let analytics = Analytics::new(
        create_test_config(true, 10),
        Arc::new(ScriptedTransport::new()),
    );
    analytics.track(event(1)).await;
    analytics.set_enabled(false).await;
    assert_eq!(analytics.queued().await, 0);
    assert!(!analytics.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_timer_flush_and_shutdown_flush() {
    let transport = ScriptedTransport::new();
    transport
        .push(ScriptedReply::status(200, "{}"))
        .push(ScriptedReply::status(200, "{}"));
    let analytics = Arc::new(Analytics::new(
        create_test_config(true, 100),
        Arc::new(transport.clone()),
    ));
    let cancel = CancellationToken::new();
    let flusher = analytics.spawn_flusher(cancel.clone());

    analytics.track(event(1)).await;
    tokio::time::sleep(Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS - 1)).await;
    assert_eq!(transport.call_count(), 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.call_count(), 1);

    analytics.track(event(2)).await;
    cancel.cancel();
    flusher.await.unwrap();
    assert_eq!(transport.call_count(), 2);
    assert_eq!(analytics.queued().await, 0);
}

#[tokio::test]
async fn test_observer_feeds_sink() {
    let transport = ScriptedTransport::new();
    let analytics = Arc::new(Analytics::new(
        create_test_config(true, 100),
        Arc::new(transport),
    ));
    let (observer, task) = AnalyticsObserver::spawn(analytics.clone());
    let handle = ObserverHandle::new(Arc::new(observer));

    handle.report_fault(FaultReport {
        error: "boom".to_string(),
        category: "transient-network".to_string(),
        endpoint: "/api/chat".to_string(),
        method: "POST".to_string(),
        status_code: Some(503),
    });
    handle.notify(Notification::success("Image ready").with_job("J1"));
    drop(handle);
    task.await.unwrap();

    assert_eq!(analytics.queued().await, 2);
    let value = json!({"type": "notification_shown", "level": "success", "title": "Image ready", "job_id": "J1"});
    let parsed: AnalyticsEvent = serde_json::from_value(value).unwrap();
    assert!(matches!(parsed, AnalyticsEvent::NotificationShown { .. }));
}
