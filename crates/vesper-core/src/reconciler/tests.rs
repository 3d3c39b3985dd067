use super::*;
use crate::model::Role;
use crate::observer::{NotificationLevel, RecordingObserver};
use serde_json::json;

async fn setup() -> (JobReconciler, Arc<RecordingObserver>) {
    let recorder = Arc::new(RecordingObserver::new());
    let store = RecordStore::new();
    store
        .append_message(None, Message::placeholder("42"))
        .await
        .unwrap();
    let reconciler = JobReconciler::new(store, ObserverHandle::new(recorder.clone()));
    reconciler.register_job("42", "J1").await.unwrap();
    (reconciler, recorder)
}

async fn job_of(reconciler: &JobReconciler) -> JobDescriptor {
    reconciler.store().message("42").await.unwrap().job().unwrap()
}

#[tokio::test]
async fn test_register_sets_queued_descriptor() {
    let (reconciler, _) = setup().await;
    let message = reconciler.store().message("42").await.unwrap();

    assert!(!message.is_streaming);
    let job = message.job().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);
    assert_eq!(job.queue_position, Some(1));
    assert_eq!(job.kind, "image");
}

#[tokio::test]
async fn test_register_unknown_message() {
    let reconciler = JobReconciler::new(RecordStore::new(), ObserverHandle::noop());
    let err = reconciler.register_job("nope", "J1").await.unwrap_err();
    assert!(matches!(err, Error::MessageNotFound(_)));
}

#[tokio::test]
async fn test_register_does_not_regress_pushed_status() {
    let store = RecordStore::new();
    store
        .append_message(None, Message::placeholder("42"))
        .await
        .unwrap();
    let reconciler = JobReconciler::new(store, ObserverHandle::noop());

    // Push frame names the message before the stream registers the job
    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Processing)
                .with_message("42")
                .with_progress(30),
            UpdateSource::Push,
        )
        .await;
    assert!(outcome.is_applied());

    assert!(!reconciler.register_job("42", "J1").await.unwrap());
    assert_eq!(job_of(&reconciler).await.status, JobStatus::Processing);
    assert_eq!(job_of(&reconciler).await.progress, 30);
}

#[tokio::test]
async fn test_job_lifecycle_scenario() {
    let (reconciler, recorder) = setup().await;

    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Processing).with_progress(40),
            UpdateSource::Push,
        )
        .await;
    assert!(outcome.is_applied());
    assert_eq!(job_of(&reconciler).await.progress, 40);

    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Queued).with_progress(10),
            UpdateSource::Push,
        )
        .await;
    assert_eq!(
        outcome,
        ApplyOutcome::Dropped(DropReason::OutOfOrder {
            current: JobStatus::Processing,
            incoming: JobStatus::Queued
        })
    );
    assert_eq!(job_of(&reconciler).await.progress, 40);

    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Complete).with_image_url("/x.png"),
            UpdateSource::Push,
        )
        .await;
    assert!(outcome.is_applied());

    let outcome = reconciler
        .apply_update(&JobUpdate::new("J1", JobStatus::Error), UpdateSource::Push)
        .await;
    assert_eq!(
        outcome,
        ApplyOutcome::Dropped(DropReason::Terminal(JobStatus::Complete))
    );

    let message = reconciler.store().message("42").await.unwrap();
    let job = message.job().unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.image_url.as_deref(), Some("/x.png"));
    assert_eq!(job.progress, 100);
    assert!(message.content.contains("/x.png"));

    let notifications = recorder.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].level, NotificationLevel::Success);
}

#[tokio::test]
async fn test_duplicate_complete_is_idempotent() {
    let (reconciler, recorder) = setup().await;
    let update = JobUpdate::new("J1", JobStatus::Complete).with_image_url("/a.png");

    reconciler.apply_update(&update, UpdateSource::Push).await;
    let once = reconciler.store().message("42").await.unwrap();

    let second = reconciler.apply_update(&update, UpdateSource::Poll).await;
    let twice = reconciler.store().message("42").await.unwrap();

    assert!(!second.is_applied());
    assert_eq!(once, twice);
    assert_eq!(recorder.notifications().len(), 1);
}

#[tokio::test]
async fn test_monotonic_sequence() {
    let (reconciler, _) = setup().await;

    for status in [
        JobStatus::Processing,
        JobStatus::Queued,
        JobStatus::Complete,
        JobStatus::Error,
    ] {
        reconciler
            .apply_update(&JobUpdate::new("J1", status), UpdateSource::Push)
            .await;
    }

    assert_eq!(job_of(&reconciler).await.status, JobStatus::Complete);
}

#[tokio::test]
async fn test_error_is_write_once() {
    let (reconciler, recorder) = setup().await;

    reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Error).with_error("GPU out of memory"),
            UpdateSource::Push,
        )
        .await;
    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Complete).with_image_url("/late.png"),
            UpdateSource::Poll,
        )
        .await;

    assert_eq!(
        outcome,
        ApplyOutcome::Dropped(DropReason::Terminal(JobStatus::Error))
    );
    let message = reconciler.store().message("42").await.unwrap();
    let job = message.job().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error.as_deref(), Some("GPU out of memory"));
    assert!(job.image_url.is_none());
    assert!(message.content.contains("GPU out of memory"));
    assert_eq!(recorder.notifications()[0].level, NotificationLevel::Error);
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let (reconciler, _) = setup().await;

    for progress in [20, 60, 35] {
        reconciler
            .apply_update(
                &JobUpdate::new("J1", JobStatus::Processing).with_progress(progress),
                UpdateSource::Push,
            )
            .await;
    }

    assert_eq!(job_of(&reconciler).await.progress, 60);
}

#[tokio::test]
async fn test_unknown_job_is_dropped() {
    let (reconciler, recorder) = setup().await;

    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J-unknown", JobStatus::Complete),
            UpdateSource::Push,
        )
        .await;

    assert_eq!(outcome, ApplyOutcome::Dropped(DropReason::NotFound));
    assert!(recorder.notifications().is_empty());
}

#[tokio::test]
async fn test_message_id_establishes_association() {
    let store = RecordStore::new();
    store
        .append_message(None, Message::new("m7", Role::Assistant, ""))
        .await
        .unwrap();
    let reconciler = JobReconciler::new(store, ObserverHandle::noop());

    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J9", JobStatus::Processing).with_message("m7"),
            UpdateSource::Push,
        )
        .await;

    assert!(outcome.is_applied());
    assert_eq!(reconciler.job_status("J9").await, Some(JobStatus::Processing));
}

#[tokio::test]
async fn test_message_with_other_job_is_not_overwritten() {
    let (reconciler, _) = setup().await;

    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J2", JobStatus::Processing).with_message("42"),
            UpdateSource::Push,
        )
        .await;

    assert_eq!(
        outcome,
        ApplyOutcome::Dropped(DropReason::JobMismatch {
            current: "J1".to_string()
        })
    );
}

#[tokio::test]
async fn test_merge_preserves_foreign_metadata() {
    let (reconciler, _) = setup().await;
    reconciler
        .store()
        .update_message("42", |m| {
            m.extra_metadata
                .insert("style".to_string(), json!("watercolor"));
        })
        .await
        .unwrap();

    reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Processing)
                .with_progress(50)
                .with_queue_position(0),
            UpdateSource::Poll,
        )
        .await;

    let message = reconciler.store().message("42").await.unwrap();
    assert_eq!(message.extra_metadata["style"], json!("watercolor"));
    assert_eq!(message.extra_metadata["queue_position"], json!(0));
}

#[tokio::test]
async fn test_concurrent_updates_settle_on_highest_rank() {
    let (reconciler, _) = setup().await;
    let reconciler = Arc::new(reconciler);

    let updates = vec![
        JobUpdate::new("J1", JobStatus::Complete).with_image_url("/done.png"),
        JobUpdate::new("J1", JobStatus::Queued),
        JobUpdate::new("J1", JobStatus::Processing).with_progress(80),
        JobUpdate::new("J1", JobStatus::Processing).with_progress(20),
        JobUpdate::new("J1", JobStatus::Complete).with_image_url("/done.png"),
    ];

    let handles: Vec<_> = updates
        .into_iter()
        .enumerate()
        .map(|(i, update)| {
            let r = reconciler.clone();
            let source = if i % 2 == 0 {
                UpdateSource::Push
            } else {
                UpdateSource::Poll
            };
            tokio::spawn(async move { r.apply_update(&update, source).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let job = job_of(&reconciler).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.image_url.as_deref(), Some("/done.png"));
}

#[tokio::test]
async fn test_listen_applies_broadcast_updates() {
    let (reconciler, _) = setup().await;
    let reconciler = Arc::new(reconciler);
    let (tx, rx) = broadcast::channel(8);

    let handle = reconciler.clone().listen(rx);
    tx.send(JobUpdate::new("J1", JobStatus::Processing).with_progress(10))
        .unwrap();
    tx.send(JobUpdate::new("J1", JobStatus::Complete).with_image_url("/p.png"))
        .unwrap();
    drop(tx);
    handle.await.unwrap();

    assert_eq!(reconciler.job_status("J1").await, Some(JobStatus::Complete));
}

#[tokio::test]
async fn test_reloaded_terminal_jobs_stay_terminal() {
    let store = RecordStore::new();
    let reloaded: Vec<Message> = serde_json::from_value(json!([
        {
            "id": "42",
            "role": "assistant",
            "content": "![Generated image](/a.png)",
            "extra_metadata": {"type": "image", "job_id": "J1", "status": "complete", "progress": 100.0}
        },
        {
            "id": "43",
            "role": "assistant",
            "content": "",
            "extra_metadata": {"job_id": "J2", "status": "error"}
        },
        {
            "id": "44",
            "role": "assistant",
            "content": "",
            "extra_metadata": {"job_id": "J3", "status": "complete", "progress": "done"}
        }
    ]))
    .unwrap();
    store.replace_messages("c1", reloaded).await;
    let reconciler = JobReconciler::new(store, ObserverHandle::noop());

    for (job, status, expected) in [
        ("J1", JobStatus::Processing, JobStatus::Complete),
        ("J2", JobStatus::Queued, JobStatus::Error),
        ("J3", JobStatus::Error, JobStatus::Complete),
    ] {
        let outcome = reconciler
            .apply_update(&JobUpdate::new(job, status), UpdateSource::Poll)
            .await;
        assert_eq!(
            outcome,
            ApplyOutcome::Dropped(DropReason::Terminal(expected)),
            "{} was overwritten",
            job
        );
        assert_eq!(reconciler.job_status(job).await, Some(expected));
    }

    let job = reconciler.store().message("42").await.unwrap().job().unwrap();
    assert_eq!(job.progress, 100);
    assert_eq!(job.kind, "image");
}

#[tokio::test]
async fn test_unparseable_descriptor_still_ranks() {
    let store = RecordStore::new();
    let mut message = Message::new("42", Role::Assistant, "");
    message.extra_metadata.insert("job_id".to_string(), json!("J1"));
    message.extra_metadata.insert("status".to_string(), json!("processing"));
    message.extra_metadata.insert("progress".to_string(), json!("half"));
    store.append_message(None, message).await.unwrap();
    let reconciler = JobReconciler::new(store, ObserverHandle::noop());

    let outcome = reconciler
        .apply_update(&JobUpdate::new("J1", JobStatus::Queued), UpdateSource::Push)
        .await;
    assert!(matches!(
        outcome,
        ApplyOutcome::Dropped(DropReason::OutOfOrder { .. })
    ));

    let outcome = reconciler
        .apply_update(
            &JobUpdate::new("J1", JobStatus::Complete).with_image_url("/x.png"),
            UpdateSource::Push,
        )
        .await;
    assert!(outcome.is_applied());
    assert_eq!(reconciler.job_status("J1").await, Some(JobStatus::Complete));
}
