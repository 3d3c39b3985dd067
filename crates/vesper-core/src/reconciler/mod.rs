//! Job progress reconciler
//!
//! Owns the job state machine. Push frames, the polling fallback and the
//! streaming session's own registration all funnel through
//! [`JobReconciler::apply_update`], whose guards make duplicate and stale
//! updates no-ops:
//!
//! - terminal statuses (`complete`, `error`) are write-once
//! - an update whose status ranks below the current one is dropped
//! - progress never decreases while the job is running

mod types;

pub use types::{ApplyOutcome, DropReason, JobUpdate, UpdateSource};

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{JobDescriptor, JobStatus, Message};
use crate::observer::{Breadcrumb, Notification, ObserverHandle};
use crate::store::{MessageLocator, RecordStore};

/// Fallback text when a finished job has no result location
const COMPLETE_WITHOUT_URL: &str = "Image generated.";

/// Fallback failure reason
const DEFAULT_JOB_ERROR: &str = "Image generation failed";

/// Merges job progress into the record store
#[derive(Debug, Clone)]
pub struct JobReconciler {
    store: RecordStore,
    observer: ObserverHandle,
}

impl JobReconciler {
    /// Create a reconciler writing into `store`
    #[must_use]
    pub fn new(store: RecordStore, observer: ObserverHandle) -> Self {
        Self { store, observer }
    }

    /// The store this reconciler writes into
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Current status of a job, if a message carries it
    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.store
            .find_by_job(job_id)
            .await
            .and_then(|m| m.job_status())
    }

    /// Associate a job with a message as `queued`.
    ///
    /// If the message already carries this job (a push frame got there
    /// first) its status is left alone. Returns whether a new association
    /// was written.
    pub async fn register_job(&self, message_id: &str, job_id: &str) -> Result<bool> {
        let (_, registered) = self
            .store
            .modify(&[MessageLocator::Id(message_id)], |message| {
                message.is_streaming = false;
                match message.job_id() {
                    Some(existing) if existing == job_id => false,
                    Some(existing) => {
                        warn!(
                            message_id = %message.id,
                            existing_job = %existing,
                            job_id = %job_id,
                            "Message already carries another job, keeping it"
                        );
                        false
                    }
                    None => {
                        message.write_job(&JobDescriptor::queued_image(job_id));
                        true
                    }
                }
            })
            .await
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;

        if registered {
            info!(message_id = %message_id, job_id = %job_id, "Registered image job");
            self.observer.breadcrumb(Breadcrumb::new(
                "job",
                format!("registered job {} on message {}", job_id, message_id),
            ));
        }
        Ok(registered)
    }

    /// Merge one status update.
    ///
    /// Never fails: unknown jobs and stale or duplicate updates are logged
    /// and reported as [`ApplyOutcome::Dropped`].
    pub async fn apply_update(&self, update: &JobUpdate, source: UpdateSource) -> ApplyOutcome {
        let mut locators = Vec::with_capacity(2);
        if let Some(message_id) = update.message_id.as_deref() {
            locators.push(MessageLocator::Id(message_id));
        }
        locators.push(MessageLocator::Job(&update.job_id));

        let outcome = self
            .store
            .modify(&locators, |message| merge(message, update))
            .await
            .map(|(_, outcome)| outcome)
            .unwrap_or(ApplyOutcome::Dropped(DropReason::NotFound));

        self.after_apply(update, source, &outcome);
        outcome
    }

    fn after_apply(&self, update: &JobUpdate, source: UpdateSource, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied { message_id, status } => {
                debug!(
                    job_id = %update.job_id,
                    message_id = %message_id,
                    status = %status,
                    progress = update.progress,
                    source = %source,
                    "Applied job update"
                );
                self.observer.breadcrumb(Breadcrumb::new(
                    "job",
                    format!("{} {} via {}", update.job_id, status, source),
                ));
                match status {
                    JobStatus::Complete => self.observer.notify(
                        Notification::success("Image ready").with_job(update.job_id.clone()),
                    ),
                    JobStatus::Error => {
                        let reason = update.error.as_deref().unwrap_or(DEFAULT_JOB_ERROR);
                        self.observer.notify(
                            Notification::error("Image generation failed")
                                .with_body(reason)
                                .with_job(update.job_id.clone()),
                        );
                    }
                    JobStatus::Queued | JobStatus::Processing => {}
                }
            }
            ApplyOutcome::Dropped(DropReason::NotFound) => {
                debug!(
                    job_id = %update.job_id,
                    message_id = update.message_id.as_deref(),
                    source = %source,
                    "No message for job update yet, dropping"
                );
            }
            ApplyOutcome::Dropped(reason) => {
                debug!(
                    job_id = %update.job_id,
                    status = %update.status,
                    source = %source,
                    reason = %reason,
                    "Ignoring job update"
                );
            }
        }
    }

    /// Apply every update received on `updates` until the channel closes
    pub fn listen(self: Arc<Self>, mut updates: broadcast::Receiver<JobUpdate>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        self.apply_update(&update, UpdateSource::Push).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Job update listener lagged, polling will catch up");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Job update channel closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Guarded merge of one update into one message.
///
/// The guards read `job_id` and `status` on their own so a descriptor that
/// does not parse as a whole still cannot be regressed.
fn merge(message: &mut Message, update: &JobUpdate) -> ApplyOutcome {
    if let Some(current) = message.job_id() {
        if current != update.job_id {
            return ApplyOutcome::Dropped(DropReason::JobMismatch {
                current: current.to_string(),
            });
        }
    }
    if let Some(status) = message.job_status() {
        if status.is_terminal() {
            return ApplyOutcome::Dropped(DropReason::Terminal(status));
        }
        if update.status.rank() < status.rank() {
            return ApplyOutcome::Dropped(DropReason::OutOfOrder {
                current: status,
                incoming: update.status,
            });
        }
    }

    let current = message.job();
    let mut job = current.unwrap_or_else(|| JobDescriptor::queued_image(update.job_id.clone()));
    job.status = update.status;
    if let Some(progress) = update.progress {
        job.progress = job.progress.max(progress.min(100));
    }
    if let Some(position) = update.queue_position {
        job.queue_position = Some(position);
    }

    match update.status {
        JobStatus::Complete => {
            job.progress = 100;
            if update.image_url.is_some() {
                job.image_url = update.image_url.clone();
            }
            let marker = match &job.image_url {
                Some(url) => format!("![Generated image]({})", url),
                None => COMPLETE_WITHOUT_URL.to_string(),
            };
            set_or_append(&mut message.content, &marker);
        }
        JobStatus::Error => {
            let reason = update
                .error
                .clone()
                .unwrap_or_else(|| DEFAULT_JOB_ERROR.to_string());
            set_or_append(
                &mut message.content,
                &format!("⚠️ Image generation failed: {}", reason),
            );
            job.error = Some(reason);
        }
        JobStatus::Queued | JobStatus::Processing => {}
    }

    message.write_job(&job);
    message.is_streaming = false;

    ApplyOutcome::Applied {
        message_id: message.id.clone(),
        status: job.status,
    }
}

fn set_or_append(content: &mut String, text: &str) {
    if content.contains(text) {
        return;
    }
    if content.trim().is_empty() {
        *content = text.to_string();
    } else {
        content.push_str("\n\n");
        content.push_str(text);
    }
}

#[cfg(test)]
mod tests;
