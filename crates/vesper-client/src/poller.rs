//! Polling fallback for job status
//!
//! While a job is not terminal, its status is fetched on a fixed interval
//! and funnelled through the same [`JobReconciler::apply_update`] path as
//! push frames, so polling can never violate the ordering guards. A watch
//! ends when the job reaches a terminal status (from any source) or its
//! message disappears from the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use vesper_core::reconciler::{JobReconciler, UpdateSource};

use crate::api::JobStatusSource;

type Watches = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Per-job polling tasks
pub struct JobPoller {
    source: Arc<dyn JobStatusSource>,
    reconciler: Arc<JobReconciler>,
    interval: Duration,
    watches: Watches,
}

impl std::fmt::Debug for JobPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPoller")
            .field("interval", &self.interval)
            .field("watching", &self.watching())
            .finish_non_exhaustive()
    }
}

impl JobPoller {
    /// Create a poller
    #[must_use]
    pub fn new(
        source: Arc<dyn JobStatusSource>,
        reconciler: Arc<JobReconciler>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            reconciler,
            interval,
            watches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start polling a job; a no-op if it is already watched
    pub fn watch(&self, job_id: &str) {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        if watches.get(job_id).is_some_and(|h| !h.is_finished()) {
            return;
        }

        debug!(job_id = %job_id, interval_secs = self.interval.as_secs(), "Polling job");
        let handle = tokio::spawn(poll_job(
            self.source.clone(),
            self.reconciler.clone(),
            job_id.to_string(),
            self.interval,
            self.watches.clone(),
        ));
        watches.insert(job_id.to_string(), handle);
    }

    /// Stop polling a job. Returns whether a watch was running
    pub fn stop(&self, job_id: &str) -> bool {
        let handle = self
            .watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        match handle {
            Some(handle) => {
                handle.abort();
                debug!(job_id = %job_id, "Stopped polling job");
                true
            }
            None => false,
        }
    }

    /// Whether a job is being polled
    #[must_use]
    pub fn is_watching(&self, job_id: &str) -> bool {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Ids of the jobs being polled
    #[must_use]
    pub fn watching(&self) -> Vec<String> {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Stop every watch
    pub fn shutdown(&self) {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in watches.drain() {
            handle.abort();
        }
    }
}

impl Drop for JobPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn poll_job(
    source: Arc<dyn JobStatusSource>,
    reconciler: Arc<JobReconciler>,
    job_id: String,
    period: Duration,
    watches: Watches,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the first poll waits one period
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match reconciler.job_status(&job_id).await {
            None => {
                debug!(job_id = %job_id, "Job message gone, stopping poll");
                break;
            }
            Some(status) if status.is_terminal() => {
                debug!(job_id = %job_id, status = %status, "Job settled, stopping poll");
                break;
            }
            Some(_) => {}
        }

        match source.job_status(&job_id).await {
            Ok(report) => {
                let terminal = report.status.is_terminal();
                reconciler
                    .apply_update(&report.into_update(), UpdateSource::Poll)
                    .await;
                if terminal {
                    break;
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job status poll failed");
            }
        }
    }

    watches
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&job_id);
}
