//! CLI command: `vesper watch`
//!
//! Connects the push channel, feeds job frames to the reconciler and prints
//! every notification until Ctrl+C.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use vesper_client::{ConnectionState, PushChannel, PushEvent};
use vesper_core::observer::ObserverResult;
use vesper_core::{Notification, NotificationLevel, Observer};

use super::Session;

/// Run the watch subcommand.
pub async fn run() -> Result<()> {
    let session = Session::connect_with(Some(Arc::new(PrintingObserver)))?;
    let Some(url) = session.config.push.url.clone() else {
        session.finish().await;
        bail!("No push channel configured. Set push.url or VESPER_PUSH__URL.");
    };

    let push = PushChannel::new(
        session.config.push.clone(),
        session.config.server.api_token.clone(),
    );
    let handles = session.client.attach_push(&push);
    let progress = spawn_progress_printer(&push);
    let mut state = push.state();

    push.start().await.context("Failed to start push channel")?;
    println!("  watching {} (Ctrl+C to stop)", url);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => println!("  connected"),
                    ConnectionState::Reconnecting { attempt } => {
                        println!("  connection lost, reconnecting (attempt {})", attempt)
                    }
                    ConnectionState::Closed => {
                        println!("  push channel closed");
                        break;
                    }
                    ConnectionState::Idle | ConnectionState::Connecting => {}
                }
            }
        }
    }

    push.shutdown().await;
    progress.abort();
    for handle in handles {
        handle.abort();
    }
    session.finish().await;
    Ok(())
}

/// Prints every notification the client reports
struct PrintingObserver;

impl Observer for PrintingObserver {
    fn notify(&self, notification: &Notification) -> ObserverResult {
        println!("  {}", format_notification(notification));
        Ok(())
    }
}

fn format_notification(notification: &Notification) -> String {
    let level = match notification.level {
        NotificationLevel::Success => "ok",
        NotificationLevel::Info => "info",
        NotificationLevel::Error => "error",
    };
    let mut line = format!("[{}] {}", level, notification.title);
    if let Some(body) = &notification.body {
        line.push_str(": ");
        line.push_str(body);
    }
    if let Some(job) = &notification.job_id {
        line.push_str(&format!(" (job {})", job));
    }
    line
}

fn spawn_progress_printer(push: &PushChannel) -> JoinHandle<()> {
    let mut events = push.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PushEvent::JobProgress(update)) => {
                    let progress = update
                        .progress
                        .map(|p| format!(" {}%", p))
                        .unwrap_or_default();
                    println!("  job {} {}{}", update.job_id, update.status.as_str(), progress);
                }
                Ok(PushEvent::Notification(_)) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}
