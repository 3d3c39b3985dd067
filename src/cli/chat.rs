//! CLI command: `vesper chat`
//!
//! Sends one message, prints the settled reply and, when the reply started
//! an image job, follows the job until it settles or Ctrl+C is pressed.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use vesper_client::{AnalyticsEvent, Attachment, SendOptions, SendOutcome};
use vesper_core::{Message, Role};

use super::Session;

/// Run the chat subcommand.
pub async fn run(
    text: &str,
    conversation: Option<String>,
    persona: Option<String>,
    images: &[PathBuf],
) -> Result<()> {
    let session = Session::connect()?;

    let mut options = SendOptions::new();
    if let Some(id) = conversation {
        options = options.in_conversation(id);
    }
    if let Some(persona) = persona {
        options = options.with_persona(persona);
    }
    for path in images {
        options = options.with_attachment(read_attachment(path).await?);
    }

    let result = session.client.send(text, options).await;
    if let Some(analytics) = &session.analytics {
        let (duration_ms, success) = match &result {
            Ok(outcome) => (outcome.duration.as_millis() as u64, true),
            Err(_) => (0, false),
        };
        analytics
            .track(AnalyticsEvent::SendCompleted { duration_ms, success })
            .await;
    }

    if let Ok(outcome) = &result {
        print_reply(&session, outcome).await;
        if let Some(job_id) = &outcome.job_id {
            follow_job(&session, job_id).await;
        }
    }

    session.finish().await;
    result.map(|_| ()).map_err(|e| {
        let message = e.user_message();
        anyhow::Error::new(e).context(message)
    })
}

async fn read_attachment(path: &Path) -> Result<Attachment> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    Ok(Attachment::new(filename, mime_type(path), data))
}

fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn print_reply(session: &Session, outcome: &SendOutcome) {
    let store = session.client.store();
    let reply = match &outcome.assistant_message_id {
        Some(id) => store.message(id).await,
        None => last_assistant(store.messages(outcome.conversation_id.as_deref()).await),
    };

    println!();
    match reply {
        Some(message) if !message.content.trim().is_empty() => println!("{}", message.content),
        _ => println!("  (no reply text)"),
    }
    println!();
    if let Some(id) = &outcome.conversation_id {
        println!("  conversation: {}", id);
    }
    println!("  took {:.1}s", outcome.duration.as_secs_f64());
}

fn last_assistant(messages: Vec<Message>) -> Option<Message> {
    messages.into_iter().rev().find(|m| m.role == Role::Assistant)
}

/// Print job progress from the store feed until the job settles.
async fn follow_job(session: &Session, job_id: &str) {
    let store = session.client.store();
    let mut feed = store.subscribe();
    let mut last = None;
    println!("  image job {} started (Ctrl+C to stop waiting)", job_id);

    loop {
        if let Some(job) = store.find_by_job(job_id).await.and_then(|m| m.job()) {
            let seen = (job.status, job.progress);
            if last != Some(seen) {
                println!("  {:<10} {:>3}%", job.status.as_str(), job.progress);
                last = Some(seen);
            }
            if job.status.is_terminal() {
                if let Some(url) = job.image_url {
                    println!("  image: {}", url);
                }
                if let Some(error) = job.error {
                    println!("  error: {}", error);
                }
                return;
            }
        } else if last.is_some() {
            println!("  job {} was removed", job_id);
            return;
        }

        tokio::select! {
            event = feed.recv() => {
                if let Err(RecvError::Closed) = event {
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("  stopped waiting for job {}", job_id);
                return;
            }
        }
    }
}
