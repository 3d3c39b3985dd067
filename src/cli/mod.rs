//! CLI module for Vesper
//!
//! Provides commands:
//! - `chat`: send one message and print the streamed reply
//! - `job status` / `job cancel`: inspect or cancel a background job
//! - `watch`: follow the push channel and print notifications

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use vesper_client::{
    Analytics, AnalyticsObserver, ChatApi, ChatClient, ClientConfig, Executor, ReqwestTransport,
    RetryPolicy, Transport,
};
use vesper_core::{FanoutObserver, Observer, ObserverHandle, RecordStore, TracingObserver};

pub mod chat;
pub mod job;
pub mod watch;

/// Vesper streaming chat client
#[derive(Parser, Debug)]
#[command(name = "vesper")]
#[command(about = "Streaming chat client with background job tracking")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message and print the reply
    Chat {
        /// Message text
        text: String,
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,
        /// Persona to answer with
        #[arg(long)]
        persona: Option<String>,
        /// Attach an image (repeatable)
        #[arg(long = "image", value_name = "PATH")]
        images: Vec<PathBuf>,
    },
    /// Inspect or cancel background jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Follow the push channel and print notifications
    Watch,
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Show the current status of a job
    Status {
        /// Job id
        id: String,
    },
    /// Cancel a queued or running job
    Cancel {
        /// Job id
        id: String,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Chat {
            text,
            conversation,
            persona,
            images,
        }) => chat::run(&text, conversation, persona, &images).await,
        Some(Commands::Job { command }) => match command {
            JobCommands::Status { id } => job::status(&id).await,
            JobCommands::Cancel { id } => job::cancel(&id).await,
        },
        Some(Commands::Watch) => watch::run().await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Everything a command needs: config, client and the optional analytics sink
pub struct Session {
    pub config: ClientConfig,
    pub client: ChatClient,
    pub analytics: Option<Arc<Analytics>>,
    cancel: CancellationToken,
    sink: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl Session {
    /// Load config and wire the client against the configured server
    pub fn connect() -> Result<Self> {
        Self::connect_with(None)
    }

    /// Like [`Session::connect`], with one more observer for the client
    pub fn connect_with(extra: Option<Arc<dyn Observer>>) -> Result<Self> {
        let config = crate::config::load_config()?;
        let transport: Arc<dyn Transport> = Arc::new(
            ReqwestTransport::new(&config.server).context("Failed to create HTTP client")?,
        );

        let cancel = CancellationToken::new();
        let mut sink = None;
        let mut flusher = None;
        let mut fanout = FanoutObserver::new().with(Arc::new(TracingObserver));
        let analytics = if config.analytics.enabled {
            let analytics = Arc::new(Analytics::new(config.analytics.clone(), transport.clone()));
            let (observer, task) = AnalyticsObserver::spawn(analytics.clone());
            fanout = fanout.with(Arc::new(observer));
            sink = Some(task);
            flusher = Some(analytics.spawn_flusher(cancel.clone()));
            Some(analytics)
        } else {
            None
        };

        if let Some(extra) = extra {
            fanout = fanout.with(extra);
        }
        let observer = ObserverHandle::new(Arc::new(fanout));
        let executor = Executor::new(transport, observer.clone())
            .with_policy(RetryPolicy::from_config(&config.requests));
        let api = ChatApi::new(executor, &config);
        let client = ChatClient::new(api, RecordStore::new(), observer, &config);

        Ok(Self {
            config,
            client,
            analytics,
            cancel,
            sink,
            flusher,
        })
    }

    /// Stop background work and flush analytics
    pub async fn finish(self) {
        let Session {
            client,
            cancel,
            sink,
            flusher,
            ..
        } = self;

        client.poller().shutdown();
        drop(client);
        drain_analytics(sink, cancel, flusher).await;
    }
}

/// Wait for the forwarding task to deliver what the observers reported,
/// then stop the flusher, which flushes one last time.
///
/// The forwarding task ends once the last observer clone is dropped.
async fn drain_analytics(
    sink: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    flusher: Option<JoinHandle<()>>,
) {
    if let Some(mut sink) = sink {
        if tokio::time::timeout(Duration::from_secs(2), &mut sink).await.is_err() {
            warn!("Analytics forwarding did not drain in time");
            sink.abort();
        }
    }

    cancel.cancel();
    if let Some(flusher) = flusher {
        if tokio::time::timeout(Duration::from_secs(15), flusher).await.is_err() {
            warn!("Analytics flush did not finish in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_client::config::AnalyticsConfig;
    use vesper_client::{ScriptedReply, ScriptedTransport};
    use vesper_core::Notification;

    #[tokio::test]
    async fn test_drain_delivers_queued_observer_events() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::status(200, "{}"));
        let config = AnalyticsConfig {
            enabled: true,
            endpoint_url: Some("https://events.example.com/batch".to_string()),
            batch_size: 1000,
            ..Default::default()
        };
        let analytics = Arc::new(Analytics::new(config, Arc::new(transport.clone())));
        let cancel = CancellationToken::new();
        let (observer, sink) = AnalyticsObserver::spawn(analytics.clone());
        let flusher = analytics.spawn_flusher(cancel.clone());

        let handle = ObserverHandle::new(Arc::new(observer));
        for n in 0..50 {
            handle.notify(Notification::info(format!("event {}", n)));
        }
        drop(handle);

        drain_analytics(Some(sink), cancel, Some(flusher)).await;

        assert_eq!(transport.call_count(), 1);
        let body = transport.requests()[0].body.clone();
        assert_eq!(body.as_ref().and_then(|b| b.as_array()).map(Vec::len), Some(50));
        assert_eq!(analytics.queued().await, 0);
    }
}
