//! Push channel connection manager
//!
//! Owns one WebSocket connection to the backend with an explicit
//! `start` / `shutdown` lifecycle. Frames are decoded and published on
//! broadcast channels: job progress as [`JobUpdate`]s (ready for
//! [`vesper_core::reconciler::JobReconciler::listen`]) and everything as
//! [`PushEvent`]s.
//!
//! A lost connection is retried with exponential backoff up to
//! `max_reconnect_attempts`. The count only resets once a connection has
//! delivered a frame. A close with code 1008 (policy violation) means the
//! server refused us and is never retried.

use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vesper_core::observer::Notification;
use vesper_core::reconciler::JobUpdate;

use crate::config::PushConfig;
use crate::error::{Error, Result};
use crate::wire::JobReport;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Broadcast buffer for push events
const EVENT_CAPACITY: usize = 256;

/// A decoded push frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    /// Background job progress
    ImageProgress(JobReport),
    /// Generic server notification
    Notification(PushNotification),
}

/// Payload of a `notification` frame
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushNotification {
    /// Headline
    #[serde(default)]
    pub title: Option<String>,
    /// Body text
    #[serde(default)]
    pub message: Option<String>,
    /// `success`, `info` or `error`
    #[serde(default)]
    pub level: Option<String>,
    /// Everything else the server sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PushNotification {
    /// User-facing notification for this frame
    #[must_use]
    pub fn to_notification(&self) -> Notification {
        let title = self
            .title
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Notification".to_string());
        let notification = match self.level.as_deref() {
            Some("error") => Notification::error(title),
            Some("success") => Notification::success(title),
            _ => Notification::info(title),
        };
        match (&self.title, &self.message) {
            (Some(_), Some(body)) => notification.with_body(body.clone()),
            _ => notification,
        }
    }
}

/// What the push channel publishes
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Job progress frame
    JobProgress(JobUpdate),
    /// Notification frame
    Notification(PushNotification),
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started
    Idle,
    /// Handshake in progress
    Connecting,
    /// Receiving frames
    Connected,
    /// Waiting before the given reconnect attempt
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Stopped for good (shutdown, policy close or attempts exhausted)
    Closed,
}

/// Why a connection ended
#[derive(Debug)]
enum Disconnect {
    /// Shutdown was requested
    Cancelled,
    /// Server closed with 1008
    Policy(String),
    /// Anything else
    Lost(String),
}

struct Senders {
    events: broadcast::Sender<PushEvent>,
    jobs: broadcast::Sender<JobUpdate>,
    state: watch::Sender<ConnectionState>,
}

/// Push channel connection manager
pub struct PushChannel {
    config: PushConfig,
    token: Option<SecretString>,
    senders: Arc<Senders>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("url", &self.config.url)
            .field("state", &*self.senders.state.borrow())
            .finish_non_exhaustive()
    }
}

impl PushChannel {
    /// Create an idle channel
    #[must_use]
    pub fn new(config: PushConfig, token: Option<SecretString>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (jobs, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            token,
            senders: Arc::new(Senders {
                events,
                jobs,
                state,
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to every push event
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.senders.events.subscribe()
    }

    /// Subscribe to job progress only
    #[must_use]
    pub fn job_updates(&self) -> broadcast::Receiver<JobUpdate> {
        self.senders.jobs.subscribe()
    }

    /// Watch the connection state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.senders.state.subscribe()
    }

    /// Connect in the background. Calling it again while running is a no-op
    pub async fn start(&self) -> Result<()> {
        let url = self
            .config
            .url
            .clone()
            .ok_or_else(|| Error::PushChannel("no push URL configured".to_string()))?;
        if self.cancel.is_cancelled() {
            return Err(Error::PushChannel("channel was shut down".to_string()));
        }

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        info!(url = %url, "Starting push channel");
        *task = Some(tokio::spawn(run(
            url,
            self.token.clone(),
            self.config.clone(),
            self.senders.clone(),
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Push channel task ended abnormally");
            }
        }
        self.senders.state.send_replace(ConnectionState::Closed);
        info!("Push channel shut down");
    }
}

/// Decode one text frame
pub fn parse_frame(text: &str) -> Option<PushFrame> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Ignoring non-JSON push frame");
            return None;
        }
    };
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match serde_json::from_value(value) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!(kind = %kind, error = %e, "Ignoring push frame");
            None
        }
    }
}

/// Delay before the given 1-based reconnect attempt
#[must_use]
pub fn reconnect_delay(config: &PushConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(
        config
            .reconnect_base_ms
            .saturating_mul(factor)
            .min(config.reconnect_max_ms),
    )
}

fn publish(senders: &Senders, frame: PushFrame) {
    // No subscribers is fine
    match frame {
        PushFrame::ImageProgress(report) => {
            let update = report.into_update();
            let _ = senders.jobs.send(update.clone());
            let _ = senders.events.send(PushEvent::JobProgress(update));
        }
        PushFrame::Notification(notification) => {
            let _ = senders.events.send(PushEvent::Notification(notification));
        }
    }
}

async fn connect(url: &str, token: Option<&SecretString>) -> Result<WsStream> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::PushChannel(e.to_string()))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| Error::PushChannel(e.to_string()))?;
        request.headers_mut().insert("authorization", value);
    }
    let (stream, _) = connect_async(request)
        .await
        .map_err(|e| Error::PushChannel(e.to_string()))?;
    Ok(stream)
}

/// Read until the connection ends. `received` counts the data frames seen.
async fn read_frames(
    stream: &mut WsStream,
    senders: &Senders,
    cancel: &CancellationToken,
    received: &mut u64,
) -> Disconnect {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = stream.close(None).await;
                return Disconnect::Cancelled;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => {
                *received += 1;
                if let Some(frame) = parse_frame(&text) {
                    publish(senders, frame);
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                return match frame {
                    Some(frame) if frame.code == CloseCode::Policy => {
                        Disconnect::Policy(frame.reason.to_string())
                    }
                    Some(frame) => Disconnect::Lost(format!("closed with {}", frame.code)),
                    None => Disconnect::Lost("closed".to_string()),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Disconnect::Lost(e.to_string()),
            None => return Disconnect::Lost("stream ended".to_string()),
        }
    }
}

async fn run(
    url: String,
    token: Option<SecretString>,
    config: PushConfig,
    senders: Arc<Senders>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        senders.state.send_replace(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect(&url, token.as_ref()) => result,
        };

        match connected {
            Ok(mut stream) => {
                senders.state.send_replace(ConnectionState::Connected);
                info!(url = %url, "Push channel connected");

                // Backoff resets only once the connection delivered data
                let mut received = 0;
                let disconnect = read_frames(&mut stream, &senders, &cancel, &mut received).await;
                if received > 0 {
                    attempt = 0;
                }
                match disconnect {
                    Disconnect::Cancelled => break,
                    Disconnect::Policy(reason) => {
                        warn!(reason = %reason, "Push channel closed by policy, not reconnecting");
                        break;
                    }
                    Disconnect::Lost(reason) => {
                        warn!(reason = %reason, "Push channel connection lost");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, attempt, "Push channel connect failed");
            }
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            error!(
                attempts = config.max_reconnect_attempts,
                "Push channel giving up, polling remains active"
            );
            break;
        }

        let delay = reconnect_delay(&config, attempt);
        senders
            .state
            .send_replace(ConnectionState::Reconnecting { attempt });
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting push channel");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    senders.state.send_replace(ConnectionState::Closed);
}
