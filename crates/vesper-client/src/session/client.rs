use futures::{pin_mut, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vesper_core::identity::{provisional_id, MessageIdentity, Migration};
use vesper_core::model::{title_from, Conversation, Message, Role};
use vesper_core::observer::{Breadcrumb, Notification, ObserverHandle};
use vesper_core::reconciler::JobReconciler;
use vesper_core::store::RecordStore;

use super::state::{FinalizeDecision, LegacyMarker, SendingGuard, SessionState};
use crate::api::{Attachment, ChatApi, JobStatusSource, SendRequest, Uploader};
use crate::config::{ClientConfig, JobsConfig, StreamConfig};
use crate::decoder::{decode_stream, DecodedItem, StreamEvent};
use crate::error::{Error, Result};
use crate::executor::{Executor, RetryPolicy};
use crate::poller::JobPoller;
use crate::push::{PushChannel, PushEvent};
use crate::transport::ReqwestTransport;
use crate::wire::CancelReply;

/// Persona used when the caller does not pick one
pub const DEFAULT_PERSONA: &str = "default";

/// Per-send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Target conversation; `None` starts a new one
    pub conversation_id: Option<String>,
    /// Assistant persona
    pub persona: Option<String>,
    /// Writing style profile
    pub style_profile: Option<String>,
    /// Files uploaded before the send
    pub attachments: Vec<Attachment>,
    /// Image generation settings
    pub image_settings: Option<Value>,
}

impl SendOptions {
    /// Options for a new conversation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Send into an existing conversation
    #[must_use]
    pub fn in_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Pick a persona
    #[must_use]
    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    /// Pick a style profile
    #[must_use]
    pub fn with_style_profile(mut self, profile: impl Into<String>) -> Self {
        self.style_profile = Some(profile.into());
        self
    }

    /// Attach a file
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Image generation settings
    #[must_use]
    pub fn with_image_settings(mut self, settings: Value) -> Self {
        self.image_settings = Some(settings);
        self
    }
}

/// What a successful send produced
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    /// Conversation the exchange landed in
    pub conversation_id: Option<String>,
    /// Final id of the user message
    pub user_message_id: String,
    /// Final id of the assistant message; `None` when recovery reloaded
    /// the conversation instead
    pub assistant_message_id: Option<String>,
    /// Job detected during the stream
    pub job_id: Option<String>,
    /// How the stream was settled
    pub decision: FinalizeDecision,
    /// Wall time of the send
    pub duration: Duration,
}

/// Bookkeeping for one send
struct Exchange {
    /// Captured at send time, set once by adoption
    conversation_id: Option<String>,
    title: String,
    user: MessageIdentity,
    assistant: MessageIdentity,
    placeholder_live: bool,
    job_id: Option<String>,
    saw_error: bool,
}

impl Exchange {
    fn new(conversation_id: Option<String>, text: &str) -> Self {
        Self {
            conversation_id,
            title: title_from(text),
            user: MessageIdentity::new(),
            assistant: MessageIdentity::new(),
            placeholder_live: false,
            job_id: None,
            saw_error: false,
        }
    }
}

/// Streaming session orchestrator
pub struct ChatClient {
    api: ChatApi,
    uploader: Arc<dyn Uploader>,
    store: RecordStore,
    reconciler: Arc<JobReconciler>,
    poller: JobPoller,
    observer: ObserverHandle,
    stream: StreamConfig,
    jobs: JobsConfig,
    sending: Arc<AtomicBool>,
    state: Arc<watch::Sender<SessionState>>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("state", &self.current_state())
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Create a client around an API and a store
    #[must_use]
    pub fn new(api: ChatApi, store: RecordStore, observer: ObserverHandle, config: &ClientConfig) -> Self {
        let reconciler = Arc::new(JobReconciler::new(store.clone(), observer.clone()));
        let shared = Arc::new(api.clone());
        let poller = JobPoller::new(
            shared.clone(),
            reconciler.clone(),
            config.jobs.poll_interval(),
        );
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            api,
            uploader: shared,
            store,
            reconciler,
            poller,
            observer,
            stream: config.stream.clone(),
            jobs: config.jobs.clone(),
            sending: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        }
    }

    /// Client talking to the configured server over HTTP
    pub fn from_config(config: &ClientConfig, observer: ObserverHandle) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.server)?;
        let executor = Executor::new(Arc::new(transport), observer.clone())
            .with_policy(RetryPolicy::from_config(&config.requests));
        let api = ChatApi::new(executor, config);
        Ok(Self::new(api, RecordStore::new(), observer, config))
    }

    /// Replace the attachment uploader
    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = uploader;
        self
    }

    /// Replace where the polling fallback looks up job status
    #[must_use]
    pub fn with_job_source(mut self, source: Arc<dyn JobStatusSource>) -> Self {
        self.poller = JobPoller::new(source, self.reconciler.clone(), self.jobs.poll_interval());
        self
    }

    /// The record store
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// The job reconciler
    #[must_use]
    pub fn reconciler(&self) -> &Arc<JobReconciler> {
        &self.reconciler
    }

    /// The polling fallback
    #[must_use]
    pub fn poller(&self) -> &JobPoller {
        &self.poller
    }

    /// The typed API
    #[must_use]
    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    /// Watch the session state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Current session state
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether a send is in flight
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Send a message and stream the reply into the store.
    ///
    /// On failure a readable error message is appended to the conversation
    /// before the error is returned. Only one send may run at a time; a
    /// concurrent call fails with [`Error::Busy`] and touches nothing.
    pub async fn send(&self, text: &str, options: SendOptions) -> Result<SendOutcome> {
        let _guard = SendingGuard::acquire(&self.sending, &self.state)?;
        let started = Instant::now();
        self.transition(SessionState::Sending);

        let mut exchange = Exchange::new(options.conversation_id.clone(), text);
        match self.run(&mut exchange, text, &options).await {
            Ok(decision) => {
                let assistant_message_id = match &decision {
                    FinalizeDecision::Complete => Some(exchange.assistant.current().to_string()),
                    FinalizeDecision::Recover { marker: Some(marker) } => {
                        Some(marker.message_id.clone())
                    }
                    FinalizeDecision::Recover { marker: None } => None,
                };
                let outcome = SendOutcome {
                    conversation_id: exchange.conversation_id,
                    user_message_id: exchange.user.current().to_string(),
                    assistant_message_id,
                    job_id: exchange.job_id,
                    decision,
                    duration: started.elapsed(),
                };
                info!(
                    conversation_id = outcome.conversation_id.as_deref(),
                    message_id = outcome.assistant_message_id.as_deref(),
                    job_id = outcome.job_id.as_deref(),
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Send complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.fail(&exchange, &e).await;
                Err(e)
            }
        }
    }

    /// Load a conversation's authoritative message list into the store.
    ///
    /// Jobs that are still running get polled. Returns the message count.
    pub async fn load_conversation(&self, conversation_id: &str) -> Result<usize> {
        let messages = self.api.list_messages(conversation_id).await?;
        let running: Vec<String> = messages
            .iter()
            .filter(|m| m.job_status().is_some_and(|s| !s.is_terminal()))
            .filter_map(|m| m.job_id().map(str::to_string))
            .collect();
        let count = messages.len();

        self.store.replace_messages(conversation_id, messages).await;
        for job_id in &running {
            self.poller.watch(job_id);
        }
        debug!(conversation_id = %conversation_id, count, running = running.len(), "Conversation loaded");
        Ok(count)
    }

    /// Cancel a job.
    ///
    /// Once the backend confirms, polling stops and the job's message is
    /// removed after a short delay. A refusal keeps the message.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelReply> {
        let reply = self.api.cancel_job(job_id).await?;
        if !reply.success {
            warn!(job_id = %job_id, reason = %reply.message, "Cancel rejected");
            return Err(Error::CancelRejected {
                job_id: job_id.to_string(),
                message: reply.message,
            });
        }

        self.poller.stop(job_id);
        tokio::time::sleep(self.jobs.cancel_removal_delay()).await;
        let removed = self.store.remove_by_job(job_id).await;
        info!(job_id = %job_id, removed = removed.is_some(), "Job cancelled");
        self.observer
            .notify(Notification::info("Image generation cancelled").with_job(job_id));
        Ok(reply)
    }

    /// Feed a push channel into this client: job frames go to the
    /// reconciler, notification frames to the observer.
    pub fn attach_push(&self, channel: &PushChannel) -> [JoinHandle<()>; 2] {
        let jobs = Arc::clone(&self.reconciler).listen(channel.job_updates());

        let mut events = channel.subscribe();
        let observer = self.observer.clone();
        let notifications = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PushEvent::Notification(notification)) => {
                        observer.notify(notification.to_notification());
                    }
                    Ok(PushEvent::JobProgress(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Push notifications lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        [jobs, notifications]
    }

    async fn run(
        &self,
        exchange: &mut Exchange,
        text: &str,
        options: &SendOptions,
    ) -> Result<FinalizeDecision> {
        let images = self.upload_all(&options.attachments).await?;
        if let Some(id) = exchange.conversation_id.clone() {
            self.ensure_conversation(&id, &exchange.title).await;
        }

        let mut user = Message::new(exchange.user.current(), Role::User, text);
        if !images.is_empty() {
            user.extra_metadata.insert("images".to_string(), json!(images));
        }
        self.store
            .append_message(exchange.conversation_id.as_deref(), user)
            .await?;
        self.store
            .append_message(
                exchange.conversation_id.as_deref(),
                Message::placeholder(exchange.assistant.current()),
            )
            .await?;
        exchange.placeholder_live = true;

        let request = SendRequest {
            message: text.to_string(),
            conversation_id: exchange.conversation_id.clone(),
            persona: options
                .persona
                .clone()
                .unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            stream: true,
            style_profile: options.style_profile.clone(),
            images,
            image_settings: options.image_settings.clone(),
        };
        let response = self.api.open_send(&request).await?;
        self.transition(SessionState::HandshakePending);

        if let Some(id) = response.header(self.api.conversation_header()) {
            let id = id.to_string();
            self.adopt_conversation(exchange, &id).await;
        }

        let items = decode_stream(response.into_body(), self.stream.idle_timeout());
        pin_mut!(items);
        while let Some(item) = items.next().await {
            match item? {
                DecodedItem::Event(event) => self.dispatch(exchange, event).await?,
                DecodedItem::Text(line) => {
                    self.transition(SessionState::Streaming);
                    self.store
                        .append_content(exchange.assistant.current(), &line)
                        .await?;
                }
            }
        }

        self.transition(SessionState::Finalizing);
        self.finalize(exchange).await
    }

    async fn dispatch(&self, exchange: &mut Exchange, event: StreamEvent) -> Result<()> {
        self.transition(SessionState::Streaming);
        let target = exchange.assistant.current().to_string();

        match event {
            StreamEvent::Metadata {
                assistant_message_id,
                user_message_id,
                conversation_id,
            } => {
                if let Some(id) = conversation_id {
                    self.adopt_conversation(exchange, &id).await;
                }
                if let Some(id) = user_message_id {
                    self.migrate(&mut exchange.user, &id).await;
                }
                if let Some(id) = assistant_message_id {
                    self.migrate(&mut exchange.assistant, &id).await;
                }
            }
            StreamEvent::Chunk { content } => {
                self.store.append_content(&target, &content).await?;
            }
            StreamEvent::Thought { content } => {
                self.store
                    .update_message(&target, |m| m.reasoning.push(content))
                    .await?;
            }
            StreamEvent::TaskResult(task) => match task.job_id() {
                Some(job_id) => {
                    self.reconciler.register_job(&target, &job_id).await?;
                    self.poller.watch(&job_id);
                    exchange.job_id.get_or_insert(job_id);
                }
                None => debug!(tool = task.tool.as_deref(), "Task result without a job"),
            },
            StreamEvent::Sources { sources } => {
                self.store
                    .update_message(&target, |m| m.sources = sources)
                    .await?;
            }
            StreamEvent::Error { message } => {
                warn!(message_id = %target, error = %message, "Error reported in stream");
                exchange.saw_error = true;
                self.store
                    .append_content(&target, &format!("\n\n⚠️ {}", message))
                    .await?;
            }
        }
        Ok(())
    }

    /// Swap a provisional id for its durable one, in the store first
    async fn migrate(&self, identity: &mut MessageIdentity, durable: &str) {
        let mut next = identity.clone();
        match next.migrate(durable) {
            Ok(Migration::Migrated { from, to }) => {
                match self.store.migrate_message_id(&from, &to).await {
                    Ok(()) => {
                        *identity = next;
                        self.observer
                            .breadcrumb(Breadcrumb::new("session", format!("handshake {} -> {}", from, to)));
                    }
                    Err(e) => warn!(from = %from, to = %to, error = %e, "Handshake failed, keeping provisional id"),
                }
            }
            Ok(Migration::Unchanged) => {}
            Err(e) => warn!(error = %e, "Ignoring second durable id"),
        }
    }

    async fn ensure_conversation(&self, id: &str, title: &str) {
        if self.store.conversation(id).await.is_none() {
            self.store
                .insert_conversation(Conversation::new(id, title))
                .await;
        }
    }

    async fn adopt_conversation(&self, exchange: &mut Exchange, id: &str) {
        match exchange.conversation_id.as_deref() {
            None => {
                self.store
                    .adopt_conversation(id, exchange.title.clone())
                    .await;
                exchange.conversation_id = Some(id.to_string());
                info!(conversation_id = %id, "New conversation");
            }
            Some(current) if current == id => {}
            Some(current) => {
                warn!(
                    conversation_id = %current,
                    received = %id,
                    "Response names another conversation, keeping the original"
                );
            }
        }
    }

    async fn upload_all(&self, attachments: &[Attachment]) -> Result<Vec<String>> {
        let mut urls = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let url = self
                .uploader
                .upload(attachment)
                .await
                .map_err(|e| match e {
                    Error::Upload(_) => e,
                    other => Error::Upload(other.to_string()),
                })?;
            urls.push(url);
        }
        Ok(urls)
    }

    async fn finalize(&self, exchange: &mut Exchange) -> Result<FinalizeDecision> {
        let target = exchange.assistant.current().to_string();
        let content = self
            .store
            .message(&target)
            .await
            .map(|m| m.content)
            .unwrap_or_default();
        let decision =
            FinalizeDecision::decide(&content, exchange.job_id.is_some(), exchange.saw_error);

        match &decision {
            FinalizeDecision::Complete => {
                self.store
                    .update_message(&target, |m| m.is_streaming = false)
                    .await?;
            }
            FinalizeDecision::Recover { marker } => {
                info!(message_id = %target, marker = marker.is_some(), "Empty reply, recovering");
                self.store.remove_message(&target).await;
                exchange.placeholder_live = false;
                match marker {
                    Some(marker) => self.adopt_marker(exchange, marker).await?,
                    None => match exchange.conversation_id.clone() {
                        Some(id) => {
                            self.load_conversation(&id).await?;
                        }
                        None => warn!("Empty reply outside a conversation, nothing to reload"),
                    },
                }
            }
        }
        Ok(decision)
    }

    /// Attach the job a legacy marker announced to the message it names
    async fn adopt_marker(&self, exchange: &mut Exchange, marker: &LegacyMarker) -> Result<()> {
        let message = Message::new(&marker.message_id, Role::Assistant, "");
        match self
            .store
            .append_message(exchange.conversation_id.as_deref(), message)
            .await
        {
            Ok(()) | Err(vesper_core::Error::IdentityConflict(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.reconciler
            .register_job(&marker.message_id, &marker.job_id)
            .await?;
        self.poller.watch(&marker.job_id);
        exchange.job_id = Some(marker.job_id.clone());
        Ok(())
    }

    async fn fail(&self, exchange: &Exchange, error: &Error) {
        self.transition(SessionState::Failed);
        warn!(error = %error, category = %error.category(), "Send failed");

        if exchange.placeholder_live {
            let target = exchange.assistant.current();
            let keep = self
                .store
                .message(target)
                .await
                .is_some_and(|m| m.has_text() || m.job_id().is_some());
            if keep {
                if let Err(e) = self
                    .store
                    .update_message(target, |m| m.is_streaming = false)
                    .await
                {
                    debug!(error = %e, "Placeholder already gone");
                }
            } else {
                self.store.remove_message(target).await;
            }
        }

        // The notice is the only record a failure before any append leaves
        if let Some(id) = exchange.conversation_id.as_deref() {
            self.ensure_conversation(id, &exchange.title).await;
        }
        let mut notice = Message::new(provisional_id(), Role::Assistant, error.user_message());
        notice
            .extra_metadata
            .insert("kind".to_string(), Value::String("error".to_string()));
        if let Err(e) = self
            .store
            .append_message(exchange.conversation_id.as_deref(), notice)
            .await
        {
            warn!(error = %e, "Could not append error notice");
        }
    }

    fn transition(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "Session state");
            self.observer
                .breadcrumb(Breadcrumb::new("session", next.as_str()));
        }
    }
}
