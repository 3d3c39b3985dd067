//! Vesper Client - Streaming chat client
//!
//! This crate puts the network around `vesper-core`:
//! - Transport: HTTP seam (`reqwest`) and a scripted stand-in
//! - Executor: Timeouts, classification and bounded retries
//! - Decoder: NDJSON stream events with a plain-text fallback
//! - Api: Typed endpoints (send, job status, cancel, messages, upload)
//! - Poller: Job status polling fallback
//! - Push: WebSocket push channel with reconnects
//! - Session: Streaming session orchestrator
//! - Analytics: Batched event sink

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod analytics;
pub mod api;
pub mod config;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod poller;
pub mod push;
pub mod session;
pub mod transport;
pub mod wire;

pub use analytics::{Analytics, AnalyticsEvent, AnalyticsObserver};
pub use api::{Attachment, ChatApi, JobStatusSource, SendRequest, Uploader};
pub use config::ClientConfig;
pub use decoder::{decode_stream, DecodedItem, LineDecoder, StreamEvent};
pub use error::{Error, ErrorCategory, Result};
pub use executor::{Executor, RetryPolicy};
pub use poller::JobPoller;
pub use push::{ConnectionState, PushChannel, PushEvent, PushFrame};
pub use session::{ChatClient, FinalizeDecision, SendOptions, SendOutcome, SessionState};
pub use transport::{
    HttpRequest, HttpResponse, Method, ReqwestTransport, ScriptedReply, ScriptedTransport,
    Transport,
};
pub use wire::{CancelReply, JobReport};
