//! Streaming session orchestrator
//!
//! [`ChatClient::send`] drives one exchange end to end:
//!
//! 1. uploads attachments, then appends the user message and an assistant
//!    placeholder under provisional ids
//! 2. opens the streaming send (single attempt) and adopts a new
//!    conversation id from the response header
//! 3. decodes the body and applies each event to the placeholder, migrating
//!    ids once on the `metadata` handshake
//! 4. settles the record on a normal end, or appends a readable error
//!    notice on failure
//!
//! Job progress for detected jobs flows through the shared
//! [`vesper_core::reconciler::JobReconciler`] from the push channel and the
//! polling fallback.

mod client;
mod state;

pub use client::{ChatClient, SendOptions, SendOutcome, DEFAULT_PERSONA};
pub use state::{FinalizeDecision, LegacyMarker, SendingGuard, SessionState};
