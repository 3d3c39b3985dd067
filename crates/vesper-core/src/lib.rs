//! Vesper Core - Conversation state
//!
//! This crate holds the transport-free half of the Vesper chat client:
//! - Model: Messages, conversations and job descriptors
//! - Identity: Provisional and durable message ids
//! - Store: Single source of truth with a change feed
//! - Reconciler: Job progress merging from push, poll and stream
//! - Observer: Breadcrumbs, notifications and fault reports

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod lenient;
pub mod model;
pub mod observer;
pub mod reconciler;
pub mod store;

pub use error::{Error, Result};
pub use identity::{is_provisional, provisional_id, MessageIdentity, Migration};
pub use model::{Conversation, JobDescriptor, JobStatus, Message, Role};
pub use observer::{
    Breadcrumb, FanoutObserver, FaultReport, Notification, NotificationLevel, Observer,
    ObserverHandle, RecordingObserver, TracingObserver,
};
pub use reconciler::{ApplyOutcome, DropReason, JobReconciler, JobUpdate, UpdateSource};
pub use store::{MessageLocator, RecordStore, StoreEvent};
