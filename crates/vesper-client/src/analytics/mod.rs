//! Analytics - Batched event sink
//!
//! Structured events are queued and POSTed in batches, fire-and-forget.
//! A batch goes out when `batch_size` events are queued or when the flush
//! timer fires, whichever comes first. Failed batches are requeued for the
//! next attempt and the queue never grows past [`MAX_QUEUE_SIZE`].
//!
//! [`AnalyticsObserver`] plugs the sink into the observer side channel so
//! fault reports and notifications are collected without the core knowing.

pub mod client;
pub mod observer;
pub mod types;

pub use client::{Analytics, MAX_QUEUE_SIZE};
pub use observer::AnalyticsObserver;
pub use types::{AnalyticsEvent, AnalyticsRecord};

#[cfg(test)]
mod tests;
