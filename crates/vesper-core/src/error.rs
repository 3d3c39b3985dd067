//! Error types for vesper-core

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// No message with the given id exists in the store
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// No conversation with the given id exists in the store
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// Target id of a migration is already in use
    #[error("message id already in use: {0}")]
    IdentityConflict(String),

    /// Identity was already migrated to a different durable id
    #[error("message identity already migrated to {current}, refusing {requested}")]
    AlreadyMigrated {
        /// Durable id adopted earlier
        current: String,
        /// Durable id that was rejected
        requested: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
