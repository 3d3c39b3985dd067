use serde::Serialize;

/// Change notification published by the record store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A conversation was added or received its server identity
    ConversationAdded {
        /// Conversation id
        conversation_id: String,
    },
    /// A message was appended
    MessageAppended {
        /// Owning conversation (`None` for the draft conversation)
        conversation_id: Option<String>,
        /// Message id
        message_id: String,
    },
    /// A message changed in place
    MessageUpdated {
        /// Message id after the change
        message_id: String,
    },
    /// A message received its durable id
    MessageMigrated {
        /// Provisional id
        from: String,
        /// Durable id
        to: String,
    },
    /// A message was deleted
    MessageRemoved {
        /// Message id
        message_id: String,
    },
    /// A conversation's messages were reloaded wholesale
    MessagesReplaced {
        /// Conversation id
        conversation_id: String,
    },
}

impl StoreEvent {
    /// Message this event is about, if any
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::MessageAppended { message_id, .. }
            | Self::MessageUpdated { message_id }
            | Self::MessageRemoved { message_id } => Some(message_id),
            Self::MessageMigrated { to, .. } => Some(to),
            Self::ConversationAdded { .. } | Self::MessagesReplaced { .. } => None,
        }
    }
}
