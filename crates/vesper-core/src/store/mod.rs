//! Conversational record store
//!
//! Single source of truth for conversations and messages. Every mutation
//! happens under one write lock, so resolve-then-modify sequences such as
//! the job merge are atomic with respect to each other. Changes are
//! published on a broadcast feed for observers.

mod events;

pub use events::StoreEvent;

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Conversation, Message};

/// How a mutation finds its target message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLocator<'a> {
    /// Match on message id
    Id(&'a str),
    /// Match on `extra_metadata.job_id`
    Job(&'a str),
}

impl MessageLocator<'_> {
    fn matches(&self, message: &Message) -> bool {
        match self {
            MessageLocator::Id(id) => message.id == *id,
            MessageLocator::Job(job_id) => message.job_id() == Some(*job_id),
        }
    }
}

/// Where a message lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    /// Messages of a conversation that has no server id yet
    Draft,
    /// Index into the conversation list
    Conversation(usize),
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Most recent first
    conversations: Vec<Conversation>,
    draft: Vec<Message>,
}

impl StoreInner {
    fn conversation_index(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    fn bucket_for(&self, conversation_id: Option<&str>) -> Result<Bucket> {
        match conversation_id {
            None => Ok(Bucket::Draft),
            Some(id) => self
                .conversation_index(id)
                .map(Bucket::Conversation)
                .ok_or_else(|| Error::ConversationNotFound(id.to_string())),
        }
    }

    fn messages(&self, bucket: Bucket) -> &Vec<Message> {
        match bucket {
            Bucket::Draft => &self.draft,
            Bucket::Conversation(i) => &self.conversations[i].messages,
        }
    }

    fn messages_mut(&mut self, bucket: Bucket) -> &mut Vec<Message> {
        match bucket {
            Bucket::Draft => &mut self.draft,
            Bucket::Conversation(i) => &mut self.conversations[i].messages,
        }
    }

    fn buckets(&self) -> impl Iterator<Item = Bucket> {
        std::iter::once(Bucket::Draft).chain((0..self.conversations.len()).map(Bucket::Conversation))
    }

    fn locate(&self, locator: MessageLocator<'_>) -> Option<(Bucket, usize)> {
        self.buckets().find_map(|bucket| {
            self.messages(bucket)
                .iter()
                .position(|m| locator.matches(m))
                .map(|index| (bucket, index))
        })
    }

    fn contains_id(&self, id: &str) -> bool {
        self.locate(MessageLocator::Id(id)).is_some()
    }

    fn conversation_id_of(&self, bucket: Bucket) -> Option<String> {
        match bucket {
            Bucket::Draft => None,
            Bucket::Conversation(i) => Some(self.conversations[i].id.clone()),
        }
    }

    fn refresh(&mut self, bucket: Bucket) {
        if let Bucket::Conversation(i) = bucket {
            self.conversations[i].refresh_summary();
        }
    }
}

/// Shared handle to the record store
#[derive(Debug, Clone)]
pub struct RecordStore {
    inner: Arc<RwLock<StoreInner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl RecordStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(256)
    }

    /// Create an empty store whose change feed buffers `capacity` events
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            events,
        }
    }

    /// Subscribe to the change feed
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// All conversations, most recent first
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.read().await.conversations.clone()
    }

    /// One conversation by id
    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        let inner = self.inner.read().await;
        inner
            .conversation_index(id)
            .map(|i| inner.conversations[i].clone())
    }

    /// Messages of a conversation (`None` addresses the draft conversation)
    pub async fn messages(&self, conversation_id: Option<&str>) -> Vec<Message> {
        let inner = self.inner.read().await;
        match inner.bucket_for(conversation_id) {
            Ok(bucket) => inner.messages(bucket).clone(),
            Err(_) => Vec::new(),
        }
    }

    /// One message by id, anywhere in the store
    pub async fn message(&self, id: &str) -> Option<Message> {
        self.find(MessageLocator::Id(id)).await
    }

    /// The message carrying the given job
    pub async fn find_by_job(&self, job_id: &str) -> Option<Message> {
        self.find(MessageLocator::Job(job_id)).await
    }

    /// Find a message by locator
    pub async fn find(&self, locator: MessageLocator<'_>) -> Option<Message> {
        let inner = self.inner.read().await;
        inner
            .locate(locator)
            .map(|(bucket, index)| inner.messages(bucket)[index].clone())
    }

    /// Insert a conversation at the top of the list.
    ///
    /// An existing conversation with the same id is replaced in place.
    pub async fn insert_conversation(&self, mut conversation: Conversation) {
        conversation.refresh_summary();
        let id = conversation.id.clone();
        {
            let mut inner = self.inner.write().await;
            match inner.conversation_index(&id) {
                Some(i) => inner.conversations[i] = conversation,
                None => inner.conversations.insert(0, conversation),
            }
        }
        self.publish(StoreEvent::ConversationAdded {
            conversation_id: id,
        });
    }

    /// Give the draft conversation its server identity.
    ///
    /// Draft messages move into a new conversation prepended to the list, or
    /// are appended to the existing conversation with that id.
    pub async fn adopt_conversation(&self, id: &str, title: impl Into<String>) {
        let title = title.into();
        {
            let mut inner = self.inner.write().await;
            let draft = std::mem::take(&mut inner.draft);
            match inner.conversation_index(id) {
                Some(i) => {
                    inner.conversations[i].messages.extend(draft);
                    inner.conversations[i].refresh_summary();
                }
                None => {
                    let mut conversation = Conversation::new(id, title);
                    conversation.messages = draft;
                    conversation.refresh_summary();
                    inner.conversations.insert(0, conversation);
                }
            }
        }
        debug!(conversation_id = %id, "Adopted conversation identity");
        self.publish(StoreEvent::ConversationAdded {
            conversation_id: id.to_string(),
        });
    }

    /// Append a message to a conversation
    pub async fn append_message(
        &self,
        conversation_id: Option<&str>,
        message: Message,
    ) -> Result<()> {
        let message_id = message.id.clone();
        {
            let mut inner = self.inner.write().await;
            if inner.contains_id(&message_id) {
                return Err(Error::IdentityConflict(message_id));
            }
            let bucket = inner.bucket_for(conversation_id)?;
            inner.messages_mut(bucket).push(message);
            inner.refresh(bucket);
        }
        self.publish(StoreEvent::MessageAppended {
            conversation_id: conversation_id.map(str::to_string),
            message_id,
        });
        Ok(())
    }

    /// Mutate a message in place
    pub async fn update_message<F, R>(&self, id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Message) -> R,
    {
        self.modify(&[MessageLocator::Id(id)], f)
            .await
            .map(|(_, r)| r)
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))
    }

    /// Resolve the first locator that matches and mutate that message.
    ///
    /// Resolution and mutation happen under one lock acquisition. Returns the
    /// id of the mutated message with the closure's result, or `None` when
    /// nothing matched.
    pub async fn modify<F, R>(&self, locators: &[MessageLocator<'_>], f: F) -> Option<(String, R)>
    where
        F: FnOnce(&mut Message) -> R,
    {
        let (message_id, result) = {
            let mut inner = self.inner.write().await;
            let (bucket, index) = locators.iter().find_map(|l| inner.locate(*l))?;
            let message = &mut inner.messages_mut(bucket)[index];
            let result = f(message);
            let message_id = message.id.clone();
            inner.refresh(bucket);
            (message_id, result)
        };
        self.publish(StoreEvent::MessageUpdated {
            message_id: message_id.clone(),
        });
        Some((message_id, result))
    }

    /// Append text to a message's content
    pub async fn append_content(&self, id: &str, text: &str) -> Result<()> {
        self.update_message(id, |m| m.content.push_str(text)).await
    }

    /// Swap a message's id for a new one
    pub async fn migrate_message_id(&self, from: &str, to: &str) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.contains_id(to) {
                return Err(Error::IdentityConflict(to.to_string()));
            }
            let (bucket, index) = inner
                .locate(MessageLocator::Id(from))
                .ok_or_else(|| Error::MessageNotFound(from.to_string()))?;
            inner.messages_mut(bucket)[index].id = to.to_string();
        }
        debug!(from = %from, to = %to, "Migrated message id");
        self.publish(StoreEvent::MessageMigrated {
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }

    /// Remove a message
    pub async fn remove_message(&self, id: &str) -> Option<Message> {
        self.remove(MessageLocator::Id(id)).await
    }

    /// Remove the message carrying a job
    pub async fn remove_by_job(&self, job_id: &str) -> Option<Message> {
        self.remove(MessageLocator::Job(job_id)).await
    }

    async fn remove(&self, locator: MessageLocator<'_>) -> Option<Message> {
        let removed = {
            let mut inner = self.inner.write().await;
            let (bucket, index) = inner.locate(locator)?;
            let removed = inner.messages_mut(bucket).remove(index);
            inner.refresh(bucket);
            removed
        };
        self.publish(StoreEvent::MessageRemoved {
            message_id: removed.id.clone(),
        });
        Some(removed)
    }

    /// Replace a conversation's message list with an authoritative copy.
    ///
    /// The conversation is created when it does not exist yet.
    pub async fn replace_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        {
            let mut inner = self.inner.write().await;
            let index = match inner.conversation_index(conversation_id) {
                Some(i) => i,
                None => {
                    let title = messages
                        .iter()
                        .find(|m| m.role == crate::model::Role::User)
                        .map(|m| crate::model::title_from(&m.content))
                        .unwrap_or_else(|| crate::model::title_from(""));
                    inner
                        .conversations
                        .insert(0, Conversation::new(conversation_id, title));
                    0
                }
            };
            inner.conversations[index].messages = messages;
            inner.conversations[index].refresh_summary();
        }
        self.publish(StoreEvent::MessagesReplaced {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Conversation id holding a message (`None` for the draft conversation)
    pub async fn conversation_of(&self, message_id: &str) -> Option<Option<String>> {
        let inner = self.inner.read().await;
        inner
            .locate(MessageLocator::Id(message_id))
            .map(|(bucket, _)| inner.conversation_id_of(bucket))
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
