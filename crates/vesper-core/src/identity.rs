//! Message identity with a single provisional → durable migration.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Prefix of client-generated ids
pub const PROVISIONAL_PREFIX: &str = "temp-";

/// Generate a client-side provisional message id
#[must_use]
pub fn provisional_id() -> String {
    format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4())
}

/// Whether an id was generated on the client
#[must_use]
pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// Identity of the message a streaming session writes to.
///
/// Immutable except through [`MessageIdentity::migrate`], which succeeds at
/// most once with a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdentity {
    provisional: String,
    durable: Option<String>,
}

/// Result of a migration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
    /// The identity moved from `from` to `to`
    Migrated {
        /// Previous id
        from: String,
        /// New id
        to: String,
    },
    /// The identity already carried this durable id
    Unchanged,
}

impl MessageIdentity {
    /// Fresh identity with a generated provisional id
    #[must_use]
    pub fn new() -> Self {
        Self::with_provisional(provisional_id())
    }

    /// Identity starting from a known provisional id
    #[must_use]
    pub fn with_provisional(id: impl Into<String>) -> Self {
        Self {
            provisional: id.into(),
            durable: None,
        }
    }

    /// The id every write must address right now
    #[must_use]
    pub fn current(&self) -> &str {
        self.durable.as_deref().unwrap_or(&self.provisional)
    }

    /// The id assigned before migration
    #[must_use]
    pub fn provisional(&self) -> &str {
        &self.provisional
    }

    /// Whether the durable id has been adopted
    #[must_use]
    pub fn is_migrated(&self) -> bool {
        self.durable.is_some()
    }

    /// Adopt the server-durable id.
    ///
    /// Repeating the same id is a no-op; a different id after migration is
    /// rejected.
    pub fn migrate(&mut self, durable: impl Into<String>) -> Result<Migration> {
        let durable = durable.into();
        match &self.durable {
            Some(current) if *current == durable => Ok(Migration::Unchanged),
            Some(current) => Err(Error::AlreadyMigrated {
                current: current.clone(),
                requested: durable,
            }),
            None if durable == self.provisional => Ok(Migration::Unchanged),
            None => {
                let from = self.provisional.clone();
                self.durable = Some(durable.clone());
                Ok(Migration::Migrated { from, to: durable })
            }
        }
    }
}

impl Default for MessageIdentity {
    fn default() -> Self {
        Self::new()
    }
}
