//! # Storage
//!
//! Persistence interface for messages, contacts and API keys.
//!
//! Implementations must enforce uniqueness of `whatsapp_message_id`,
//! contact `phone_number` and API key `key_hash`, and must run the
//! [`Record`](crate::models::Record) pre-commit pipeline on every write.

use crate::models::{ApiKey, Contact, Message, MessageDirection, MessageStatus};
use crate::{PhoneNumber, RecordId, Timestamp, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Page size used when the caller does not ask for one
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: u32 = 100;

// ============================================================================
// Pagination
// ============================================================================

/// Offset/limit window for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u64,
}

impl Pagination {
    /// Build a window from raw query values.
    ///
    /// Missing or non-positive limits fall back to the default, oversized
    /// limits are clamped and negative offsets become zero.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = match limit {
            Some(l) if l > 0 => l.min(MAX_PAGE_LIMIT as i64) as u32,
            _ => DEFAULT_PAGE_LIMIT,
        };
        let offset = offset.unwrap_or(0).max(0) as u64;
        Self { limit, offset }
    }

    /// Slice an already ordered collection into a page
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let page_items = items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect();
        Page::new(page_items, total, *self)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// One page of results plus the information needed to fetch the next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        Self {
            items,
            total,
            limit: pagination.limit,
            offset: pagination.offset,
            has_more: pagination.offset + (pagination.limit as u64) < total,
        }
    }
}

/// Optional narrowing for message listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Matches either side of the conversation
    pub phone_number: Option<PhoneNumber>,
    pub direction: Option<MessageDirection>,
    pub status: Option<MessageStatus>,
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(phone) = &self.phone_number {
            if &message.from_number != phone && &message.to_number != phone {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if message.direction != direction {
                return false;
            }
        }
        if let Some(status) = self.status {
            if message.status != status {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Storage Interface
// ============================================================================

/// Interface for message, contact and credential persistence
///
/// Every operation is individually atomic. Callers rely on the uniqueness
/// constraints for idempotency, so implementations must report a duplicate
/// insert as [`StorageError::Conflict`] rather than silently overwriting.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a new message.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`] if a message with the same
    ///   `whatsapp_message_id` already exists
    /// - [`StorageError::Validation`] if the pre-commit pipeline rejects it
    async fn create_message(&self, message: Message) -> Result<Message, StorageError>;

    async fn get_message(&self, id: &RecordId) -> Result<Option<Message>, StorageError>;

    async fn find_message_by_whatsapp_id(
        &self,
        whatsapp_message_id: &str,
    ) -> Result<Option<Message>, StorageError>;

    /// List messages newest provider timestamp first
    async fn list_messages(
        &self,
        filter: &MessageFilter,
        pagination: Pagination,
    ) -> Result<Page<Message>, StorageError>;

    /// Replace a message only if its stored status still equals `expected`.
    ///
    /// This is the compare-and-set primitive used for status transitions.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the message does not exist
    /// - [`StorageError::StaleWrite`] if the stored status has moved on
    async fn update_message_if_status(
        &self,
        message: Message,
        expected: MessageStatus,
    ) -> Result<Message, StorageError>;

    /// Insert an inbound message and count it on the sender's contact.
    ///
    /// Both writes commit together or not at all. The contact is created if
    /// absent, `message_count` and `unread_count` are incremented and
    /// `last_message_at` only moves forward. A failed call therefore leaves
    /// nothing behind and a redelivery of the same event starts afresh.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`] if the `whatsapp_message_id` is already
    ///   stored; the contact is left untouched
    async fn create_inbound_message(
        &self,
        message: Message,
        contact_name: Option<&str>,
    ) -> Result<(Message, Contact), StorageError>;

    async fn get_contact_by_phone(
        &self,
        phone_number: &PhoneNumber,
    ) -> Result<Option<Contact>, StorageError>;

    /// List contacts by most recent activity first
    async fn list_contacts(&self, pagination: Pagination) -> Result<Page<Contact>, StorageError>;

    /// Insert a new API key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`] if the `key_hash` is already stored
    async fn create_api_key(&self, key: ApiKey) -> Result<ApiKey, StorageError>;

    /// All keys sharing the given plaintext prefix
    async fn find_api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, StorageError>;

    async fn touch_api_key(&self, id: &RecordId, at: Timestamp) -> Result<(), StorageError>;

    /// Verify the store can serve requests
    async fn health_check(&self) -> Result<(), StorageError>;
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A uniqueness constraint rejected the write
    #[error("Unique constraint violated on {field}: {value}")]
    Conflict { field: String, value: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Conditional update lost a race with a concurrent writer
    #[error("Stale write for {id}: expected status {expected}, found {actual}")]
    StaleWrite {
        id: String,
        expected: MessageStatus,
        actual: MessageStatus,
    },

    #[error("Record failed validation: {0}")]
    Validation(#[from] ValidationError),

    /// Backing store cannot serve the request right now
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },
}

impl StorageError {
    /// Check if error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::StaleWrite { .. })
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
