//! Store wrapper with injectable faults, shared by unit tests.

use crate::adapters::InMemoryMessageStore;
use crate::models::{ApiKey, Contact, Message, MessageStatus};
use crate::storage::{MessageFilter, MessageStore, Page, Pagination, StorageError};
use crate::{PhoneNumber, RecordId, Timestamp};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Delegates to an [`InMemoryMessageStore`] unless a fault is armed.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: InMemoryMessageStore,
    /// Fail every message insert whose provider id is listed
    pub fail_creates_for: Mutex<Vec<String>>,
    /// Fail the combined inbound message and contact write
    pub fail_contact_updates: AtomicBool,
    pub fail_key_touch: AtomicBool,
    /// Status written behind the caller's back before the next N conditional updates
    pub race_with: Mutex<Option<(MessageStatus, usize)>>,
    pub conditional_updates: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_should_fail(&self, message: &Message) -> bool {
        match &message.whatsapp_message_id {
            Some(wamid) => self.fail_creates_for.lock().unwrap().contains(wamid),
            None => false,
        }
    }

    fn unavailable() -> StorageError {
        StorageError::Unavailable {
            message: "injected fault".to_string(),
        }
    }
}

#[async_trait]
impl MessageStore for FaultyStore {
    async fn create_message(&self, message: Message) -> Result<Message, StorageError> {
        if self.create_should_fail(&message) {
            return Err(Self::unavailable());
        }
        self.inner.create_message(message).await
    }

    async fn get_message(&self, id: &RecordId) -> Result<Option<Message>, StorageError> {
        self.inner.get_message(id).await
    }

    async fn find_message_by_whatsapp_id(
        &self,
        whatsapp_message_id: &str,
    ) -> Result<Option<Message>, StorageError> {
        self.inner
            .find_message_by_whatsapp_id(whatsapp_message_id)
            .await
    }

    async fn list_messages(
        &self,
        filter: &MessageFilter,
        pagination: Pagination,
    ) -> Result<Page<Message>, StorageError> {
        self.inner.list_messages(filter, pagination).await
    }

    async fn update_message_if_status(
        &self,
        message: Message,
        expected: MessageStatus,
    ) -> Result<Message, StorageError> {
        self.conditional_updates.fetch_add(1, Ordering::SeqCst);

        let race = {
            let mut race = self.race_with.lock().unwrap();
            match race.as_mut() {
                Some((status, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*status)
                }
                _ => None,
            }
        };

        if let Some(status) = race {
            let mut competing = message.clone();
            competing.status = status;
            self.inner
                .update_message_if_status(competing, expected)
                .await?;
        }

        self.inner.update_message_if_status(message, expected).await
    }

    async fn create_inbound_message(
        &self,
        message: Message,
        contact_name: Option<&str>,
    ) -> Result<(Message, Contact), StorageError> {
        if self.create_should_fail(&message) || self.fail_contact_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.create_inbound_message(message, contact_name).await
    }

    async fn get_contact_by_phone(
        &self,
        phone_number: &PhoneNumber,
    ) -> Result<Option<Contact>, StorageError> {
        self.inner.get_contact_by_phone(phone_number).await
    }

    async fn list_contacts(&self, pagination: Pagination) -> Result<Page<Contact>, StorageError> {
        self.inner.list_contacts(pagination).await
    }

    async fn create_api_key(&self, key: ApiKey) -> Result<ApiKey, StorageError> {
        self.inner.create_api_key(key).await
    }

    async fn find_api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, StorageError> {
        self.inner.find_api_keys_by_prefix(prefix).await
    }

    async fn touch_api_key(&self, id: &RecordId, at: Timestamp) -> Result<(), StorageError> {
        if self.fail_key_touch.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.touch_api_key(id, at).await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.inner.health_check().await
    }
}
