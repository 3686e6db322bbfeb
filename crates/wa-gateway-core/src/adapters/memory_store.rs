//! # In-Memory Message Store
//!
//! Thread-safe in-memory implementation of [`MessageStore`] for testing and
//! development. All tables live behind a single lock so that each trait
//! operation is atomic with respect to every other one.

use crate::models::{ApiKey, Contact, Message, MessageStatus, Record};
use crate::storage::{MessageFilter, MessageStore, Page, Pagination, StorageError};
use crate::{PhoneNumber, RecordId, Timestamp};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    messages: HashMap<RecordId, Message>,
    // whatsapp_message_id -> message id
    messages_by_wamid: HashMap<String, RecordId>,
    contacts: HashMap<PhoneNumber, Contact>,
    api_keys: HashMap<RecordId, ApiKey>,
}

impl Tables {
    fn insert_message(&mut self, message: Message) -> Result<Message, StorageError> {
        let id = record_id(&message)?;

        if self.messages.contains_key(&id) {
            return Err(StorageError::Conflict {
                field: "id".to_string(),
                value: id.to_string(),
            });
        }

        if let Some(wamid) = &message.whatsapp_message_id {
            if self.messages_by_wamid.contains_key(wamid) {
                return Err(StorageError::Conflict {
                    field: "whatsapp_message_id".to_string(),
                    value: wamid.clone(),
                });
            }
            self.messages_by_wamid.insert(wamid.clone(), id.clone());
        }

        self.messages.insert(id.clone(), message.clone());
        debug!(message_id = %id, "Stored message");
        Ok(message)
    }

    /// The sender's contact with one more message counted, not yet written
    fn contact_after_activity(
        &self,
        phone_number: &PhoneNumber,
        name: Option<&str>,
        at: Timestamp,
        now: Timestamp,
    ) -> Result<Contact, StorageError> {
        match self.contacts.get(phone_number) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.record_message(at, name);
                updated.prepare_update(now)?;
                Ok(updated)
            }
            None => {
                let mut created = Contact::new(phone_number.clone(), None);
                created.record_message(at, name);
                created.prepare_create(now)?;
                debug!(phone_number = %phone_number, "Created contact");
                Ok(created)
            }
        }
    }
}

/// Thread-safe in-memory store
///
/// Uses RwLock for concurrent access with minimal contention. Clones share
/// the same underlying tables.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryMessageStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::Unavailable {
            message: "store lock poisoned".to_string(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::Unavailable {
            message: "store lock poisoned".to_string(),
        })
    }
}

fn record_id<R: Record>(record: &R) -> Result<RecordId, StorageError> {
    record.id().cloned().ok_or_else(|| {
        StorageError::Validation(crate::ValidationError::Required {
            field: "id".to_string(),
        })
    })
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_message(&self, mut message: Message) -> Result<Message, StorageError> {
        message.prepare_create(Timestamp::now())?;

        let mut tables = self.write()?;
        tables.insert_message(message)
    }

    async fn create_inbound_message(
        &self,
        mut message: Message,
        contact_name: Option<&str>,
    ) -> Result<(Message, Contact), StorageError> {
        let now = Timestamp::now();
        message.prepare_create(now)?;

        let mut tables = self.write()?;

        // Both rows are validated before either is written
        let contact = tables.contact_after_activity(
            &message.from_number,
            contact_name,
            message.timestamp,
            now,
        )?;
        let message = tables.insert_message(message)?;

        tables
            .contacts
            .insert(contact.phone_number.clone(), contact.clone());
        Ok((message, contact))
    }

    async fn get_message(&self, id: &RecordId) -> Result<Option<Message>, StorageError> {
        Ok(self.read()?.messages.get(id).cloned())
    }

    async fn find_message_by_whatsapp_id(
        &self,
        whatsapp_message_id: &str,
    ) -> Result<Option<Message>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .messages_by_wamid
            .get(whatsapp_message_id)
            .and_then(|id| tables.messages.get(id))
            .cloned())
    }

    async fn list_messages(
        &self,
        filter: &MessageFilter,
        pagination: Pagination,
    ) -> Result<Page<Message>, StorageError> {
        let mut matching: Vec<Message> = self
            .read()?
            .messages
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        Ok(pagination.apply(matching))
    }

    async fn update_message_if_status(
        &self,
        mut message: Message,
        expected: MessageStatus,
    ) -> Result<Message, StorageError> {
        message.prepare_update(Timestamp::now())?;
        let id = record_id(&message)?;

        let mut guard = self.write()?;
        let tables = &mut *guard;
        let stored = tables
            .messages
            .get(&id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "message".to_string(),
                id: id.to_string(),
            })?;

        if stored.status != expected {
            return Err(StorageError::StaleWrite {
                id: id.to_string(),
                expected,
                actual: stored.status,
            });
        }

        message.created_at = stored.created_at;
        let stored_wamid = stored.whatsapp_message_id.clone();

        // The provider id may be assigned once (outbound sends) but never changed
        match stored_wamid {
            Some(existing) => message.whatsapp_message_id = Some(existing),
            None => {
                if let Some(assigned) = &message.whatsapp_message_id {
                    if tables.messages_by_wamid.contains_key(assigned) {
                        return Err(StorageError::Conflict {
                            field: "whatsapp_message_id".to_string(),
                            value: assigned.clone(),
                        });
                    }
                    tables
                        .messages_by_wamid
                        .insert(assigned.clone(), id.clone());
                }
            }
        }

        tables.messages.insert(id, message.clone());
        Ok(message)
    }

    async fn get_contact_by_phone(
        &self,
        phone_number: &PhoneNumber,
    ) -> Result<Option<Contact>, StorageError> {
        Ok(self.read()?.contacts.get(phone_number).cloned())
    }

    async fn list_contacts(&self, pagination: Pagination) -> Result<Page<Contact>, StorageError> {
        let mut contacts: Vec<Contact> = self.read()?.contacts.values().cloned().collect();

        // Contacts without activity sort last
        contacts.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.phone_number.cmp(&b.phone_number))
        });

        Ok(pagination.apply(contacts))
    }

    async fn create_api_key(&self, mut key: ApiKey) -> Result<ApiKey, StorageError> {
        key.prepare_create(Timestamp::now())?;
        let id = record_id(&key)?;

        let mut tables = self.write()?;

        if tables.api_keys.values().any(|k| k.key_hash == key.key_hash) {
            return Err(StorageError::Conflict {
                field: "key_hash".to_string(),
                value: key.key_prefix.clone(),
            });
        }
        if tables.api_keys.contains_key(&id) {
            return Err(StorageError::Conflict {
                field: "id".to_string(),
                value: id.to_string(),
            });
        }

        tables.api_keys.insert(id, key.clone());
        Ok(key)
    }

    async fn find_api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, StorageError> {
        Ok(self
            .read()?
            .api_keys
            .values()
            .filter(|k| k.key_prefix == prefix)
            .cloned()
            .collect())
    }

    async fn touch_api_key(&self, id: &RecordId, at: Timestamp) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        let key = tables
            .api_keys
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "api_key".to_string(),
                id: id.to_string(),
            })?;

        key.last_used_at = Some(at);
        key.prepare_update(Timestamp::now())?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.read().map(|_| ())
    }
}

#[cfg(test)]
#[path = "memory_store_tests.rs"]
mod tests;
