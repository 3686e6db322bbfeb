//! Persisted entities and the pre-commit pipeline every store write runs.
//!
//! Records are created without an id; the store assigns one on insert via
//! [`Record::prepare_create`], which also stamps `created_at` / `updated_at`
//! and validates the record. Updates go through [`Record::prepare_update`].

use crate::{PhoneNumber, RecordId, Timestamp, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Free-form key/value annotations attached to a record
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Permission scope granting every other scope
pub const WILDCARD_PERMISSION: &str = "*";

// ============================================================================
// Pre-commit pipeline
// ============================================================================

/// Behaviour shared by all persisted entities.
pub trait Record: Clone + Send + Sync + 'static {
    /// Prefix used when generating identifiers (`msg`, `contact`, `key`)
    const ID_PREFIX: &'static str;

    fn id(&self) -> Option<&RecordId>;
    fn set_id(&mut self, id: RecordId);
    fn set_created_at(&mut self, at: Timestamp);
    fn set_updated_at(&mut self, at: Timestamp);

    /// Entity-specific invariants checked before every write
    fn validate(&self) -> Result<(), ValidationError>;

    /// Run the create pipeline: id if absent, timestamps, validation.
    fn prepare_create(&mut self, now: Timestamp) -> Result<(), ValidationError> {
        if self.id().is_none() {
            self.set_id(RecordId::generate(Self::ID_PREFIX));
        }
        self.set_created_at(now);
        self.set_updated_at(now);
        self.validate()
    }

    /// Run the update pipeline: re-stamp `updated_at`, re-validate.
    fn prepare_update(&mut self, now: Timestamp) -> Result<(), ValidationError> {
        if self.id().is_none() {
            return Err(ValidationError::Required {
                field: "id".to_string(),
            });
        }
        self.set_updated_at(now);
        self.validate()
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Message enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageDirection {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(ValidationError::UnsupportedValue {
                field: "direction".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Template,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Location => "location",
            Self::Template => "template",
        }
    }

    /// Whether the message body is a media attachment
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Audio | Self::Document)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "document" => Ok(Self::Document),
            "location" => Ok(Self::Location),
            "template" => Ok(Self::Template),
            other => Err(ValidationError::UnsupportedValue {
                field: "type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery lifecycle of a message.
///
/// `queued -> sent -> delivered -> read` only ever moves forward; `failed`
/// is terminal and may be entered from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position in the forward lifecycle. `None` for the terminal state.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Queued => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(ValidationError::UnsupportedValue {
                field: "status".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// A WhatsApp message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Provider id; unique when present and used as the idempotency key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whatsapp_message_id: Option<String>,
    pub from_number: PhoneNumber,
    pub to_number: PhoneNumber,
    pub direction: MessageDirection,
    pub message_type: MessageType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_mime_type: Option<String>,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Provider time of the message, distinct from record bookkeeping
    pub timestamp: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Message {
    /// Build an inbound message as received from the provider.
    pub fn inbound(
        whatsapp_message_id: impl Into<String>,
        from_number: PhoneNumber,
        to_number: PhoneNumber,
        message_type: MessageType,
        content: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: None,
            whatsapp_message_id: Some(whatsapp_message_id.into()),
            from_number,
            to_number,
            direction: MessageDirection::Inbound,
            message_type,
            content: content.into(),
            media_url: None,
            media_mime_type: None,
            status: MessageStatus::Delivered,
            error_code: None,
            error_message: None,
            metadata: Metadata::new(),
            timestamp,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a queued outbound message awaiting dispatch.
    pub fn outbound(
        from_number: PhoneNumber,
        to_number: PhoneNumber,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: None,
            whatsapp_message_id: None,
            from_number,
            to_number,
            direction: MessageDirection::Outbound,
            message_type,
            content: content.into(),
            media_url: None,
            media_mime_type: None,
            status: MessageStatus::Queued,
            error_code: None,
            error_message: None,
            metadata: Metadata::new(),
            timestamp: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a terminal failure with the provider's error details.
    pub fn mark_failed(&mut self, code: Option<String>, message: Option<String>) {
        self.status = MessageStatus::Failed;
        self.error_code = code;
        self.error_message = message;
    }
}

impl Record for Message {
    const ID_PREFIX: &'static str = "msg";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    fn set_created_at(&mut self, at: Timestamp) {
        self.created_at = at;
    }

    fn set_updated_at(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(wamid) = &self.whatsapp_message_id {
            require_non_empty("whatsapp_message_id", wamid)?;
        }

        match self.message_type {
            MessageType::Text => require_non_empty("content", &self.content)?,
            MessageType::Template => require_non_empty("template_name", &self.content)?,
            _ => {}
        }

        if self.direction == MessageDirection::Outbound && self.message_type.is_media() {
            let url = self.media_url.as_deref().unwrap_or_default();
            require_non_empty("media_url", url)?;
        }

        Ok(())
    }
}

// ============================================================================
// Contact
// ============================================================================

/// A WhatsApp user the business has exchanged messages with.
///
/// Counters are denormalized and only change through message ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub phone_number: PhoneNumber,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message_count: u64,
    pub unread_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<Timestamp>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Contact {
    pub fn new(phone_number: PhoneNumber, name: Option<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: None,
            phone_number,
            name,
            message_count: 0,
            unread_count: 0,
            last_message_at: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Account for one newly ingested message.
    ///
    /// `last_message_at` only ever moves forward, so out-of-order deliveries
    /// cannot rewind it. A newly seen profile name replaces the stored one.
    pub fn record_message(&mut self, at: Timestamp, name: Option<&str>) {
        self.message_count += 1;
        self.unread_count += 1;
        self.last_message_at = Some(match self.last_message_at {
            Some(previous) => previous.max(at),
            None => at,
        });
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            self.name = Some(name.to_string());
        }
    }
}

impl Record for Contact {
    const ID_PREFIX: &'static str = "contact";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    fn set_created_at(&mut self, at: Timestamp) {
        self.created_at = at;
    }

    fn set_updated_at(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.unread_count > self.message_count {
            return Err(ValidationError::InvalidFormat {
                field: "unread_count".to_string(),
                message: "cannot exceed message_count".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// API key
// ============================================================================

/// Stored credential for an API caller. The plaintext key is never stored.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub name: String,
    /// Argon2id PHC string
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    /// First characters of the plaintext, used to narrow lookups
    pub key_prefix: String,
    pub permissions: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ApiKey {
    pub fn new(
        name: impl Into<String>,
        key_hash: impl Into<String>,
        key_prefix: impl Into<String>,
        permissions: impl IntoIterator<Item = String>,
        expires_at: Option<Timestamp>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: None,
            name: name.into(),
            key_hash: key_hash.into(),
            key_prefix: key_prefix.into(),
            permissions: permissions.into_iter().collect(),
            expires_at,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A key is expired strictly after its expiry instant.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Timestamp::now())
    }

    pub fn is_valid(&self) -> bool {
        !self.is_expired()
    }

    /// `*` grants every permission; otherwise exact membership.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(WILDCARD_PERMISSION) || self.permissions.contains(permission)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("key_hash", &"<REDACTED>")
            .field("key_prefix", &self.key_prefix)
            .field("permissions", &self.permissions)
            .field("expires_at", &self.expires_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl Record for ApiKey {
    const ID_PREFIX: &'static str = "key";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    fn set_created_at(&mut self, at: Timestamp) {
        self.created_at = at;
    }

    fn set_updated_at(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)?;
        require_non_empty("key_hash", &self.key_hash)?;
        require_non_empty("key_prefix", &self.key_prefix)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
