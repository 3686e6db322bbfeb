//! # Webhook Processing Module
//!
//! Handles incoming WhatsApp Cloud API webhook deliveries.
//!
//! This module contains:
//! - The wire envelope as the provider sends it
//! - Signature verification ([`signature`])
//! - Flattening of the envelope into per-event records ([`normalizer`])

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod normalizer;
pub mod signature;

pub use normalizer::{
    normalize, DeliveryStatus, MediaAttachment, MessageContent, MessageEvent, NormalizedBatch,
    RejectedEvent, StatusError, StatusEvent,
};
pub use signature::{sign, verify, WebhookSecret};

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

// ============================================================================
// Wire Envelope
// ============================================================================

/// Root webhook payload, typically with `object = "whatsapp_business_account"`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEnvelope {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

/// One business account's batch of changes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Entry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Change {
    /// The field that changed, e.g. `messages`
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messaging_product: Option<String>,
    #[serde(default)]
    pub metadata: Option<PhoneMetadata>,
    #[serde(default)]
    pub contacts: Vec<ContactPayload>,
    /// Kept untyped so one malformed item cannot fail its siblings
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub statuses: Vec<serde_json::Value>,
}

/// The receiving business number
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhoneMetadata {
    #[serde(default)]
    pub display_phone_number: Option<String>,
    #[serde(default)]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContactPayload {
    #[serde(default)]
    pub profile: Option<ProfilePayload>,
    #[serde(default)]
    pub wa_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfilePayload {
    #[serde(default)]
    pub name: Option<String>,
}

/// Inbound message as sent by the provider.
///
/// Exactly one of the content fields is expected to be populated, selected by
/// `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagePayload {
    pub from: String,
    pub id: String,
    /// Decimal epoch seconds; anything else is rejected with the event
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<MediaPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<MediaPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationPayload>,
    /// Present when the message replies to an earlier one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextPayload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextPayload {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaPayload {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    /// Set on audio recorded as a voice note
    #[serde(default)]
    pub voice: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextPayload {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Delivery status update for a previously sent message
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusPayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub errors: Vec<StatusErrorPayload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusErrorPayload {
    /// Numeric in practice, but accepted as any JSON scalar
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that occur during payload normalization
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    /// The delivery as a whole cannot be parsed
    #[error("Invalid webhook payload: {message}")]
    InvalidPayload { message: String },

    /// One event carried an unparsable timestamp
    #[error("Malformed timestamp '{value}' on {event_id}")]
    MalformedTimestamp { event_id: String, value: String },

    #[error("Unsupported message type '{message_type}' on {event_id}")]
    UnsupportedMessageType {
        event_id: String,
        message_type: String,
    },

    /// The payload variant named by `type` is absent
    #[error("Message {event_id} of type '{message_type}' has no content")]
    MissingContent {
        event_id: String,
        message_type: String,
    },

    #[error("Invalid phone number '{value}' on {event_id}")]
    InvalidPhoneNumber { event_id: String, value: String },

    /// One item in `messages` or `statuses` does not have the expected shape
    #[error("Malformed event {event_id}: {message}")]
    MalformedEvent { event_id: String, message: String },
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
