//! Flattens a webhook envelope into ordered message and status events.
//!
//! Problems that affect a single event (a bad timestamp, an item missing a
//! required field, an unsupported message type) are recorded in [`NormalizedBatch::rejected`] and never
//! stop sibling events from being produced. Only a body that cannot be read
//! as an envelope at all fails the whole delivery.

use super::{
    ChangeValue, MediaPayload, MessagePayload, NormalizationError, StatusPayload, WebhookEnvelope,
};
use crate::models::{MessageStatus, MessageType};
use crate::{PhoneNumber, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ============================================================================
// Normalized Events
// ============================================================================

/// Media reference attached to an inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub id: String,
    pub mime_type: Option<String>,
    pub sha256: Option<String>,
    pub caption: Option<String>,
}

impl From<&MediaPayload> for MediaAttachment {
    fn from(payload: &MediaPayload) -> Self {
        Self {
            id: payload.id.clone(),
            mime_type: payload.mime_type.clone(),
            sha256: payload.sha256.clone(),
            caption: payload.caption.clone(),
        }
    }
}

/// Inbound message body, one variant per supported type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Image {
        media: MediaAttachment,
    },
    Video {
        media: MediaAttachment,
    },
    Audio {
        media: MediaAttachment,
        voice: bool,
    },
    Document {
        media: MediaAttachment,
        filename: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
}

impl MessageContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::Image { .. } => MessageType::Image,
            Self::Video { .. } => MessageType::Video,
            Self::Audio { .. } => MessageType::Audio,
            Self::Document { .. } => MessageType::Document,
            Self::Location { .. } => MessageType::Location,
        }
    }

    pub fn media(&self) -> Option<&MediaAttachment> {
        match self {
            Self::Image { media }
            | Self::Video { media }
            | Self::Audio { media, .. }
            | Self::Document { media, .. } => Some(media),
            Self::Text { .. } | Self::Location { .. } => None,
        }
    }

    /// Human readable body stored as the message `content`
    pub fn display_text(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Document { media, filename } => media
                .caption
                .clone()
                .or_else(|| filename.clone())
                .unwrap_or_default(),
            Self::Image { media } | Self::Video { media } | Self::Audio { media, .. } => {
                media.caption.clone().unwrap_or_default()
            }
            Self::Location {
                latitude,
                longitude,
                name,
                address,
            } => {
                let label = [name.as_deref(), address.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(", ");
                if label.is_empty() {
                    format!("{},{}", latitude, longitude)
                } else {
                    format!("{} ({},{})", label, latitude, longitude)
                }
            }
        }
    }
}

/// One inbound message from a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub whatsapp_message_id: String,
    pub from_number: PhoneNumber,
    /// Receiving business number, when the change metadata carries one
    pub to_number: Option<PhoneNumber>,
    /// Sender profile name from the change's contacts list
    pub contact_name: Option<String>,
    pub timestamp: Timestamp,
    pub content: MessageContent,
    /// Provider id of the message this one replies to
    pub reply_to: Option<String>,
}

/// Provider delivery status. Unknown values pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
    Other(String),
}

impl DeliveryStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }

    /// Lifecycle status this provider status maps onto, if any
    pub fn as_message_status(&self) -> Option<MessageStatus> {
        match self {
            Self::Sent => Some(MessageStatus::Sent),
            Self::Delivered => Some(MessageStatus::Delivered),
            Self::Read => Some(MessageStatus::Read),
            Self::Failed => Some(MessageStatus::Failed),
            Self::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Other(value) => value,
        }
    }
}

/// Error details reported with a `failed` status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    /// Provider error code, rendered as text whether it arrived as a number or a string
    pub code: Option<String>,
    pub title: String,
    pub message: Option<String>,
}

/// One status update from a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub whatsapp_message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: Timestamp,
    pub recipient_id: String,
    /// Only populated when `status` is [`DeliveryStatus::Failed`]
    pub error: Option<StatusError>,
}

/// An event dropped during normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEvent {
    pub event_id: String,
    pub reason: NormalizationError,
}

/// Normalized output of one webhook delivery, in delivery order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub message_events: Vec<MessageEvent>,
    pub status_events: Vec<StatusEvent>,
    pub rejected: Vec<RejectedEvent>,
}

// ============================================================================
// Normalization
// ============================================================================

/// Parse a raw webhook body and flatten it into events.
///
/// # Errors
///
/// Returns [`NormalizationError::InvalidPayload`] when the body is not JSON,
/// when the top-level `object` field is missing or not a string, or when the
/// envelope structure cannot be read.
pub fn normalize(raw_body: &[u8]) -> Result<NormalizedBatch, NormalizationError> {
    let value: serde_json::Value =
        serde_json::from_slice(raw_body).map_err(|e| NormalizationError::InvalidPayload {
            message: format!("body is not JSON: {}", e),
        })?;

    match value.get("object") {
        Some(serde_json::Value::String(_)) => {}
        Some(_) => {
            return Err(NormalizationError::InvalidPayload {
                message: "field 'object' is not a string".to_string(),
            })
        }
        None => {
            return Err(NormalizationError::InvalidPayload {
                message: "field 'object' is missing".to_string(),
            })
        }
    }

    let envelope: WebhookEnvelope =
        serde_json::from_value(value).map_err(|e| NormalizationError::InvalidPayload {
            message: format!("unexpected envelope structure: {}", e),
        })?;

    Ok(flatten(&envelope))
}

/// Flatten an already parsed envelope.
pub fn flatten(envelope: &WebhookEnvelope) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();

    for change in envelope.entry.iter().flat_map(|entry| entry.changes.iter()) {
        flatten_change(&change.value, &mut batch);
    }

    debug!(
        object = %envelope.object,
        messages = batch.message_events.len(),
        statuses = batch.status_events.len(),
        rejected = batch.rejected.len(),
        "Normalized webhook envelope"
    );

    batch
}

fn flatten_change(value: &ChangeValue, batch: &mut NormalizedBatch) {
    let business_number = value
        .metadata
        .as_ref()
        .and_then(|m| m.display_phone_number.as_deref())
        .and_then(|n| PhoneNumber::from_wa_id(n).ok());

    let profile_names: HashMap<&str, &str> = value
        .contacts
        .iter()
        .filter_map(|c| {
            let name = c.profile.as_ref()?.name.as_deref()?;
            Some((c.wa_id.as_str(), name))
        })
        .collect();

    for item in &value.messages {
        let result = parse_item::<MessagePayload>(item)
            .and_then(|message| message_event(&message, business_number.as_ref(), &profile_names));
        match result {
            Ok(event) => batch.message_events.push(event),
            Err(reason) => batch.rejected.push(RejectedEvent {
                event_id: item_id(item),
                reason,
            }),
        }
    }

    for item in &value.statuses {
        match parse_item::<StatusPayload>(item).and_then(|status| status_event(&status)) {
            Ok(event) => batch.status_events.push(event),
            Err(reason) => batch.rejected.push(RejectedEvent {
                event_id: item_id(item),
                reason,
            }),
        }
    }
}

/// Provider id of a raw item, or empty when it has none
fn item_id(item: &serde_json::Value) -> String {
    item.get("id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_item<T: DeserializeOwned>(item: &serde_json::Value) -> Result<T, NormalizationError> {
    T::deserialize(item).map_err(|e| NormalizationError::MalformedEvent {
        event_id: item_id(item),
        message: e.to_string(),
    })
}

/// Parse decimal epoch seconds carried as a JSON string.
///
/// Numbers and absent values are rejected; the provider always sends a string.
fn event_timestamp(
    event_id: &str,
    value: Option<&serde_json::Value>,
) -> Result<Timestamp, NormalizationError> {
    let malformed = |rendered: String| NormalizationError::MalformedTimestamp {
        event_id: event_id.to_string(),
        value: rendered,
    };

    match value {
        Some(serde_json::Value::String(text)) => {
            Timestamp::from_unix_seconds(text).map_err(|_| malformed(text.clone()))
        }
        Some(other) => Err(malformed(other.to_string())),
        None => Err(malformed(String::new())),
    }
}

/// Render a provider error code; null and structured values count as absent
fn error_code(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(code) => Some(code.clone()),
        serde_json::Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

fn message_event(
    message: &MessagePayload,
    business_number: Option<&PhoneNumber>,
    profile_names: &HashMap<&str, &str>,
) -> Result<MessageEvent, NormalizationError> {
    let timestamp = event_timestamp(&message.id, message.timestamp.as_ref())?;

    let from_number = PhoneNumber::from_wa_id(&message.from).map_err(|_| {
        NormalizationError::InvalidPhoneNumber {
            event_id: message.id.clone(),
            value: message.from.clone(),
        }
    })?;

    let content = message_content(message)?;

    Ok(MessageEvent {
        whatsapp_message_id: message.id.clone(),
        from_number,
        to_number: business_number.cloned(),
        contact_name: profile_names
            .get(message.from.as_str())
            .map(|name| name.to_string()),
        timestamp,
        content,
        reply_to: message.context.as_ref().and_then(|c| c.id.clone()),
    })
}

fn message_content(message: &MessagePayload) -> Result<MessageContent, NormalizationError> {
    let missing = || NormalizationError::MissingContent {
        event_id: message.id.clone(),
        message_type: message.message_type.clone(),
    };

    match message.message_type.as_str() {
        "text" => {
            let text = message.text.as_ref().ok_or_else(missing)?;
            Ok(MessageContent::Text {
                body: text.body.clone(),
            })
        }
        "image" => {
            let media = message.image.as_ref().ok_or_else(missing)?;
            Ok(MessageContent::Image {
                media: media.into(),
            })
        }
        "video" => {
            let media = message.video.as_ref().ok_or_else(missing)?;
            Ok(MessageContent::Video {
                media: media.into(),
            })
        }
        "audio" | "voice" => {
            let media = message
                .audio
                .as_ref()
                .or(message.voice.as_ref())
                .ok_or_else(missing)?;
            let voice = message.message_type == "voice"
                || message.voice.is_some()
                || media.voice.unwrap_or(false);
            Ok(MessageContent::Audio {
                media: media.into(),
                voice,
            })
        }
        "document" => {
            let media = message.document.as_ref().ok_or_else(missing)?;
            Ok(MessageContent::Document {
                media: media.into(),
                filename: media.filename.clone(),
            })
        }
        "location" => {
            let location = message.location.as_ref().ok_or_else(missing)?;
            Ok(MessageContent::Location {
                latitude: location.latitude,
                longitude: location.longitude,
                name: location.name.clone(),
                address: location.address.clone(),
            })
        }
        other => Err(NormalizationError::UnsupportedMessageType {
            event_id: message.id.clone(),
            message_type: other.to_string(),
        }),
    }
}

fn status_event(status: &StatusPayload) -> Result<StatusEvent, NormalizationError> {
    let timestamp = event_timestamp(&status.id, status.timestamp.as_ref())?;

    let delivery_status = DeliveryStatus::parse(&status.status);

    let error = match delivery_status {
        DeliveryStatus::Failed => status.errors.first().map(|e| StatusError {
            code: error_code(e.code.as_ref()),
            title: e.title.clone(),
            message: e.message.clone(),
        }),
        _ => None,
    };

    Ok(StatusEvent {
        whatsapp_message_id: status.id.clone(),
        status: delivery_status,
        timestamp,
        recipient_id: status.recipient_id.clone(),
        error,
    })
}

#[cfg(test)]
#[path = "normalizer_tests.rs"]
mod tests;
