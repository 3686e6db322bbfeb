//! # Outbound Dispatch
//!
//! Accepts send requests from authenticated callers, records them as queued
//! outbound messages and hands the provider call to a background task.
//!
//! The provider call is fire-and-forget from the caller's point of view: the
//! task records `sent` plus the provider message id on success, or `failed`
//! plus the provider error otherwise. Failed sends are not retried.

use crate::models::{Message, MessageStatus, MessageType};
use crate::storage::{MessageStore, StorageError};
use crate::{ErrorCategory, PhoneNumber, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

pub mod cloud_api;

pub use cloud_api::{CloudApiClient, CloudApiConfig};

/// Longest text body the Cloud API accepts
pub const MAX_TEXT_LENGTH: usize = 4096;

/// Longest media caption the Cloud API accepts
pub const MAX_CAPTION_LENGTH: usize = 1024;

// ============================================================================
// Request validation
// ============================================================================

/// Send request as submitted by an API caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
}

/// Provider-ready message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Media {
        kind: MessageType,
        link: String,
        caption: Option<String>,
        filename: Option<String>,
    },
    Template {
        name: String,
        language: String,
        parameters: Vec<String>,
    },
}

impl OutboundContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::Media { kind, .. } => *kind,
            Self::Template { .. } => MessageType::Template,
        }
    }
}

/// A validated message ready to hand to a [`MessageSender`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: PhoneNumber,
    pub content: OutboundContent,
}

fn non_empty(field: &str, value: Option<&str>) -> Result<String, ValidationError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ValidationError::Required {
            field: field.to_string(),
        }),
    }
}

fn max_length(field: &str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max_length: max,
        });
    }
    Ok(())
}

impl SendMessageRequest {
    /// Check the request and turn it into a provider-ready message.
    pub fn validate(&self) -> Result<OutboundMessage, ValidationError> {
        let to = PhoneNumber::normalize(&self.to)?;
        let message_type: MessageType = self.message_type.parse()?;

        let content = match message_type {
            MessageType::Text => {
                let body = non_empty("content", self.content.as_deref())?;
                max_length("content", &body, MAX_TEXT_LENGTH)?;
                OutboundContent::Text { body }
            }
            MessageType::Image | MessageType::Video | MessageType::Audio | MessageType::Document => {
                let link = non_empty("media_url", self.media_url.as_deref())?;
                let parsed = url::Url::parse(&link).map_err(|e| ValidationError::InvalidFormat {
                    field: "media_url".to_string(),
                    message: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ValidationError::InvalidFormat {
                        field: "media_url".to_string(),
                        message: "must be an http or https URL".to_string(),
                    });
                }

                // Audio cannot carry a caption on the Cloud API
                let caption = match message_type {
                    MessageType::Audio => None,
                    _ => self.caption.clone().filter(|c| !c.trim().is_empty()),
                };
                if let Some(caption) = &caption {
                    max_length("caption", caption, MAX_CAPTION_LENGTH)?;
                }

                let filename = match message_type {
                    MessageType::Document => self.filename.clone().filter(|f| !f.trim().is_empty()),
                    _ => None,
                };

                OutboundContent::Media {
                    kind: message_type,
                    link,
                    caption,
                    filename,
                }
            }
            MessageType::Template => {
                let name = non_empty("template_name", self.template_name.as_deref())?;
                let language = non_empty("template_language", self.template_language.as_deref())?;
                if language.len() != 2 && language.len() != 5 {
                    return Err(ValidationError::InvalidFormat {
                        field: "template_language".to_string(),
                        message: format!("'{}' is not a language code like 'en' or 'en_US'", language),
                    });
                }
                OutboundContent::Template {
                    name,
                    language,
                    parameters: self.parameters.clone(),
                }
            }
            MessageType::Location => {
                return Err(ValidationError::UnsupportedValue {
                    field: "type".to_string(),
                    value: "location".to_string(),
                })
            }
        };

        Ok(OutboundMessage { to, content })
    }
}

// ============================================================================
// Provider seam
// ============================================================================

/// Provider acknowledgement of an accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub whatsapp_message_id: String,
}

/// Interface to the messaging provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Submit one message to the provider.
    ///
    /// # Errors
    ///
    /// - [`SendError::Rejected`] if the provider refused the message
    /// - [`SendError::Transport`] if the provider could not be reached
    /// - [`SendError::InvalidResponse`] if the reply could not be understood
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError>;
}

/// Errors reported by a [`MessageSender`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Provider rejected message ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Provider unreachable: {message}")]
    Transport { message: String },

    #[error("Unexpected provider response: {message}")]
    InvalidResponse { message: String },
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Transport { .. } => true,
            Self::InvalidResponse { .. } => false,
        }
    }

    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::Rejected { status: 401, .. } | Self::Rejected { status: 403, .. } => {
                ErrorCategory::Configuration
            }
            e if e.is_transient() => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    /// Error code recorded on the failed message
    pub fn code(&self) -> String {
        match self {
            Self::Rejected {
                code: Some(code), ..
            } => code.clone(),
            Self::Rejected { status, .. } => status.to_string(),
            Self::Transport { .. } => "transport_error".to_string(),
            Self::InvalidResponse { .. } => "invalid_response".to_string(),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// A queued message plus the background task delivering it
#[derive(Debug)]
pub struct Dispatched {
    pub message: Message,
    /// Resolves to the message as recorded after the provider call
    pub delivery: JoinHandle<Option<Message>>,
}

/// Queues outbound messages and delivers them in the background
#[derive(Clone)]
pub struct OutboundDispatcher {
    store: Arc<dyn MessageStore>,
    sender: Arc<dyn MessageSender>,
    business_number: PhoneNumber,
}

impl OutboundDispatcher {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sender: Arc<dyn MessageSender>,
        business_number: PhoneNumber,
    ) -> Self {
        Self {
            store,
            sender,
            business_number,
        }
    }

    /// Validate, persist as `queued`, and spawn delivery.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] if the request is malformed
    /// - [`DispatchError::Storage`] if the queued message cannot be stored
    #[instrument(skip(self, request), fields(message_type = %request.message_type))]
    pub async fn dispatch(&self, request: &SendMessageRequest) -> Result<Dispatched, DispatchError> {
        let outbound = request.validate()?;
        let message = self.queued_message(&outbound);
        let message = self.store.create_message(message).await?;

        info!(message_id = ?message.id, to = %outbound.to, "Queued outbound message");

        let store = self.store.clone();
        let sender = self.sender.clone();
        let queued = message.clone();
        let delivery = tokio::spawn(async move { deliver(store, sender, queued, outbound).await });

        Ok(Dispatched { message, delivery })
    }

    fn queued_message(&self, outbound: &OutboundMessage) -> Message {
        let (content, media_url) = match &outbound.content {
            OutboundContent::Text { body } => (body.clone(), None),
            OutboundContent::Media {
                link,
                caption,
                filename,
                ..
            } => (
                caption.clone().or_else(|| filename.clone()).unwrap_or_default(),
                Some(link.clone()),
            ),
            OutboundContent::Template { name, .. } => (name.clone(), None),
        };

        let mut message = Message::outbound(
            self.business_number.clone(),
            outbound.to.clone(),
            outbound.content.message_type(),
            content,
        );
        message.media_url = media_url;

        if let OutboundContent::Template {
            language,
            parameters,
            ..
        } = &outbound.content
        {
            message
                .metadata
                .insert("template_language".to_string(), language.clone().into());
            message.metadata.insert(
                "template_parameters".to_string(),
                serde_json::Value::from(parameters.clone()),
            );
        }

        message
    }
}

async fn deliver(
    store: Arc<dyn MessageStore>,
    sender: Arc<dyn MessageSender>,
    queued: Message,
    outbound: OutboundMessage,
) -> Option<Message> {
    let mut updated = queued.clone();

    match sender.send(&outbound).await {
        Ok(receipt) => {
            info!(
                message_id = ?queued.id,
                whatsapp_message_id = %receipt.whatsapp_message_id,
                "Provider accepted message"
            );
            updated.status = MessageStatus::Sent;
            updated.whatsapp_message_id = Some(receipt.whatsapp_message_id);
        }
        Err(e) => {
            warn!(message_id = ?queued.id, error = %e, transient = e.is_transient(), "Provider send failed");
            updated.mark_failed(Some(e.code()), Some(e.to_string()));
        }
    }

    match store
        .update_message_if_status(updated, MessageStatus::Queued)
        .await
    {
        Ok(stored) => Some(stored),
        Err(e) => {
            error!(message_id = ?queued.id, error = %e, "Failed to record send result");
            None
        }
    }
}

/// Errors that stop a send request from being queued
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid send request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Storage(e) => e.is_transient(),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
