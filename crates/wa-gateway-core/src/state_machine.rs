//! # Message State Machine
//!
//! Applies normalized webhook events to stored messages and contacts.
//!
//! Message events are idempotent on the provider message id: the first
//! application creates the message and bumps the sender's contact counters,
//! every later one returns the stored record untouched. Status events move a
//! message forward through `queued -> sent -> delivered -> read`; stale or
//! replayed statuses are no-ops, and `failed` is terminal.

use crate::models::{Message, MessageStatus};
use crate::storage::{MessageStore, StorageError};
use crate::webhook::normalizer::{DeliveryStatus, MessageContent, MessageEvent, StatusEvent};
use crate::{ErrorCategory, PhoneNumber};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Attempts made at a conditional status write before giving up
pub const DEFAULT_MAX_WRITE_ATTEMPTS: usize = 5;

// ============================================================================
// Transition rules
// ============================================================================

/// Why a status event leaves the stored message unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Incoming status does not move the lifecycle forward
    NotForward,
    /// Message already failed
    Terminal,
    /// Provider status with no lifecycle meaning
    UnknownStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply(MessageStatus),
    Ignore(IgnoreReason),
}

/// Decide what an incoming provider status does to a message in `current`.
pub fn decide_transition(current: MessageStatus, incoming: &DeliveryStatus) -> Transition {
    let Some(target) = incoming.as_message_status() else {
        return Transition::Ignore(IgnoreReason::UnknownStatus);
    };

    // Failure always wins so the latest error details are recorded
    if target.is_terminal() {
        return Transition::Apply(target);
    }

    match (current.rank(), target.rank()) {
        (None, _) => Transition::Ignore(IgnoreReason::Terminal),
        (Some(from), Some(to)) if to > from => Transition::Apply(target),
        _ => Transition::Ignore(IgnoreReason::NotForward),
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Applies inbound events against the store
pub struct MessageStateMachine {
    store: Arc<dyn MessageStore>,
    business_number: Option<PhoneNumber>,
    max_write_attempts: usize,
}

impl MessageStateMachine {
    /// Create a state machine.
    ///
    /// `business_number` is used as the recipient of inbound messages whose
    /// webhook change carries no phone metadata.
    pub fn new(store: Arc<dyn MessageStore>, business_number: Option<PhoneNumber>) -> Self {
        Self {
            store,
            business_number,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }

    pub fn with_max_write_attempts(mut self, attempts: usize) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    /// Persist an inbound message, at most once per provider message id.
    ///
    /// The message and the sender's contact counters are written in one
    /// store operation, so an event whose write failed is applied in full
    /// when the provider redelivers it.
    ///
    /// Returns the stored message and whether this call created it.
    #[instrument(skip(self, event), fields(whatsapp_message_id = %event.whatsapp_message_id))]
    pub async fn apply_message_event(
        &self,
        event: &MessageEvent,
    ) -> Result<(Message, bool), StateError> {
        if let Some(existing) = self
            .store
            .find_message_by_whatsapp_id(&event.whatsapp_message_id)
            .await?
        {
            debug!("Message already stored; skipping duplicate delivery");
            return Ok((existing, false));
        }

        let to_number = event
            .to_number
            .clone()
            .or_else(|| self.business_number.clone())
            .ok_or_else(|| StateError::MissingRecipient {
                whatsapp_message_id: event.whatsapp_message_id.clone(),
            })?;

        let message = inbound_message(event, to_number);

        let stored = match self
            .store
            .create_inbound_message(message, event.contact_name.as_deref())
            .await
        {
            Ok((stored, _contact)) => stored,
            Err(StorageError::Conflict { .. }) => {
                // A concurrent delivery of the same event won the insert
                debug!("Lost insert race for duplicate delivery");
                return self
                    .store
                    .find_message_by_whatsapp_id(&event.whatsapp_message_id)
                    .await?
                    .map(|existing| (existing, false))
                    .ok_or_else(|| {
                        StateError::Database(StorageError::NotFound {
                            entity: "message".to_string(),
                            id: event.whatsapp_message_id.clone(),
                        })
                    });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            message_id = ?stored.id,
            from = %stored.from_number,
            message_type = %stored.message_type,
            "Stored inbound message"
        );

        Ok((stored, true))
    }

    /// Move a stored message forward according to a provider status.
    ///
    /// Returns the message as stored after the event, which is unchanged when
    /// the event is ignored.
    ///
    /// # Errors
    ///
    /// - [`StateError::UnknownMessage`] if no message has the event's id
    /// - [`StateError::WriteContention`] if concurrent writers kept winning
    /// - [`StateError::Database`] for any other storage failure
    #[instrument(skip(self, event), fields(
        whatsapp_message_id = %event.whatsapp_message_id,
        status = %event.status.as_str()
    ))]
    pub async fn apply_status_event(&self, event: &StatusEvent) -> Result<Message, StateError> {
        for attempt in 1..=self.max_write_attempts {
            let current = self
                .store
                .find_message_by_whatsapp_id(&event.whatsapp_message_id)
                .await?
                .ok_or_else(|| StateError::UnknownMessage {
                    whatsapp_message_id: event.whatsapp_message_id.clone(),
                })?;

            let target = match decide_transition(current.status, &event.status) {
                Transition::Apply(target) => target,
                Transition::Ignore(reason) => {
                    match reason {
                        IgnoreReason::UnknownStatus => {
                            warn!("Ignoring unknown provider status")
                        }
                        IgnoreReason::Terminal => {
                            info!(current = %current.status, "Ignoring status for failed message")
                        }
                        IgnoreReason::NotForward => {
                            debug!(current = %current.status, "Ignoring stale status")
                        }
                    }
                    return Ok(current);
                }
            };

            let mut updated = current.clone();
            if target == MessageStatus::Failed {
                let (code, message) = match &event.error {
                    Some(error) => (
                        error.code.clone(),
                        error.message.clone().or_else(|| Some(error.title.clone())),
                    ),
                    None => (None, None),
                };
                updated.mark_failed(code, message);
            } else {
                updated.status = target;
            }

            match self
                .store
                .update_message_if_status(updated, current.status)
                .await
            {
                Ok(stored) => {
                    info!(from = %current.status, to = %stored.status, "Applied status transition");
                    return Ok(stored);
                }
                Err(StorageError::StaleWrite { actual, .. }) => {
                    debug!(attempt, actual = %actual, "Status changed concurrently; re-deciding");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StateError::WriteContention {
            whatsapp_message_id: event.whatsapp_message_id.clone(),
            attempts: self.max_write_attempts,
        })
    }
}

fn inbound_message(event: &MessageEvent, to_number: PhoneNumber) -> Message {
    let mut message = Message::inbound(
        event.whatsapp_message_id.clone(),
        event.from_number.clone(),
        to_number,
        event.content.message_type(),
        event.content.display_text(),
        event.timestamp,
    );

    if let Some(media) = event.content.media() {
        message.media_mime_type = media.mime_type.clone();
        message
            .metadata
            .insert("media_id".to_string(), media.id.clone().into());
        if let Some(sha256) = &media.sha256 {
            message
                .metadata
                .insert("media_sha256".to_string(), sha256.clone().into());
        }
    }

    match &event.content {
        MessageContent::Audio { voice: true, .. } => {
            message.metadata.insert("voice".to_string(), true.into());
        }
        MessageContent::Location {
            latitude,
            longitude,
            ..
        } => {
            message
                .metadata
                .insert("latitude".to_string(), (*latitude).into());
            message
                .metadata
                .insert("longitude".to_string(), (*longitude).into());
        }
        _ => {}
    }

    if let Some(reply_to) = &event.reply_to {
        message
            .metadata
            .insert("reply_to".to_string(), reply_to.clone().into());
    }

    message
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that occur while applying events
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Status event for a message this gateway never stored
    #[error("No message with provider id {whatsapp_message_id}")]
    UnknownMessage { whatsapp_message_id: String },

    /// Neither the webhook nor configuration names the receiving number
    #[error("Cannot resolve recipient number for {whatsapp_message_id}")]
    MissingRecipient { whatsapp_message_id: String },

    #[error("Gave up on {whatsapp_message_id} after {attempts} conflicting writes")]
    WriteContention {
        whatsapp_message_id: String,
        attempts: usize,
    },

    #[error("Database error: {0}")]
    Database(#[from] StorageError),
}

impl StateError {
    /// Check if error is transient and may succeed on redelivery
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => e.is_transient(),
            Self::WriteContention { .. } => true,
            Self::UnknownMessage { .. } | Self::MissingRecipient { .. } => false,
        }
    }

    /// Whether the failure came from the store rather than the event itself
    pub fn is_storage_failure(&self) -> bool {
        match self {
            Self::Database(StorageError::Validation(_)) => false,
            Self::Database(_) | Self::WriteContention { .. } => true,
            Self::UnknownMessage { .. } | Self::MissingRecipient { .. } => false,
        }
    }

    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::UnknownMessage { .. } => ErrorCategory::Permanent,
            Self::MissingRecipient { .. } => ErrorCategory::Configuration,
            Self::WriteContention { .. } => ErrorCategory::Transient,
            Self::Database(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Database(_) => ErrorCategory::Permanent,
        }
    }
}

#[cfg(test)]
#[path = "state_machine_tests.rs"]
mod tests;
