//! # Ingestion Coordinator
//!
//! Runs one webhook delivery through verification, normalization and the
//! state machine.
//!
//! The provider delivers at least once, so every step downstream of
//! verification must be safe to repeat. Per-event problems are collected in
//! the [`IngestionReport`] and never abort sibling events. A storage failure
//! is surfaced only after all siblings have been applied so that provider
//! redelivery acts as the retry.

use crate::state_machine::{MessageStateMachine, StateError};
use crate::webhook::normalizer::{normalize, RejectedEvent};
use crate::webhook::signature::{verify, WebhookSecret};
use crate::webhook::NormalizationError;
use crate::ErrorCategory;
use std::fmt;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Status,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => f.write_str("message"),
            Self::Status => f.write_str("status"),
        }
    }
}

/// An event that normalized cleanly but could not be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFailure {
    pub event_id: String,
    pub kind: EventKind,
    pub error: StateError,
}

/// Outcome of one webhook delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionReport {
    pub messages_created: usize,
    pub messages_duplicate: usize,
    pub statuses_applied: usize,
    /// Dropped during normalization
    pub rejected: Vec<RejectedEvent>,
    /// Failed while applying to the store
    pub failures: Vec<EventFailure>,
}

impl IngestionReport {
    /// Failures the store caused, as opposed to the event itself
    pub fn storage_failures(&self) -> impl Iterator<Item = &EventFailure> {
        self.failures.iter().filter(|f| f.error.is_storage_failure())
    }

    pub fn has_storage_failures(&self) -> bool {
        self.storage_failures().next().is_some()
    }

    /// Status events that referenced a message this gateway never stored
    pub fn unknown_messages(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().filter_map(|f| match &f.error {
            StateError::UnknownMessage {
                whatsapp_message_id,
            } => Some(whatsapp_message_id.as_str()),
            _ => None,
        })
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Verifies, normalizes and applies webhook deliveries
pub struct IngestionCoordinator {
    secret: Option<WebhookSecret>,
    state_machine: MessageStateMachine,
}

impl IngestionCoordinator {
    /// Create a coordinator.
    ///
    /// Without a secret no delivery can be verified, so every delivery is
    /// rejected.
    pub fn new(secret: Option<WebhookSecret>, state_machine: MessageStateMachine) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            state_machine,
        }
    }

    pub fn state_machine(&self) -> &MessageStateMachine {
        &self.state_machine
    }

    /// Process one webhook delivery.
    ///
    /// All message events are applied before any status event, whatever their
    /// order in the body, so a status for a message carried in the same
    /// delivery finds that message already stored.
    ///
    /// # Errors
    ///
    /// - [`IngestionError::Unauthorized`] when the signature is missing or
    ///   wrong, or no secret is configured
    /// - [`IngestionError::BadRequest`] when the body is not a webhook envelope
    /// - [`IngestionError::Database`] when any event failed in the store; all
    ///   other events have still been applied
    #[instrument(skip(self, raw_body, signature_header), fields(body_len = raw_body.len()))]
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<IngestionReport, IngestionError> {
        let Some(secret) = &self.secret else {
            warn!("Rejecting webhook: no webhook secret configured");
            return Err(IngestionError::Unauthorized {
                reason: "webhook secret not configured".to_string(),
            });
        };

        let Some(signature) = signature_header else {
            warn!("Rejecting webhook: signature header missing");
            return Err(IngestionError::Unauthorized {
                reason: "signature header missing".to_string(),
            });
        };

        if !verify(raw_body, signature, secret) {
            return Err(IngestionError::Unauthorized {
                reason: "signature mismatch".to_string(),
            });
        }

        let batch = normalize(raw_body).map_err(|e| {
            warn!(error = %e, "Rejecting webhook: payload could not be normalized");
            IngestionError::BadRequest(e)
        })?;

        let mut report = IngestionReport {
            rejected: batch.rejected,
            ..Default::default()
        };

        for rejected in &report.rejected {
            warn!(event_id = %rejected.event_id, reason = %rejected.reason, "Event rejected during normalization");
        }

        // Messages first so statuses in the same delivery can find them
        for event in &batch.message_events {
            match self.state_machine.apply_message_event(event).await {
                Ok((_, true)) => report.messages_created += 1,
                Ok((_, false)) => report.messages_duplicate += 1,
                Err(e) => report.failures.push(EventFailure {
                    event_id: event.whatsapp_message_id.clone(),
                    kind: EventKind::Message,
                    error: e,
                }),
            }
        }

        for event in &batch.status_events {
            match self.state_machine.apply_status_event(event).await {
                Ok(_) => report.statuses_applied += 1,
                Err(e) => report.failures.push(EventFailure {
                    event_id: event.whatsapp_message_id.clone(),
                    kind: EventKind::Status,
                    error: e,
                }),
            }
        }

        for failure in &report.failures {
            if failure.error.is_storage_failure() {
                error!(event_id = %failure.event_id, kind = %failure.kind, error = %failure.error, "Failed to persist event");
            } else {
                warn!(event_id = %failure.event_id, kind = %failure.kind, error = %failure.error, "Event not applied");
            }
        }

        info!(
            messages_created = report.messages_created,
            messages_duplicate = report.messages_duplicate,
            statuses_applied = report.statuses_applied,
            rejected = report.rejected.len(),
            failed = report.failures.len(),
            "Webhook delivery processed"
        );

        if report.has_storage_failures() {
            let failures = report.storage_failures().count();
            return Err(IngestionError::Database {
                failures,
                report: Box::new(report),
            });
        }

        Ok(report)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that fail a whole webhook delivery
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Webhook signature rejected: {reason}")]
    Unauthorized { reason: String },

    #[error("Bad webhook request: {0}")]
    BadRequest(NormalizationError),

    /// Some events could not be stored; the report covers every event
    #[error("{failures} event(s) could not be stored")]
    Database {
        failures: usize,
        report: Box<IngestionReport>,
    },
}

impl IngestionError {
    /// HTTP status the provider should see
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 403,
            Self::BadRequest(_) => 400,
            Self::Database { .. } => 500,
        }
    }

    /// Check if redelivery of the same payload may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { .. })
    }

    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorized { .. } => ErrorCategory::Security,
            Self::BadRequest(_) => ErrorCategory::Permanent,
            Self::Database { .. } => ErrorCategory::Transient,
        }
    }

    /// Per-event outcome, when processing got that far
    pub fn report(&self) -> Option<&IngestionReport> {
        match self {
            Self::Database { report, .. } => Some(report.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "ingestion_tests.rs"]
mod tests;
