//! # WA-Gateway Core
//!
//! Core business logic for the WhatsApp Business gateway.
//!
//! This crate contains the domain logic for ingesting WhatsApp Cloud API
//! webhooks (signature verification, payload normalization, idempotent
//! persistence and the message status lifecycle), authenticating API callers,
//! and dispatching outbound messages.
//!
//! ## Architecture
//!
//! The core follows clean architecture principles:
//! - Business logic depends only on trait abstractions ([`storage::MessageStore`],
//!   [`outbound::MessageSender`])
//! - Infrastructure implementations are injected at runtime
//! - No process-wide state: configuration values are passed to constructors
//!
//! ## Usage
//!
//! ```rust
//! use wa_gateway_core::{PhoneNumber, RecordId};
//!
//! let phone = PhoneNumber::new("+15551234567").unwrap();
//! let id = RecordId::generate("msg");
//! assert!(id.as_str().starts_with("msg_"));
//! assert_eq!(phone.as_str(), "+15551234567");
//! ```

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

// Re-export commonly used types
pub use uuid::Uuid;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Identifier of a persisted record.
///
/// Generated identifiers carry a short entity prefix followed by a UUID,
/// e.g. `msg_6f1c...`, so that ids remain recognisable in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a new identifier with the given prefix
    pub fn generate(prefix: &str) -> Self {
        let id = Uuid::new_v4();
        if prefix.is_empty() {
            Self(id.to_string())
        } else {
            Self(format!("{}_{}", prefix, id))
        }
    }

    /// Wrap an existing identifier value
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "id".to_string(),
            });
        }
        if value.len() > 100 {
            return Err(ValidationError::TooLong {
                field: "id".to_string(),
                max_length: 100,
            });
        }
        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

fn e164_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("E.164 pattern is valid"))
}

/// Phone number in E.164 format (`+` followed by up to 15 digits)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Create a phone number, validating the E.164 format
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "phone_number".to_string(),
            });
        }

        if !e164_pattern().is_match(&value) {
            return Err(ValidationError::InvalidFormat {
                field: "phone_number".to_string(),
                message: format!("'{}' is not an E.164 number", value),
            });
        }

        Ok(Self(value))
    }

    /// Build a phone number from a provider `wa_id`.
    ///
    /// WhatsApp identifies users by their number without the leading `+`;
    /// separators that sometimes appear in display numbers are dropped.
    pub fn from_wa_id(wa_id: &str) -> Result<Self, ValidationError> {
        let digits: String = wa_id.chars().filter(|c| c.is_ascii_digit()).collect();
        Self::new(format!("+{}", digits))
    }

    /// Accept a caller-supplied number, tolerating common separators.
    ///
    /// Spaces, dashes and parentheses are removed and a missing leading `+`
    /// is added before validating.
    pub fn normalize(input: &str) -> Result<Self, ValidationError> {
        let cleaned: String = input
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
            .collect();

        if cleaned.is_empty() || cleaned.starts_with('+') {
            Self::new(cleaned)
        } else {
            Self::new(format!("+{}", cleaned))
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

// ============================================================================
// Time and Metadata Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Parse a provider timestamp: decimal seconds since the Unix epoch
    pub fn from_unix_seconds(s: &str) -> Result<Self, ParseError> {
        let seconds = s
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidFormat {
                expected: "decimal seconds since epoch".to_string(),
                actual: s.to_string(),
            })?;

        Utc.timestamp_opt(seconds, 0)
            .single()
            .map(Self)
            .ok_or_else(|| ParseError::InvalidFormat {
                expected: "timestamp within supported range".to_string(),
                actual: s.to_string(),
            })
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Seconds since the Unix epoch
    pub fn unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    /// Add seconds to timestamp
    pub fn add_seconds(&self, seconds: i64) -> Self {
        Self(self.0 + chrono::Duration::seconds(seconds))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Deployment environment enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl FromStr for Environment {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ParseError::InvalidFormat {
                expected: "development, staging, or production".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// Logging level configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(ParseError::InvalidFormat {
                expected: "error, warn, info, debug, or trace".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// High-level error categorization for retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Temporary failures that may succeed on redelivery
    Transient,
    /// Permanent failures that won't succeed on retry
    Permanent,
    /// Security-related failures (bad signatures, bad credentials)
    Security,
    /// Configuration errors preventing startup
    Configuration,
}

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' has unsupported value '{value}'")]
    UnsupportedValue { field: String, value: String },
}

/// Error type for string parsing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Persisted entities: messages, contacts and API keys
pub mod models;

/// Storage collaborator interface and pagination
pub mod storage;

/// Infrastructure implementations of the storage interface
pub mod adapters;

/// Webhook envelope, signature verification and normalization
pub mod webhook;

/// Message status lifecycle
pub mod state_machine;

/// Per-delivery webhook orchestration
pub mod ingestion;

/// API key authentication and authorization
pub mod auth;

/// Outbound message dispatch
pub mod outbound;

// Re-export key types for convenience
pub use adapters::InMemoryMessageStore;
pub use auth::{ApiKeyAuthenticator, AuthError, IssuedApiKey, Permission};
pub use ingestion::{IngestionCoordinator, IngestionError, IngestionReport};
pub use models::{
    ApiKey, Contact, Message, MessageDirection, MessageStatus, MessageType, Metadata,
};
pub use outbound::{
    CloudApiClient, CloudApiConfig, DispatchError, Dispatched, MessageSender, OutboundDispatcher,
    SendError, SendMessageRequest,
};
pub use state_machine::{MessageStateMachine, StateError};
pub use storage::{MessageStore, Page, Pagination, StorageError};
pub use webhook::{
    normalizer::{normalize, MessageContent, MessageEvent, NormalizedBatch, StatusEvent},
    signature::{sign, verify, WebhookSecret},
    NormalizationError,
};

#[cfg(test)]
mod test_support;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
