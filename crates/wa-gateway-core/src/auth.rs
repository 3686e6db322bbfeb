//! # API Key Authentication
//!
//! Authenticates outbound API callers by API key and checks their
//! permission scopes.
//!
//! Keys are stored as an Argon2id PHC hash plus the first characters of the
//! plaintext, which narrows the candidates that need the (deliberately slow)
//! hash verification.

use crate::models::ApiKey;
use crate::storage::{MessageStore, StorageError};
use crate::{ErrorCategory, Timestamp};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Number of plaintext characters stored for lookup
pub const KEY_PREFIX_LEN: usize = 8;

/// Random bytes in a generated key
pub const KEY_BYTES: usize = 32;

/// Permission scopes checked by the HTTP surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    SendMessage,
    ReadMessages,
    ReadContacts,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::ReadMessages => "read_messages",
            Self::ReadContacts => "read_contacts",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A freshly issued key. The plaintext is only ever available here.
#[derive(Clone)]
pub struct IssuedApiKey {
    pub key: ApiKey,
    pub plaintext: String,
}

impl fmt::Debug for IssuedApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedApiKey")
            .field("key", &self.key)
            .field("plaintext", &"<REDACTED>")
            .finish()
    }
}

// ============================================================================
// Hashing helpers
// ============================================================================

/// Hash a plaintext key into an Argon2id PHC string.
pub fn hash_api_key(plaintext: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hashing {
            message: e.to_string(),
        })
}

/// Check a plaintext key against a stored PHC string.
///
/// An unparsable hash never verifies.
pub fn verify_api_key(plaintext: &str, key_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(key_hash) else {
        warn!("Stored API key hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

/// Plaintext characters used to narrow key lookups
pub fn key_prefix(plaintext: &str) -> Option<&str> {
    plaintext.get(..KEY_PREFIX_LEN)
}

fn generate_plaintext_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

// ============================================================================
// Authenticator
// ============================================================================

/// Authenticates API keys against the store
#[derive(Clone)]
pub struct ApiKeyAuthenticator {
    store: Arc<dyn MessageStore>,
}

impl ApiKeyAuthenticator {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Resolve a plaintext key to its stored record.
    ///
    /// On success an asynchronous `last_used_at` update is spawned; its
    /// failure is logged and never affects the caller.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Unauthorized`] if no stored key matches or the matching
    ///   key has expired
    /// - [`AuthError::Storage`] if the key lookup fails
    #[instrument(skip(self, plaintext))]
    pub async fn authenticate(&self, plaintext: &str) -> Result<ApiKey, AuthError> {
        let Some(prefix) = key_prefix(plaintext) else {
            debug!("API key too short");
            return Err(AuthError::Unauthorized);
        };

        let candidates = self.store.find_api_keys_by_prefix(prefix).await?;
        if candidates.is_empty() {
            debug!(key_prefix = %prefix, "No API key with prefix");
            return Err(AuthError::Unauthorized);
        }

        // Argon2 verification is CPU bound; keep it off the async workers
        let plaintext = plaintext.to_string();
        let matched = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .find(|candidate| verify_api_key(&plaintext, &candidate.key_hash))
        })
        .await
        .map_err(|e| AuthError::Hashing {
            message: e.to_string(),
        })?;

        let Some(key) = matched else {
            debug!(key_prefix = %prefix, "API key hash mismatch");
            return Err(AuthError::Unauthorized);
        };

        if key.is_expired() {
            warn!(key_name = %key.name, "Rejected expired API key");
            return Err(AuthError::Unauthorized);
        }

        if let Some(id) = key.id.clone() {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.touch_api_key(&id, Timestamp::now()).await {
                    warn!(key_id = %id, error = %e, "Failed to record API key usage");
                }
            });
        }

        debug!(key_name = %key.name, "API key authenticated");
        Ok(key)
    }

    /// Check a permission scope. `*` grants everything.
    pub fn authorize(&self, key: &ApiKey, permission: Permission) -> bool {
        let allowed = key.has_permission(permission.as_str());
        if !allowed {
            info!(key_name = %key.name, permission = %permission, "Permission denied");
        }
        allowed
    }

    /// Generate, hash and store a new key.
    ///
    /// The returned plaintext is not recoverable afterwards.
    #[instrument(skip(self, permissions))]
    pub async fn issue_api_key(
        &self,
        name: &str,
        permissions: Vec<String>,
        expires_at: Option<Timestamp>,
    ) -> Result<IssuedApiKey, AuthError> {
        let plaintext = generate_plaintext_key();
        self.store_api_key(name, &plaintext, permissions, expires_at)
            .await
            .map(|key| IssuedApiKey { key, plaintext })
    }

    /// Hash and store a caller-provided plaintext key.
    ///
    /// Used to seed a bootstrap key from configuration.
    pub async fn store_api_key(
        &self,
        name: &str,
        plaintext: &str,
        permissions: Vec<String>,
        expires_at: Option<Timestamp>,
    ) -> Result<ApiKey, AuthError> {
        let prefix = key_prefix(plaintext).ok_or_else(|| AuthError::Hashing {
            message: format!("API keys must be at least {} characters", KEY_PREFIX_LEN),
        })?;

        let owned = plaintext.to_string();
        let key_hash = tokio::task::spawn_blocking(move || hash_api_key(&owned))
            .await
            .map_err(|e| AuthError::Hashing {
                message: e.to_string(),
            })??;

        let key = ApiKey::new(name, key_hash, prefix, permissions, expires_at);
        let stored = self.store.create_api_key(key).await?;

        info!(key_id = ?stored.id, key_name = %stored.name, "Issued API key");
        Ok(stored)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential missing, unknown, mismatched or expired
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: missing permission {permission}")]
    Forbidden { permission: Permission },

    #[error("Key hashing failed: {message}")]
    Hashing { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AuthError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorized | Self::Forbidden { .. } => ErrorCategory::Security,
            Self::Hashing { .. } => ErrorCategory::Permanent,
            Self::Storage(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Storage(_) => ErrorCategory::Permanent,
        }
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
