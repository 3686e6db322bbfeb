//! Configuration types for the HTTP service

use crate::errors::ConfigError;
use serde::Deserialize;
use std::fmt;
use wa_gateway_core::outbound::cloud_api::{
    DEFAULT_API_BASE_URL, DEFAULT_API_VERSION, DEFAULT_REQUEST_TIMEOUT_SECONDS,
};
use wa_gateway_core::{Environment, LogLevel, PhoneNumber, WebhookSecret};

/// Service configuration
///
/// Every section carries serde defaults so an empty source produces a
/// usable development configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub environment: Environment,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// WhatsApp Cloud API and webhook settings
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    /// API key settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Check the configuration for values the service cannot run with.
    ///
    /// Production additionally requires everything needed to verify
    /// webhooks and send messages.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                message: "server.port must be between 1 and 65535".to_string(),
            });
        }

        if self.server.max_body_size == 0 {
            return Err(ConfigError::Invalid {
                message: "server.max_body_size must be greater than zero".to_string(),
            });
        }

        if let Err(e) = url::Url::parse(&self.whatsapp.api_base_url) {
            return Err(ConfigError::Invalid {
                message: format!("whatsapp.api_base_url is not a valid URL: {}", e),
            });
        }

        if self.whatsapp.api_version.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "whatsapp.api_version".to_string(),
            });
        }

        if let Some(number) = &self.whatsapp.business_phone_number {
            PhoneNumber::normalize(number).map_err(|e| ConfigError::Invalid {
                message: format!("whatsapp.business_phone_number: {}", e),
            })?;
        }

        if self.environment.is_production() {
            let required = [
                ("whatsapp.access_token", &self.whatsapp.access_token),
                ("whatsapp.phone_number_id", &self.whatsapp.phone_number_id),
                ("whatsapp.webhook_secret", &self.whatsapp.webhook_secret),
                ("whatsapp.verify_token", &self.whatsapp.verify_token),
            ];
            for (key, value) in required {
                if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                    return Err(ConfigError::Missing {
                        key: key.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,

    /// Maximum request size in bytes
    pub max_body_size: usize,

    /// Enable CORS
    pub enable_cors: bool,

    /// Enable compression
    pub enable_compression: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_seconds: 30,
            max_body_size: 1024 * 1024, // 1MB
            enable_cors: true,
            enable_compression: true,
        }
    }
}

/// WhatsApp Cloud API and webhook settings
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub api_base_url: String,
    pub api_version: String,

    /// Sender id assigned by the Cloud API
    pub phone_number_id: Option<String>,

    pub access_token: Option<String>,

    /// E.164 number of the business account. Used as the sender of outbound
    /// messages and as the recipient when a webhook omits it.
    pub business_phone_number: Option<String>,

    /// App secret used to sign webhook deliveries
    pub webhook_secret: Option<String>,

    /// Token echoed back during webhook subscription
    pub verify_token: Option<String>,

    pub request_timeout_seconds: u64,
}

impl WhatsAppConfig {
    pub fn webhook_secret(&self) -> Option<WebhookSecret> {
        self.webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(WebhookSecret::new)
    }

    /// Whether outbound sends can be made
    pub fn can_send(&self) -> bool {
        self.phone_number_id.is_some()
            && self.access_token.is_some()
            && self.business_phone_number.is_some()
    }
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            phone_number_id: None,
            access_token: None,
            business_phone_number: None,
            webhook_secret: None,
            verify_token: None,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
        }
    }
}

fn redact(value: &Option<String>) -> &'static str {
    match value {
        Some(_) => "<REDACTED>",
        None => "<unset>",
    }
}

impl fmt::Debug for WhatsAppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_version", &self.api_version)
            .field("phone_number_id", &self.phone_number_id)
            .field("access_token", &redact(&self.access_token))
            .field("business_phone_number", &self.business_phone_number)
            .field("webhook_secret", &redact(&self.webhook_secret))
            .field("verify_token", &redact(&self.verify_token))
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

/// API key settings
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Plaintext key stored at startup so a fresh deployment has a caller
    pub bootstrap_api_key: Option<String>,

    pub bootstrap_key_name: String,

    pub bootstrap_permissions: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bootstrap_api_key: None,
            bootstrap_key_name: "bootstrap".to_string(),
            bootstrap_permissions: vec![wa_gateway_core::models::WILDCARD_PERMISSION.to_string()],
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("bootstrap_api_key", &redact(&self.bootstrap_api_key))
            .field("bootstrap_key_name", &self.bootstrap_key_name)
            .field("bootstrap_permissions", &self.bootstrap_permissions)
            .finish()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level
    pub level: LogLevel,

    /// Enable JSON structured logging
    pub json_format: bool,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
