//! # WhatsApp Gateway Service
//!
//! Binary entry point for the gateway HTTP service.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes structured logging
//! - Wires the message store, provider client and API-key authenticator
//! - Starts the HTTP server from wa-gateway-api

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wa_gateway_api::{start_server, AppState, LoggingConfig, ServiceConfig, ServiceError};
use wa_gateway_core::{
    CloudApiClient, CloudApiConfig, InMemoryMessageStore, MessageSender, MessageStore,
};

/// Environment variable naming an extra configuration file
const CONFIG_FILE_ENV: &str = "WAG_CONFIG_FILE";

/// Prefix of configuration environment variables, e.g. `WAG__SERVER__PORT`
const CONFIG_ENV_PREFIX: &str = "WAG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // Load configuration
    //
    // Sources, later ones override earlier ones:
    //  1. /etc/wa-gateway/service.yaml
    //  2. ./config/service.yaml
    //  3. Path given by WAG_CONFIG_FILE
    //  4. Environment variables prefixed WAG with `__` as separator
    //
    // Every field carries a serde default so an unconfigured environment
    // still yields a development configuration. Malformed sources are fatal.
    // -------------------------------------------------------------------------
    let loaded = load_configuration();

    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging);

    let service_config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load service configuration; aborting");
            std::process::exit(3);
        }
    };

    if let Err(e) = service_config.validate() {
        error!(error = %e, "Service configuration is invalid; aborting");
        std::process::exit(3);
    }

    info!(
        environment = service_config.environment.as_str(),
        "Starting WhatsApp gateway service"
    );

    let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
    let metrics = wa_gateway_api::ServiceMetrics::new().context("registering metrics")?;

    let sender = match build_sender(&service_config) {
        Ok(sender) => sender,
        Err(e) => {
            error!(error = %e, "Failed to create WhatsApp Cloud API client; aborting");
            std::process::exit(3);
        }
    };

    let state = match AppState::new(service_config, store, sender, metrics) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to wire application state; aborting");
            std::process::exit(3);
        }
    };

    seed_bootstrap_key(&state).await?;

    if let Err(e) = start_server(state).await {
        error!(error = %e, "HTTP server failed");

        let exit_code = match e {
            ServiceError::BindFailed { .. } => 1,
            ServiceError::ServerFailed { .. } => 2,
            ServiceError::Configuration(_) => 3,
        };
        std::process::exit(exit_code);
    }

    Ok(())
}

// ============================================================================
// Private helpers
// ============================================================================

fn load_configuration() -> Result<ServiceConfig, config::ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/wa-gateway/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    if let Ok(explicit_path) = std::env::var(CONFIG_FILE_ENV) {
        if !explicit_path.is_empty() {
            builder = builder.add_source(
                config::File::with_name(&explicit_path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }
    }

    builder
        .add_source(config::Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()
}

/// Filter used when `RUST_LOG` is not set
fn default_filter(logging: &LoggingConfig) -> String {
    let level = logging.level.as_str();
    format!(
        "wa_gateway_service={level},wa_gateway_api={level},wa_gateway_core={level},tower_http=debug"
    )
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(logging).into());

    let json = logging.json_format;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Build the Cloud API client when credentials and a business number are set
fn build_sender(
    config: &ServiceConfig,
) -> Result<Option<Arc<dyn MessageSender>>, wa_gateway_core::SendError> {
    let whatsapp = &config.whatsapp;
    let (Some(phone_number_id), Some(access_token)) = (
        whatsapp.phone_number_id.as_deref().filter(|v| !v.is_empty()),
        whatsapp.access_token.as_deref().filter(|v| !v.is_empty()),
    ) else {
        warn!("WhatsApp credentials not configured; outbound sending disabled");
        return Ok(None);
    };
    if !whatsapp.can_send() {
        warn!("No business phone number configured; outbound sending disabled");
        return Ok(None);
    }

    let mut api_config = CloudApiConfig::new(phone_number_id, access_token)
        .with_base_url(whatsapp.api_base_url.as_str())
        .with_api_version(whatsapp.api_version.as_str());
    api_config.timeout = Duration::from_secs(whatsapp.request_timeout_seconds);

    info!(
        base_url = %api_config.base_url,
        api_version = %api_config.api_version,
        "Outbound sending enabled"
    );
    Ok(Some(Arc::new(CloudApiClient::new(api_config)?)))
}

/// Store the configured bootstrap key so operators can reach the API
async fn seed_bootstrap_key(state: &AppState) -> anyhow::Result<()> {
    let auth = &state.config.auth;
    let Some(plaintext) = auth.bootstrap_api_key.as_deref().filter(|k| !k.is_empty()) else {
        info!("No bootstrap API key configured");
        return Ok(());
    };

    let key = state
        .authenticator
        .store_api_key(
            &auth.bootstrap_key_name,
            plaintext,
            auth.bootstrap_permissions.clone(),
            None,
        )
        .await
        .context("storing bootstrap API key")?;

    info!(
        key_name = %key.name,
        key_prefix = %key.key_prefix,
        "Bootstrap API key registered"
    );
    Ok(())
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
