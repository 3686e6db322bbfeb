//! WhatsApp Cloud API client.
//!
//! Sends messages through `POST {base}/{version}/{phone_number_id}/messages`
//! authenticated with a bearer access token.

use super::{MessageSender, OutboundContent, OutboundMessage, SendError, SendReceipt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const DEFAULT_API_BASE_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_API_VERSION: &str = "v18.0";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Connection settings for the Cloud API
#[derive(Clone, PartialEq, Eq)]
pub struct CloudApiConfig {
    pub base_url: String,
    pub api_version: String,
    pub phone_number_id: String,
    pub access_token: String,
    pub timeout: Duration,
}

impl CloudApiConfig {
    pub fn new(phone_number_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            phone_number_id: phone_number_id.into(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url.trim_end_matches('/'),
            self.api_version,
            self.phone_number_id
        )
    }
}

impl fmt::Debug for CloudApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudApiConfig")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("phone_number_id", &self.phone_number_id)
            .field("access_token", &"<REDACTED>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct SendPayload<'a> {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    message_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<MediaLink<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<MediaLink<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<MediaLink<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document: Option<MediaLink<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<TemplateBody<'a>>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    preview_url: bool,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct MediaLink<'a> {
    link: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct TemplateBody<'a> {
    name: &'a str,
    language: TemplateLanguage<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    components: Vec<TemplateComponent<'a>>,
}

#[derive(Debug, Serialize)]
struct TemplateLanguage<'a> {
    code: &'a str,
}

#[derive(Debug, Serialize)]
struct TemplateComponent<'a> {
    #[serde(rename = "type")]
    component_type: &'static str,
    parameters: Vec<TemplateParameter<'a>>,
}

#[derive(Debug, Serialize)]
struct TemplateParameter<'a> {
    #[serde(rename = "type")]
    parameter_type: &'static str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_subcode: Option<i64>,
}

fn build_payload<'a>(to: &'a str, content: &'a OutboundContent) -> SendPayload<'a> {
    let mut payload = SendPayload {
        messaging_product: "whatsapp",
        recipient_type: "individual",
        to,
        message_type: content.message_type().as_str(),
        text: None,
        image: None,
        video: None,
        audio: None,
        document: None,
        template: None,
    };

    match content {
        OutboundContent::Text { body } => {
            payload.text = Some(TextBody {
                preview_url: false,
                body,
            });
        }
        OutboundContent::Media {
            kind,
            link,
            caption,
            filename,
        } => {
            let media = MediaLink {
                link,
                caption: caption.as_deref(),
                filename: filename.as_deref(),
            };
            match kind {
                crate::MessageType::Image => payload.image = Some(media),
                crate::MessageType::Video => payload.video = Some(media),
                crate::MessageType::Audio => payload.audio = Some(media),
                _ => payload.document = Some(media),
            }
        }
        OutboundContent::Template {
            name,
            language,
            parameters,
        } => {
            let components = if parameters.is_empty() {
                Vec::new()
            } else {
                vec![TemplateComponent {
                    component_type: "body",
                    parameters: parameters
                        .iter()
                        .map(|text| TemplateParameter {
                            parameter_type: "text",
                            text,
                        })
                        .collect(),
                }]
            };
            payload.template = Some(TemplateBody {
                name,
                language: TemplateLanguage { code: language },
                components,
            });
        }
    }

    payload
}

// ============================================================================
// Client
// ============================================================================

/// [`MessageSender`] backed by the WhatsApp Cloud API
#[derive(Debug, Clone)]
pub struct CloudApiClient {
    client: reqwest::Client,
    config: CloudApiConfig,
}

impl CloudApiClient {
    pub fn new(config: CloudApiConfig) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SendError::Transport {
                message: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &CloudApiConfig {
        &self.config
    }
}

#[async_trait]
impl MessageSender for CloudApiClient {
    #[instrument(skip(self, message), fields(to = %message.to))]
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        // The Cloud API addresses recipients by digits only
        let to = message.to.as_str().trim_start_matches('+');
        let payload = build_payload(to, &message.content);

        let response = self
            .client
            .post(self.config.messages_url())
            .bearer_auth(&self.config.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| SendError::Transport {
            message: e.to_string(),
        })?;

        if !status.is_success() {
            let (code, message) = match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(parsed) => (
                    parsed
                        .error
                        .code
                        .or(parsed.error.error_subcode)
                        .map(|c| c.to_string()),
                    parsed.error.message,
                ),
                Err(_) => (None, String::from_utf8_lossy(&body).into_owned()),
            };
            warn!(status = status.as_u16(), code = ?code, "Cloud API rejected message");
            return Err(SendError::Rejected {
                status: status.as_u16(),
                code,
                message,
            });
        }

        let parsed: SendResponse =
            serde_json::from_slice(&body).map_err(|e| SendError::InvalidResponse {
                message: e.to_string(),
            })?;

        let id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| SendError::InvalidResponse {
                message: "response carried no message id".to_string(),
            })?;

        debug!(whatsapp_message_id = %id, "Cloud API accepted message");
        Ok(SendReceipt {
            whatsapp_message_id: id,
        })
    }
}

#[cfg(test)]
#[path = "cloud_api_tests.rs"]
mod tests;
