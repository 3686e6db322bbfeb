//! Response types for the HTTP endpoints

use serde::{Deserialize, Serialize};
use wa_gateway_core::{IngestionReport, Page, Timestamp};

/// Webhook processing response
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: String,
    pub messages_created: usize,
    pub messages_duplicate: usize,
    pub statuses_applied: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl From<&IngestionReport> for WebhookResponse {
    fn from(report: &IngestionReport) -> Self {
        Self {
            status: "processed".to_string(),
            messages_created: report.messages_created,
            messages_duplicate: report.messages_duplicate,
            statuses_applied: report.statuses_applied,
            rejected: report.rejected.len(),
            failed: report.failures.len(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub timestamp: Timestamp,
}

/// Pagination block of a list response
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationInfo {
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
    pub has_more: bool,
}

/// Paginated list response
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub pagination: PaginationInfo,
}

impl<T> From<Page<T>> for ListResponse<T> {
    fn from(page: Page<T>) -> Self {
        Self {
            pagination: PaginationInfo {
                total: page.total,
                limit: page.limit,
                offset: page.offset,
                has_more: page.has_more,
            },
            data: page.items,
        }
    }
}

/// Query parameters for `GET /api/messages`
#[derive(Debug, Default, Deserialize)]
pub struct MessageListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub phone_number: Option<String>,
    pub direction: Option<String>,
    pub status: Option<String>,
}

/// Query parameters for `GET /api/contacts`
#[derive(Debug, Default, Deserialize)]
pub struct ContactListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Query parameters of the webhook subscription handshake
#[derive(Debug, Default, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}
