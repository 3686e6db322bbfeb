//! Common test utilities for wa-gateway integration tests
//!
//! This module provides:
//! - A fully wired [`TestGateway`] backed by the in-memory store
//! - Signed webhook delivery builders
//! - Request helpers driving the router in-process

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wa_gateway_api::{create_router, AppState, ServiceConfig, ServiceMetrics, API_KEY_HEADER};
use wa_gateway_core::{
    sign, webhook::SIGNATURE_HEADER, CloudApiClient, CloudApiConfig, InMemoryMessageStore,
    MessageSender, WebhookSecret,
};

pub const WEBHOOK_SECRET: &str = "integration-secret";
pub const VERIFY_TOKEN: &str = "integration-verify";
pub const BUSINESS_NUMBER: &str = "+15550001111";
pub const CUSTOMER_WA_ID: &str = "15551234567";
pub const CUSTOMER_NUMBER: &str = "+15551234567";

// ============================================================================
// Gateway fixture
// ============================================================================

/// Router plus handles on the state it was built from
#[allow(dead_code)]
pub struct TestGateway {
    pub state: AppState,
    pub store: InMemoryMessageStore,
    pub router: Router,
}

#[allow(dead_code)]
impl TestGateway {
    /// Gateway without outbound sending
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Gateway sending through a Cloud API at `base_url`
    pub fn with_cloud_api(base_url: &str) -> Self {
        let config = CloudApiConfig::new("PHONE_ID", "test-access-token").with_base_url(base_url);
        let client = CloudApiClient::new(config).unwrap();
        Self::build(Some(Arc::new(client)))
    }

    fn build(sender: Option<Arc<dyn MessageSender>>) -> Self {
        let mut config = ServiceConfig::default();
        config.whatsapp.webhook_secret = Some(WEBHOOK_SECRET.to_string());
        config.whatsapp.verify_token = Some(VERIFY_TOKEN.to_string());
        config.whatsapp.business_phone_number = Some(BUSINESS_NUMBER.to_string());

        let store = InMemoryMessageStore::new();
        let state = AppState::new(
            config,
            Arc::new(store.clone()),
            sender,
            ServiceMetrics::new().unwrap(),
        )
        .unwrap();
        let router = create_router(state.clone());

        Self {
            state,
            store,
            router,
        }
    }

    /// Issue a key with the given permissions and return its plaintext
    pub async fn issue_key(&self, permissions: &[&str]) -> String {
        self.state
            .authenticator
            .issue_api_key(
                "integration",
                permissions.iter().map(|p| p.to_string()).collect(),
                None,
            )
            .await
            .unwrap()
            .plaintext
    }

    /// POST a correctly signed webhook delivery
    pub async fn deliver(&self, body: &[u8]) -> (StatusCode, Value) {
        let signature = sign(body, &WebhookSecret::new(WEBHOOK_SECRET));
        self.send(
            Request::post("/webhook")
                .header(SIGNATURE_HEADER, signature)
                .header("content-type", "application/json")
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
    }

    pub async fn get(&self, uri: &str, api_key: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::get(uri);
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        self.send(request.body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(
        &self,
        uri: &str,
        api_key: Option<&str>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut request = Request::post(uri).header("content-type", "application/json");
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        self.send(request.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Drive one request through the router; non-JSON bodies map to `Value::String`
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }
}

// ============================================================================
// Payload builders
// ============================================================================

/// Wrap a change value in the provider's delivery envelope
#[allow(dead_code)]
pub fn delivery(value: Value) -> Vec<u8> {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA_ID",
            "changes": [{ "field": "messages", "value": value }]
        }]
    })
    .to_string()
    .into_bytes()
}

#[allow(dead_code)]
pub fn metadata() -> Value {
    json!({ "display_phone_number": "15550001111", "phone_number_id": "PHONE_ID" })
}

/// Delivery carrying one inbound text message from the customer
#[allow(dead_code)]
pub fn inbound_text(wamid: &str, body: &str) -> Vec<u8> {
    delivery(json!({
        "messaging_product": "whatsapp",
        "metadata": metadata(),
        "contacts": [{ "profile": { "name": "Ada" }, "wa_id": CUSTOMER_WA_ID }],
        "messages": [{
            "from": CUSTOMER_WA_ID,
            "id": wamid,
            "timestamp": "1700000000",
            "type": "text",
            "text": { "body": body }
        }]
    }))
}

/// Delivery carrying one status update for a message sent to the customer
#[allow(dead_code)]
pub fn status_update(wamid: &str, status: &str, timestamp: &str) -> Vec<u8> {
    delivery(json!({
        "messaging_product": "whatsapp",
        "metadata": metadata(),
        "statuses": [{
            "id": wamid,
            "status": status,
            "timestamp": timestamp,
            "recipient_id": CUSTOMER_WA_ID
        }]
    }))
}
