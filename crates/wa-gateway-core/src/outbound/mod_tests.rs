//! Tests for outbound request validation and dispatch

use super::*;
use crate::adapters::InMemoryMessageStore;
use crate::storage::{MessageFilter, Pagination};

fn business() -> PhoneNumber {
    PhoneNumber::new("+15550001111").unwrap()
}

fn text_request(to: &str, content: &str) -> SendMessageRequest {
    SendMessageRequest {
        to: to.to_string(),
        message_type: "text".to_string(),
        content: Some(content.to_string()),
        ..Default::default()
    }
}

fn dispatcher(sender: MockMessageSender) -> (OutboundDispatcher, InMemoryMessageStore) {
    let store = InMemoryMessageStore::new();
    let dispatcher = OutboundDispatcher::new(Arc::new(store.clone()), Arc::new(sender), business());
    (dispatcher, store)
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_text_request_normalizes_recipient() {
    let message = text_request("+44 (7700) 900-123", "hello").validate().unwrap();

    assert_eq!(message.to.as_str(), "+447700900123");
    assert_eq!(
        message.content,
        OutboundContent::Text {
            body: "hello".to_string()
        }
    );
}

#[test]
fn test_text_request_requires_content() {
    let result = text_request("+447700900123", "   ").validate();
    assert!(matches!(result, Err(ValidationError::Required { field }) if field == "content"));
}

#[test]
fn test_text_request_rejects_oversized_body() {
    let result = text_request("+447700900123", &"a".repeat(MAX_TEXT_LENGTH + 1)).validate();
    assert!(matches!(result, Err(ValidationError::TooLong { .. })));
}

#[test]
fn test_invalid_recipient_rejected() {
    let result = text_request("+0 not a phone", "hello").validate();
    assert!(matches!(result, Err(ValidationError::InvalidFormat { .. })));
}

#[test]
fn test_unknown_and_location_types_rejected() {
    let mut request = text_request("+447700900123", "hello");
    request.message_type = "sticker".to_string();
    assert!(matches!(
        request.validate(),
        Err(ValidationError::UnsupportedValue { .. })
    ));

    request.message_type = "location".to_string();
    assert!(matches!(
        request.validate(),
        Err(ValidationError::UnsupportedValue { value, .. }) if value == "location"
    ));
}

#[test]
fn test_media_request_requires_http_url() {
    let mut request = SendMessageRequest {
        to: "+447700900123".to_string(),
        message_type: "image".to_string(),
        caption: Some("a cat".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        request.validate(),
        Err(ValidationError::Required { field }) if field == "media_url"
    ));

    request.media_url = Some("not a url".to_string());
    assert!(matches!(
        request.validate(),
        Err(ValidationError::InvalidFormat { .. })
    ));

    request.media_url = Some("ftp://files.example.com/cat.png".to_string());
    assert!(matches!(
        request.validate(),
        Err(ValidationError::InvalidFormat { .. })
    ));

    request.media_url = Some("https://cdn.example.com/cat.png".to_string());
    let message = request.validate().unwrap();
    assert_eq!(
        message.content,
        OutboundContent::Media {
            kind: MessageType::Image,
            link: "https://cdn.example.com/cat.png".to_string(),
            caption: Some("a cat".to_string()),
            filename: None,
        }
    );
}

#[test]
fn test_audio_drops_caption_and_document_keeps_filename() {
    let audio = SendMessageRequest {
        to: "+447700900123".to_string(),
        message_type: "audio".to_string(),
        media_url: Some("https://cdn.example.com/a.ogg".to_string()),
        caption: Some("ignored".to_string()),
        ..Default::default()
    };
    match audio.validate().unwrap().content {
        OutboundContent::Media { caption, .. } => assert!(caption.is_none()),
        other => panic!("unexpected content {:?}", other),
    }

    let document = SendMessageRequest {
        to: "+447700900123".to_string(),
        message_type: "document".to_string(),
        media_url: Some("https://cdn.example.com/invoice.pdf".to_string()),
        filename: Some("invoice.pdf".to_string()),
        ..Default::default()
    };
    match document.validate().unwrap().content {
        OutboundContent::Media { filename, .. } => {
            assert_eq!(filename.as_deref(), Some("invoice.pdf"))
        }
        other => panic!("unexpected content {:?}", other),
    }
}

#[test]
fn test_template_request_checks_language() {
    let mut request = SendMessageRequest {
        to: "+447700900123".to_string(),
        message_type: "template".to_string(),
        template_name: Some("order_update".to_string()),
        template_language: Some("english".to_string()),
        parameters: vec!["#42".to_string()],
        ..Default::default()
    };
    assert!(matches!(
        request.validate(),
        Err(ValidationError::InvalidFormat { field, .. }) if field == "template_language"
    ));

    request.template_language = Some("en_US".to_string());
    let message = request.validate().unwrap();
    assert_eq!(
        message.content,
        OutboundContent::Template {
            name: "order_update".to_string(),
            language: "en_US".to_string(),
            parameters: vec!["#42".to_string()],
        }
    );

    request.template_name = None;
    assert!(matches!(
        request.validate(),
        Err(ValidationError::Required { field }) if field == "template_name"
    ));
}

#[test]
fn test_request_deserializes_type_field() {
    let request: SendMessageRequest =
        serde_json::from_str(r#"{"to":"+447700900123","type":"text","content":"hi"}"#).unwrap();
    assert_eq!(request.message_type, "text");
    assert!(request.parameters.is_empty());
}

#[test]
fn test_send_error_classification() {
    let throttled = SendError::Rejected {
        status: 429,
        code: Some("130429".to_string()),
        message: "rate limited".to_string(),
    };
    assert!(throttled.is_transient());
    assert_eq!(throttled.code(), "130429");

    let bad_token = SendError::Rejected {
        status: 401,
        code: None,
        message: "invalid token".to_string(),
    };
    assert!(!bad_token.is_transient());
    assert_eq!(bad_token.error_category(), ErrorCategory::Configuration);
    assert_eq!(bad_token.code(), "401");

    let transport = SendError::Transport {
        message: "connection refused".to_string(),
    };
    assert_eq!(transport.error_category(), ErrorCategory::Transient);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_dispatch_queues_then_records_sent() {
    let mut sender = MockMessageSender::new();
    sender
        .expect_send()
        .withf(|m| m.to.as_str() == "+447700900123")
        .times(1)
        .returning(|_| {
            Ok(SendReceipt {
                whatsapp_message_id: "wamid.OUT1".to_string(),
            })
        });
    let (dispatcher, store) = dispatcher(sender);

    let dispatched = dispatcher
        .dispatch(&text_request("+447700900123", "hello"))
        .await
        .unwrap();

    assert_eq!(dispatched.message.status, MessageStatus::Queued);
    assert_eq!(dispatched.message.direction, crate::MessageDirection::Outbound);
    assert_eq!(dispatched.message.from_number, business());
    assert!(dispatched.message.whatsapp_message_id.is_none());

    let delivered = dispatched.delivery.await.unwrap().unwrap();
    assert_eq!(delivered.status, MessageStatus::Sent);
    assert_eq!(delivered.whatsapp_message_id.as_deref(), Some("wamid.OUT1"));

    // Later provider statuses can find the message by its provider id
    let found = store
        .find_message_by_whatsapp_id("wamid.OUT1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, dispatched.message.id);
}

#[tokio::test]
async fn test_dispatch_records_provider_failure() {
    let mut sender = MockMessageSender::new();
    sender.expect_send().times(1).returning(|_| {
        Err(SendError::Rejected {
            status: 400,
            code: Some("131026".to_string()),
            message: "Message undeliverable".to_string(),
        })
    });
    let (dispatcher, store) = dispatcher(sender);

    let dispatched = dispatcher
        .dispatch(&text_request("+447700900123", "hello"))
        .await
        .unwrap();
    let failed = dispatched.delivery.await.unwrap().unwrap();

    assert_eq!(failed.status, MessageStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("131026"));
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("Message undeliverable"));

    let stored = store
        .get_message(dispatched.message.id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
}

#[tokio::test]
async fn test_invalid_request_is_not_persisted() {
    let mut sender = MockMessageSender::new();
    sender.expect_send().times(0);
    let (dispatcher, store) = dispatcher(sender);

    let result = dispatcher.dispatch(&text_request("+447700900123", "")).await;
    assert!(matches!(result, Err(DispatchError::Validation(_))));

    let page = store
        .list_messages(&MessageFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_template_dispatch_keeps_template_details() {
    let mut sender = MockMessageSender::new();
    sender.expect_send().returning(|_| {
        Ok(SendReceipt {
            whatsapp_message_id: "wamid.T1".to_string(),
        })
    });
    let (dispatcher, _) = dispatcher(sender);

    let request = SendMessageRequest {
        to: "+447700900123".to_string(),
        message_type: "template".to_string(),
        template_name: Some("order_update".to_string()),
        template_language: Some("en".to_string()),
        parameters: vec!["#42".to_string(), "tomorrow".to_string()],
        ..Default::default()
    };
    let dispatched = dispatcher.dispatch(&request).await.unwrap();

    assert_eq!(dispatched.message.message_type, MessageType::Template);
    assert_eq!(dispatched.message.content, "order_update");
    assert_eq!(
        dispatched.message.metadata.get("template_language"),
        Some(&serde_json::json!("en"))
    );
    assert_eq!(
        dispatched.message.metadata.get("template_parameters"),
        Some(&serde_json::json!(["#42", "tomorrow"]))
    );
    dispatched.delivery.await.unwrap();
}

#[tokio::test]
async fn test_media_dispatch_stores_link() {
    let mut sender = MockMessageSender::new();
    sender.expect_send().returning(|_| {
        Ok(SendReceipt {
            whatsapp_message_id: "wamid.M1".to_string(),
        })
    });
    let (dispatcher, _) = dispatcher(sender);

    let request = SendMessageRequest {
        to: "+447700900123".to_string(),
        message_type: "image".to_string(),
        media_url: Some("https://cdn.example.com/cat.png".to_string()),
        ..Default::default()
    };
    let dispatched = dispatcher.dispatch(&request).await.unwrap();

    assert_eq!(
        dispatched.message.media_url.as_deref(),
        Some("https://cdn.example.com/cat.png")
    );
    assert_eq!(dispatched.message.content, "");
    dispatched.delivery.await.unwrap();
}
