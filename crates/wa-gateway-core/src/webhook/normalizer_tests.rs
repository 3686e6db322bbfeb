//! Tests for webhook payload normalization

use super::*;
use serde_json::json;

fn envelope(value: serde_json::Value) -> Vec<u8> {
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

fn metadata() -> serde_json::Value {
    json!({ "display_phone_number": "15550001111", "phone_number_id": "PHONE_ID" })
}

#[test]
fn test_text_message_is_flattened() {
    let body = envelope(json!({
        "messaging_product": "whatsapp",
        "metadata": metadata(),
        "contacts": [{ "profile": { "name": "Ada" }, "wa_id": "15551234567" }],
        "messages": [{
            "from": "15551234567",
            "id": "wamid.1",
            "timestamp": "1700000000",
            "type": "text",
            "text": { "body": "hi" }
        }]
    }));

    let batch = normalize(&body).unwrap();

    assert_eq!(batch.message_events.len(), 1);
    assert!(batch.status_events.is_empty());
    assert!(batch.rejected.is_empty());

    let event = &batch.message_events[0];
    assert_eq!(event.whatsapp_message_id, "wamid.1");
    assert_eq!(event.from_number.as_str(), "+15551234567");
    assert_eq!(
        event.to_number.as_ref().map(|n| n.as_str()),
        Some("+15550001111")
    );
    assert_eq!(event.contact_name.as_deref(), Some("Ada"));
    assert_eq!(event.timestamp.unix_seconds(), 1_700_000_000);
    assert_eq!(
        event.content,
        MessageContent::Text {
            body: "hi".to_string()
        }
    );
}

#[test]
fn test_media_and_location_variants() {
    let body = envelope(json!({
        "metadata": metadata(),
        "messages": [
            {
                "from": "15551234567", "id": "wamid.img", "timestamp": "1700000001",
                "type": "image",
                "image": { "id": "MEDIA1", "mime_type": "image/jpeg", "sha256": "abc", "caption": "cat" }
            },
            {
                "from": "15551234567", "id": "wamid.doc", "timestamp": "1700000002",
                "type": "document",
                "document": { "id": "MEDIA2", "mime_type": "application/pdf", "filename": "invoice.pdf" }
            },
            {
                "from": "15551234567", "id": "wamid.voice", "timestamp": "1700000003",
                "type": "audio",
                "audio": { "id": "MEDIA3", "mime_type": "audio/ogg", "voice": true }
            },
            {
                "from": "15551234567", "id": "wamid.loc", "timestamp": "1700000004",
                "type": "location",
                "location": { "latitude": 52.37, "longitude": 4.89, "name": "Dam Square" }
            }
        ]
    }));

    let batch = normalize(&body).unwrap();
    assert_eq!(batch.message_events.len(), 4);

    let image = &batch.message_events[0].content;
    assert_eq!(image.message_type(), MessageType::Image);
    assert_eq!(image.media().unwrap().id, "MEDIA1");
    assert_eq!(image.display_text(), "cat");

    let document = &batch.message_events[1].content;
    assert_eq!(document.display_text(), "invoice.pdf");
    assert!(matches!(document, MessageContent::Document { filename: Some(f), .. } if f == "invoice.pdf"));

    assert!(matches!(
        batch.message_events[2].content,
        MessageContent::Audio { voice: true, .. }
    ));

    let location = &batch.message_events[3].content;
    assert_eq!(location.message_type(), MessageType::Location);
    assert!(location.media().is_none());
    assert_eq!(location.display_text(), "Dam Square (52.37,4.89)");
}

#[test]
fn test_malformed_timestamp_rejects_only_that_event() {
    let body = envelope(json!({
        "messages": [
            { "from": "15551234567", "id": "wamid.bad", "timestamp": "not-a-time", "type": "text", "text": { "body": "a" } },
            { "from": "15551234567", "id": "wamid.good", "timestamp": "1700000000", "type": "text", "text": { "body": "b" } }
        ]
    }));

    let batch = normalize(&body).unwrap();

    assert_eq!(batch.message_events.len(), 1);
    assert_eq!(batch.message_events[0].whatsapp_message_id, "wamid.good");
    assert_eq!(batch.rejected.len(), 1);
    assert_eq!(batch.rejected[0].event_id, "wamid.bad");
    assert!(matches!(
        batch.rejected[0].reason,
        NormalizationError::MalformedTimestamp { .. }
    ));
}

#[test]
fn test_unsupported_and_contentless_messages_are_rejected_per_item() {
    let body = envelope(json!({
        "messages": [
            { "from": "15551234567", "id": "wamid.sticker", "timestamp": "1700000000", "type": "sticker", "sticker": { "id": "S1" } },
            { "from": "15551234567", "id": "wamid.empty", "timestamp": "1700000000", "type": "image" },
            { "from": "15551234567", "id": "wamid.ok", "timestamp": "1700000000", "type": "text", "text": { "body": "ok" } }
        ]
    }));

    let batch = normalize(&body).unwrap();

    assert_eq!(batch.message_events.len(), 1);
    assert!(matches!(
        batch.rejected[0].reason,
        NormalizationError::UnsupportedMessageType { ref message_type, .. } if message_type == "sticker"
    ));
    assert!(matches!(
        batch.rejected[1].reason,
        NormalizationError::MissingContent { .. }
    ));
}

#[test]
fn test_status_events_with_failure_details() {
    let body = envelope(json!({
        "statuses": [
            { "id": "wamid.out1", "status": "delivered", "timestamp": "1700000000", "recipient_id": "15551234567",
              "errors": [{ "code": 1, "title": "ignored" }] },
            { "id": "wamid.out2", "status": "failed", "timestamp": "1700000001", "recipient_id": "15551234567",
              "errors": [{ "code": 131047, "title": "Re-engagement message", "message": "More than 24 hours have passed" }] },
            { "id": "wamid.out3", "status": "deleted", "timestamp": "1700000002", "recipient_id": "15551234567" }
        ]
    }));

    let batch = normalize(&body).unwrap();
    assert_eq!(batch.status_events.len(), 3);

    let delivered = &batch.status_events[0];
    assert_eq!(delivered.status, DeliveryStatus::Delivered);
    assert!(delivered.error.is_none());

    let failed = &batch.status_events[1];
    assert_eq!(failed.status, DeliveryStatus::Failed);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.code.as_deref(), Some("131047"));
    assert_eq!(error.title, "Re-engagement message");
    assert_eq!(
        error.message.as_deref(),
        Some("More than 24 hours have passed")
    );

    let other = &batch.status_events[2];
    assert_eq!(other.status, DeliveryStatus::Other("deleted".to_string()));
    assert_eq!(other.status.as_message_status(), None);
}

#[test]
fn test_order_is_preserved_across_entries_and_changes() {
    let body = json!({
        "object": "whatsapp_business_account",
        "entry": [
            { "id": "A", "changes": [
                { "field": "messages", "value": { "messages": [
                    { "from": "15551234567", "id": "wamid.1", "timestamp": "1", "type": "text", "text": { "body": "1" } }
                ] } },
                { "field": "messages", "value": { "messages": [
                    { "from": "15551234567", "id": "wamid.2", "timestamp": "2", "type": "text", "text": { "body": "2" } }
                ] } }
            ] },
            { "id": "B", "changes": [
                { "field": "messages", "value": { "messages": [
                    { "from": "15551234567", "id": "wamid.3", "timestamp": "3", "type": "text", "text": { "body": "3" } }
                ] } }
            ] }
        ]
    })
    .to_string();

    let batch = normalize(body.as_bytes()).unwrap();
    let ids: Vec<_> = batch
        .message_events
        .iter()
        .map(|e| e.whatsapp_message_id.as_str())
        .collect();
    assert_eq!(ids, vec!["wamid.1", "wamid.2", "wamid.3"]);
}

#[test]
fn test_empty_envelope_yields_empty_batch() {
    for body in [
        &br#"{"object":"whatsapp_business_account","entry":[]}"#[..],
        &br#"{"object":"whatsapp_business_account"}"#[..],
    ] {
        let batch = normalize(body).unwrap();
        assert_eq!(batch, NormalizedBatch::default());
    }
}

#[test]
fn test_malformed_message_items_are_rejected_individually() {
    let body = envelope(json!({
        "metadata": metadata(),
        "messages": [
            { "from": "15551234567", "id": "wamid.numeric", "timestamp": 1700000000, "type": "text", "text": { "body": "a" } },
            { "from": "15551234567", "id": "wamid.no_ts", "type": "text", "text": { "body": "b" } },
            { "id": "wamid.no_from", "timestamp": "1700000000", "type": "text", "text": { "body": "c" } },
            { "from": "15551234567", "timestamp": "1700000000", "type": "text", "text": { "body": "d" } },
            { "from": "15551234567", "id": "wamid.loc", "timestamp": "1700000000", "type": "location",
              "location": { "latitude": "north", "longitude": 2.0 } },
            { "from": "15551234567", "id": "wamid.good", "timestamp": "1700000000", "type": "text", "text": { "body": "kept" } }
        ]
    }));

    let batch = normalize(&body).unwrap();

    assert_eq!(batch.message_events.len(), 1);
    assert_eq!(batch.message_events[0].whatsapp_message_id, "wamid.good");

    let ids: Vec<_> = batch.rejected.iter().map(|r| r.event_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["wamid.numeric", "wamid.no_ts", "wamid.no_from", "", "wamid.loc"]
    );
    assert_eq!(
        batch.rejected[0].reason,
        NormalizationError::MalformedTimestamp {
            event_id: "wamid.numeric".to_string(),
            value: "1700000000".to_string(),
        }
    );
    assert!(matches!(
        batch.rejected[1].reason,
        NormalizationError::MalformedTimestamp { .. }
    ));
    for rejected in &batch.rejected[2..] {
        assert!(
            matches!(rejected.reason, NormalizationError::MalformedEvent { .. }),
            "{:?}",
            rejected
        );
    }
}

#[test]
fn test_malformed_status_items_are_rejected_individually() {
    let body = envelope(json!({
        "statuses": [
            { "id": "wamid.s1", "status": "delivered", "timestamp": 1700000000, "recipient_id": "15551234567" },
            { "status": "read", "timestamp": "1700000000" },
            { "id": "wamid.s3", "status": "failed", "timestamp": "1700000001", "recipient_id": "15551234567",
              "errors": [{ "title": "No code given" }] },
            { "id": "wamid.s4", "status": "failed", "timestamp": "1700000002", "recipient_id": "15551234567",
              "errors": [{ "code": "131026", "title": "Message undeliverable" }] }
        ]
    }));

    let batch = normalize(&body).unwrap();

    let ids: Vec<_> = batch
        .status_events
        .iter()
        .map(|e| e.whatsapp_message_id.as_str())
        .collect();
    assert_eq!(ids, vec!["wamid.s3", "wamid.s4"]);
    assert_eq!(batch.status_events[0].error.as_ref().unwrap().code, None);
    assert_eq!(
        batch.status_events[1].error.as_ref().unwrap().code.as_deref(),
        Some("131026")
    );

    assert_eq!(batch.rejected.len(), 2);
    assert_eq!(batch.rejected[0].event_id, "wamid.s1");
    assert!(matches!(
        batch.rejected[0].reason,
        NormalizationError::MalformedTimestamp { .. }
    ));
    assert_eq!(batch.rejected[1].event_id, "");
    assert!(matches!(
        batch.rejected[1].reason,
        NormalizationError::MalformedEvent { .. }
    ));
}

#[test]
fn test_contact_without_wa_id_does_not_fail_delivery() {
    let body = envelope(json!({
        "metadata": metadata(),
        "contacts": [{ "profile": { "name": "Nobody" } }],
        "messages": [
            { "from": "15551234567", "id": "wamid.1", "timestamp": "1700000000", "type": "text", "text": { "body": "hi" } }
        ]
    }));

    let batch = normalize(&body).unwrap();

    assert_eq!(batch.message_events.len(), 1);
    assert_eq!(batch.message_events[0].contact_name, None);
}

#[test]
fn test_invalid_payloads() {
    for body in [
        &b"not json"[..],
        &br#"{"entry":[]}"#[..],
        &br#"{"object":42,"entry":[]}"#[..],
        &br#"[1,2,3]"#[..],
    ] {
        let result = normalize(body);
        assert!(
            matches!(result, Err(NormalizationError::InvalidPayload { .. })),
            "expected {:?} to be rejected",
            String::from_utf8_lossy(body)
        );
    }
}

#[test]
fn test_missing_metadata_leaves_recipient_unresolved() {
    let body = envelope(json!({
        "messages": [
            { "from": "15551234567", "id": "wamid.1", "timestamp": "1700000000", "type": "text", "text": { "body": "hi" } }
        ]
    }));

    let batch = normalize(&body).unwrap();
    assert!(batch.message_events[0].to_number.is_none());
    assert!(batch.message_events[0].contact_name.is_none());
}
