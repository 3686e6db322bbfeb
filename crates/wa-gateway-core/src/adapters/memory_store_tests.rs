//! Tests for the in-memory message store

use super::*;
use crate::models::{MessageDirection, MessageType};

fn phone(s: &str) -> PhoneNumber {
    PhoneNumber::new(s).unwrap()
}

fn inbound(wamid: &str, seconds: &str) -> Message {
    Message::inbound(
        wamid,
        phone("+15551234567"),
        phone("+15550001111"),
        MessageType::Text,
        "hello",
        Timestamp::from_unix_seconds(seconds).unwrap(),
    )
}

#[tokio::test]
async fn test_create_and_find_message() {
    let store = InMemoryMessageStore::new();

    let created = store
        .create_message(inbound("wamid.1", "1000"))
        .await
        .unwrap();
    let id = created.id.clone().unwrap();

    let by_id = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(by_id, created);

    let by_wamid = store
        .find_message_by_whatsapp_id("wamid.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_wamid.id, Some(id));

    assert!(store
        .find_message_by_whatsapp_id("wamid.missing")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_duplicate_whatsapp_id_is_a_conflict() {
    let store = InMemoryMessageStore::new();
    store
        .create_message(inbound("wamid.1", "1000"))
        .await
        .unwrap();

    let result = store.create_message(inbound("wamid.1", "1001")).await;
    assert!(matches!(result, Err(StorageError::Conflict { field, .. }) if field == "whatsapp_message_id"));

    let page = store
        .list_messages(&MessageFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn test_outbound_messages_without_provider_id_do_not_conflict() {
    let store = InMemoryMessageStore::new();
    for _ in 0..2 {
        let message = Message::outbound(
            phone("+15550001111"),
            phone("+15551234567"),
            MessageType::Text,
            "hi",
        );
        store.create_message(message).await.unwrap();
    }

    let page = store
        .list_messages(&MessageFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn test_create_message_runs_validation() {
    let store = InMemoryMessageStore::new();
    let mut message = inbound("wamid.1", "1000");
    message.content = String::new();

    let result = store.create_message(message).await;
    assert!(matches!(result, Err(StorageError::Validation(_))));
}

#[tokio::test]
async fn test_list_messages_newest_first_with_filter() {
    let store = InMemoryMessageStore::new();
    store
        .create_message(inbound("wamid.old", "1000"))
        .await
        .unwrap();
    store
        .create_message(inbound("wamid.new", "3000"))
        .await
        .unwrap();
    store
        .create_message(inbound("wamid.mid", "2000"))
        .await
        .unwrap();

    let page = store
        .list_messages(&MessageFilter::default(), Pagination::new(Some(2), None))
        .await
        .unwrap();
    let ids: Vec<_> = page
        .items
        .iter()
        .map(|m| m.whatsapp_message_id.clone().unwrap())
        .collect();
    assert_eq!(ids, vec!["wamid.new", "wamid.mid"]);
    assert!(page.has_more);

    let outbound_only = MessageFilter {
        direction: Some(MessageDirection::Outbound),
        ..Default::default()
    };
    let page = store
        .list_messages(&outbound_only, Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_update_if_status_rejects_stale_writes() {
    let store = InMemoryMessageStore::new();
    let created = store
        .create_message(inbound("wamid.1", "1000"))
        .await
        .unwrap();

    let mut read = created.clone();
    read.status = MessageStatus::Read;
    let updated = store
        .update_message_if_status(read, MessageStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(updated.status, MessageStatus::Read);

    // A writer that decided against the old status loses
    let mut failed = created.clone();
    failed.status = MessageStatus::Failed;
    let result = store
        .update_message_if_status(failed, MessageStatus::Delivered)
        .await;
    assert!(matches!(
        result,
        Err(StorageError::StaleWrite {
            actual: MessageStatus::Read,
            ..
        })
    ));
}

#[tokio::test]
async fn test_update_unknown_message_is_not_found() {
    let store = InMemoryMessageStore::new();
    let mut message = inbound("wamid.1", "1000");
    message.id = Some(RecordId::new("msg_missing").unwrap());

    let result = store
        .update_message_if_status(message, MessageStatus::Delivered)
        .await;
    assert!(matches!(result, Err(StorageError::NotFound { .. })));
}

#[tokio::test]
async fn test_inbound_message_upserts_and_counts_contact() {
    let store = InMemoryMessageStore::new();

    let (message, first) = store
        .create_inbound_message(inbound("wamid.1", "2000"), Some("Ada"))
        .await
        .unwrap();
    assert!(message.id.is_some());
    assert!(first.id.clone().unwrap().as_str().starts_with("contact_"));
    assert_eq!(first.message_count, 1);
    assert_eq!(first.unread_count, 1);

    let (_, second) = store
        .create_inbound_message(inbound("wamid.2", "1000"), None)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.message_count, 2);
    assert_eq!(second.unread_count, 2);
    assert_eq!(
        second.last_message_at,
        Some(Timestamp::from_unix_seconds("2000").unwrap())
    );
    assert_eq!(second.name.as_deref(), Some("Ada"));
}

#[tokio::test]
async fn test_duplicate_inbound_message_leaves_contact_untouched() {
    let store = InMemoryMessageStore::new();
    store
        .create_inbound_message(inbound("wamid.1", "1000"), None)
        .await
        .unwrap();

    let result = store
        .create_inbound_message(inbound("wamid.1", "1000"), None)
        .await;
    assert!(matches!(result, Err(StorageError::Conflict { .. })));

    let contact = store
        .get_contact_by_phone(&phone("+15551234567"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(contact.message_count, 1);
}

#[tokio::test]
async fn test_concurrent_inbound_messages_are_atomic() {
    let store = InMemoryMessageStore::new();

    let mut handles = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let wamid = format!("wamid.{}", i);
            let seconds = (1000 + i).to_string();
            store
                .create_inbound_message(inbound(&wamid, &seconds), None)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let contact = store
        .get_contact_by_phone(&phone("+15551234567"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(contact.message_count, 50);
    assert_eq!(
        contact.last_message_at,
        Some(Timestamp::from_unix_seconds("1049").unwrap())
    );
}

#[tokio::test]
async fn test_list_contacts_most_recent_first() {
    let store = InMemoryMessageStore::new();
    let mut older = inbound("wamid.1", "1000");
    older.from_number = phone("+15551111111");
    let mut newer = inbound("wamid.2", "5000");
    newer.from_number = phone("+15552222222");
    store.create_inbound_message(older, None).await.unwrap();
    store.create_inbound_message(newer, None).await.unwrap();

    let page = store.list_contacts(Pagination::default()).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.items[0].phone_number.as_str(), "+15552222222");
}

#[tokio::test]
async fn test_api_key_storage_and_prefix_lookup() {
    let store = InMemoryMessageStore::new();
    let key = ApiKey::new(
        "ci",
        "$argon2id$hash-one",
        "abcdefgh",
        vec!["send_message".to_string()],
        None,
    );
    let stored = store.create_api_key(key).await.unwrap();
    let id = stored.id.clone().unwrap();
    assert!(id.as_str().starts_with("key_"));

    let duplicate = ApiKey::new("other", "$argon2id$hash-one", "abcdefgh", vec![], None);
    assert!(matches!(
        store.create_api_key(duplicate).await,
        Err(StorageError::Conflict { .. })
    ));

    let found = store.find_api_keys_by_prefix("abcdefgh").await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(store
        .find_api_keys_by_prefix("zzzzzzzz")
        .await
        .unwrap()
        .is_empty());

    let used_at = Timestamp::from_unix_seconds("1700000000").unwrap();
    store.touch_api_key(&id, used_at).await.unwrap();
    let found = store.find_api_keys_by_prefix("abcdefgh").await.unwrap();
    assert_eq!(found[0].last_used_at, Some(used_at));
}

#[tokio::test]
async fn test_touch_unknown_key_is_not_found() {
    let store = InMemoryMessageStore::new();
    let result = store
        .touch_api_key(&RecordId::new("key_missing").unwrap(), Timestamp::now())
        .await;
    assert!(matches!(result, Err(StorageError::NotFound { .. })));
}

#[tokio::test]
async fn test_health_check() {
    let store = InMemoryMessageStore::new();
    assert!(store.health_check().await.is_ok());
}

#[tokio::test]
async fn test_update_assigns_provider_id_once() {
    let store = InMemoryMessageStore::new();
    let queued = store
        .create_message(Message::outbound(
            phone("+15550001111"),
            phone("+15551234567"),
            MessageType::Text,
            "hi",
        ))
        .await
        .unwrap();

    let mut sent = queued.clone();
    sent.status = MessageStatus::Sent;
    sent.whatsapp_message_id = Some("wamid.out".to_string());
    store
        .update_message_if_status(sent, MessageStatus::Queued)
        .await
        .unwrap();

    let found = store
        .find_message_by_whatsapp_id("wamid.out")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, queued.id);

    // Later writes cannot change it
    let mut renamed = found.clone();
    renamed.whatsapp_message_id = Some("wamid.other".to_string());
    let stored = store
        .update_message_if_status(renamed, MessageStatus::Sent)
        .await
        .unwrap();
    assert_eq!(stored.whatsapp_message_id.as_deref(), Some("wamid.out"));
}
