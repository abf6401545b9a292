//! End-to-end delivery: send path, bus, consumer, hub.

use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::Value;

use messenger::application::services::MessageService;
use messenger::domain::{ChatMessage, ChatType, MessageStatus, ParticipantRole};
use messenger::presentation::websocket::Client;

use crate::common::harness::Pipeline;
use crate::common::{chat_message, eventually, settings, text_request};

#[tokio::test]
async fn test_sent_message_is_broadcast_and_marked_delivered() {
    let pipeline = Pipeline::start(settings()).await;
    pipeline.store.add_chat(7, ChatType::Group);
    pipeline.store.add_participant(7, 3, ParticipantRole::Member);

    let (viewer, mut viewer_rx) = Client::new(50, "test", "127.0.0.1", pipeline.hub.clone(), 16);
    let (other, mut other_rx) = Client::new(51, "test", "127.0.0.1", pipeline.hub.clone(), 16);
    pipeline.hub.register(viewer.clone());
    pipeline.hub.register(other.clone());
    assert_eq!(pipeline.hub.client_count().await.unwrap(), 2);

    let mut request = text_request(7, "hi");
    request.client_id = "c1".into();
    let sent = pipeline.service.send_message(3, request).await.unwrap();

    // Published as `sent`, before any consumer touched it.
    let records = pipeline.bus.records(&pipeline.settings.kafka.topic_messages);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key_str(), "chat_7");
    let published: ChatMessage = serde_json::from_slice(&records[0].value).unwrap();
    assert_eq!(published.status, MessageStatus::Sent);
    assert_eq!(published.id, sent.id);

    for rx in [&mut viewer_rx, &mut other_rx] {
        let payload: Bytes = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope["type"], "new_message");
        assert_eq!(envelope["message_id"], sent.id);
        assert_eq!(envelope["chat_id"], 7);
        assert_eq!(envelope["user_id"], 3);
        assert_eq!(envelope["content"], "hi");
        assert_eq!(envelope["status"], "delivered");
        assert_eq!(envelope["client_id"], "c1");
    }

    let store = pipeline.store.clone();
    assert!(eventually(|| {
        let store = store.clone();
        async move { store.status_of(sent.id) == Some(MessageStatus::Delivered) }
    })
    .await);

    let partition = records[0].partition;
    let bus = pipeline.bus.clone();
    let (group, topic) = (
        pipeline.settings.kafka.group_id.clone(),
        pipeline.settings.kafka.topic_messages.clone(),
    );
    assert!(eventually(|| {
        let committed = bus.committed_offset(&group, &topic, partition);
        async move { committed == Some(1) }
    })
    .await);
    assert!(pipeline.bus.records(&pipeline.settings.kafka.topic_dlq).is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_publish_failure_leaves_message_for_reconciler() {
    let mut config = settings();
    config.kafka.publish_attempts = 1;
    let pipeline = Pipeline::start(config).await;
    pipeline.store.add_chat(7, ChatType::Group);
    pipeline.store.add_participant(7, 3, ParticipantRole::Owner);
    pipeline
        .bus
        .fail_next_writes(&pipeline.settings.kafka.topic_messages, 1);

    let result = pipeline.service.send_message(3, text_request(7, "lost")).await;
    assert!(result.is_err());

    // Persisted but never published; the producer mirrored it to the DLQ.
    let stored = pipeline.store.messages();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MessageStatus::Sent);
    assert_eq!(pipeline.bus.records(&pipeline.settings.kafka.topic_dlq).len(), 1);

    let republished = pipeline
        .service
        .republish_stale(Duration::ZERO, 100)
        .await
        .unwrap();
    assert_eq!(republished, 1);

    let store = pipeline.store.clone();
    let id = stored[0].id;
    assert!(eventually(|| {
        let store = store.clone();
        async move { store.status_of(id) == Some(MessageStatus::Delivered) }
    })
    .await);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_channel_member_message_never_reaches_the_bus() {
    let pipeline = Pipeline::start(settings()).await;
    pipeline.store.add_chat(9, ChatType::Channel);
    pipeline.store.add_participant(9, 3, ParticipantRole::Member);

    let result = pipeline.service.send_message(3, text_request(9, "nope")).await;

    assert!(result.is_err());
    assert!(pipeline.store.messages().is_empty());
    assert!(pipeline
        .bus
        .records(&pipeline.settings.kafka.topic_messages)
        .is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_republished_message_is_not_republished_again_within_window() {
    let pipeline = Pipeline::start(settings()).await;
    // Nothing consumes, so republished messages stay `sent`.
    pipeline.consumer.stop().await;

    let mut stuck = chat_message(1, 7, 3);
    stuck.created_at -= chrono::Duration::hours(2);
    stuck.updated_at = stuck.created_at;
    pipeline.store.insert_message(stuck);
    pipeline.store.insert_message(chat_message(2, 7, 3));

    let window = Duration::from_secs(3600);
    let first = pipeline.service.republish_stale(window, 100).await.unwrap();
    let second = pipeline.service.republish_stale(window, 100).await.unwrap();

    assert_eq!((first, second), (1, 0));
    let records = pipeline.bus.records(&pipeline.settings.kafka.topic_messages);
    assert_eq!(records.len(), 1);
    let republished: ChatMessage = serde_json::from_slice(&records[0].value).unwrap();
    assert_eq!(republished.id, 1);
    assert_eq!(pipeline.store.status_of(1), Some(MessageStatus::Sent));

    pipeline.stop().await;
}
