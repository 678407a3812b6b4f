// Tests for sending messages, read receipts and their broadcasts

mod common;

use agora::{
    bus::{Broadcaster, Channel, Event, Relay},
    manager::Manager,
    ChatError,
};
use async_trait::async_trait;
use common::*;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Relay stand-in whose every publish fails.
struct BrokenRelay {
    attempts: AtomicUsize,
}

#[async_trait]
impl Broadcaster for BrokenRelay {
    async fn publish(&self, _channel: Channel, _event: Event) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("relay unreachable")
    }
}

#[tokio::test]
async fn test_buyer_seller_scenario() {
    let (_dir, relay, manager) = seeded_manager().await;

    let c1 = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    assert_eq!(manager.resolve_conversation(ALICE, BIKE).await.unwrap().id, c1.id);

    let mut conv_rx = relay.subscribe(Channel::Conversation(c1.id));
    let mut global_rx = relay.subscribe(Channel::Global);

    let m1 = manager.send_message(c1.id, ALICE, "hello").await.unwrap();
    assert!(!m1.read);
    assert_eq!(m1.sender_id, ALICE);

    assert_eq!(conv_rx.recv().await.unwrap(), Event::NewMessage(m1.clone()));
    assert_eq!(global_rx.recv().await.unwrap().conversation_id(), c1.id);

    assert_eq!(manager.store().unread_count(c1.id, BOB).await.unwrap(), 1);
    assert_eq!(manager.store().unread_count(c1.id, ALICE).await.unwrap(), 0);

    let updated = manager.mark_read(c1.id, BOB, None).await.unwrap();
    assert_eq!(updated, 1);

    match conv_rx.recv().await.unwrap() {
        Event::MessageRead(receipt) => assert_eq!(receipt.message_ids, vec![m1.id]),
        other => panic!("expected message-read, got {:?}", other),
    }
    assert!(matches!(
        global_rx.recv().await.unwrap(),
        Event::MessageReadNotice(n) if n.conversation_id == c1.id
    ));

    let stored = manager.list_messages(c1.id, ALICE).await.unwrap();
    assert!(stored[0].read);
    assert_eq!(manager.store().unread_count(c1.id, BOB).await.unwrap(), 0);
    assert_eq!(manager.store().unread_count(c1.id, ALICE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_mark_read_without_unread_messages_is_silent() {
    let (_dir, relay, manager) = seeded_manager().await;
    let conv = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    manager.send_message(conv.id, ALICE, "ping").await.unwrap();

    let mut conv_rx = relay.subscribe(Channel::Conversation(conv.id));

    // Alice only has her own message: nothing to read
    assert_eq!(manager.mark_read(conv.id, ALICE, None).await.unwrap(), 0);
    assert_eq!(manager.mark_read(conv.id, BOB, None).await.unwrap(), 1);
    assert_eq!(manager.mark_read(conv.id, BOB, None).await.unwrap(), 0);

    assert!(matches!(conv_rx.try_recv(), Ok(Event::MessageRead(_))));
    assert!(conv_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_sender_cannot_mark_own_message_read() {
    let (_dir, _relay, manager) = seeded_manager().await;
    let conv = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    let own = manager.send_message(conv.id, ALICE, "mine").await.unwrap();

    let count = manager.mark_read(conv.id, ALICE, Some(&[own.id])).await.unwrap();
    assert_eq!(count, 0);
    assert!(!manager.list_messages(conv.id, ALICE).await.unwrap()[0].read);
}

#[tokio::test]
async fn test_mark_specific_messages_only() {
    let (_dir, _relay, manager) = seeded_manager().await;
    let conv = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    let first = manager.send_message(conv.id, BOB, "first").await.unwrap();
    let second = manager.send_message(conv.id, BOB, "second").await.unwrap();

    assert_eq!(manager.mark_read(conv.id, ALICE, Some(&[second.id])).await.unwrap(), 1);

    let messages = manager.list_messages(conv.id, ALICE).await.unwrap();
    assert_eq!(messages[0].id, first.id);
    assert!(!messages[0].read);
    assert!(messages[1].read);
    assert_eq!(manager.unread_count(ALICE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_non_participants_are_kept_out() {
    let (_dir, _relay, manager) = seeded_manager().await;
    let conv = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    manager.send_message(conv.id, ALICE, "private").await.unwrap();

    assert!(matches!(
        manager.list_messages(conv.id, CAROL).await,
        Err(ChatError::NotFound(_))
    ));
    assert!(matches!(
        manager.mark_read(conv.id, CAROL, None).await,
        Err(ChatError::NotFound(_))
    ));
    assert!(matches!(
        manager.subscribe(Channel::Conversation(conv.id), CAROL).await,
        Err(ChatError::NotFound(_))
    ));
    assert!(matches!(
        manager.send_message(conv.id, CAROL, "let me in").await,
        Err(ChatError::Validation(_))
    ));
}

#[tokio::test]
async fn test_relay_failure_does_not_fail_the_operation() {
    let (_dir, store) = seeded_store().await;
    let broken = Arc::new(BrokenRelay {
        attempts: AtomicUsize::new(0),
    });
    let manager = Manager::with_broadcaster(store, Arc::new(Relay::default()), broken.clone());

    let conv = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    let message = manager.send_message(conv.id, ALICE, "anyone?").await.unwrap();
    assert_eq!(manager.mark_read(conv.id, BOB, None).await.unwrap(), 1);

    // Durable state is intact even though every broadcast was dropped
    let stored = manager.list_messages(conv.id, BOB).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, message.id);
    assert!(stored[0].read);
    assert_eq!(broken.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unread_badge_sums_across_conversations() {
    let (_dir, _relay, manager) = seeded_manager().await;
    let bike = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    let desk = manager.resolve_conversation(ALICE, DESK).await.unwrap();

    manager.send_message(bike.id, BOB, "hi").await.unwrap();
    manager.send_message(bike.id, BOB, "still there?").await.unwrap();
    manager.send_message(desk.id, CAROL, "desk available").await.unwrap();
    manager.send_message(desk.id, ALICE, "great").await.unwrap();

    assert_eq!(manager.unread_count(ALICE).await.unwrap(), 3);
    assert_eq!(manager.unread_count(CAROL).await.unwrap(), 1);

    manager.mark_read(bike.id, ALICE, None).await.unwrap();
    assert_eq!(manager.unread_count(ALICE).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_conversation_accepts_concurrent_sends() {
    let (_dir, _relay, manager) = seeded_manager().await;
    let conv = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    let conv_id = conv.id;

    let sends: Vec<_> = (0..20)
        .map(|i| {
            let manager = manager.clone();
            let sender = if i % 2 == 0 { ALICE } else { BOB };
            tokio::spawn(async move {
                manager
                    .send_message(conv_id, sender, &format!("message {}", i))
                    .await
            })
        })
        .collect();

    for send in sends {
        send.await.unwrap().expect("send into a resolved conversation");
    }
    assert_eq!(manager.list_messages(conv.id, BOB).await.unwrap().len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_receipt_follows_every_broadcast_message() {
    let (_dir, relay, manager) = seeded_manager().await;
    let conv = manager.resolve_conversation(ALICE, BIKE).await.unwrap();
    let conv_id = conv.id;
    let mut conv_rx = relay.subscribe(Channel::Conversation(conv.id));

    for i in 0..20 {
        manager
            .send_message(conv.id, ALICE, &format!("message {}", i))
            .await
            .unwrap();

        // Reacting to the broadcast the way an open thread does
        let Event::NewMessage(message) = conv_rx.recv().await.unwrap() else {
            panic!("expected new-message");
        };
        let reader = manager.clone();
        let count = tokio::spawn(async move {
            reader.mark_read(conv_id, BOB, Some(&[message.id])).await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(count, 1);

        assert!(matches!(conv_rx.recv().await.unwrap(), Event::MessageRead(_)));
    }
}
