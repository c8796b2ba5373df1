//! Tests for in-memory queue provider.

use super::*;

fn queue() -> QueueName {
    QueueName::new("sbq-yym-test-usce".to_string()).unwrap()
}

fn short_lock_provider() -> InMemoryProvider {
    InMemoryProvider::new(InMemoryConfig {
        lock_duration: Duration::milliseconds(50),
        ..Default::default()
    })
}

mod provider_tests {
    use super::*;

    #[test]
    fn test_create_provider_with_default_config() {
        let provider = InMemoryProvider::default();
        assert_eq!(provider.provider_type(), ProviderType::InMemory);
        assert_eq!(provider.max_batch_size(), MAX_RECEIVE_BATCH);
        assert_eq!(provider.stats(), LinkStats::default());
    }

    #[test]
    fn test_handle_shares_storage() {
        let provider = InMemoryProvider::default();
        let handle = provider.handle();

        provider.fail_sends(true);

        assert!(lock(&handle.storage).faults.fail_sends);
    }

    #[tokio::test]
    async fn test_closed_provider_refuses_new_links() {
        let provider = InMemoryProvider::default();
        provider.close().await.unwrap();

        assert!(matches!(
            provider.open_sender(&queue()).await,
            Err(QueueError::ClientClosed)
        ));
        assert!(matches!(
            provider.open_receiver(&queue()).await,
            Err(QueueError::ClientClosed)
        ));
    }

    #[tokio::test]
    async fn test_link_counters_track_open_and_close() {
        let provider = InMemoryProvider::default();

        let sender = provider.open_sender(&queue()).await.unwrap();
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        sender.close().await.unwrap();
        receiver.close().await.unwrap();

        let stats = provider.stats();
        assert_eq!(stats.senders_opened, 1);
        assert_eq!(stats.senders_closed, 1);
        assert_eq!(stats.receivers_opened, 1);
        assert_eq!(stats.receivers_closed, 1);
    }
}

mod sender_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_enqueues_message() {
        let provider = InMemoryProvider::default();
        let sender = provider.open_sender(&queue()).await.unwrap();
        let message = Message::from_text("super cool message");
        let expected_id = message.message_id.clone();

        let id = sender.send_message(&message).await.unwrap();

        assert_eq!(id, expected_id);
        assert_eq!(provider.ready_count(&queue()), 1);
        assert_eq!(sender.queue_name(), &queue());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let provider = InMemoryProvider::default();
        let sender = provider.open_sender(&queue()).await.unwrap();
        sender.close().await.unwrap();

        let result = sender.send_message(&Message::from_text("late")).await;

        assert!(matches!(result, Err(QueueError::LinkClosed { .. })));
        assert_eq!(provider.ready_count(&queue()), 0);
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_body() {
        let provider = InMemoryProvider::new(InMemoryConfig {
            max_message_size: 4,
            ..Default::default()
        });
        let sender = provider.open_sender(&queue()).await.unwrap();

        let result = sender.send_message(&Message::from_text("too long")).await;

        assert!(matches!(
            result,
            Err(QueueError::MessageTooLarge { size: 8, max_size: 4 })
        ));
    }

    #[tokio::test]
    async fn test_injected_send_failure() {
        let provider = InMemoryProvider::default();
        provider.fail_sends(true);
        let sender = provider.open_sender(&queue()).await.unwrap();

        let result = sender.send_message(&Message::from_text("x")).await;

        assert!(matches!(result, Err(QueueError::ConnectionFailed { .. })));
    }
}

mod receiver_tests {
    use super::*;

    async fn send_texts(provider: &InMemoryProvider, texts: &[&str]) {
        let sender = provider.open_sender(&queue()).await.unwrap();
        for text in texts {
            sender.send_message(&Message::from_text(text)).await.unwrap();
        }
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_returns_messages_in_send_order() {
        let provider = InMemoryProvider::default();
        send_texts(&provider, &["one", "two", "three"]).await;
        let receiver = provider.open_receiver(&queue()).await.unwrap();

        let batch = receiver
            .receive_messages(10, Duration::seconds(1))
            .await
            .unwrap();

        let bodies: Vec<&str> = batch.iter().map(|m| m.body_text().unwrap()).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
        assert!(batch.iter().all(|m| m.delivery_count == 1));
        assert_eq!(provider.locked_count(&queue()), 3);
        assert_eq!(provider.ready_count(&queue()), 0);
    }

    #[tokio::test]
    async fn test_receive_respects_max_messages() {
        let provider = InMemoryProvider::default();
        send_texts(&provider, &["a", "b", "c", "d"]).await;
        let receiver = provider.open_receiver(&queue()).await.unwrap();

        let batch = receiver
            .receive_messages(2, Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(provider.ready_count(&queue()), 2);
    }

    #[tokio::test]
    async fn test_receive_rejects_batch_over_limit() {
        let provider = InMemoryProvider::default();
        let receiver = provider.open_receiver(&queue()).await.unwrap();

        let result = receiver
            .receive_messages(MAX_RECEIVE_BATCH + 1, Duration::seconds(1))
            .await;

        assert!(matches!(result, Err(QueueError::BatchTooLarge { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_on_empty_queue_returns_empty_after_timeout() {
        let provider = InMemoryProvider::default();
        let receiver = provider.open_receiver(&queue()).await.unwrap();

        let batch = receiver
            .receive_messages(5, Duration::seconds(2))
            .await
            .unwrap();

        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_receive_waits_for_late_message() {
        let provider = InMemoryProvider::default();
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        let producer = provider.handle();

        let send = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            send_texts(&producer, &["late"]).await;
        });

        let batch = receiver
            .receive_messages(5, Duration::seconds(5))
            .await
            .unwrap();
        send.await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body_text().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_complete_removes_message() {
        let provider = InMemoryProvider::default();
        send_texts(&provider, &["done"]).await;
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        let batch = receiver
            .receive_messages(1, Duration::seconds(1))
            .await
            .unwrap();

        receiver
            .complete_message(&batch[0].receipt_handle)
            .await
            .unwrap();

        assert_eq!(provider.locked_count(&queue()), 0);
        assert_eq!(provider.ready_count(&queue()), 0);
        assert_eq!(provider.stats().completions, 1);
    }

    #[tokio::test]
    async fn test_complete_twice_reports_message_not_found() {
        let provider = InMemoryProvider::default();
        send_texts(&provider, &["once"]).await;
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        let batch = receiver
            .receive_messages(1, Duration::seconds(1))
            .await
            .unwrap();
        let receipt = &batch[0].receipt_handle;

        receiver.complete_message(receipt).await.unwrap();
        let second = receiver.complete_message(receipt).await;

        assert!(matches!(second, Err(QueueError::MessageNotFound { .. })));
    }

    #[tokio::test]
    async fn test_abandon_makes_message_redeliverable() {
        let provider = InMemoryProvider::default();
        send_texts(&provider, &["retry"]).await;
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        let first = receiver
            .receive_messages(1, Duration::seconds(1))
            .await
            .unwrap();

        receiver
            .abandon_message(&first[0].receipt_handle)
            .await
            .unwrap();
        let second = receiver
            .receive_messages(1, Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_expired_lock_redelivers_and_rejects_stale_completion() {
        let provider = short_lock_provider();
        send_texts(&provider, &["slow"]).await;
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        let first = receiver
            .receive_messages(1, Duration::seconds(1))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;

        let stale = receiver.complete_message(&first[0].receipt_handle).await;
        assert!(matches!(stale, Err(QueueError::MessageNotFound { .. })));

        let again = receiver
            .receive_messages(1, Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_injected_completion_failure_keeps_message_locked() {
        let provider = InMemoryProvider::default();
        send_texts(&provider, &["a", "b"]).await;
        provider.fail_completion_call(1);
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        let batch = receiver
            .receive_messages(2, Duration::seconds(1))
            .await
            .unwrap();

        let first = receiver.complete_message(&batch[0].receipt_handle).await;
        let second = receiver.complete_message(&batch[1].receipt_handle).await;

        assert!(matches!(first, Err(QueueError::ConnectionFailed { .. })));
        assert!(second.is_ok());
        assert_eq!(provider.locked_count(&queue()), 1);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let provider = InMemoryProvider::default();
        let receiver = provider.open_receiver(&queue()).await.unwrap();
        receiver.close().await.unwrap();

        let result = receiver.receive_messages(1, Duration::seconds(1)).await;

        assert!(matches!(result, Err(QueueError::LinkClosed { .. })));
    }
}
