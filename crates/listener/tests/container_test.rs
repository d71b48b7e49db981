// Integration tests for the message listener container
//
// These tests run complete containers against the in-memory queue and
// stream clients: polling, backpressure, pipeline, acknowledgement and
// shutdown together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use message_listener::acknowledgement::AcknowledgementMode;
use message_listener::container::MessageListenerContainer;
use message_listener::options::{ContainerOptions, ListenerMode};
use message_listener::pipeline::{
    batch_listener_fn, listener_fn, BoxError, ExponentialBackoffErrorHandler,
};
use message_listener::provider::{InMemoryQueueClient, InMemoryStreamClient, ProviderError};
use message_listener::source::BackOffPolicy;
use message_listener::Message;
use parking_lot::Mutex;

fn fast_options() -> message_listener::options::ContainerOptionsBuilder {
    ContainerOptions::builder()
        .max_concurrent_messages(10)
        .max_messages_per_poll(10)
        .poll_timeout(Duration::from_millis(50))
        .max_delay_between_polls(Duration::from_millis(50))
        .listener_shutdown_timeout(Duration::from_secs(2))
        .acknowledgement_shutdown_timeout(Duration::from_secs(2))
        .acknowledgement_interval(Duration::from_millis(50))
        .poll_back_off(BackOffPolicy::fixed(Duration::from_millis(10)))
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn recording_listener(
    processed: Arc<Mutex<Vec<String>>>,
) -> Arc<dyn message_listener::pipeline::MessageListener> {
    listener_fn(move |message: Message| {
        let processed = Arc::clone(&processed);
        async move {
            processed.lock().push(message.body.clone());
            Ok::<_, BoxError>(())
        }
    })
}

// =============================================================================
// Acknowledgement modes
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_on_success_deletes_once_and_returns_permits() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.send_message("orders", "foo");
    let processed = Arc::new(Mutex::new(Vec::new()));

    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders")
        .listener(recording_listener(Arc::clone(&processed)))
        .options(fast_options().build().unwrap())
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("delete", || client.delete_count() == 1).await;
    assert_eq!(*processed.lock(), vec!["foo".to_string()]);

    container.stop().await.unwrap();
    assert_eq!(container.available_permits("orders"), Some(10));
    assert_eq!(client.deleted_receipt_handles("orders").len(), 1);
    assert_eq!(client.message_count("orders"), 0);
}

#[test_log::test(tokio::test)]
async fn test_failed_messages_are_not_acknowledged() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.send_message("orders", "bad");
    let attempts = Arc::new(AtomicUsize::new(0));

    let listener = {
        let attempts = Arc::clone(&attempts);
        listener_fn(move |_message: Message| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>("boom".into())
            }
        })
    };

    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders")
        .listener(listener)
        .error_handler(Arc::new(ExponentialBackoffErrorHandler::new()))
        .options(fast_options().build().unwrap())
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("visibility change", || !client.visibility_changes().is_empty()).await;
    container.stop().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(client.delete_count(), 0);
    assert_eq!(client.message_count("orders"), 1);
    assert_eq!(
        client.visibility_changes()[0].timeout,
        Duration::from_secs(100)
    );
}

#[test_log::test(tokio::test)]
async fn test_never_mode_with_explicit_acknowledgement() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.send_message("orders", "ack-me");
    client.send_message("orders", "keep-me");
    let processed = Arc::new(AtomicUsize::new(0));

    let listener = {
        let processed = Arc::clone(&processed);
        listener_fn(move |message: Message| {
            let processed = Arc::clone(&processed);
            async move {
                if message.body == "ack-me" {
                    message.acknowledge().await?;
                }
                processed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
    };

    let options = fast_options()
        .acknowledgement_mode(AcknowledgementMode::Never)
        .build()
        .unwrap();
    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders")
        .listener(listener)
        .options(options)
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("processing", || processed.load(Ordering::SeqCst) == 2).await;
    container.stop().await.unwrap();

    assert_eq!(client.delete_count(), 1);
    assert_eq!(client.message_count("orders"), 1);
}

#[test_log::test(tokio::test)]
async fn test_never_mode_failed_message_acknowledged_later() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.send_message("orders", "retry-me");
    let received = Arc::new(Mutex::new(Vec::new()));

    let listener = {
        let received = Arc::clone(&received);
        listener_fn(move |message: Message| {
            let received = Arc::clone(&received);
            async move {
                received.lock().push(message);
                Err::<(), BoxError>("downstream unavailable".into())
            }
        })
    };

    let options = fast_options()
        .acknowledgement_mode(AcknowledgementMode::Never)
        .build()
        .unwrap();
    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders")
        .listener(listener)
        .options(options)
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("failed invocation", || received.lock().len() == 1).await;
    // Give a batching flush the chance to run.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.delete_count(), 0);
    assert_eq!(client.in_flight_count("orders"), 1);

    let message = received.lock()[0].clone();
    message.acknowledge().await.unwrap();
    wait_until("explicit delete", || client.delete_count() == 1).await;

    container.stop().await.unwrap();
    assert_eq!(client.delete_count(), 1);
    assert_eq!(client.message_count("orders"), 0);
}

// =============================================================================
// Shutdown
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_stop_drains_in_flight_messages() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.send_message("orders", "slow");
    let finished = Arc::new(AtomicUsize::new(0));

    let listener = {
        let finished = Arc::clone(&finished);
        listener_fn(move |_message: Message| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
    };

    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders")
        .listener(listener)
        .options(fast_options().build().unwrap())
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("receive", || client.in_flight_count("orders") == 1).await;
    container.stop().await.unwrap();

    assert!(!container.is_running());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    // Pending acknowledgements are flushed on stop.
    assert_eq!(client.delete_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_missing_queue_stops_only_its_endpoint() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.send_message("orders", "foo");
    let processed = Arc::new(Mutex::new(Vec::new()));

    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoints(["orders", "missing"])
        .listener(recording_listener(Arc::clone(&processed)))
        .options(fast_options().build().unwrap())
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("missing endpoint to stop", || {
        !container.is_endpoint_running("missing")
    })
    .await;
    wait_until("processing", || processed.lock().len() == 1).await;
    assert!(container.is_running());
    assert!(container.is_endpoint_running("orders"));

    container.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_transient_errors_are_retried() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.fail_next_receive(ProviderError::Throttled("slow down".into()));
    client.fail_next_receive(ProviderError::Transient("connection reset".into()));
    client.send_message("orders", "foo");
    let processed = Arc::new(Mutex::new(Vec::new()));

    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders")
        .listener(recording_listener(Arc::clone(&processed)))
        .options(fast_options().build().unwrap())
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("processing", || processed.lock().len() == 1).await;
    assert!(client.receive_calls() >= 3);
    assert!(container.is_endpoint_running("orders"));
    container.stop().await.unwrap();
}

// =============================================================================
// Ordering
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_fifo_groups_keep_order() {
    let client = Arc::new(InMemoryQueueClient::new());
    for i in 0..5 {
        client.send_message_to_group("orders.fifo", "a", format!("a{}", i));
        client.send_message_to_group("orders.fifo", "b", format!("b{}", i));
    }
    let processed = Arc::new(Mutex::new(Vec::new()));

    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders.fifo")
        .listener(recording_listener(Arc::clone(&processed)))
        .options(fast_options().build().unwrap())
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("processing", || processed.lock().len() == 10).await;
    wait_until("deletes", || client.message_count("orders.fifo") == 0).await;
    container.stop().await.unwrap();

    let processed = processed.lock().clone();
    let group = |prefix: char| -> Vec<String> {
        processed
            .iter()
            .filter(|body| body.starts_with(prefix))
            .cloned()
            .collect()
    };
    assert_eq!(group('a'), vec!["a0", "a1", "a2", "a3", "a4"]);
    assert_eq!(group('b'), vec!["b0", "b1", "b2", "b3", "b4"]);
}

#[test_log::test(tokio::test)]
async fn test_stream_records_are_checkpointed() {
    let client = Arc::new(InMemoryStreamClient::new());
    client.create_shard("events", "shard-0");
    let mut last = String::new();
    for i in 0..5 {
        last = client.put_record("events", "shard-0", "key", format!("e{}", i));
    }
    let processed = Arc::new(Mutex::new(Vec::new()));

    let container = MessageListenerContainer::builder()
        .stream_client(client.clone(), "events")
        .endpoint("shard-0")
        .listener(recording_listener(Arc::clone(&processed)))
        .options(fast_options().build().unwrap())
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("checkpoint", || {
        client.last_checkpoint("events", "shard-0").as_deref() == Some(last.as_str())
    })
    .await;
    container.stop().await.unwrap();

    assert_eq!(*processed.lock(), vec!["e0", "e1", "e2", "e3", "e4"]);
}

// =============================================================================
// Batch listeners
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_batch_listener_receives_polled_batches() {
    let client = Arc::new(InMemoryQueueClient::new());
    for i in 0..4 {
        client.send_message("orders", format!("m{}", i));
    }
    let batches = Arc::new(Mutex::new(Vec::new()));

    let listener = {
        let batches = Arc::clone(&batches);
        batch_listener_fn(move |messages: Vec<Message>| {
            let batches = Arc::clone(&batches);
            async move {
                batches.lock().push(messages.len());
                Ok::<_, BoxError>(())
            }
        })
    };

    let options = fast_options()
        .listener_mode(ListenerMode::Batch)
        .build()
        .unwrap();
    let container = MessageListenerContainer::builder()
        .queue_client(client.clone())
        .endpoint("orders")
        .batch_listener(listener)
        .options(options)
        .build()
        .unwrap();
    container.start().await.unwrap();

    wait_until("deletes", || client.delete_count() == 4).await;
    container.stop().await.unwrap();

    assert_eq!(batches.lock().iter().sum::<usize>(), 4);
}
