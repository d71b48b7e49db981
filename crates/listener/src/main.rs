use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use message_listener::pipeline::{listener_fn, BoxError};
use message_listener::provider::InMemoryQueueClient;
use message_listener::telemetry::{init_tracing, TelemetryConfig};
use message_listener::{ContainerOptions, Message, MessageListenerContainer};
use tokio::sync::Notify;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "message_listener=info")
    // - LISTENER_*: container options, see `ContainerOptions::from_env`
    // - LISTENER_DEMO_QUEUE / LISTENER_DEMO_MESSAGES: seeded queue
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("message_listener=info".to_string());
    }
    let _telemetry_guard = init_tracing(telemetry_config);

    let options = ContainerOptions::from_env().context("Invalid LISTENER_* configuration")?;
    let queue = std::env::var("LISTENER_DEMO_QUEUE").unwrap_or_else(|_| "demo-queue".to_string());
    let total: usize = std::env::var("LISTENER_DEMO_MESSAGES")
        .ok()
        .map(|v| v.parse::<usize>())
        .transpose()
        .context("LISTENER_DEMO_MESSAGES must be a number")?
        .unwrap_or(100);

    let client = Arc::new(InMemoryQueueClient::new());
    for i in 0..total {
        client.send_message(&queue, format!("{{\"order\":{}}}", i));
    }
    tracing::info!(%queue, messages = total, ?options, "Seeded demo queue");

    let processed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Notify::new());
    let listener = {
        let processed = Arc::clone(&processed);
        let done = Arc::clone(&done);
        listener_fn(move |message: Message| {
            let processed = Arc::clone(&processed);
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tracing::debug!(
                    message_id = %message.id,
                    body = %message.body,
                    "Processed message"
                );
                if processed.fetch_add(1, Ordering::SeqCst) + 1 == total {
                    done.notify_one();
                }
                Ok::<_, BoxError>(())
            }
        })
    };

    let container = MessageListenerContainer::builder()
        .id("demo")
        .queue_client(client.clone())
        .endpoint(queue.clone())
        .listener(listener)
        .options(options)
        .build()
        .context("Failed to build container")?;

    container.start().await.context("Failed to start container")?;

    tokio::select! {
        _ = done.notified(), if total > 0 => {
            tracing::info!(processed = processed.load(Ordering::SeqCst), "All messages processed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    container.stop().await.context("Failed to stop container")?;
    tracing::info!(
        processed = processed.load(Ordering::SeqCst),
        remaining = client.message_count(&queue),
        "Demo finished"
    );
    Ok(())
}
