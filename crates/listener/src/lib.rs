//! # Message Listener Container
//!
//! A pull-based consumer for queue and stream services with bounded
//! concurrency and configurable acknowledgement.
//!
//! ## Features
//!
//! - **Permit-based backpressure**: at most `max_concurrent_messages` in flight per endpoint
//! - **Adaptive throughput**: one poll at a time on idle endpoints, parallel polls under load
//! - **Pluggable pipeline**: interceptors, single or batch listeners, error handlers
//! - **FIFO ordering**: sequential processing per message group, across polls
//! - **Acknowledgement policies**: on success, always or manual; immediate or batched,
//!   parallel or ordered
//! - **Graceful shutdown**: bounded drain of in-flight messages and pending acknowledgements
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 MessageListenerContainer                     │
//! │  (lifecycle, per-endpoint wiring from ContainerOptions)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ per endpoint
//!                              ▼
//! ┌──────────────────────┐  permits  ┌───────────────────────────┐
//! │ PollingMessageSource │ ◀───────▶ │ BackPressureHandler chain │
//! └──────────────────────┘           └───────────────────────────┘
//!                              │ batches           ▲ release(Processed)
//!                              ▼                   │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  MessageSink (fan-out / batch / ordered, grouping adapter)   │
//! │  └─▶ MessageProcessingPipeline on the shared TaskExecutor    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ acknowledge
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  AcknowledgementProcessor ─▶ QueueClient / StreamClient      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use message_listener::prelude::*;
//!
//! let client = Arc::new(InMemoryQueueClient::new());
//! client.send_message("orders", "hello");
//!
//! let container = MessageListenerContainer::builder()
//!     .queue_client(client)
//!     .endpoint("orders")
//!     .listener(listener_fn(|message: Message| async move {
//!         tracing::info!(body = %message.body, "received");
//!         Ok(())
//!     }))
//!     .options(ContainerOptions::builder().max_concurrent_messages(20).build()?)
//!     .build()?;
//!
//! container.start().await?;
//! // ...
//! container.stop().await?;
//! ```

pub mod acknowledgement;
pub mod backpressure;
pub mod container;
pub mod executor;
pub mod message;
pub mod options;
pub mod pipeline;
pub mod provider;
pub mod sink;
pub mod source;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::acknowledgement::{
        AcknowledgementError, AcknowledgementMode, AcknowledgementOrdering,
        AcknowledgementResultCallback,
    };
    pub use crate::backpressure::BackPressureLimiter;
    pub use crate::container::{
        ContainerError, ContainerStatus, MessageListenerContainer, MessageProvider,
    };
    pub use crate::message::Message;
    pub use crate::options::{
        BackPressureMode, ContainerOptions, FifoBatchGroupingStrategy, ListenerMode,
    };
    pub use crate::pipeline::{
        batch_listener_fn, listener_fn, BatchMessageListener, BoxError, ErrorHandler,
        ExponentialBackoffErrorHandler, ListenerExecutionFailed, MessageInterceptor,
        MessageListener,
    };
    pub use crate::provider::{
        InMemoryQueueClient, InMemoryStreamClient, ProviderError, QueueClient, StreamClient,
    };
    pub use crate::source::BackOffPolicy;
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use acknowledgement::{AcknowledgementError, AcknowledgementMode, AcknowledgementOrdering};
pub use container::{ContainerError, ContainerStatus, MessageListenerContainer, MessageProvider};
pub use message::Message;
pub use options::{BackPressureMode, ContainerOptions, ContainerOptionsError, ListenerMode};
pub use pipeline::{BoxError, ListenerExecutionFailed};
pub use provider::ProviderError;
