//! # cross-cloud-pubsub
//!
//! Provider-agnostic publish/subscribe contract with an in-process bus.
//!
//! Topics are plain strings. Publishing fans a message out to every live
//! subscriber; delivery is at-least-once, so consumers must tolerate
//! duplicates. A [`TopicSubscription`] is a channel of received messages
//! with a cancellation-scoped `receive` loop.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use cross_cloud_pubsub::{InMemoryPubSubService, PubSubService};
//!
//! # async fn run() -> cross_cloud_types::ServiceResult<()> {
//! let bus: Arc<dyn PubSubService> = Arc::new(InMemoryPubSubService::new());
//! bus.ensure_topic_exists("orders").await?;
//!
//! let subscription = bus.subscribe("orders").await?;
//! let cancel = CancellationToken::new();
//! tokio::spawn(subscription.receive(
//!     |message| async move { tracing::info!("got {}", message.payload) },
//!     cancel.clone(),
//! ));
//!
//! bus.publish("orders", "order-42").await?;
//! cancel.cancel();
//! # Ok(())
//! # }
//! ```

mod in_memory;
mod service;

pub use in_memory::InMemoryPubSubService;
pub use service::{PubSubService, ReceivedMessage, TopicSubscription};
