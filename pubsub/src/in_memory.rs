use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use cross_cloud_types::{ServiceError, ServiceResult};

use crate::service::{PubSubService, ReceivedMessage, TopicSubscription};

/// An in-process pub/sub bus. Every subscriber gets an unbounded queue;
/// publishing fans out to all of them and prunes queues whose receivers
/// were dropped.
pub struct InMemoryPubSubService {
    topics: Mutex<HashMap<String, Vec<async_channel::Sender<ReceivedMessage>>>>,
    bucket_event_topics: Mutex<HashSet<String>>,
}

impl InMemoryPubSubService {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            bucket_event_topics: Mutex::new(HashSet::new()),
        }
    }

    fn validated(topic: &str) -> ServiceResult<()> {
        if topic.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "topic must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryPubSubService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubService for InMemoryPubSubService {
    async fn ensure_topic_exists(&self, topic: &str) -> ServiceResult<()> {
        Self::validated(topic)?;
        self.topics.lock().entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &str) -> ServiceResult<()> {
        Self::validated(topic)?;
        if message.is_empty() {
            return Err(ServiceError::InvalidInput(
                "message must not be empty".to_string(),
            ));
        }

        let senders = {
            let mut topics = self.topics.lock();
            let senders = topics.entry(topic.to_string()).or_default();
            senders.retain(|s| !s.is_closed());
            senders.clone()
        };

        for sender in senders {
            let delivery = ReceivedMessage {
                topic: topic.to_string(),
                payload: message.to_string(),
            };
            if sender.send(delivery).await.is_err() {
                tracing::trace!("dropping message for closed subscriber on {topic}");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> ServiceResult<TopicSubscription> {
        Self::validated(topic)?;
        let (sender, receiver) = async_channel::unbounded();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        Ok(TopicSubscription::new(topic.to_string(), receiver))
    }

    async fn delete_topic(&self, topic: &str) -> ServiceResult<()> {
        Self::validated(topic)?;
        if let Some(senders) = self.topics.lock().remove(topic) {
            for sender in senders {
                sender.close();
            }
        }
        Ok(())
    }

    async fn mark_used_on_bucket_event(&self, topic: &str) -> ServiceResult<()> {
        Self::validated(topic)?;
        self.bucket_event_topics.lock().insert(topic.to_string());
        Ok(())
    }

    async fn unmark_used_on_bucket_event(&self, topic: &str) -> ServiceResult<()> {
        Self::validated(topic)?;
        self.bucket_event_topics.lock().remove(topic);
        Ok(())
    }

    async fn topics_used_on_bucket_event(&self) -> ServiceResult<Vec<String>> {
        let mut topics: Vec<String> = self.bucket_event_topics.lock().iter().cloned().collect();
        topics.sort();
        Ok(topics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[ctor::ctor]
    fn init() {
        let _ = tracing_subscriber::fmt().try_init();
    }

    #[tokio::test]
    async fn publish_rejects_empty_topic_and_message() {
        let bus = InMemoryPubSubService::new();
        assert_eq!(bus.publish("", "m").await.unwrap_err().status_code(), 400);
        assert_eq!(bus.publish("t", "").await.unwrap_err().status_code(), 400);
    }

    #[tokio::test]
    async fn fanout_reaches_every_subscriber() -> Result<(), anyhow::Error> {
        let bus = InMemoryPubSubService::new();
        bus.ensure_topic_exists("fanout").await?;
        let first = bus.subscribe("fanout").await?;
        let second = bus.subscribe("fanout").await?;

        bus.publish("fanout", "hello").await?;

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a.payload, "hello");
        assert_eq!(b.payload, "hello");
        assert_eq!(a.topic, "fanout");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_loop_stops_on_cancel() -> Result<(), anyhow::Error> {
        let bus = InMemoryPubSubService::new();
        let subscription = bus.subscribe("loop").await?;

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(subscription.receive(
            move |_message| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            },
            cancel.clone(),
        ));

        bus.publish("loop", "one").await?;
        bus.publish("loop", "two").await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await?;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn delete_topic_closes_subscribers() -> Result<(), anyhow::Error> {
        let bus = InMemoryPubSubService::new();
        let subscription = bus.subscribe("gone").await?;
        bus.delete_topic("gone").await?;
        assert!(subscription.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn bucket_event_marker_set() -> Result<(), anyhow::Error> {
        let bus = InMemoryPubSubService::new();
        bus.mark_used_on_bucket_event("b").await?;
        bus.mark_used_on_bucket_event("a").await?;
        bus.mark_used_on_bucket_event("a").await?;
        assert_eq!(bus.topics_used_on_bucket_event().await?, vec!["a", "b"]);

        bus.unmark_used_on_bucket_event("a").await?;
        assert_eq!(bus.topics_used_on_bucket_event().await?, vec!["b"]);
        Ok(())
    }
}
