use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cross_cloud_types::ServiceResult;

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: String,
}

/// TopicSubscription is one subscriber's queue on a topic. The channel
/// closes when the topic is deleted or the service goes away.
pub struct TopicSubscription {
    topic: String,
    receiver: async_channel::Receiver<ReceivedMessage>,
}

impl TopicSubscription {
    pub fn new(topic: String, receiver: async_channel::Receiver<ReceivedMessage>) -> Self {
        Self { topic, receiver }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// recv returns the next message, or `None` once the topic is gone.
    pub async fn recv(&self) -> Option<ReceivedMessage> {
        self.receiver.recv().await.ok()
    }

    /// receive runs `f` for every delivered message until the token is
    /// cancelled or the topic is deleted.
    pub async fn receive<F, Fut>(self, f: F, cancel: CancellationToken)
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::trace!("stop message receiver: {}", self.topic);
                    return;
                }
                message = self.receiver.recv() => match message {
                    Ok(message) => f(message).await,
                    Err(_) => {
                        tracing::trace!("topic channel closed: {}", self.topic);
                        return;
                    }
                }
            }
        }
    }
}

/// The pub/sub contract: topic lifecycle, at-least-once publish with
/// fanout to every subscriber, and the bucket-event marker set the file
/// services use to track which topics carry bucket change notifications.
#[async_trait]
pub trait PubSubService: Send + Sync {
    /// ensure_topic_exists creates the topic if it is not already there.
    async fn ensure_topic_exists(&self, topic: &str) -> ServiceResult<()>;

    /// publish delivers `message` to every current subscriber of `topic`.
    /// Empty topic or message is invalid input.
    async fn publish(&self, topic: &str, message: &str) -> ServiceResult<()>;

    /// subscribe registers a new subscriber and returns its queue.
    async fn subscribe(&self, topic: &str) -> ServiceResult<TopicSubscription>;

    /// delete_topic removes the topic and closes all subscriber queues.
    async fn delete_topic(&self, topic: &str) -> ServiceResult<()>;

    async fn mark_used_on_bucket_event(&self, topic: &str) -> ServiceResult<()>;

    async fn unmark_used_on_bucket_event(&self, topic: &str) -> ServiceResult<()>;

    async fn topics_used_on_bucket_event(&self) -> ServiceResult<Vec<String>>;
}
