//! One consumer per (topic, subscription), created on first use.

use super::ConnectionManager;
use crate::broker::BrokerConsumer;
use crate::config::ConsumerOptions;
use crate::error::JobError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Cache key: a subscription is only meaningful on its topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub topic: String,
    pub subscription: String,
}

impl ConsumerKey {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }
}

pub struct ConsumerPool {
    connections: Arc<ConnectionManager>,
    consumers: Mutex<HashMap<ConsumerKey, Arc<dyn BrokerConsumer>>>,
}

impl ConsumerPool {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the consumer for `(topic, subscription)`, subscribing on first use.
    ///
    /// Broker errors (including `TopicNotFound`) propagate unchanged.
    pub async fn get_or_create(
        &self,
        topic: &str,
        subscription: &str,
        options: &ConsumerOptions,
    ) -> Result<Arc<dyn BrokerConsumer>, JobError> {
        let key = ConsumerKey::new(topic, subscription);
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(&key) {
            return Ok(consumer.clone());
        }

        let consumer = self
            .connections
            .connection()
            .await?
            .subscribe(&[topic.to_string()], subscription, options)
            .await?;

        debug!(topic = %topic, subscription = %subscription, "Consumer created");
        consumers.insert(key, consumer.clone());
        Ok(consumer)
    }

    /// Remove the cached consumer for `(topic, subscription)` without closing it.
    pub async fn release(&self, topic: &str, subscription: &str) -> Option<Arc<dyn BrokerConsumer>> {
        self.consumers
            .lock()
            .await
            .remove(&ConsumerKey::new(topic, subscription))
    }

    pub async fn len(&self) -> usize {
        self.consumers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every cached consumer and clear the cache.
    pub async fn shutdown(&self) {
        let consumers: Vec<_> = self.consumers.lock().await.drain().collect();
        if consumers.is_empty() {
            return;
        }
        for (key, consumer) in consumers {
            if let Err(e) = consumer.close().await {
                warn!(
                    topic = %key.topic,
                    subscription = %key.subscription,
                    error = %e,
                    "Failed to close consumer"
                );
            }
        }
        debug!("Consumers closed");
    }
}
