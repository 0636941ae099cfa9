//! One producer per topic, created on first use.

use super::ConnectionManager;
use crate::broker::{BrokerProducer, ProducerOptions};
use crate::error::JobError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct ProducerPool {
    connections: Arc<ConnectionManager>,
    producers: Mutex<HashMap<String, Arc<dyn BrokerProducer>>>,
}

impl ProducerPool {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            producers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the producer for `topic`, creating it on first use.
    ///
    /// Creation failures propagate unchanged and nothing is cached.
    pub async fn get_or_create(&self, topic: &str) -> Result<Arc<dyn BrokerProducer>, JobError> {
        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(topic) {
            return Ok(producer.clone());
        }

        let config = self.connections.config();
        let options = ProducerOptions {
            producer_name: config.producer_name(),
            send_timeout: config.producer_send_timeout,
        };
        let producer = self
            .connections
            .connection()
            .await?
            .create_producer(topic, &options)
            .await?;

        debug!(topic = %topic, "Producer created");
        producers.insert(topic.to_string(), producer.clone());
        Ok(producer)
    }

    pub async fn len(&self) -> usize {
        self.producers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every cached producer and clear the cache.
    pub async fn shutdown(&self) {
        let producers: Vec<_> = self.producers.lock().await.drain().collect();
        if producers.is_empty() {
            return;
        }
        for (topic, producer) in producers {
            if let Err(e) = producer.close().await {
                warn!(topic = %topic, error = %e, "Failed to close producer");
            }
        }
        debug!("Producers closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::RuntimeConfig;

    fn pool(broker: &InMemoryBroker) -> ProducerPool {
        let connections = ConnectionManager::new(
            Arc::new(broker.clone()),
            RuntimeConfig::new("memory://local"),
        );
        ProducerPool::new(Arc::new(connections))
    }

    #[tokio::test]
    async fn test_same_topic_returns_cached_producer() {
        let broker = InMemoryBroker::new();
        let pool = pool(&broker);

        let first = pool.get_or_create("jobs").await.unwrap();
        let second = pool.get_or_create("jobs").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.producers_created(), 1);
    }

    #[tokio::test]
    async fn test_distinct_topics_get_distinct_producers() {
        let broker = InMemoryBroker::new();
        let pool = pool(&broker);

        pool.get_or_create("jobs").await.unwrap();
        pool.get_or_create("jobs.dlq").await.unwrap();

        assert_eq!(pool.len().await, 2);
        assert_eq!(broker.producers_created(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_opens_one_producer() {
        let broker = InMemoryBroker::new();
        let pool = Arc::new(pool(&broker));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_or_create("jobs").await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(broker.producers_created(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_clears() {
        let broker = InMemoryBroker::new();
        let pool = pool(&broker);
        pool.shutdown().await;

        let producer = pool.get_or_create("jobs").await.unwrap();
        pool.shutdown().await;

        assert!(pool.is_empty().await);
        assert!(producer.send(b"late".to_vec()).await.is_err());
    }
}
