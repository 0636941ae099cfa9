//! Outbound side: wraps arguments in a [`JobEnvelope`] and sends it through
//! the producer pool.

use crate::callbacks::CallbackFlow;
use crate::envelope::JobEnvelope;
use crate::error::JobError;
use crate::job::JobDefinition;
use crate::metrics;
use crate::pool::ProducerPool;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of [`Publisher::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// A before-enqueue callback aborted the publish
    Aborted,
}

#[derive(Clone)]
pub struct Publisher {
    producers: Arc<ProducerPool>,
}

impl Publisher {
    pub fn new(producers: Arc<ProducerPool>) -> Self {
        Self { producers }
    }

    /// Enqueue `job` with positional `args`, running its enqueue callbacks.
    pub async fn publish(
        &self,
        job: &JobDefinition,
        args: Vec<Value>,
    ) -> Result<PublishOutcome, JobError> {
        let mut descriptor = job.descriptor();
        descriptor.args = args;

        let enqueue = &job.callbacks().enqueue;
        if enqueue.run_before(&descriptor) == CallbackFlow::Abort {
            info!(job = %job.name(), topic = %job.topic(), "Publish aborted by before-enqueue callback");
            return Ok(PublishOutcome::Aborted);
        }

        let envelope = JobEnvelope::new(
            job.name(),
            job.handler_method(),
            std::mem::take(&mut descriptor.args),
        );
        self.publish_envelope(job.topic(), &envelope).await?;

        descriptor.args = envelope.args;
        descriptor.created_at = Some(envelope.sent_at);
        enqueue.run_after(&descriptor);
        Ok(PublishOutcome::Sent)
    }

    /// Serialize any envelope to JSON and send it to `topic`.
    pub async fn publish_envelope<T: Serialize>(
        &self,
        topic: &str,
        envelope: &T,
    ) -> Result<(), JobError> {
        let body = serde_json::to_vec(envelope)?;
        self.send(topic, body).await
    }

    /// Send `body` unchanged. Used to move a delivery to its dead-letter topic.
    pub async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> Result<(), JobError> {
        self.send(topic, body).await
    }

    async fn send(&self, topic: &str, body: Vec<u8>) -> Result<(), JobError> {
        if topic.trim().is_empty() {
            return Err(JobError::configuration("cannot publish without a topic"));
        }

        let bytes = body.len();
        let producer = self.producers.get_or_create(topic).await?;
        producer.send(body).await?;

        metrics::message_published(topic);
        debug!(topic = %topic, bytes = bytes, "Message published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::RuntimeConfig;
    use crate::error::HandlerError;
    use crate::handler::HandlerInput;
    use crate::pool::ConnectionManager;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn publisher(broker: &InMemoryBroker) -> Publisher {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            RuntimeConfig::new("memory://local"),
        ));
        Publisher::new(Arc::new(ProducerPool::new(connections)))
    }

    fn builder() -> crate::job::JobBuilder {
        JobDefinition::builder("MailerJob")
            .topic("jobs.mail")
            .handler("perform", |_: HandlerInput| async { Ok::<_, HandlerError>(Value::Null) })
    }

    #[tokio::test]
    async fn test_publish_sends_envelope() {
        let broker = InMemoryBroker::new();
        let job = builder().build(&RuntimeConfig::default()).unwrap();

        let outcome = publisher(&broker)
            .publish(&job, vec![json!(42), json!("welcome")])
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Sent);
        let published = broker.published("jobs.mail");
        assert_eq!(published.len(), 1);
        let envelope: JobEnvelope = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(envelope.job, "MailerJob");
        assert_eq!(envelope.method, "perform");
        assert_eq!(envelope.args, vec![json!(42), json!("welcome")]);
    }

    #[tokio::test]
    async fn test_before_enqueue_abort_skips_send_and_after() {
        let broker = InMemoryBroker::new();
        let after = Arc::new(AtomicUsize::new(0));
        let after_count = after.clone();
        let job = builder()
            .before_enqueue(|job| {
                if job.args.is_empty() {
                    CallbackFlow::Abort
                } else {
                    CallbackFlow::Continue
                }
            })
            .after_enqueue(move |_| {
                after_count.fetch_add(1, Ordering::SeqCst);
            })
            .build(&RuntimeConfig::default())
            .unwrap();
        let publisher = publisher(&broker);

        assert_eq!(
            publisher.publish(&job, vec![]).await.unwrap(),
            PublishOutcome::Aborted
        );
        assert!(broker.published("jobs.mail").is_empty());
        assert_eq!(after.load(Ordering::SeqCst), 0);

        publisher.publish(&job, vec![json!(1)]).await.unwrap();
        assert_eq!(broker.published("jobs.mail").len(), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_raw_preserves_bytes() {
        let broker = InMemoryBroker::new();
        let body = vec![0xff, 0x00, b'{', 0x7f];

        publisher(&broker)
            .publish_raw("jobs.dlq", body.clone())
            .await
            .unwrap();

        assert_eq!(broker.published("jobs.dlq"), vec![body]);
    }

    #[tokio::test]
    async fn test_publish_without_topic_is_configuration_error() {
        let broker = InMemoryBroker::new();
        let job = JobDefinition::builder("NoTopicJob")
            .handler("perform", |_: HandlerInput| async { Ok::<_, HandlerError>(Value::Null) })
            .build(&RuntimeConfig::default())
            .unwrap();

        let err = publisher(&broker).publish(&job, vec![]).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
        assert_eq!(broker.producers_created(), 0);
    }
}
