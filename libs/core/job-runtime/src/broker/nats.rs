//! NATS JetStream binding.
//!
//! Mapping:
//! - topic `t` is published on subject `t` and stored in stream `stream_name(t)`
//! - subscription `s` is the durable pull consumer `durable_name(s)` with explicit acks
//! - redelivery count is JetStream's `delivered - 1`
//! - negative acknowledgment is `Nak` with no delay

use super::{
    Broker, BrokerConnection, BrokerConsumer, BrokerProducer, ConnectOptions, Message,
    ProducerOptions, Receipt,
};
use crate::config::ConsumerOptions;
use crate::error::BrokerError;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{AckKind, Context};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// JetStream stream name for a topic (`jobs.email` becomes `JOBS_EMAIL`).
pub fn stream_name(topic: &str) -> String {
    sanitize(topic).to_uppercase()
}

/// Durable consumer name for a subscription.
pub fn durable_name(subscription: &str) -> String {
    sanitize(subscription)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn is_not_found(error: &impl std::fmt::Display) -> bool {
    error.to_string().to_lowercase().contains("not found")
}

/// [`Broker`] backed by NATS JetStream.
#[derive(Debug, Clone, Default)]
pub struct NatsBroker {
    client_name: Option<String>,
}

impl NatsBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name advertised to the server for every connection.
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn connect(
        &self,
        host: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let url = format!("{}://{}", options.scheme, host);

        let mut connect_options = async_nats::ConnectOptions::new()
            .connection_timeout(options.connection_timeout)
            .request_timeout(Some(options.operation_timeout));
        if let Some(name) = &self.client_name {
            connect_options = connect_options.name(name.as_str());
        }

        let client = connect_options
            .connect(url.as_str())
            .await
            .map_err(|e| BrokerError::connect(format!("{url}: {e}")))?;

        info!(url = %url, "Connected to NATS");

        Ok(Arc::new(NatsConnection {
            jetstream: async_nats::jetstream::new(client.clone()),
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

struct NatsConnection {
    client: async_nats::Client,
    jetstream: Context,
    closed: AtomicBool,
}

impl NatsConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed("nats connection".to_string()));
        }
        Ok(())
    }

    /// Ensure the stream backing `topic` exists, creating it if necessary.
    async fn ensure_stream(&self, topic: &str) -> Result<(), BrokerError> {
        let name = stream_name(topic);
        match self.jetstream.get_stream(&name).await {
            Ok(_) => {
                debug!(stream = %name, "Stream already exists");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                info!(stream = %name, subject = %topic, "Creating stream");
                self.jetstream
                    .create_stream(StreamConfig {
                        name: name.clone(),
                        subjects: vec![topic.to_string()],
                        ..Default::default()
                    })
                    .await
                    .map_err(BrokerError::operation)?;
                Ok(())
            }
            Err(e) => Err(BrokerError::operation(e)),
        }
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    async fn subscribe(
        &self,
        topics: &[String],
        subscription: &str,
        options: &ConsumerOptions,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        self.ensure_open()?;
        let topic = topics
            .first()
            .ok_or_else(|| BrokerError::Operation("no topic to subscribe to".to_string()))?;

        let stream = self
            .jetstream
            .get_stream(stream_name(topic))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BrokerError::TopicNotFound(topic.clone())
                } else {
                    BrokerError::operation(e)
                }
            })?;

        let durable = durable_name(subscription);
        let consumer = match stream.get_consumer::<PullConfig>(&durable).await {
            Ok(consumer) => consumer,
            Err(_) => {
                info!(
                    consumer = %durable,
                    topic = %topic,
                    consumer_type = %options.consumer_type,
                    "Creating durable consumer"
                );
                stream
                    .create_consumer(PullConfig {
                        durable_name: Some(durable.clone()),
                        name: Some(durable.clone()),
                        ack_policy: AckPolicy::Explicit,
                        filter_subject: topic.clone(),
                        ..Default::default()
                    })
                    .await
                    .map_err(BrokerError::operation)?
            }
        };

        Ok(Arc::new(NatsConsumer {
            consumer,
            topic: topic.clone(),
            options: options.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_producer(
        &self,
        topic: &str,
        options: &ProducerOptions,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        self.ensure_open()?;
        self.ensure_stream(topic).await?;

        debug!(topic = %topic, producer = %options.producer_name, "Producer ready");

        Ok(Arc::new(NatsProducer {
            jetstream: self.jetstream.clone(),
            subject: topic.to_string(),
            send_timeout: options.send_timeout,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.flush().await.map_err(BrokerError::operation)
    }
}

struct NatsConsumer {
    consumer: Consumer<PullConfig>,
    topic: String,
    options: ConsumerOptions,
    closed: AtomicBool,
}

impl NatsConsumer {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed(self.topic.clone()));
        }
        Ok(())
    }

    async fn pull(&self, max: usize, expires: Duration) -> Result<Vec<Message>, BrokerError> {
        self.ensure_open()?;

        let mut batch = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(expires)
            .messages()
            .await
            .map_err(BrokerError::operation)?;

        let mut messages = Vec::new();
        while let Some(next) = batch.next().await {
            match next {
                Ok(message) => messages.push(self.wrap(message)),
                Err(e) => warn!(topic = %self.topic, error = %e, "Error receiving message"),
            }
        }
        Ok(messages)
    }

    fn wrap(&self, message: async_nats::jetstream::Message) -> Message {
        let (id, redelivery_count) = match message.info() {
            Ok(info) => (
                info.stream_sequence.to_string(),
                u32::try_from(info.delivered.saturating_sub(1)).unwrap_or(u32::MAX),
            ),
            Err(e) => {
                warn!(error = %e, "Failed to get message info, using defaults");
                (uuid::Uuid::new_v4().to_string(), 0)
            }
        };
        let data = message.payload.to_vec();
        Message::new(id, self.topic.clone(), data, redelivery_count, Receipt::new(message))
    }

    fn native<'a>(
        &self,
        message: &'a Message,
    ) -> Result<&'a async_nats::jetstream::Message, BrokerError> {
        message
            .receipt()
            .downcast_ref::<async_nats::jetstream::Message>()
            .ok_or_else(|| BrokerError::Operation("message was not received from NATS".to_string()))
    }
}

#[async_trait]
impl BrokerConsumer for NatsConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Message, BrokerError> {
        self.pull(1, timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::timeout(format!("no message within {timeout:?}")))
    }

    async fn batch_receive(&self) -> Result<Vec<Message>, BrokerError> {
        self.pull(self.options.batch_max_messages.max(1), self.options.batch_timeout)
            .await
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        self.native(message)?
            .ack()
            .await
            .map_err(BrokerError::operation)
    }

    async fn negative_acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        self.native(message)?
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(BrokerError::operation)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct NatsProducer {
    jetstream: Context,
    subject: String,
    send_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerProducer for NatsProducer {
    async fn send(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed(format!("producer {}", self.subject)));
        }

        let publish = async {
            self.jetstream
                .publish(self.subject.clone(), payload.into())
                .await
                .map_err(BrokerError::operation)?
                .await
                .map_err(BrokerError::operation)
        };

        let ack = tokio::time::timeout(self.send_timeout, publish)
            .await
            .map_err(|_| BrokerError::timeout(format!("send to {}", self.subject)))??;

        debug!(subject = %self.subject, sequence = ack.sequence, "Published message");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
