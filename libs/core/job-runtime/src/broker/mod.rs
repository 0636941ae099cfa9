//! Broker abstraction layer
//!
//! The runtime never speaks a wire protocol itself: it drives these traits and
//! interprets their [`BrokerError`] taxonomy. Implementations:
//! - [`NatsBroker`]: NATS JetStream via `async-nats`
//! - [`InMemoryBroker`]: in-process queues, for tests and local development

mod memory;
mod nats;

pub use memory::InMemoryBroker;
pub use nats::{stream_name, NatsBroker};

use crate::config::ConsumerOptions;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque handle a binding attaches to a message so it can later ack/nack it.
#[derive(Clone)]
pub struct Receipt(Arc<dyn Any + Send + Sync>);

impl Receipt {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Receipt(..)")
    }
}

/// A message handed out by a consumer.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    topic: String,
    data: Vec<u8>,
    redelivery_count: u32,
    publish_time: Option<DateTime<Utc>>,
    receipt: Receipt,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        data: Vec<u8>,
        redelivery_count: u32,
        receipt: Receipt,
    ) -> Self {
        Self {
            id: MessageId(id.into()),
            topic: topic.into(),
            data,
            redelivery_count,
            publish_time: None,
            receipt,
        }
    }

    pub fn with_publish_time(mut self, publish_time: DateTime<Utc>) -> Self {
        self.publish_time = Some(publish_time);
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Raw message body, exactly as published.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Times the broker has resent this message (0 on first delivery).
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    pub fn publish_time(&self) -> Option<DateTime<Utc>> {
        self.publish_time
    }

    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }
}

/// Options for a single connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// URL scheme the host was configured with
    pub scheme: String,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
}

/// Options for creating a producer.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub producer_name: String,
    pub send_timeout: Duration,
}

/// Connects to a single broker host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// An established broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn subscribe(
        &self,
        topics: &[String],
        subscription: &str,
        options: &ConsumerOptions,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;

    async fn create_producer(
        &self,
        topic: &str,
        options: &ProducerOptions,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Inbound channel for one (topic, subscription) pair.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Wait up to `timeout` for one message; `Timeout` when none arrived.
    async fn receive(&self, timeout: Duration) -> Result<Message, BrokerError>;

    /// Receive whatever the batch policy collects; may be empty.
    async fn batch_receive(&self) -> Result<Vec<Message>, BrokerError>;

    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError>;

    async fn negative_acknowledge(&self, message: &Message) -> Result<(), BrokerError>;

    /// Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Outbound channel for one topic.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(&self, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}
