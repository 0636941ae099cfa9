//! Broker-backed background job runtime.
//!
//! Application code enqueues jobs (a job name, a handler method and positional
//! arguments) as broker messages; worker processes consume them, dispatch to
//! the registered handler and acknowledge, retry or dead-letter based on the
//! outcome.
//!
//! # Architecture
//!
//! ```text
//!  Publisher ──► ProducerPool ──┐
//!                               ├──► ConnectionManager ──► broker (NATS JetStream)
//!  Listener ◄── ConsumerPool ◄──┘
//!     │
//!     ▼
//!  DeliveryHandler ──► before_perform ─► handler ─► rescue ─► ack / nack / DLQ ─► after_perform
//! ```
//!
//! # Key Features
//!
//! - **Pooled resources**: one connection per process, one producer per topic,
//!   one consumer per (topic, subscription)
//! - **Failover**: shuffled multi-host connect with a bounded retry budget
//! - **Single or batched delivery**, with per-message settlement
//! - **Dead-letter routing**: argument errors and deliveries past the
//!   redelivery threshold are republished byte-for-byte to the DLQ topic
//! - **Graceful shutdown**: stop, drain with a deadline, close
//!
//! # Example
//!
//! ```rust,ignore
//! use job_runtime::{HandlerError, HandlerInput, JobDefinition, JobRuntime, RuntimeConfig};
//! use core_config::FromEnv;
//! use serde_json::json;
//!
//! let runtime = JobRuntime::nats(RuntimeConfig::from_env()?);
//!
//! let mailer = JobDefinition::builder("MailerJob")
//!     .topic("jobs.mail")
//!     .dlq_topic("jobs.mail.dlq")
//!     .handler("perform", |input: HandlerInput| async move {
//!         let (user_id, template): (u64, String) = input.parse_args()?;
//!         send_mail(user_id, &template).await.map_err(HandlerError::failed)?;
//!         Ok::<_, HandlerError>(json!("sent"))
//!     })
//!     .build(runtime.config())?;
//!
//! runtime.publisher().publish(&mailer, vec![json!(42), json!("welcome")]).await?;
//! runtime.spawn(mailer).await?;
//! runtime.run_until_signal().await;
//! ```

pub mod async_call;
pub mod broker;
pub mod callbacks;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod job;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod publisher;
pub mod rescue;
pub mod runtime;

pub use async_call::{AsyncCall, AsyncTargets};
pub use broker::{
    Broker, BrokerConnection, BrokerConsumer, BrokerProducer, InMemoryBroker, Message, MessageId,
    NatsBroker,
};
pub use callbacks::{CallbackFlow, CallbackStage, Callbacks};
pub use config::{ConsumerOptions, ConsumerType, RuntimeConfig, DEFAULT_HANDLER_METHOD};
pub use delivery::{Delivery, DeliveryHandler, DeliveryOutcome};
pub use envelope::{JobEnvelope, Payload};
pub use error::{ArgumentError, BrokerError, ErrorCategory, HandlerError, JobError};
pub use handler::{Handler, HandlerInput, HandlerRegistry, RawDelivery};
pub use job::{JobBuilder, JobDefinition, JobDescriptor};
pub use listener::{Listener, ListenerHandle, ListenerState};
pub use metrics::{init_metrics, render_metrics, JobMetrics};
pub use publisher::{PublishOutcome, Publisher};
pub use rescue::RescueRegistry;
pub use runtime::JobRuntime;
