//! Delivery handling: decode, dispatch, rescue, then acknowledge,
//! negatively acknowledge or dead-letter.
//!
//! ```text
//! before_perform ─┬─ abort ──────────────────────────────► (no settlement)
//!                 └─ prepare (single | batched)
//!                        │
//!                    handler.call ──► rescue registry ──► reset descriptor
//!                        │
//!             ok ──► ack every message
//!             err ─► argument error or redelivery >= max ?
//!                      ├─ yes + dlq topic ─► publish_raw each body ─► ack
//!                      └─ otherwise ─────────────────────────────► nack
//!                        │
//!                  after_perform
//! ```

mod batched;
mod single;

use crate::broker::{BrokerConsumer, Message};
use crate::callbacks::CallbackFlow;
use crate::error::{HandlerError, JobError};
use crate::handler::HandlerInput;
use crate::job::{JobDefinition, JobDescriptor};
use crate::metrics::JobMetrics;
use crate::publisher::Publisher;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// What one receive handed to the listener.
#[derive(Debug, Clone)]
pub enum Delivery {
    One(Message),
    /// Non-empty, in received order
    Batch(Vec<Message>),
}

impl Delivery {
    pub fn messages(&self) -> &[Message] {
        match self {
            Delivery::One(message) => std::slice::from_ref(message),
            Delivery::Batch(messages) => messages,
        }
    }

    /// Highest redelivery count among the delivered messages.
    pub fn redelivery_count(&self) -> u32 {
        self.messages()
            .iter()
            .map(Message::redelivery_count)
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    NegativelyAcknowledged,
    /// Republished to the dead-letter topic, then acknowledged
    DeadLettered,
    /// A before-perform callback aborted; nothing was settled
    Skipped,
}

pub struct DeliveryHandler {
    job: Arc<JobDefinition>,
    consumer: Arc<dyn BrokerConsumer>,
    publisher: Publisher,
    metrics: JobMetrics,
}

impl DeliveryHandler {
    pub fn new(
        job: Arc<JobDefinition>,
        consumer: Arc<dyn BrokerConsumer>,
        publisher: Publisher,
    ) -> Self {
        let metrics = JobMetrics::new(job.name(), job.topic());
        Self {
            job,
            consumer,
            publisher,
            metrics,
        }
    }

    /// Handle one delivery. Every failure becomes a settlement decision.
    pub async fn handle(&self, descriptor: &mut JobDescriptor, delivery: Delivery) -> DeliveryOutcome {
        self.metrics.received(delivery.len());
        descriptor.raw = Some(delivery.clone());

        let perform = &self.job.callbacks().perform;
        if perform.run_before(descriptor) == CallbackFlow::Abort {
            debug!(
                job = %self.job.name(),
                messages = delivery.len(),
                "Delivery skipped by before-perform callback"
            );
            return DeliveryOutcome::Skipped;
        }

        let started = Instant::now();
        let result = self.execute(descriptor, &delivery).await;
        self.metrics.handled(started.elapsed(), result.is_ok());

        let outcome = match result {
            Ok(()) => self.acknowledge(&delivery).await,
            Err(e) => self.on_error(&delivery, &e).await,
        };

        perform.run_after(descriptor);
        outcome
    }

    async fn execute(
        &self,
        descriptor: &mut JobDescriptor,
        delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        let prepared = match delivery {
            Delivery::One(message) => single::prepare(&self.job, descriptor, message),
            Delivery::Batch(messages) => Ok(batched::prepare(descriptor, messages)),
        };

        let result = match prepared {
            Ok(input) => invoke(&self.job, input).await.map(|value| {
                descriptor.result = Some(value);
            }),
            Err(e) => Err(e),
        };

        let result = match result {
            Ok(()) => Ok(()),
            Err(e) => match self.job.rescue().handle(descriptor, &e) {
                Some(rescued) => rescued,
                None => Err(e),
            },
        };

        descriptor.reset();
        result
    }

    /// Decide between dead-lettering and negative acknowledgment.
    async fn on_error(&self, delivery: &Delivery, failure: &HandlerError) -> DeliveryOutcome {
        let redelivery_count = delivery.redelivery_count();
        let max_redelivery_count = self.job.max_redelivery_count();
        let argument_error = failure.is_argument_error();

        warn!(
            job = %self.job.name(),
            error = %failure,
            redelivery_count = redelivery_count,
            max_redelivery_count = max_redelivery_count,
            "Job handler failed"
        );

        if argument_error || redelivery_count >= max_redelivery_count {
            match self.job.dlq_topic() {
                Some(dlq_topic) => match self.dead_letter(dlq_topic, delivery).await {
                    Ok(()) => {
                        self.ack_each(delivery).await;
                        self.metrics.dead_lettered(delivery.len());
                        warn!(
                            job = %self.job.name(),
                            dlq_topic = %dlq_topic,
                            messages = delivery.len(),
                            argument_error = argument_error,
                            "Delivery moved to dead-letter topic"
                        );
                        return DeliveryOutcome::DeadLettered;
                    }
                    Err(e) => {
                        error!(
                            job = %self.job.name(),
                            dlq_topic = %dlq_topic,
                            error = %e,
                            "Dead-letter publish failed, requesting redelivery"
                        );
                    }
                },
                None => {
                    debug!(
                        job = %self.job.name(),
                        "No dead-letter topic configured, requesting redelivery"
                    );
                }
            }
        }

        self.negative_acknowledge(delivery).await
    }

    async fn dead_letter(&self, dlq_topic: &str, delivery: &Delivery) -> Result<(), JobError> {
        for message in delivery.messages() {
            self.publisher
                .publish_raw(dlq_topic, message.data().to_vec())
                .await?;
        }
        Ok(())
    }

    async fn acknowledge(&self, delivery: &Delivery) -> DeliveryOutcome {
        self.ack_each(delivery).await;
        self.metrics.acknowledged(delivery.len());
        debug!(job = %self.job.name(), messages = delivery.len(), "Delivery acknowledged");
        DeliveryOutcome::Acknowledged
    }

    async fn ack_each(&self, delivery: &Delivery) {
        for message in delivery.messages() {
            if let Err(e) = self.consumer.acknowledge(message).await {
                warn!(message_id = %message.id(), error = %e, "Failed to acknowledge message");
            }
        }
    }

    async fn negative_acknowledge(&self, delivery: &Delivery) -> DeliveryOutcome {
        for message in delivery.messages() {
            if let Err(e) = self.consumer.negative_acknowledge(message).await {
                warn!(
                    message_id = %message.id(),
                    error = %e,
                    "Failed to negatively acknowledge message"
                );
            }
        }
        self.metrics.negatively_acknowledged(delivery.len());
        debug!(
            job = %self.job.name(),
            messages = delivery.len(),
            "Delivery negatively acknowledged"
        );
        DeliveryOutcome::NegativelyAcknowledged
    }
}

/// Call the bound handler; a panic counts as a handler failure.
async fn invoke(job: &JobDefinition, input: HandlerInput) -> Result<serde_json::Value, HandlerError> {
    match AssertUnwindSafe(job.handler().call(input)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::msg(format!(
            "handler '{}' panicked: {}",
            job.handler_method(),
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, Receipt};
    use crate::config::RuntimeConfig;
    use crate::error::ArgumentError;
    use crate::handler::HandlerInput;
    use crate::job::JobBuilder;
    use crate::pool::{ConnectionManager, ConsumerPool, ProducerPool};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    const TOPIC: &str = "jobs.work";
    const SUBSCRIPTION: &str = "workers";

    struct Fixture {
        broker: InMemoryBroker,
        consumer: Arc<dyn BrokerConsumer>,
        publisher: Publisher,
        config: RuntimeConfig,
    }

    impl Fixture {
        async fn new() -> Self {
            let broker = InMemoryBroker::new();
            broker.create_topic(TOPIC);
            let config = RuntimeConfig::new("memory://local");
            let connections = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), config.clone()));
            let consumers = ConsumerPool::new(connections.clone());
            let consumer = consumers
                .get_or_create(TOPIC, SUBSCRIPTION, &config.consumer_options())
                .await
                .unwrap();
            let publisher = Publisher::new(Arc::new(ProducerPool::new(connections)));
            Self {
                broker,
                consumer,
                publisher,
                config,
            }
        }

        fn builder(&self) -> JobBuilder {
            JobDefinition::builder("WorkJob")
                .topic(TOPIC)
                .subscription(SUBSCRIPTION)
        }

        async fn handle(&self, job: Arc<JobDefinition>, redelivery_count: u32, body: &[u8]) -> DeliveryOutcome {
            self.broker.publish_redelivered(TOPIC, body.to_vec(), redelivery_count);
            let message = self.consumer.receive(Duration::from_millis(50)).await.unwrap();
            let handler = DeliveryHandler::new(job.clone(), self.consumer.clone(), self.publisher.clone());
            let mut descriptor = job.descriptor();
            handler.handle(&mut descriptor, Delivery::One(message)).await
        }
    }

    fn failing(_: HandlerInput) -> futures::future::Ready<Result<Value, HandlerError>> {
        futures::future::ready(Err(HandlerError::msg("boom")))
    }

    #[tokio::test]
    async fn test_success_acknowledges_and_stores_result() {
        let fixture = Fixture::new().await;
        let seen = Arc::new(Mutex::new(None));
        let seen_in_after = seen.clone();
        let job = fixture
            .builder()
            .handler("perform", |input: HandlerInput| async move {
                let (a, b): (i64, i64) = input.parse_args()?;
                Ok::<_, HandlerError>(json!(a * b))
            })
            .after_perform(move |job| {
                *seen_in_after.lock().unwrap() = Some(job.result.clone());
            })
            .build(&fixture.config)
            .unwrap();

        let outcome = fixture.handle(job, 0, br#"{"job":"WorkJob","args":[6,7]}"#).await;

        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert_eq!(fixture.broker.acked(TOPIC, SUBSCRIPTION), 1);
        assert_eq!(fixture.broker.nacked(TOPIC, SUBSCRIPTION), 0);
        // the per-delivery context is cleared before after_perform runs
        assert_eq!(*seen.lock().unwrap(), Some(None));
    }

    #[tokio::test]
    async fn test_failure_below_threshold_nacks() {
        let fixture = Fixture::new().await;
        let job = fixture
            .builder()
            .handler("perform", failing)
            .dlq_topic("jobs.dlq")
            .max_redelivery_count(3)
            .build(&fixture.config)
            .unwrap();

        for count in 0..3 {
            let outcome = fixture.handle(job.clone(), count, br#"{"args":[]}"#).await;
            assert_eq!(outcome, DeliveryOutcome::NegativelyAcknowledged);
            fixture.consumer.receive(Duration::from_millis(50)).await.unwrap();
        }
        assert!(fixture.broker.published("jobs.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_threshold_reached_dead_letters_exact_bytes() {
        let fixture = Fixture::new().await;
        let job = fixture
            .builder()
            .handler("perform", failing)
            .dlq_topic("jobs.dlq")
            .max_redelivery_count(2)
            .build(&fixture.config)
            .unwrap();
        let body = br#"{"job":"WorkJob","args":[1],  "extra": "kept as-is"}"#;

        let outcome = fixture.handle(job, 2, body).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(fixture.broker.published("jobs.dlq"), vec![body.to_vec()]);
        assert_eq!(fixture.broker.acked(TOPIC, SUBSCRIPTION), 1);
        assert_eq!(fixture.broker.nacked(TOPIC, SUBSCRIPTION), 0);
    }

    #[tokio::test]
    async fn test_argument_error_without_dlq_nacks_once() {
        let fixture = Fixture::new().await;
        let job = fixture
            .builder()
            .handler("perform", |_: HandlerInput| async {
                Err::<Value, _>(HandlerError::from(ArgumentError::new("wrong number of arguments")))
            })
            .max_redelivery_count(1)
            .build(&fixture.config)
            .unwrap();

        let outcome = fixture.handle(job, 1, br#"{"args":[1,2,3]}"#).await;

        assert_eq!(outcome, DeliveryOutcome::NegativelyAcknowledged);
        assert_eq!(fixture.broker.nacked(TOPIC, SUBSCRIPTION), 1);
        assert_eq!(fixture.broker.acked(TOPIC, SUBSCRIPTION), 0);
    }

    #[tokio::test]
    async fn test_argument_error_dead_letters_on_first_delivery() {
        let fixture = Fixture::new().await;
        let job = fixture
            .builder()
            .handler("perform", |input: HandlerInput| async move {
                let (_id,): (u64,) = input.parse_args()?;
                Ok::<_, HandlerError>(Value::Null)
            })
            .dlq_topic("jobs.dlq")
            .max_redelivery_count(5)
            .build(&fixture.config)
            .unwrap();

        let outcome = fixture.handle(job, 0, br#"{"args":["not-a-number"]}"#).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(fixture.broker.published("jobs.dlq").len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_an_argument_error_in_args_mode() {
        let fixture = Fixture::new().await;
        let job = fixture
            .builder()
            .handler("perform", |_: HandlerInput| async { Ok::<_, HandlerError>(Value::Null) })
            .dlq_topic("jobs.dlq")
            .build(&fixture.config)
            .unwrap();

        let outcome = fixture.handle(job, 0, b"\x00not json").await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(fixture.broker.published("jobs.dlq"), vec![b"\x00not json".to_vec()]);
    }

    #[tokio::test]
    async fn test_rescued_error_acknowledges() {
        let fixture = Fixture::new().await;
        let job = fixture
            .builder()
            .handler("perform", failing)
            .rescue_all(|_, _| Ok(()))
            .build(&fixture.config)
            .unwrap();

        let outcome = fixture.handle(job, 0, br#"{"args":[]}"#).await;
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn test_before_perform_abort_skips_body_and_settlement() {
        let fixture = Fixture::new().await;
        let after_ran = Arc::new(Mutex::new(false));
        let flag = after_ran.clone();
        let job = fixture
            .builder()
            .handler("perform", failing)
            .before_perform(|_| CallbackFlow::Abort)
            .after_perform(move |_| *flag.lock().unwrap() = true)
            .build(&fixture.config)
            .unwrap();

        let outcome = fixture.handle(job, 0, br#"{"args":[]}"#).await;

        assert_eq!(outcome, DeliveryOutcome::Skipped);
        assert_eq!(fixture.broker.acked(TOPIC, SUBSCRIPTION), 0);
        assert_eq!(fixture.broker.nacked(TOPIC, SUBSCRIPTION), 0);
        assert!(!*after_ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_after_perform_runs_on_failure() {
        let fixture = Fixture::new().await;
        let after_ran = Arc::new(Mutex::new(false));
        let flag = after_ran.clone();
        let job = fixture
            .builder()
            .handler("perform", failing)
            .after_perform(move |_| *flag.lock().unwrap() = true)
            .build(&fixture.config)
            .unwrap();

        fixture.handle(job, 0, br#"{"args":[]}"#).await;
        assert!(*after_ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_failure() {
        let fixture = Fixture::new().await;
        let job = fixture
            .builder()
            .handler("perform", |_: HandlerInput| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<_, HandlerError>(Value::Null)
            })
            .build(&fixture.config)
            .unwrap();

        let outcome = fixture.handle(job, 0, br#"{"args":[]}"#).await;
        assert_eq!(outcome, DeliveryOutcome::NegativelyAcknowledged);
    }

    #[test]
    fn test_batch_redelivery_count_is_maximum() {
        let message = |count| Message::new("m", TOPIC, vec![], count, Receipt::new(()));
        let delivery = Delivery::Batch(vec![message(0), message(4), message(1)]);
        assert_eq!(delivery.redelivery_count(), 4);
        assert_eq!(delivery.len(), 3);
        assert_eq!(Delivery::One(message(2)).redelivery_count(), 2);
    }
}
