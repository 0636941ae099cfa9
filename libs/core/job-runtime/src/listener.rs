//! Per-job consumption loop.
//!
//! ```text
//! Idle ─► Subscribing ─► Polling ⇄ Handling
//!  │           │            │         │
//!  │           │            └──► Draining ◄┘   (stop requested)
//!  │           │                    │
//!  └───────────┴──────────────► Closed          (terminal)
//! ```
//!
//! Each receive runs on its own task and is joined before the next step, so
//! at most one delivery is outstanding per listener. A stop request is
//! observed between cycles and during the inter-poll delay, never in the
//! middle of handling.

use crate::broker::BrokerConsumer;
use crate::config::RuntimeConfig;
use crate::delivery::{Delivery, DeliveryHandler};
use crate::error::{BrokerError, JobError};
use crate::job::{JobDefinition, JobDescriptor};
use crate::metrics::JobMetrics;
use crate::pool::ConsumerPool;
use crate::publisher::Publisher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ListenerState {
    Idle,
    Subscribing,
    Polling,
    Handling,
    Draining,
    Closed,
}

impl ListenerState {
    fn can_become(self, next: ListenerState) -> bool {
        match self {
            ListenerState::Closed => false,
            ListenerState::Draining => next == ListenerState::Closed,
            _ => self != next,
        }
    }
}

/// State shared between a running listener and its handles.
struct Shared {
    job: String,
    topic: String,
    subscription: String,
    state: watch::Sender<ListenerState>,
    stop: watch::Sender<bool>,
    busy: AtomicBool,
    consumer: Mutex<Option<Arc<dyn BrokerConsumer>>>,
    consumers: Arc<ConsumerPool>,
    max_shutdown_wait: Duration,
    shutdown_poll_interval: Duration,
}

impl Shared {
    fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    fn transition(&self, next: ListenerState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if !state.can_become(next) {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });

        match previous {
            Some(from) => {
                debug!(job = %self.job, from = %from, to = %next, "Listener state changed");
                true
            }
            None => false,
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Close the consumer (once) and drop it from the pool.
    async fn close_consumer(&self) {
        let Some(consumer) = self.consumer.lock().await.take() else {
            return;
        };
        self.consumers.release(&self.topic, &self.subscription).await;
        if let Err(e) = consumer.close().await {
            warn!(job = %self.job, error = %e, "Failed to close consumer");
        }
        debug!(job = %self.job, topic = %self.topic, "Consumer closed");
    }
}

/// Consumes one job's topic and feeds deliveries to its handler.
pub struct Listener {
    job: Arc<JobDefinition>,
    descriptor: JobDescriptor,
    publisher: Publisher,
    handler: Option<DeliveryHandler>,
    shared: Arc<Shared>,
    receive_timeout: Duration,
    receive_interval: Duration,
    retry_interval: Duration,
    metrics: JobMetrics,
}

impl Listener {
    pub fn new(
        job: Arc<JobDefinition>,
        consumers: Arc<ConsumerPool>,
        publisher: Publisher,
        config: &RuntimeConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            job: job.name().to_string(),
            topic: job.topic().to_string(),
            subscription: job.subscription().to_string(),
            state,
            stop,
            busy: AtomicBool::new(false),
            consumer: Mutex::new(None),
            consumers,
            max_shutdown_wait: config.max_shutdown_wait,
            shutdown_poll_interval: config.shutdown_poll_interval,
        });

        Self {
            descriptor: job.descriptor(),
            metrics: JobMetrics::new(job.name(), job.topic()),
            job,
            publisher,
            handler: None,
            shared,
            receive_timeout: config.consumer_receive_timeout,
            receive_interval: config.consumer_receive_interval,
            retry_interval: config.broker_retry_interval,
        }
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state()
    }

    /// Validate the job's consumer settings and acquire its consumer.
    ///
    /// Any failure closes the listener.
    pub async fn subscribe(&mut self) -> Result<(), JobError> {
        if self.handler.is_some() {
            return Ok(());
        }
        if self.state() == ListenerState::Closed {
            return Err(JobError::ListenerClosed(self.job.name().to_string()));
        }
        self.shared.transition(ListenerState::Subscribing);

        if let Err(e) = self.descriptor.validate() {
            error!(job = %self.job.name(), error = %e, "Invalid consumer configuration");
            self.shared.transition(ListenerState::Closed);
            return Err(e);
        }

        let consumer = match self
            .shared
            .consumers
            .get_or_create(
                self.job.topic(),
                self.job.subscription(),
                self.job.consumer_options(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                let e = match e {
                    JobError::Broker(BrokerError::TopicNotFound(topic)) => {
                        JobError::JobTopicNotFound(topic)
                    }
                    other => other,
                };
                error!(job = %self.job.name(), error = %e, "Subscribe failed");
                self.shared.transition(ListenerState::Closed);
                return Err(e);
            }
        };

        *self.shared.consumer.lock().await = Some(consumer.clone());
        self.handler = Some(DeliveryHandler::new(
            self.job.clone(),
            consumer,
            self.publisher.clone(),
        ));

        info!(
            job = %self.job.name(),
            topic = %self.job.topic(),
            subscription = %self.job.subscription(),
            batched = self.job.batched_consume(),
            "Subscribed"
        );
        Ok(())
    }

    /// Poll and handle until a stop is requested, then close the consumer.
    ///
    /// Subscribes first when [`Listener::subscribe`] was not called.
    pub async fn run(mut self) -> Result<(), JobError> {
        if self.state() == ListenerState::Closed {
            return Err(JobError::ListenerClosed(self.job.name().to_string()));
        }
        self.subscribe().await?;

        let (Some(handler), Some(consumer)) = (
            self.handler.take(),
            self.shared.consumer.lock().await.clone(),
        ) else {
            return Err(JobError::ListenerClosed(self.job.name().to_string()));
        };

        info!(job = %self.job.name(), topic = %self.job.topic(), "Listener started");
        let mut stop = self.shared.stop.subscribe();

        loop {
            // Mark busy before reading the stop flag so shutdown never sees an
            // idle listener that is about to receive.
            self.shared.busy.store(true, Ordering::SeqCst);
            if *stop.borrow() {
                self.shared.busy.store(false, Ordering::SeqCst);
                break;
            }
            self.shared.transition(ListenerState::Polling);

            match self.poll(consumer.clone()).await {
                Ok(Some(delivery)) => {
                    self.shared.transition(ListenerState::Handling);
                    let outcome = handler.handle(&mut self.descriptor, delivery).await;
                    trace!(job = %self.job.name(), outcome = ?outcome, "Delivery handled");
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.poll_error();
                    error!(job = %self.job.name(), error = %e, "Poll failed");
                    pause(&mut stop, self.retry_interval).await;
                }
            }

            self.shared.busy.store(false, Ordering::SeqCst);
            pause(&mut stop, self.receive_interval).await;
        }

        self.shared.close_consumer().await;
        self.shared.transition(ListenerState::Closed);
        info!(job = %self.job.name(), "Listener stopped");
        Ok(())
    }

    /// One receive on its own task. `Ok(None)` means nothing arrived.
    async fn poll(&self, consumer: Arc<dyn BrokerConsumer>) -> Result<Option<Delivery>, JobError> {
        let batched = self.job.batched_consume();
        let timeout = self.receive_timeout;

        let received = tokio::spawn(async move {
            if batched {
                consumer
                    .batch_receive()
                    .await
                    .map(|messages| (!messages.is_empty()).then_some(Delivery::Batch(messages)))
            } else {
                consumer.receive(timeout).await.map(|m| Some(Delivery::One(m)))
            }
        })
        .await
        .map_err(|e| JobError::Task(e.to_string()))?;

        match received {
            Ok(delivery) => {
                if delivery.is_none() {
                    trace!(job = %self.job.name(), "Empty batch");
                }
                Ok(delivery)
            }
            Err(e) if e.is_no_delivery() => {
                if matches!(e, BrokerError::AlreadyClosed(_)) {
                    debug!(job = %self.job.name(), error = %e, "Consumer closed during receive");
                    if !self.shared.stop_requested() {
                        pause(&mut self.shared.stop.subscribe(), self.retry_interval).await;
                    }
                } else {
                    trace!(job = %self.job.name(), "No delivery this cycle");
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Sleep for `duration` unless a stop is requested first.
async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = stop.wait_for(|stopped| *stopped) => {}
    }
}

/// Control side of a [`Listener`], usable from any task.
#[derive(Clone)]
pub struct ListenerHandle {
    shared: Arc<Shared>,
}

impl ListenerHandle {
    pub fn job(&self) -> &str {
        &self.shared.job
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn subscription(&self) -> &str {
        &self.shared.subscription
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Ask the loop to exit after its current cycle.
    pub fn stop(&self) {
        self.shared.stop.send_replace(true);
        let next = match self.shared.state() {
            ListenerState::Idle => ListenerState::Closed,
            _ => ListenerState::Draining,
        };
        if self.shared.transition(next) {
            info!(job = %self.shared.job, "Listener stop requested");
        }
    }

    /// Stop, wait for the in-flight cycle up to `max_shutdown_wait`, then
    /// close the consumer whether or not the wait succeeded.
    pub async fn shutdown(&self) {
        self.stop();

        let deadline = Instant::now() + self.shared.max_shutdown_wait;
        while self.shared.busy.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                error!(
                    job = %self.shared.job,
                    waited = ?self.shared.max_shutdown_wait,
                    "Listener still handling a delivery, abandoning drain wait"
                );
                break;
            }
            tokio::time::sleep(self.shared.shutdown_poll_interval.min(deadline - now)).await;
        }

        self.shared.close_consumer().await;
        self.shared.transition(ListenerState::Closed);
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("job", &self.shared.job)
            .field("topic", &self.shared.topic)
            .field("subscription", &self.shared.subscription)
            .field("state", &self.shared.state())
            .finish()
    }
}
