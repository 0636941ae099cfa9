//! In-process broker.
//!
//! Topics keep an append-only log; every subscription gets its own queue that
//! starts from the beginning of the log. Negative acknowledgment requeues the
//! message with its redelivery count bumped. Fault injection and counters let
//! tests drive the runtime's failure paths.

use super::{
    Broker, BrokerConnection, BrokerConsumer, BrokerProducer, ConnectOptions, Message,
    ProducerOptions, Receipt,
};
use crate::config::ConsumerOptions;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Pending {
    seq: u64,
    data: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    queue: VecDeque<Pending>,
    in_flight: HashMap<u64, Pending>,
    acked: Vec<u64>,
    nacked: Vec<u64>,
}

#[derive(Debug, Default)]
struct TopicState {
    log: Vec<Pending>,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicState>,
    unreachable: HashSet<String>,
    fail_connects: u32,
    connect_attempts: u32,
    connected_hosts: Vec<String>,
    producers_created: u32,
    consumers_created: u32,
    receive_calls: u32,
    receive_failures: VecDeque<BrokerError>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, topic: &str, data: Vec<u8>, redelivery_count: u32) {
        {
            let mut state = self.state();
            state.next_seq += 1;
            let pending = Pending {
                seq: state.next_seq,
                data,
                redelivery_count,
            };
            let topic_state = state.topics.entry(topic.to_string()).or_default();
            for subscription in topic_state.subscriptions.values_mut() {
                subscription.queue.push_back(pending.clone());
            }
            topic_state.log.push(pending);
        }
        self.notify.notify_waiters();
    }
}

/// In-memory [`Broker`] implementation.
///
/// Cloning shares the underlying state, so a test can keep one clone for
/// assertions while the runtime owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic so consumers can subscribe to it.
    pub fn create_topic(&self, topic: &str) {
        self.shared
            .state()
            .topics
            .entry(topic.to_string())
            .or_default();
    }

    /// Publish a message directly, bypassing producers.
    pub fn publish(&self, topic: &str, data: impl Into<Vec<u8>>) {
        self.shared.append(topic, data.into(), 0);
    }

    /// Publish a message that claims to have been redelivered `redelivery_count` times.
    pub fn publish_redelivered(&self, topic: &str, data: impl Into<Vec<u8>>, redelivery_count: u32) {
        self.shared.append(topic, data.into(), redelivery_count);
    }

    /// Fail the next `count` connection attempts with a connect error.
    pub fn fail_connects(&self, count: u32) {
        self.shared.state().fail_connects = count;
    }

    /// Make every connection attempt to `host` fail.
    pub fn unreachable_host(&self, host: &str) {
        self.shared.state().unreachable.insert(host.to_string());
    }

    /// Fail the next receive (single or batch) with `error`.
    pub fn fail_next_receive(&self, error: BrokerError) {
        self.shared.state().receive_failures.push_back(error);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.state().connect_attempts
    }

    /// Hosts that were successfully connected to, in order.
    pub fn connected_hosts(&self) -> Vec<String> {
        self.shared.state().connected_hosts.clone()
    }

    pub fn producers_created(&self) -> u32 {
        self.shared.state().producers_created
    }

    pub fn consumers_created(&self) -> u32 {
        self.shared.state().consumers_created
    }

    pub fn receive_calls(&self) -> u32 {
        self.shared.state().receive_calls
    }

    /// Every body ever appended to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.shared
            .state()
            .topics
            .get(topic)
            .map(|t| t.log.iter().map(|p| p.data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn acked(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |s| s.acked.len())
    }

    pub fn nacked(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |s| s.nacked.len())
    }

    /// Messages waiting to be received on a subscription.
    pub fn backlog(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |s| s.queue.len())
    }

    fn with_subscription<T: Default>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(&SubscriptionState) -> T,
    ) -> T {
        self.shared
            .state()
            .topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(f)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(
        &self,
        host: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.shared.state();
        state.connect_attempts += 1;

        if state.unreachable.contains(host) {
            return Err(BrokerError::connect(format!("{host} is unreachable")));
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::connect(format!("{host} refused connection")));
        }

        state.connected_hosts.push(host.to_string());
        debug!(host = %host, "In-memory broker connected");

        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed("connection".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
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

        let mut state = self.shared.state();
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.clone()))?;

        if !topic_state.subscriptions.contains_key(subscription) {
            let queue = topic_state.log.iter().cloned().collect();
            topic_state.subscriptions.insert(
                subscription.to_string(),
                SubscriptionState {
                    queue,
                    ..Default::default()
                },
            );
        }
        state.consumers_created += 1;

        Ok(Arc::new(MemoryConsumer {
            shared: self.shared.clone(),
            topic: topic.clone(),
            subscription: subscription.to_string(),
            options: options.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_producer(
        &self,
        topic: &str,
        _options: &ProducerOptions,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        state.topics.entry(topic.to_string()).or_default();
        state.producers_created += 1;

        Ok(Arc::new(MemoryProducer {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    topic: String,
    subscription: String,
    options: ConsumerOptions,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn closed_error(&self) -> BrokerError {
        BrokerError::AlreadyClosed(format!("{}/{}", self.topic, self.subscription))
    }

    /// Counts the call and pops any injected failure.
    fn begin_receive(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        state.receive_calls += 1;
        if let Some(error) = state.receive_failures.pop_front() {
            return Err(error);
        }
        Ok(())
    }

    fn pop(&self, max: usize) -> Vec<Message> {
        let mut state = self.shared.state();
        let Some(subscription) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.subscription))
        else {
            return Vec::new();
        };

        let mut messages = Vec::new();
        while messages.len() < max {
            let Some(pending) = subscription.queue.pop_front() else {
                break;
            };
            messages.push(
                Message::new(
                    format!("{}:{}", self.topic, pending.seq),
                    self.topic.clone(),
                    pending.data.clone(),
                    pending.redelivery_count,
                    Receipt::new(pending.seq),
                )
                .with_publish_time(Utc::now()),
            );
            subscription.in_flight.insert(pending.seq, pending);
        }
        messages
    }

    /// Wait until at least one message is available or the deadline passes.
    async fn wait_for(&self, max: usize, timeout: Duration) -> Result<Vec<Message>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            if self.closed.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }
            let messages = self.pop(max);
            if !messages.is_empty() {
                return Ok(messages);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn settle(&self, message: &Message, requeue: bool) -> Result<(), BrokerError> {
        let seq = *message
            .receipt()
            .downcast_ref::<u64>()
            .ok_or_else(|| BrokerError::Operation("foreign message receipt".to_string()))?;

        {
            let mut state = self.shared.state();
            let subscription = state
                .topics
                .get_mut(&self.topic)
                .and_then(|t| t.subscriptions.get_mut(&self.subscription))
                .ok_or_else(|| BrokerError::TopicNotFound(self.topic.clone()))?;

            let pending = subscription.in_flight.remove(&seq);
            if requeue {
                subscription.nacked.push(seq);
                if let Some(mut pending) = pending {
                    pending.redelivery_count += 1;
                    subscription.queue.push_back(pending);
                }
            } else {
                subscription.acked.push(seq);
            }
        }

        if requeue {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Message, BrokerError> {
        self.begin_receive()?;
        self.wait_for(1, timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::timeout(format!("no message within {timeout:?}")))
    }

    async fn batch_receive(&self) -> Result<Vec<Message>, BrokerError> {
        self.begin_receive()?;
        self.wait_for(self.options.batch_max_messages.max(1), self.options.batch_timeout)
            .await
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        self.settle(message, false)
    }

    async fn negative_acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        self.settle(message, true)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    topic: String,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed(format!("producer {}", self.topic)));
        }
        self.shared.append(&self.topic, payload, 0);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
