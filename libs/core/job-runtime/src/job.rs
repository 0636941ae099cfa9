//! Job definitions and the per-delivery descriptor.

use crate::callbacks::{CallbackFlow, Callbacks};
use crate::config::{ConsumerOptions, ConsumerType, RuntimeConfig, DEFAULT_HANDLER_METHOD};
use crate::delivery::Delivery;
use crate::envelope::Payload;
use crate::error::{HandlerError, JobError};
use crate::handler::{Handler, HandlerRegistry};
use crate::rescue::RescueRegistry;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::error::Error as StdError;
use std::sync::Arc;

/// State of one job class as seen by a listener or a publish call.
///
/// A listener keeps one descriptor for its whole life; the per-delivery
/// fields are cleared after every delivery.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub name: String,
    pub topic: String,
    pub subscription: String,
    pub handler_method: String,
    pub uses_raw_payload: bool,
    pub batched: bool,
    pub consumer_options: ConsumerOptions,
    pub dlq_topic: Option<String>,
    pub max_redelivery_count: u32,

    pub payload: Option<Payload>,
    pub args: Vec<Value>,
    pub result: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub raw: Option<Delivery>,
}

impl JobDescriptor {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            subscription: subscription.into(),
            handler_method: DEFAULT_HANDLER_METHOD.to_string(),
            uses_raw_payload: false,
            batched: false,
            consumer_options: ConsumerOptions::default(),
            dlq_topic: None,
            max_redelivery_count: 3,
            payload: None,
            args: Vec::new(),
            result: None,
            created_at: None,
            raw: None,
        }
    }

    /// A listener may only start once both topic and subscription are set.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.topic.trim().is_empty() {
            return Err(JobError::invalid_consumer(format!(
                "topic is not set for job '{}'",
                self.name
            )));
        }
        if self.subscription.trim().is_empty() {
            return Err(JobError::invalid_consumer(format!(
                "subscription is not set for job '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Clear the per-delivery context.
    pub fn reset(&mut self) {
        self.args.clear();
        self.payload = None;
        self.result = None;
        self.created_at = None;
    }
}

/// A registered job class: its configuration surface plus handlers,
/// callbacks and rescue handlers.
pub struct JobDefinition {
    name: String,
    topic: String,
    subscription: String,
    handler_method: String,
    use_raw_payload: bool,
    batched: bool,
    consumer_options: ConsumerOptions,
    dlq_topic: Option<String>,
    max_redelivery_count: u32,
    handler: Arc<dyn Handler>,
    callbacks: Callbacks,
    rescue: RescueRegistry,
}

impl JobDefinition {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn handler_method(&self) -> &str {
        &self.handler_method
    }

    pub fn consumer_options(&self) -> &ConsumerOptions {
        &self.consumer_options
    }

    pub fn batched_consume(&self) -> bool {
        self.batched
    }

    pub fn dlq_topic(&self) -> Option<&str> {
        self.dlq_topic.as_deref()
    }

    pub fn max_redelivery_count(&self) -> u32 {
        self.max_redelivery_count
    }

    pub fn uses_raw_payload(&self) -> bool {
        self.use_raw_payload
    }

    /// The handler bound to `handler_method`, resolved at build time.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    pub fn rescue(&self) -> &RescueRegistry {
        &self.rescue
    }

    /// A fresh descriptor carrying this job's configuration.
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            handler_method: self.handler_method.clone(),
            uses_raw_payload: self.use_raw_payload,
            batched: self.batched,
            consumer_options: self.consumer_options.clone(),
            dlq_topic: self.dlq_topic.clone(),
            max_redelivery_count: self.max_redelivery_count,
            ..JobDescriptor::new(&self.name, &self.topic, &self.subscription)
        }
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("handler_method", &self.handler_method)
            .field("use_raw_payload", &self.use_raw_payload)
            .field("batched", &self.batched)
            .field("dlq_topic", &self.dlq_topic)
            .field("max_redelivery_count", &self.max_redelivery_count)
            .finish()
    }
}

/// Builder for [`JobDefinition`].
///
/// ```rust,ignore
/// let job = JobDefinition::builder("MailerJob")
///     .topic("jobs.mail")
///     .dlq_topic("jobs.mail.dlq")
///     .handler("perform", |input: HandlerInput| async move {
///         let (user_id,): (u64,) = input.parse_args()?;
///         Ok::<_, HandlerError>(json!(user_id))
///     })
///     .build(&config)?;
/// ```
pub struct JobBuilder {
    name: String,
    topic: Option<String>,
    subscription: Option<String>,
    handler_method: String,
    use_raw_payload: bool,
    batched: bool,
    consumer_options: Option<ConsumerOptions>,
    consumer_type: Option<ConsumerType>,
    dlq_topic: Option<String>,
    max_redelivery_count: Option<u32>,
    handlers: HandlerRegistry,
    callbacks: Callbacks,
    rescue: RescueRegistry,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: None,
            subscription: None,
            handler_method: DEFAULT_HANDLER_METHOD.to_string(),
            use_raw_payload: false,
            batched: false,
            consumer_options: None,
            consumer_type: None,
            dlq_topic: None,
            max_redelivery_count: None,
            handlers: HandlerRegistry::new(),
            callbacks: Callbacks::default(),
            rescue: RescueRegistry::new(),
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    pub fn handler_method(mut self, method: impl Into<String>) -> Self {
        self.handler_method = method.into();
        self
    }

    pub fn use_raw_payload(mut self, enabled: bool) -> Self {
        self.use_raw_payload = enabled;
        self
    }

    pub fn batched(mut self, enabled: bool) -> Self {
        self.batched = enabled;
        self
    }

    pub fn consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.consumer_options = Some(options);
        self
    }

    pub fn consumer_type(mut self, consumer_type: ConsumerType) -> Self {
        self.consumer_type = Some(consumer_type);
        self
    }

    pub fn dlq_topic(mut self, topic: impl Into<String>) -> Self {
        self.dlq_topic = Some(topic.into());
        self
    }

    pub fn max_redelivery_count(mut self, count: u32) -> Self {
        self.max_redelivery_count = Some(count);
        self
    }

    /// Register a handler method.
    pub fn handler(mut self, method: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.register(method, handler);
        self
    }

    pub fn before_perform<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobDescriptor) -> CallbackFlow + Send + Sync + 'static,
    {
        self.callbacks.perform.add_before(callback);
        self
    }

    pub fn after_perform<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobDescriptor) + Send + Sync + 'static,
    {
        self.callbacks.perform.add_after(callback);
        self
    }

    pub fn before_enqueue<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobDescriptor) -> CallbackFlow + Send + Sync + 'static,
    {
        self.callbacks.enqueue.add_before(callback);
        self
    }

    pub fn after_enqueue<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobDescriptor) + Send + Sync + 'static,
    {
        self.callbacks.enqueue.add_after(callback);
        self
    }

    pub fn rescue_from<E, F>(mut self, handler: F) -> Self
    where
        E: StdError + 'static,
        F: Fn(&JobDescriptor, &E) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.rescue.rescue_from::<E, F>(handler);
        self
    }

    pub fn rescue_all<F>(mut self, handler: F) -> Self
    where
        F: Fn(&JobDescriptor, &HandlerError) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.rescue.rescue_all(handler);
        self
    }

    /// Resolve defaults from `config` and bind the handler method.
    pub fn build(self, config: &RuntimeConfig) -> Result<Arc<JobDefinition>, JobError> {
        let handler = self.handlers.resolve(&self.name, &self.handler_method)?;

        let topic = self
            .topic
            .or_else(|| config.default_topic.clone())
            .unwrap_or_default();
        let subscription = self
            .subscription
            .or_else(|| config.default_subscription.clone())
            .unwrap_or_else(|| config.auto_subscription());

        let mut consumer_options = self
            .consumer_options
            .unwrap_or_else(|| config.consumer_options());
        if let Some(consumer_type) = self.consumer_type {
            consumer_options.consumer_type = consumer_type;
        }

        Ok(Arc::new(JobDefinition {
            name: self.name,
            topic,
            subscription,
            handler_method: self.handler_method,
            use_raw_payload: self.use_raw_payload,
            batched: self.batched,
            consumer_options,
            dlq_topic: self.dlq_topic.filter(|t| !t.trim().is_empty()),
            max_redelivery_count: self
                .max_redelivery_count
                .unwrap_or(config.default_max_redelivery_count),
            handler,
            callbacks: self.callbacks,
            rescue: self.rescue,
        }))
    }
}
