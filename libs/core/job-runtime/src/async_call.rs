//! Asynchronous method invocation through a raw-payload job.
//!
//! Targets register named methods up front; [`AsyncTargets::enqueue`]
//! publishes an [`AsyncCall`] and the job built by
//! [`AsyncTargets::into_job`] resolves and runs it on the consuming side.

use crate::config::DEFAULT_HANDLER_METHOD;
use crate::error::{ArgumentError, HandlerError, JobError};
use crate::handler::HandlerInput;
use crate::job::{JobBuilder, JobDefinition};
use crate::publisher::Publisher;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Wire body of an asynchronous call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncCall {
    pub klass: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Identifies the receiving instance, when the target is not a singleton
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub sent_at: DateTime<Utc>,
}

impl AsyncCall {
    pub fn new(klass: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            klass: klass.into(),
            method: method.into(),
            args,
            id: None,
            sent_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }
}

type AsyncMethod =
    Arc<dyn Fn(Option<Value>, Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Registry of `klass -> method -> callable`.
#[derive(Clone, Default)]
pub struct AsyncTargets {
    targets: HashMap<String, HashMap<String, AsyncMethod>>,
}

impl AsyncTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `klass#method`. The callable receives the call's `id` and args.
    pub fn register<F, Fut>(
        mut self,
        klass: impl Into<String>,
        method: impl Into<String>,
        target: F,
    ) -> Self
    where
        F: Fn(Option<Value>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let callable: AsyncMethod =
            Arc::new(move |id: Option<Value>, args: Vec<Value>| target(id, args).boxed());
        self.targets
            .entry(klass.into())
            .or_default()
            .insert(method.into(), callable);
        self
    }

    pub fn contains(&self, klass: &str, method: &str) -> bool {
        self.get(klass, method).is_some()
    }

    fn get(&self, klass: &str, method: &str) -> Option<&AsyncMethod> {
        self.targets.get(klass)?.get(method)
    }

    /// Publish `call` to the async job's topic after checking the target exists.
    pub async fn enqueue(
        &self,
        publisher: &Publisher,
        job: &JobDefinition,
        call: AsyncCall,
    ) -> Result<(), JobError> {
        if !self.contains(&call.klass, &call.method) {
            return Err(JobError::AsyncMethodMissing {
                klass: call.klass,
                method: call.method,
            });
        }

        publisher.publish_envelope(job.topic(), &call).await?;
        debug!(klass = %call.klass, method = %call.method, topic = %job.topic(), "Async call enqueued");
        Ok(())
    }

    /// Turn `builder` into the raw-payload job that executes async calls.
    pub fn into_job(self, builder: JobBuilder) -> JobBuilder {
        let targets = Arc::new(self);
        builder
            .use_raw_payload(true)
            .handler_method(DEFAULT_HANDLER_METHOD)
            .handler(DEFAULT_HANDLER_METHOD, move |input: HandlerInput| {
                let targets = targets.clone();
                async move { targets.dispatch(input).await }
            })
    }

    async fn dispatch(&self, input: HandlerInput) -> Result<Value, HandlerError> {
        let raw = input
            .raw()
            .ok_or_else(|| ArgumentError::new("async call expects a raw delivery"))?;
        let body = raw
            .payload
            .as_json()
            .cloned()
            .ok_or_else(|| ArgumentError::new("async call body is not JSON"))?;
        let call: AsyncCall = serde_json::from_value(body)
            .map_err(|e| ArgumentError::new(format!("malformed async call: {e}")))?;

        let target = self.get(&call.klass, &call.method).ok_or_else(|| {
            ArgumentError::new(format!(
                "no async target '{}#{}'",
                call.klass, call.method
            ))
        })?;

        debug!(klass = %call.klass, method = %call.method, message_id = %raw.message_id, "Running async call");
        target(call.id, call.args).await
    }
}

impl std::fmt::Debug for AsyncTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut targets: Vec<String> = self
            .targets
            .iter()
            .flat_map(|(klass, methods)| methods.keys().map(move |m| format!("{klass}#{m}")))
            .collect();
        targets.sort();
        f.debug_struct("AsyncTargets").field("targets", &targets).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, Message, MessageId, Receipt};
    use crate::config::RuntimeConfig;
    use crate::envelope::Payload;
    use crate::handler::RawDelivery;
    use crate::pool::{ConnectionManager, ProducerPool};
    use serde_json::json;

    fn targets() -> AsyncTargets {
        AsyncTargets::new().register("Invoice", "finalize", |id, args| async move {
            Ok::<_, HandlerError>(json!({"id": id, "args": args}))
        })
    }

    fn raw_input(body: &[u8]) -> HandlerInput {
        HandlerInput::Raw(RawDelivery {
            payload: Payload::decode(body),
            message_id: MessageId("jobs.async:1".into()),
            raw: Message::new("jobs.async:1", "jobs.async", body.to_vec(), 0, Receipt::new(1u64)),
        })
    }

    #[tokio::test]
    async fn test_enqueue_publishes_call() {
        let broker = InMemoryBroker::new();
        let config = RuntimeConfig::new("memory://local");
        let connections = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), config.clone()));
        let publisher = Publisher::new(Arc::new(ProducerPool::new(connections)));
        let targets = targets();
        let job = targets
            .clone()
            .into_job(JobDefinition::builder("AsyncJob").topic("jobs.async"))
            .build(&config)
            .unwrap();

        targets
            .enqueue(&publisher, &job, AsyncCall::new("Invoice", "finalize", vec![json!(3)]).with_id(17))
            .await
            .unwrap();

        let published = broker.published("jobs.async");
        let call: AsyncCall = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(call.klass, "Invoice");
        assert_eq!(call.id, Some(json!(17)));
        assert!(job.uses_raw_payload());

        let err = targets
            .enqueue(&publisher, &job, AsyncCall::new("Invoice", "void", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::AsyncMethodMissing { .. }));
        assert_eq!(broker.published("jobs.async").len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_runs_target() {
        let body = serde_json::to_vec(&AsyncCall::new("Invoice", "finalize", vec![json!("a")]).with_id(5)).unwrap();
        let result = targets().dispatch(raw_input(&body)).await.unwrap();
        assert_eq!(result, json!({"id": 5, "args": ["a"]}));
    }

    #[tokio::test]
    async fn test_unknown_target_is_argument_error() {
        let body = serde_json::to_vec(&AsyncCall::new("Invoice", "void", vec![])).unwrap();
        let err = targets().dispatch(raw_input(&body)).await.unwrap_err();
        assert!(err.is_argument_error());

        let err = targets().dispatch(raw_input(b"not json")).await.unwrap_err();
        assert!(err.is_argument_error());
    }
}
