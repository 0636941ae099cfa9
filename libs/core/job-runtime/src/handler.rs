//! Job handlers and the method-name registry they are resolved from.

use crate::broker::{Message, MessageId};
use crate::envelope::Payload;
use crate::error::{ArgumentError, HandlerError, JobError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// What a raw-payload job receives instead of positional arguments.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub payload: Payload,
    pub message_id: MessageId,
    pub raw: Message,
}

/// Input handed to a handler for one delivery.
#[derive(Debug, Clone)]
pub enum HandlerInput {
    /// Positional arguments of a single message
    Args(Vec<Value>),
    /// Every decoded payload of a batch, in received order
    Batch(Vec<Payload>),
    /// The decoded payload plus the message it came from
    Raw(RawDelivery),
}

impl HandlerInput {
    pub fn args(&self) -> Option<&[Value]> {
        match self {
            HandlerInput::Args(args) => Some(args),
            _ => None,
        }
    }

    pub fn batch(&self) -> Option<&[Payload]> {
        match self {
            HandlerInput::Batch(payloads) => Some(payloads),
            _ => None,
        }
    }

    pub fn raw(&self) -> Option<&RawDelivery> {
        match self {
            HandlerInput::Raw(delivery) => Some(delivery),
            _ => None,
        }
    }

    /// Deserialize the positional arguments into a typed tuple or struct.
    ///
    /// ```rust,ignore
    /// let (user_id, template): (u64, String) = input.parse_args()?;
    /// ```
    ///
    /// Any count or type mismatch is an [`ArgumentError`].
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T, ArgumentError> {
        let args = self
            .args()
            .ok_or_else(|| ArgumentError::new("handler expects positional args"))?;
        serde_json::from_value(Value::Array(args.to_vec()))
            .map_err(|e| ArgumentError::new(format!("cannot bind {} args: {e}", args.len())))
    }
}

/// A job handler method.
///
/// Closures `Fn(HandlerInput) -> impl Future<Output = Result<Value, HandlerError>>`
/// implement this trait directly.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, input: HandlerInput) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, input: HandlerInput) -> Result<Value, HandlerError> {
        (self)(input).await
    }
}

/// Method name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `method`, replacing any previous one.
    pub fn register(&mut self, method: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(method.into(), Arc::new(handler));
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }

    /// Look up `method`, failing with `MethodNotFound` when it is not registered.
    pub fn resolve(&self, job: &str, method: &str) -> Result<Arc<dyn Handler>, JobError> {
        self.get(method).ok_or_else(|| JobError::MethodNotFound {
            job: job.to_string(),
            method: method.to_string(),
        })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
