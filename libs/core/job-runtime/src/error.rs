//! Error types for the job runtime.
//!
//! Three layers:
//! - [`BrokerError`]: what the broker binding reports (topic missing, connect, timeout, closed).
//! - [`JobError`]: what the runtime reports to its callers (configuration, availability, dispatch).
//! - [`HandlerError`]: what a job handler raises; it never escapes a running listener.

use std::error::Error as StdError;
use thiserror::Error;

/// Errors reported by a broker binding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The topic does not exist on the broker
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Could not establish a connection to a broker host
    #[error("Connect error: {0}")]
    Connect(String),

    /// A receive or operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The handle was already closed
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// Any other broker-side failure
    #[error("Broker operation failed: {0}")]
    Operation(String),
}

impl BrokerError {
    /// Create a connect error.
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an operation error from any displayable broker error.
    pub fn operation(error: impl std::fmt::Display) -> Self {
        Self::Operation(error.to_string())
    }

    /// Receive outcomes that simply mean "nothing delivered this cycle".
    pub fn is_no_delivery(&self) -> bool {
        matches!(self, BrokerError::Timeout(_) | BrokerError::AlreadyClosed(_))
    }
}

/// How an error should be treated by the process supervising the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Stop: configuration or connection establishment failed
    Fatal,
    /// Log and keep polling
    Transient,
    /// Handled inside the delivery cycle
    Recoverable,
}

/// Errors surfaced by the job runtime.
#[derive(Debug, Error)]
pub enum JobError {
    /// Invalid runtime configuration (e.g. malformed broker URL)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Topic or subscription missing when a listener starts
    #[error("Invalid consumer configuration: {0}")]
    InvalidConsumerConfiguration(String),

    /// Every connection attempt failed and the retry budget is spent
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The job's topic does not exist on the broker
    #[error("Job topic not found: {0}")]
    JobTopicNotFound(String),

    /// The handler method is not registered on the job
    #[error("Method '{method}' not found on job '{job}'")]
    MethodNotFound { job: String, method: String },

    /// Async invocation named a target or method that is not registered
    #[error("Async target '{klass}' has no method '{method}'")]
    AsyncMethodMissing { klass: String, method: String },

    /// Broker failure outside connection establishment
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Envelope could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The listener already reached its terminal state
    #[error("Listener for '{0}' is closed")]
    ListenerClosed(String),

    /// A listener task panicked or was cancelled
    #[error("Listener task failed: {0}")]
    Task(String),
}

impl JobError {
    /// Get the error category for supervision decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::Configuration(_)
            | JobError::InvalidConsumerConfiguration(_)
            | JobError::BrokerUnavailable(_)
            | JobError::JobTopicNotFound(_)
            | JobError::MethodNotFound { .. }
            | JobError::AsyncMethodMissing { .. }
            | JobError::ListenerClosed(_)
            | JobError::Task(_) => ErrorCategory::Fatal,
            JobError::Serialization(_) => ErrorCategory::Recoverable,
            JobError::Broker(BrokerError::TopicNotFound(_)) => ErrorCategory::Fatal,
            JobError::Broker(_) => ErrorCategory::Transient,
        }
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid consumer configuration error.
    pub fn invalid_consumer(msg: impl Into<String>) -> Self {
        Self::InvalidConsumerConfiguration(msg.into())
    }
}

/// Raised by a handler when its positional arguments do not fit its signature.
///
/// Argument errors are never retried: the delivery goes straight to the
/// dead-letter topic when one is configured.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("argument error: {message}")]
pub struct ArgumentError {
    pub message: String,
}

impl ArgumentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure raised by a job handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Argument or interface mismatch
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    /// Anything else the handler raised
    #[error("{0}")]
    Failed(Box<dyn StdError + Send + Sync + 'static>),
}

impl HandlerError {
    /// Wrap any error raised by a handler.
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failed(Box::new(error))
    }

    /// Create a failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Failed(message.into())
    }

    /// Create an argument error.
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(ArgumentError::new(message))
    }

    /// True when an [`ArgumentError`] was raised directly or appears in the source chain.
    pub fn is_argument_error(&self) -> bool {
        self.chain()
            .any(|e| e.downcast_ref::<ArgumentError>().is_some())
    }

    /// The error the handler actually raised, for matching against rescue handlers.
    pub fn raised(&self) -> &(dyn StdError + 'static) {
        match self {
            HandlerError::Argument(e) => e,
            HandlerError::Failed(e) => e.as_ref(),
        }
    }

    /// Iterate the raised error followed by its `source()` chain.
    pub fn chain(&self) -> impl Iterator<Item = &(dyn StdError + 'static)> {
        std::iter::successors(Some(self.raised()), |&e| e.source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, Error)]
    #[error("inner")]
    struct Inner;

    #[derive(Debug, Error)]
    #[error("decode failed")]
    struct DecodeFailed(#[source] ArgumentError);

    #[test]
    fn test_no_delivery_errors() {
        assert!(BrokerError::timeout("receive").is_no_delivery());
        assert!(BrokerError::AlreadyClosed("consumer".into()).is_no_delivery());
        assert!(!BrokerError::connect("refused").is_no_delivery());
        assert!(!BrokerError::TopicNotFound("jobs".into()).is_no_delivery());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            JobError::configuration("bad url").category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            JobError::BrokerUnavailable("no hosts".into()).category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            JobError::from(BrokerError::timeout("receive")).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            JobError::from(BrokerError::TopicNotFound("jobs".into())).category(),
            ErrorCategory::Fatal
        );
    }

    #[test]
    fn test_handler_error_argument() {
        let err = HandlerError::argument("expected 2 arguments, got 1");
        assert!(err.is_argument_error());
        assert!(err.to_string().contains("expected 2 arguments"));
        assert!(err.raised().downcast_ref::<ArgumentError>().is_some());
    }

    #[test]
    fn test_boxed_argument_error_counts_as_argument_error() {
        assert!(HandlerError::failed(ArgumentError::new("wrong arity")).is_argument_error());
        assert!(HandlerError::failed(DecodeFailed(ArgumentError::new("bad field"))).is_argument_error());
        assert!(!HandlerError::msg("timeout").is_argument_error());
    }

    #[test]
    fn test_handler_error_chain_walks_sources() {
        let err = HandlerError::failed(Outer(Inner));
        assert!(!err.is_argument_error());

        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        assert_eq!(chain, vec!["outer".to_string(), "inner".to_string()]);
        assert!(err.chain().any(|e| e.downcast_ref::<Inner>().is_some()));
    }

    #[test]
    fn test_method_not_found_message() {
        let err = JobError::MethodNotFound {
            job: "MailerJob".into(),
            method: "deliver".into(),
        };
        assert_eq!(err.to_string(), "Method 'deliver' not found on job 'MailerJob'");
    }
}
