//! Before/after callback pipelines for the `enqueue` and `perform` stages.

use crate::job::JobDescriptor;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tracing::debug;

/// Returned by a before-callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    Continue,
    /// Skip the wrapped body and the after-callbacks
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CallbackStage {
    Enqueue,
    Perform,
}

pub type BeforeCallback = Arc<dyn Fn(&JobDescriptor) -> CallbackFlow + Send + Sync>;
pub type AfterCallback = Arc<dyn Fn(&JobDescriptor) + Send + Sync>;

/// Ordered before/after lists of one stage.
#[derive(Clone)]
pub struct CallbackChain {
    stage: CallbackStage,
    before: Vec<BeforeCallback>,
    after: Vec<AfterCallback>,
}

impl CallbackChain {
    pub fn new(stage: CallbackStage) -> Self {
        Self {
            stage,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn stage(&self) -> CallbackStage {
        self.stage
    }

    pub fn add_before<F>(&mut self, callback: F)
    where
        F: Fn(&JobDescriptor) -> CallbackFlow + Send + Sync + 'static,
    {
        self.before.push(Arc::new(callback));
    }

    pub fn add_after<F>(&mut self, callback: F)
    where
        F: Fn(&JobDescriptor) + Send + Sync + 'static,
    {
        self.after.push(Arc::new(callback));
    }

    /// Run before-callbacks in registration order, stopping at the first abort.
    pub fn run_before(&self, job: &JobDescriptor) -> CallbackFlow {
        for (index, callback) in self.before.iter().enumerate() {
            if callback(job) == CallbackFlow::Abort {
                debug!(
                    job = %job.name,
                    stage = %self.stage,
                    callback = index,
                    "Before callback aborted the stage"
                );
                return CallbackFlow::Abort;
            }
        }
        CallbackFlow::Continue
    }

    pub fn run_after(&self, job: &JobDescriptor) {
        for callback in &self.after {
            callback(job);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

impl std::fmt::Debug for CallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackChain")
            .field("stage", &self.stage)
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

/// Both stages of a job.
#[derive(Debug, Clone)]
pub struct Callbacks {
    pub enqueue: CallbackChain,
    pub perform: CallbackChain,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            enqueue: CallbackChain::new(CallbackStage::Enqueue),
            perform: CallbackChain::new(CallbackStage::Perform),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn descriptor() -> JobDescriptor {
        JobDescriptor::new("AuditJob", "jobs.audit", "workers")
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = CallbackChain::new(CallbackStage::Perform);
        for name in ["first", "second"] {
            let calls = calls.clone();
            chain.add_before(move |_| {
                calls.lock().unwrap().push(name);
                CallbackFlow::Continue
            });
        }
        let after_calls = calls.clone();
        chain.add_after(move |_| after_calls.lock().unwrap().push("after"));

        let job = descriptor();
        assert_eq!(chain.run_before(&job), CallbackFlow::Continue);
        chain.run_after(&job);

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "after"]);
    }

    #[test]
    fn test_abort_stops_remaining_before_callbacks() {
        let reached = Arc::new(Mutex::new(false));
        let mut chain = CallbackChain::new(CallbackStage::Enqueue);
        chain.add_before(|_| CallbackFlow::Abort);
        let flag = reached.clone();
        chain.add_before(move |_| {
            *flag.lock().unwrap() = true;
            CallbackFlow::Continue
        });

        assert_eq!(chain.run_before(&descriptor()), CallbackFlow::Abort);
        assert!(!*reached.lock().unwrap());
    }

    #[test]
    fn test_before_callback_sees_descriptor() {
        let mut chain = CallbackChain::new(CallbackStage::Perform);
        chain.add_before(|job| {
            if job.topic == "jobs.audit" {
                CallbackFlow::Abort
            } else {
                CallbackFlow::Continue
            }
        });
        assert_eq!(chain.run_before(&descriptor()), CallbackFlow::Abort);
    }

    #[test]
    fn test_default_stages() {
        let callbacks = Callbacks::default();
        assert_eq!(callbacks.enqueue.stage().to_string(), "enqueue");
        assert_eq!(callbacks.perform.stage().as_ref(), "perform");
        assert!(callbacks.perform.is_empty());
    }
}
