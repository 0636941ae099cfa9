//! Per-job exception handlers.
//!
//! Handlers are matched against the raised error first, then each error in its
//! `source()` chain. At every step the first registrant whose type matches
//! wins, so register specific types before general ones. A catch-all
//! registered with [`RescueRegistry::rescue_all`] is consulted only after the
//! whole chain found no typed match.

use crate::error::HandlerError;
use crate::job::JobDescriptor;
use std::any::type_name;
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::debug;

type TypedRescue = Arc<
    dyn Fn(&JobDescriptor, &(dyn StdError + 'static)) -> Option<Result<(), HandlerError>>
        + Send
        + Sync,
>;
type CatchAll = Arc<dyn Fn(&JobDescriptor, &HandlerError) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Clone)]
struct TypedEntry {
    type_name: &'static str,
    rescue: TypedRescue,
}

#[derive(Clone, Default)]
pub struct RescueRegistry {
    typed: Vec<TypedEntry>,
    catch_all: Option<CatchAll>,
}

impl RescueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rescue errors of type `E`.
    ///
    /// Returning `Ok(())` resolves the failure and the delivery is acknowledged;
    /// returning an error hands that error to the acknowledgment decision.
    pub fn rescue_from<E, F>(&mut self, handler: F)
    where
        E: StdError + 'static,
        F: Fn(&JobDescriptor, &E) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let rescue: TypedRescue = Arc::new(move |job: &JobDescriptor, error: &(dyn StdError + 'static)| {
            error.downcast_ref::<E>().map(|typed| handler(job, typed))
        });
        self.typed.push(TypedEntry {
            type_name: type_name::<E>(),
            rescue,
        });
    }

    /// Rescue anything no typed handler matched. A later call replaces the earlier one.
    pub fn rescue_all<F>(&mut self, handler: F)
    where
        F: Fn(&JobDescriptor, &HandlerError) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.catch_all = Some(Arc::new(handler));
    }

    /// Run the matching handler, if any.
    ///
    /// `None` means nothing matched and `error` propagates unchanged.
    pub fn handle(
        &self,
        job: &JobDescriptor,
        error: &HandlerError,
    ) -> Option<Result<(), HandlerError>> {
        for cause in error.chain() {
            for entry in &self.typed {
                if let Some(outcome) = (entry.rescue)(job, cause) {
                    debug!(job = %job.name, rescued = entry.type_name, "Handler error rescued");
                    return Some(outcome);
                }
            }
        }

        self.catch_all.as_ref().map(|rescue| {
            debug!(job = %job.name, "Handler error rescued by catch-all");
            rescue(job, error)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.typed.is_empty() && self.catch_all.is_none()
    }
}

impl std::fmt::Debug for RescueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RescueRegistry")
            .field(
                "typed",
                &self.typed.iter().map(|e| e.type_name).collect::<Vec<_>>(),
            )
            .field("catch_all", &self.catch_all.is_some())
            .finish()
    }
}
