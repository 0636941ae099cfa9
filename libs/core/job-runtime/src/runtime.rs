//! Top-level runtime: owns the pools and the listeners it started.

use crate::broker::{Broker, NatsBroker};
use crate::config::RuntimeConfig;
use crate::error::JobError;
use crate::job::JobDefinition;
use crate::listener::{Listener, ListenerHandle, ListenerState};
use crate::pool::{ConnectionManager, ConsumerPool, ProducerPool};
use crate::publisher::Publisher;
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct RunningListener {
    handle: ListenerHandle,
    task: JoinHandle<Result<(), JobError>>,
}

/// Broker resources shared by every publisher and listener of the process.
///
/// ```rust,ignore
/// let runtime = JobRuntime::nats(RuntimeConfig::from_env()?);
/// runtime.spawn(mailer_job).await?;
/// runtime.run_until_signal().await;
/// ```
pub struct JobRuntime {
    config: RuntimeConfig,
    connections: Arc<ConnectionManager>,
    producers: Arc<ProducerPool>,
    consumers: Arc<ConsumerPool>,
    publisher: Publisher,
    listeners: Mutex<Vec<RunningListener>>,
}

impl JobRuntime {
    pub fn new(broker: Arc<dyn Broker>, config: RuntimeConfig) -> Self {
        let connections = Arc::new(ConnectionManager::new(broker, config.clone()));
        let producers = Arc::new(ProducerPool::new(connections.clone()));
        let consumers = Arc::new(ConsumerPool::new(connections.clone()));
        let publisher = Publisher::new(producers.clone());

        Self {
            config,
            connections,
            producers,
            consumers,
            publisher,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Runtime backed by NATS JetStream.
    pub fn nats(config: RuntimeConfig) -> Self {
        let broker = NatsBroker::new().with_client_name(config.producer_name());
        Self::new(Arc::new(broker), config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Build a listener for `job` without starting it.
    pub fn listener(&self, job: Arc<JobDefinition>) -> Listener {
        Listener::new(job, self.consumers.clone(), self.publisher.clone(), &self.config)
    }

    /// Subscribe and start consuming `job` on a background task.
    ///
    /// Configuration and subscribe errors are returned here rather than from
    /// the background task. A topic and subscription pair is consumed by at
    /// most one live listener; a second spawn for it fails until the first
    /// one is shut down.
    pub async fn spawn(&self, job: Arc<JobDefinition>) -> Result<ListenerHandle, JobError> {
        // Held across subscribe so two concurrent spawns cannot both pass the check.
        let mut listeners = self.listeners.lock().await;
        if let Some(running) = listeners.iter().find(|l| {
            l.handle.state() != ListenerState::Closed
                && l.handle.topic() == job.topic()
                && l.handle.subscription() == job.subscription()
        }) {
            warn!(
                job = %job.name(),
                running = %running.handle.job(),
                topic = %job.topic(),
                subscription = %job.subscription(),
                "Listener already running for subscription"
            );
            return Err(JobError::InvalidConsumerConfiguration(format!(
                "a listener for {}/{} is already running",
                job.topic(),
                job.subscription()
            )));
        }

        let mut listener = self.listener(job);
        listener.subscribe().await?;

        let handle = listener.handle();
        let task = tokio::spawn(listener.run());
        listeners.push(RunningListener {
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    /// Number of listeners started through [`JobRuntime::spawn`] and not yet shut down.
    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// Shut every listener down, then release consumers, producers and the connection.
    pub async fn shutdown(&self) {
        let listeners: Vec<RunningListener> = self.listeners.lock().await.drain(..).collect();
        info!(listeners = listeners.len(), "Shutting down job runtime");

        join_all(listeners.iter().map(|l| l.handle.shutdown())).await;

        for RunningListener { handle, task } in listeners {
            if !task.is_finished() {
                warn!(job = %handle.job(), "Listener task still running, detaching");
                continue;
            }
            match task.await {
                Ok(Ok(())) => debug!(job = %handle.job(), "Listener task finished"),
                Ok(Err(e)) => warn!(job = %handle.job(), error = %e, "Listener task ended with error"),
                Err(e) => error!(job = %handle.job(), error = %e, "Listener task failed"),
            }
        }

        self.consumers.shutdown().await;
        self.producers.shutdown().await;
        self.connections.shutdown().await;
        info!("Job runtime stopped");
    }

    /// Wait for Ctrl+C or SIGTERM, then [`shutdown`](Self::shutdown).
    pub async fn run_until_signal(&self) {
        shutdown_signal().await;
        self.shutdown().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
