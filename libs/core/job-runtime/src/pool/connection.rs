//! Shared broker connection with multi-host failover.

use crate::broker::{Broker, BrokerConnection, ConnectOptions};
use crate::config::RuntimeConfig;
use crate::error::{BrokerError, JobError};
use crate::metrics;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Owns the process's single broker connection.
///
/// The first caller connects, trying hosts from the configured URL in random
/// order; everyone else gets the cached connection.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: RuntimeConfig,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, config: RuntimeConfig) -> Self {
        Self {
            broker,
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the cached connection, connecting first if there is none.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, JobError> {
        let mut cached = self.connection.lock().await;
        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.connect().await?;
        *cached = Some(connection.clone());
        Ok(connection)
    }

    /// Whether a connection is currently cached.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Connect with failover.
    ///
    /// Every failed attempt spends one unit of `broker_max_retries`, sleeps
    /// `broker_retry_interval`, then moves to the next candidate host. When
    /// the candidates run out the full host list is reshuffled.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, JobError> {
        let hosts = self.config.broker_hosts()?;
        let max_attempts = self.config.broker_max_retries.max(1);
        let options = ConnectOptions {
            scheme: self.config.broker_scheme().to_string(),
            connection_timeout: self.config.broker_connection_timeout,
            operation_timeout: self.config.broker_operation_timeout,
        };

        let mut candidates = shuffled(&hosts);
        let mut remaining = max_attempts;

        loop {
            if candidates.is_empty() {
                candidates = shuffled(&hosts);
            }
            let host = candidates.remove(0);

            debug!(host = %host, remaining = remaining, "Connecting to broker");

            let attempt = tokio::time::timeout(
                self.config.broker_connection_timeout,
                self.broker.connect(&host, &options),
            )
            .await
            .unwrap_or_else(|_| {
                Err(BrokerError::timeout(format!(
                    "connect to {host} exceeded {:?}",
                    self.config.broker_connection_timeout
                )))
            });

            match attempt {
                Ok(connection) => {
                    info!(host = %host, "Broker connection established");
                    return Ok(connection);
                }
                Err(e) => {
                    error!(host = %host, error = %e, "Failed to connect to broker");
                    metrics::broker_connect_failed(&host);
                }
            }

            remaining -= 1;
            if remaining == 0 {
                return Err(JobError::BrokerUnavailable(format!(
                    "unable to connect to any broker after {max_attempts} attempts"
                )));
            }

            tokio::time::sleep(self.config.broker_retry_interval).await;
        }
    }

    /// Close and forget the cached connection. A no-op when never connected.
    pub async fn shutdown(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }
        debug!("Broker connection closed");
    }
}

fn shuffled(hosts: &[String]) -> Vec<String> {
    let mut hosts = hosts.to_vec();
    hosts.shuffle(&mut rand::rng());
    hosts
}
