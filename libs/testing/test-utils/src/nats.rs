//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that starts a JetStream-enabled NATS container
//! for exercising broker bindings end to end.

use async_nats::Client;
use async_nats::jetstream::{self, stream};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

// Re-export for test convenience (used by consumers of this crate)
#[allow(unused_imports)]
pub use futures::StreamExt;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Point a runtime at the container
/// let url = nats.broker_url();
///
/// // Or inspect streams directly
/// let count = nats.stream_messages("JOBS_MAIL").await;
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    broker_url: String,
}

impl TestNats {
    /// Start NATS with JetStream enabled (`-js`).
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let broker_url = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&broker_url)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            broker_url,
        }
    }

    /// Broker URL in `nats://host:port` form
    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    /// Create a file-backed stream capturing `subject`.
    pub async fn create_stream(&self, name: &str, subject: &str) -> stream::Stream {
        self.jetstream()
            .get_or_create_stream(stream::Config {
                name: name.to_string(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .expect("Failed to create stream")
    }

    /// Messages currently stored in stream `name` (0 when it does not exist).
    pub async fn stream_messages(&self, name: &str) -> u64 {
        match self.jetstream().get_stream(name).await {
            Ok(mut stream) => stream
                .info()
                .await
                .map(|info| info.state.messages)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_nats::jetstream::AckKind;
    use async_nats::jetstream::consumer::{AckPolicy, pull};

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_stream_counts_published_messages() {
        let nats = TestNats::new().await;
        nats.create_stream("JOBS_COUNT", "jobs.count").await;

        for i in 0..3 {
            nats.jetstream()
                .publish("jobs.count", format!("job-{}", i).into())
                .await
                .unwrap()
                .await
                .unwrap();
        }

        assert_eq!(nats.stream_messages("JOBS_COUNT").await, 3);
        assert_eq!(nats.stream_messages("MISSING").await, 0);
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_nak_redelivers_with_higher_delivery_count() {
        let nats = TestNats::new().await;
        let stream = nats.create_stream("JOBS_RETRY", "jobs.retry").await;
        nats.jetstream()
            .publish("jobs.retry", "payload".into())
            .await
            .unwrap()
            .await
            .unwrap();

        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: Some("workers".to_string()),
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .expect("Failed to create consumer");

        let mut first = consumer.fetch().max_messages(1).messages().await.unwrap();
        let message = first.next().await.unwrap().unwrap();
        assert_eq!(message.info().unwrap().delivered, 1);
        message.ack_with(AckKind::Nak(None)).await.unwrap();

        let mut second = consumer.fetch().max_messages(1).messages().await.unwrap();
        let message = second.next().await.unwrap().unwrap();
        assert_eq!(message.info().unwrap().delivered, 2);
        message.ack().await.unwrap();
    }
}
