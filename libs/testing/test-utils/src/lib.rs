//! Shared test utilities for the job runtime
//!
//! This crate provides reusable test infrastructure:
//! - `TestNats`: JetStream-enabled NATS container with automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: Deterministic topic, subscription and host names (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `nats`: Enables NATS test infrastructure
//!
//! # Usage
//!
//! Add `features = ["nats"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestDataBuilder::from_test_name("my_nats_test");
//!
//!     let topic = names.topic("mail");
//!     let subscription = names.subscription("workers");
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for test names with deterministic randomization
///
/// Tests sharing a broker stay isolated by deriving every topic and
/// subscription from their own name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_dead_letter_routing");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Topic name unique to this builder
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let topic = TestDataBuilder::new(7).topic("mail");
    /// assert_eq!(topic, "test.mail.7");
    /// ```
    pub fn topic(&self, name: &str) -> String {
        format!("test.{}.{}", name, self.seed)
    }

    /// Dead-letter topic paired with [`TestDataBuilder::topic`]
    pub fn dlq_topic(&self, name: &str) -> String {
        format!("{}.dlq", self.topic(name))
    }

    pub fn subscription(&self, name: &str) -> String {
        format!("test-{}-{}", name, self.seed)
    }

    /// Deterministic worker host id
    pub fn host_id(&self) -> String {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes).simple().to_string()
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Poll `check` until it holds, panicking after `timeout`.
    pub async fn eventually<F, Fut>(timeout: Duration, context: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{}: condition not met within {:?}", context, timeout);
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
