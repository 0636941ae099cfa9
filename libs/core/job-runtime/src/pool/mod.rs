//! Process-wide broker resources: the connection, producers and consumers.
//!
//! Each pool serializes create-if-absent behind its own lock so at most one
//! handle exists per key.

mod connection;
mod consumers;
mod producers;

pub use connection::ConnectionManager;
pub use consumers::{ConsumerKey, ConsumerPool};
pub use producers::ProducerPool;
