//! Message broker client.
//!
//! Every component talks to the broker through [`Broker`]: durable direct
//! exchanges, durable queues named `"{exchange}.{queue}"`, persistent and
//! mandatory publishes, and explicitly acknowledged deliveries. A delivery that
//! is never acknowledged is handed out again when its queue is consumed after a
//! restart.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use memory::{InMemoryBroker, PublishedMessage};
#[cfg(feature = "redis")]
pub use redis_streams::RedisBroker;

/// Stream of deliveries for one queue.
pub type Consumer = BoxStream<'static, Delivery>;

/// Concrete queue name for `queue` bound on `exchange`.
pub fn queue_name(exchange: &str, queue: &str) -> String {
    format!("{exchange}.{queue}")
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens the connection now instead of on first use.
    async fn connect(&self) -> Result<()>;

    /// Declares `exchange` and `"{exchange}.{queue}"` durable and binds
    /// `routing_key` to the queue. Returns the concrete queue name.
    async fn bind_queue(&self, exchange: &str, routing_key: &str, queue: &str) -> Result<String>;

    /// Starts consuming a bound queue.
    async fn consume(&self, queue: &str) -> Result<Consumer>;

    /// Publishes a JSON body. Fails with `Unroutable` when no queue is bound
    /// to `routing_key` on `exchange`.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &str) -> Result<()>;
}

/// Settles deliveries with the broker that produced them.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

/// One inbound message awaiting acknowledgment.
pub struct Delivery {
    pub queue: String,
    pub routing_key: String,
    pub body: String,
    tag: String,
    acker: Arc<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("tag", &self.tag)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<String>,
        tag: impl Into<String>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            tag: tag.into(),
            acker,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn ack(self) -> Result<()> {
        let acker = Arc::clone(&self.acker);
        acker.ack(&self).await
    }
}
