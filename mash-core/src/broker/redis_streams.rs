use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::sync::{OnceCell, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{Acknowledger, Broker, Consumer, Delivery, queue_name};
use crate::error::{MashError, Result};

const CONSUMER_GROUP: &str = "mash";
const READ_BATCH: usize = 16;
const PREFETCH: usize = 64;

fn stream_key(queue: &str) -> String {
    format!("mash:queue:{queue}")
}

fn binding_key(exchange: &str, routing_key: &str) -> String {
    format!("mash:binding:{exchange}:{routing_key}")
}

const EXCHANGES_KEY: &str = "mash:exchanges";

/// Broker backed by Redis Streams.
///
/// Exchanges are sets of bound queue names per routing key, queues are
/// streams read through one consumer group. Entries stay in the group's
/// pending list until acknowledged, and a consumer re-reads its own pending
/// entries before new ones, so a crashed runtime sees its unfinished work
/// again under the same consumer name.
pub struct RedisBroker {
    client: Client,
    consumer_name: String,
    block: Duration,
    conn: OnceCell<ConnectionManager>,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("consumer_name", &self.consumer_name)
            .field("block", &self.block)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

impl RedisBroker {
    pub fn new(url: &str, consumer_name: impl Into<String>) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| MashError::Broker(format!("Failed to create Redis client: {e}")))?;
        Ok(Self {
            client,
            consumer_name: consumer_name.into(),
            block: Duration::from_secs(5),
            conn: OnceCell::new(),
        })
    }

    pub fn with_block_timeout(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Shared command connection; opened on first use. The connection manager
    /// reconnects on its own after the server closes the socket.
    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                info!("Connecting to Redis broker");
                let conn = ConnectionManager::new(self.client.clone()).await.map_err(|e| {
                    MashError::Broker(format!("Failed to connect to Redis: {e}"))
                })?;
                info!("Successfully connected to Redis broker");
                Ok::<_, MashError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

struct RedisAcker {
    conn: ConnectionManager,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let key = stream_key(&delivery.queue);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .xack(&key, CONSUMER_GROUP, &[delivery.tag()])
            .ignore()
            .xdel(&key, &[delivery.tag()])
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

fn field(entry: &StreamId, name: &str) -> Option<String> {
    entry.get::<String>(name)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn bind_queue(&self, exchange: &str, routing_key: &str, queue: &str) -> Result<String> {
        let name = queue_name(exchange, queue);
        let mut conn = self.connection().await?;

        let _: () = conn.sadd(EXCHANGES_KEY, exchange).await?;
        let _: () = conn.sadd(binding_key(exchange, routing_key), &name).await?;

        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(stream_key(&name), CONSUMER_GROUP, "0")
            .await;
        match created {
            Ok(()) => debug!(queue = %name, "queue declared"),
            Err(err) if err.code() == Some("BUSYGROUP") => {}
            Err(err) => return Err(err.into()),
        }
        Ok(name)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        let key = stream_key(queue);
        let acker: Arc<dyn Acknowledger> = Arc::new(RedisAcker {
            conn: self.connection().await?,
        });
        // Blocking reads get their own connection so they never stall
        // publishes and acks on the shared one.
        let mut reader = self.client.get_multiplexed_async_connection().await?;
        let consumer_name = self.consumer_name.clone();
        let block_ms = usize::try_from(self.block.as_millis()).unwrap_or(usize::MAX);
        let queue = queue.to_string();
        let (tx, rx) = mpsc::channel::<Delivery>(PREFETCH);

        tokio::spawn(async move {
            // Start from our own pending entries, then switch to new ones.
            let mut cursor = "0".to_string();
            loop {
                if tx.is_closed() {
                    debug!(queue = %queue, "consumer dropped, stopping reader");
                    break;
                }

                let reading_pending = cursor != ">";
                let mut opts = StreamReadOptions::default()
                    .group(CONSUMER_GROUP, &consumer_name)
                    .count(READ_BATCH);
                if !reading_pending {
                    opts = opts.block(block_ms);
                }

                let reply: redis::RedisResult<Option<StreamReadReply>> =
                    reader.xread_options(&[&key], &[&cursor], &opts).await;
                let entries: Vec<StreamId> = match reply {
                    Ok(reply) => reply
                        .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
                        .unwrap_or_default(),
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "stream read failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                if reading_pending && entries.is_empty() {
                    cursor = ">".to_string();
                    continue;
                }

                for entry in entries {
                    if reading_pending {
                        cursor = entry.id.clone();
                    }
                    let (Some(routing_key), Some(body)) =
                        (field(&entry, "routing_key"), field(&entry, "body"))
                    else {
                        warn!(queue = %queue, id = %entry.id, "dropping malformed stream entry");
                        let stray = Delivery::new(&queue, "", "", entry.id.clone(), Arc::clone(&acker));
                        if let Err(err) = stray.ack().await {
                            warn!(queue = %queue, error = %err, "failed to drop malformed entry");
                        }
                        continue;
                    };
                    let delivery =
                        Delivery::new(&queue, routing_key, body, entry.id, Arc::clone(&acker));
                    if tx.send(delivery).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let queues: Vec<String> = conn.smembers(binding_key(exchange, routing_key)).await?;
        if queues.is_empty() {
            return Err(MashError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for queue in &queues {
            pipe.xadd(
                stream_key(queue),
                "*",
                &[("routing_key", routing_key), ("body", body)],
            )
            .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
