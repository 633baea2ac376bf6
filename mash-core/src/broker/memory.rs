use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use super::{Acknowledger, Broker, Consumer, Delivery, queue_name};
use crate::error::{MashError, Result};

/// A message as it was handed to [`InMemoryBroker::publish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: String,
}

#[derive(Clone, Debug)]
struct Envelope {
    tag: u64,
    routing_key: String,
    body: String,
}

#[derive(Default)]
struct QueueState {
    sender: Option<mpsc::UnboundedSender<Delivery>>,
    backlog: VecDeque<Envelope>,
    unacked: BTreeMap<u64, Envelope>,
}

impl fmt::Debug for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueState")
            .field("consuming", &self.sender.is_some())
            .field("backlog", &self.backlog.len())
            .field("unacked", &self.unacked.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, QueueState>,
    published: Vec<PublishedMessage>,
    next_tag: u64,
}

/// Single-process broker with the same binding, routing and acknowledgment
/// rules as the production broker.
///
/// Messages published while nobody consumes a queue wait in its backlog.
/// Unacknowledged deliveries are handed out again whenever the queue is
/// consumed anew, which is how a restarted runtime sees redeliveries.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryBroker");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("bindings", &state.bindings.len())
                    .field("queues", &state.queues.len())
                    .field("published", &state.published.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let tag: u64 = delivery
            .tag()
            .parse()
            .map_err(|_| MashError::Broker(format!("bad delivery tag `{}`", delivery.tag())))?;
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| MashError::Broker(format!("unknown queue `{}`", delivery.queue)))?;
        queue.unacked.remove(&tag);
        Ok(())
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Messages published to `exchange`, in order.
    pub async fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|msg| msg.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Deliveries handed out on `queue` and not yet acknowledged.
    pub async fn unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or_default()
    }

    /// Hands every unacknowledged delivery on `queue` out again, as the
    /// broker would after the consuming connection died.
    pub async fn redeliver_unacked(&self, queue: &str) -> usize {
        let acker = self.acker();
        let mut state = self.state.lock().await;
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return 0;
        };
        let pending: Vec<Envelope> = std::mem::take(&mut queue_state.unacked)
            .into_values()
            .collect();
        let count = pending.len();
        for envelope in pending {
            Self::deliver(queue, queue_state, envelope, &acker);
        }
        count
    }

    fn acker(&self) -> Arc<dyn Acknowledger> {
        Arc::new(InMemoryAcker {
            state: Arc::clone(&self.state),
        })
    }

    fn deliver(
        queue: &str,
        state: &mut QueueState,
        envelope: Envelope,
        acker: &Arc<dyn Acknowledger>,
    ) {
        let delivery = Delivery::new(
            queue,
            envelope.routing_key.clone(),
            envelope.body.clone(),
            envelope.tag.to_string(),
            Arc::clone(acker),
        );
        let sent = state
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(delivery).is_ok());
        if sent {
            state.unacked.insert(envelope.tag, envelope);
        } else {
            state.sender = None;
            state.backlog.push_back(envelope);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn bind_queue(&self, exchange: &str, routing_key: &str, queue: &str) -> Result<String> {
        let name = queue_name(exchange, queue);
        let mut state = self.state.lock().await;
        state.queues.entry(name.clone()).or_default();
        let bound = state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.contains(&name) {
            bound.push(name.clone());
        }
        trace!(exchange, routing_key, queue = %name, "queue bound");
        Ok(name)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        let acker = self.acker();
        let mut state = self.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MashError::Broker(format!("queue `{queue}` is not declared")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        queue_state.sender = Some(tx);

        let mut pending: Vec<Envelope> = std::mem::take(&mut queue_state.unacked)
            .into_values()
            .collect();
        pending.extend(queue_state.backlog.drain(..));
        for envelope in pending {
            Self::deliver(queue, queue_state, envelope, &acker);
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &str) -> Result<()> {
        let acker = self.acker();
        let mut state = self.state.lock().await;
        let targets = state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            return Err(MashError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_string(),
        });

        for queue in targets {
            state.next_tag += 1;
            let envelope = Envelope {
                tag: state.next_tag,
                routing_key: routing_key.to_string(),
                body: body.to_string(),
            };
            if let Some(queue_state) = state.queues.get_mut(&queue) {
                Self::deliver(&queue, queue_state, envelope, &acker);
            }
        }
        Ok(())
    }
}
