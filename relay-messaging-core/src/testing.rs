//! In-memory broker for exercising publishers, subscribers and RPC endpoints
//! without a running RabbitMQ.
//!
//! Routing follows direct-exchange semantics, unacknowledged deliveries go
//! back to their queue (flagged redelivered) when their channel closes, and
//! failures can be injected per operation.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    BrokerChannel, ConnectionParameters, Connector, Delivery, DeliveryStream, MessageProperties,
    MessagingError,
};

/// `guest:guest@localhost`, default vhost.
pub fn guest_params() -> ConnectionParameters {
    ConnectionParameters::local_guest()
}

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery, MessagingError>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, (u64, StoredMessage)>,
    consumer: Option<ConsumerSlot>,
    exclusive_owner: Option<u64>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: BTreeMap<String, QueueState>,
    bindings: HashSet<(String, String, String)>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    connect_failures: u32,
    publish_failures: u32,
    connect_attempts: u32,
    published: Vec<PublishedMessage>,
    returned: Vec<PublishedMessage>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    rejects: Vec<(u64, bool)>,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect();
        }
        self.bindings
            .iter()
            .filter(|(_, ex, key)| ex == exchange && key == routing_key)
            .map(|(queue, _, _)| queue.clone())
            .collect()
    }

    /// Pushes ready messages to the queue's consumer, if any.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            let Some(slot) = state.consumer.as_ref() else {
                return;
            };
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            let (channel_id, auto_ack) = (slot.channel_id, slot.auto_ack);

            if slot.tx.send(Ok(delivery)).is_err() {
                state.consumer = None;
                state.ready.push_front(message);
                return;
            }
            if !auto_ack {
                state.unacked.insert(tag, (channel_id, message));
            }
        }
    }

    fn settle(&mut self, channel_id: u64, tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let queue = self
            .queues
            .iter()
            .find(|(_, q)| matches!(q.unacked.get(&tag), Some((owner, _)) if *owner == channel_id))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| MessagingError::Broker(format!("unknown delivery tag {tag}")))?;

        let Some(state) = self.queues.get_mut(&queue) else {
            return Ok(());
        };
        if let Some((_, mut message)) = state.unacked.remove(&tag) {
            if requeue {
                message.redelivered = true;
                state.ready.push_front(message);
                self.dispatch(&queue);
            }
        }
        Ok(())
    }

    /// Drops the channel's consumers and exclusive queues and requeues its
    /// unacknowledged deliveries.
    fn close_channel(&mut self, channel_id: u64) {
        if let Some(open) = self.channels.remove(&channel_id) {
            open.store(false, Ordering::SeqCst);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(channel_id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in &exclusive {
            self.queues.remove(queue);
            self.bindings.retain(|(q, _, _)| q != queue);
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            let Some(state) = self.queues.get_mut(&name) else {
                continue;
            };
            if matches!(&state.consumer, Some(slot) if slot.channel_id == channel_id) {
                state.consumer = None;
            }
            let owned: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in owned.into_iter().rev() {
                if let Some((_, mut message)) = state.unacked.remove(&tag) {
                    message.redelivered = true;
                    state.ready.push_front(message);
                }
            }
            self.dispatch(&name);
        }
    }
}

/// Cloneable handle on one in-memory broker; every clone sees the same
/// state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// The next `count` publishes fail with a broker error.
    pub fn fail_publishes(&self, count: u32) {
        self.lock().publish_failures = count;
    }

    /// Closes every open channel as if the broker dropped its connections.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.lock().queues.keys().cloned().collect()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock().bindings.contains(&(
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ))
    }

    /// Ready plus unacknowledged messages.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    /// Messages published with `routing_key`, in order.
    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub fn returned(&self) -> Vec<PublishedMessage> {
        self.lock().returned.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    /// `(delivery_tag, requeue)` pairs.
    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.lock().nacks.clone()
    }

    /// `(delivery_tag, requeue)` pairs.
    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.lock().rejects.clone()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(
        &self,
        _params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(MessagingError::Connectivity("connection refused".into()));
        }

        state.next_channel_id += 1;
        let id = state.next_channel_id;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(id, Arc::clone(&open));

        Ok(Arc::new(MemoryChannel {
            id,
            open,
            broker: self.clone(),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    open: Arc<AtomicBool>,
    broker: InMemoryBroker,
}

impl MemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, MessagingError> {
        if !self.is_open() {
            return Err(MessagingError::Broker(format!("channel {} is closed", self.id)));
        }
        Ok(self.broker.lock())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), MessagingError> {
        self.state()?.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError> {
        self.state()?.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, MessagingError> {
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        let queue = QueueState {
            exclusive_owner: Some(self.id),
            ..Default::default()
        };
        self.state()?.queues.insert(name.clone(), queue);
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        let mut state = self.state()?;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Broker(format!("no queue '{queue}'")));
        }
        if !state.exchanges.contains(exchange) {
            return Err(MessagingError::Broker(format!("no exchange '{exchange}'")));
        }
        state.bindings.insert((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError> {
        let mut state = self.state()?;
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(MessagingError::Broker("connection reset by peer".into()));
        }
        if !exchange.is_empty() && !state.exchanges.contains(exchange) {
            return Err(MessagingError::Broker(format!("no exchange '{exchange}'")));
        }

        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        };
        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            state.returned.push(message);
            return Err(MessagingError::Unroutable(format!(
                "no route for '{routing_key}' on '{exchange}'"
            )));
        }

        state.published.push(message);
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, MessagingError> {
        let mut state = self.state()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = ConsumerSlot {
            channel_id: self.id,
            auto_ack,
            tx,
        };
        match state.queues.get_mut(queue) {
            Some(q) => q.consumer = Some(slot),
            None => return Err(MessagingError::Broker(format!("no queue '{queue}'"))),
        }
        state.dispatch(queue);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let mut state = self.state()?;
        state.settle(self.id, delivery_tag, false)?;
        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let mut state = self.state()?;
        state.settle(self.id, delivery_tag, requeue)?;
        state.nacks.push((delivery_tag, requeue));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let mut state = self.state()?;
        state.settle(self.id, delivery_tag, requeue)?;
        state.rejects.push((delivery_tag, requeue));
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unroutable_messages_are_returned() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect(&guest_params()).await.unwrap();
        channel.declare_exchange("SHOP").await.unwrap();

        let err = channel
            .publish("SHOP", "NOWHERE", b"{}", &MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Unroutable(_)));
        assert_eq!(broker.returned().len(), 1);
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect(&guest_params()).await.unwrap();
        channel.declare_exchange("SHOP").await.unwrap();
        channel.declare_queue("ORDERS").await.unwrap();
        channel.bind_queue("ORDERS", "SHOP", "ORDERS").await.unwrap();
        channel
            .publish("SHOP", "ORDERS", b"1", &MessageProperties::default())
            .await
            .unwrap();

        let mut deliveries = channel.consume("ORDERS", false).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);

        channel.close().await.unwrap();
        assert!(!channel.is_open());
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_depth("ORDERS"), 1);

        let channel = broker.connect(&guest_params()).await.unwrap();
        let mut deliveries = channel.consume("ORDERS", false).await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"1");
    }

    #[tokio::test]
    async fn exclusive_queues_die_with_their_channel() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect(&guest_params()).await.unwrap();
        let name = channel.declare_reply_queue().await.unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.queue_exists(&name));

        broker.disconnect_all();
        assert!(!broker.queue_exists(&name));
        assert_eq!(broker.open_channels(), 0);
    }
}
