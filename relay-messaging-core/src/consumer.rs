//! Consume loop shared by [`Subscriber`](crate::Subscriber) and
//! [`RpcServer`](crate::RpcServer).
//!
//! ```text
//! Disconnected -> Connecting -> DeclaringTopology -> Consuming
//! Consuming -> Reconnecting(budget - 1) -> Connecting ... | Dormant
//! Consuming -> Closing -> Closed
//! ```

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    BrokerChannel, ConnectionParameters, Connector, Delivery, MessagingError, ReconnectPolicy,
    Topology,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    DeclaringTopology,
    Consuming,
    Reconnecting { remaining: u32 },
    Closing,
    /// Stopped on request.
    Closed,
    /// Gave up after the reconnect budget ran out.
    Dormant,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Closed | ConsumerState::Dormant)
    }
}

/// Requests a graceful stop of a consume loop from another task.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Triggers the shutdown on the first Ctrl-C.
    pub fn shutdown_on_ctrl_c(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, stopping consumer");
                    handle.shutdown();
                }
                Err(e) => error!("unable to listen for ctrl-c: {e}"),
            }
        })
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a consumer's state, usable as a liveness check.
#[derive(Clone, Debug)]
pub struct StatusHandle {
    rx: watch::Receiver<ConsumerState>,
}

impl StatusHandle {
    pub fn current(&self) -> ConsumerState {
        *self.rx.borrow()
    }

    pub fn is_dormant(&self) -> bool {
        self.current() == ConsumerState::Dormant
    }

    /// Waits until the state satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl Fn(&ConsumerState) -> bool,
    ) -> Result<ConsumerState, MessagingError> {
        self.rx
            .wait_for(|state| predicate(state))
            .await
            .map(|state| *state)
            .map_err(|_| MessagingError::Disconnected("consumer dropped".into()))
    }
}

/// Per-delivery behaviour plugged into the loop. An `Err` means the channel
/// itself failed and triggers a reconnect.
#[async_trait]
pub(crate) trait DeliveryHandler: Send + Sync {
    async fn handle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<(), MessagingError>;

    /// Runs on every freshly established channel before consuming starts.
    async fn on_channel(&self, _channel: &dyn BrokerChannel) -> Result<(), MessagingError> {
        Ok(())
    }
}

enum Stop {
    Shutdown,
    Disconnected(MessagingError),
}

pub(crate) struct ConsumeLoop {
    topology: Topology,
    params: ConnectionParameters,
    connector: Arc<dyn Connector>,
    reconnect: ReconnectPolicy,
    retries_left: u32,
    channel: Option<Arc<dyn BrokerChannel>>,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
    status: watch::Sender<ConsumerState>,
}

impl ConsumeLoop {
    /// Connects and declares the topology right away so construction fails
    /// fast on an unreachable broker.
    pub(crate) async fn connect(
        topology: Topology,
        params: ConnectionParameters,
        connector: Arc<dyn Connector>,
        reconnect: ReconnectPolicy,
        shutdown: ShutdownHandle,
    ) -> Result<Self, MessagingError> {
        let (status, _) = watch::channel(ConsumerState::Disconnected);
        let shutdown_rx = shutdown.subscribe();
        let mut consumer = Self {
            topology,
            params,
            connector,
            reconnect,
            retries_left: reconnect.retries,
            channel: None,
            shutdown,
            shutdown_rx,
            status,
        };
        consumer.ensure_channel().await?;
        Ok(consumer)
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.topology
    }

    pub(crate) fn state(&self) -> ConsumerState {
        *self.status.borrow()
    }

    pub(crate) fn status(&self) -> StatusHandle {
        StatusHandle {
            rx: self.status.subscribe(),
        }
    }

    pub(crate) fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub(crate) fn retries_left(&self) -> u32 {
        self.retries_left
    }

    fn set_state(&self, state: ConsumerState) {
        self.status.send_replace(state);
    }

    async fn ensure_channel(&mut self) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        if let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(channel));
        }
        self.channel = None;

        self.set_state(ConsumerState::Connecting);
        let channel = self.connector.connect(&self.params).await?;
        self.set_state(ConsumerState::DeclaringTopology);
        self.topology.declare(channel.as_ref()).await?;

        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Runs until shutdown (`Closed`) or until the reconnect budget is spent
    /// (`Dormant`). Broker errors never escape.
    pub(crate) async fn run(&mut self, handler: &dyn DeliveryHandler) -> ConsumerState {
        let state = self.state();
        if state.is_terminal() {
            return state;
        }

        loop {
            if *self.shutdown_rx.borrow_and_update() {
                return self.close().await;
            }

            let err = match self.consume_once(handler).await {
                Stop::Shutdown => return self.close().await,
                Stop::Disconnected(err) => err,
            };

            let queue = self.topology.destination().queue().to_string();
            warn!(queue = %queue, error = %err, "connection closed by the broker");
            if let Some(channel) = self.channel.take() {
                if let Err(err) = channel.close().await {
                    debug!(queue = %queue, error = %err, "stale channel already gone");
                }
            }

            if self.retries_left == 0 {
                error!(queue = %queue, "shutting down consumer after all restart attempts");
                self.set_state(ConsumerState::Dormant);
                return ConsumerState::Dormant;
            }
            self.retries_left -= 1;
            self.set_state(ConsumerState::Reconnecting {
                remaining: self.retries_left,
            });

            debug!(queue = %queue, delay = ?self.reconnect.delay, "waiting to restart consumer");
            if self.wait_or_shutdown(self.reconnect.delay).await {
                return self.close().await;
            }
            info!(
                queue = %queue,
                remaining = self.retries_left,
                "re-initializing queued message consumption"
            );
        }
    }

    async fn consume_once(&mut self, handler: &dyn DeliveryHandler) -> Stop {
        let channel = match self.ensure_channel().await {
            Ok(channel) => channel,
            Err(err) => return Stop::Disconnected(err),
        };
        let queue = self.topology.destination().queue().to_string();

        if let Err(err) = handler.on_channel(channel.as_ref()).await {
            return Stop::Disconnected(err);
        }
        let mut deliveries = match channel.consume(&queue, false).await {
            Ok(stream) => stream,
            Err(err) => return Stop::Disconnected(err),
        };
        self.set_state(ConsumerState::Consuming);
        info!(queue = %queue, "waiting for messages");

        loop {
            tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow_and_update() {
                        return Stop::Shutdown;
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = handler.handle(channel.as_ref(), delivery).await {
                            return Stop::Disconnected(err);
                        }
                    }
                    Some(Err(err)) => return Stop::Disconnected(err),
                    None => {
                        return Stop::Disconnected(MessagingError::Disconnected(
                            "delivery stream ended".into(),
                        ))
                    }
                }
            }
        }
    }

    /// Returns `true` when a shutdown arrived before `delay` elapsed.
    async fn wait_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => false,
            changed = self.shutdown_rx.changed() => {
                changed.is_err() || *self.shutdown_rx.borrow_and_update()
            }
        }
    }

    async fn close(&mut self) -> ConsumerState {
        self.set_state(ConsumerState::Closing);
        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "error while closing channel");
            }
        }
        self.set_state(ConsumerState::Closed);
        info!(queue = self.topology.destination().queue(), "consumer closed");
        ConsumerState::Closed
    }
}
