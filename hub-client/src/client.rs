//! Public entry point: [`HubClient`].

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionManager, Lifecycle};
use crate::dispatcher::Dispatcher;
use crate::handlers::HandlerRegistry;
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::HubTransport;
use crate::types::{ConnectionState, ConnectionStats, Error, HubConfig, InboundMessage};
use crate::value::Value;

/// Handle to a hub session.
///
/// The session keeps itself alive in the background once
/// [`connect`](HubClient::connect) has been called: failed attempts, dropped
/// connections, and missed heartbeats all lead to a backoff reconnect, after
/// which recorded subscriptions are sent again.
///
/// Dropping the client closes it.
pub struct HubClient {
    manager: Arc<ConnectionManager>,
    handlers: Arc<HandlerRegistry>,
    messages: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl HubClient {
    pub fn new(config: HubConfig, transport: Arc<dyn HubTransport>) -> Self {
        let (tx, rx) = mpsc::channel(config.timing.message_buffer.max(1));
        let (lifecycle, signal_rx) = Lifecycle::new(&config.timing, CancellationToken::new());
        let lifecycle = Arc::new(lifecycle);
        let handlers = Arc::new(HandlerRegistry::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(handlers.clone(), tx, lifecycle.clone()));
        let manager = Arc::new(ConnectionManager::new(
            config,
            transport,
            lifecycle,
            signal_rx,
            dispatcher,
            subscriptions,
        ));
        Self {
            manager,
            handlers,
            messages: Mutex::new(Some(rx)),
        }
    }

    /// Connect and start the background reconnect and heartbeat loops.
    ///
    /// A failure is returned to the caller and also handed to the reconnect
    /// loop, which keeps trying with backoff.
    pub async fn connect(&self) -> Result<(), Error> {
        self.manager.connect().await
    }

    /// Stop all loops, the active connection, and the message channel.
    /// Safe to call more than once.
    pub fn close(&self) {
        self.manager.close();
    }

    /// Replace the bearer token used for subsequent handshakes.
    pub fn update_token(&self, token: impl Into<String>) -> Result<(), Error> {
        self.manager.update_token(token.into())
    }

    /// Route calls to `method` (any case) to `handler` instead of the message
    /// channel. The handler runs on the transport reader; keep it short.
    pub fn register_custom_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.handlers.register(method, Arc::new(handler));
    }

    /// Record a subscription and send it if connected. It is resent after
    /// every reconnect.
    pub fn subscribe(&self, method: &str, args: Vec<Value>) -> Result<(), Error> {
        self.manager.subscribe(method, args)
    }

    /// Take the inbound message receiver. Returns `None` after the first call.
    pub fn messages(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn status(&self) -> ConnectionState {
        self.manager.lifecycle().state()
    }

    /// Most recent connection failure, cleared on successful connect.
    pub fn last_error(&self) -> Option<String> {
        self.manager.lifecycle().last_error()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.manager.stats()
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.manager.close();
    }
}
