//! Transport seam between the connection manager and a concrete hub protocol.
//!
//! The core never touches frames or handshakes. A transport opens a
//! connection, exposes `send`, and calls back into a [`Receiver`] for every
//! server-initiated call and for unexpected closure.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::Error;
use crate::value::Value;

pub mod signalr;

/// Produces request headers at connect time, so a rotated token is picked up
/// by the next handshake without rebuilding the transport.
pub type HeaderProvider = Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>;

/// Entry point for everything the server pushes.
///
/// Both methods run on the transport's reader task and must not block.
pub trait Receiver: Send + Sync {
    /// Called once per server call, in arrival order, whatever the method name.
    fn receive(&self, method: &str, args: Vec<Value>);

    /// Called when the connection ends without [`HubConnection::stop`] having
    /// been called. `reason` carries the server's close error, if any.
    fn closed(&self, reason: Option<String>);
}

/// Opens hub connections.
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Human-readable protocol name for logs.
    fn name(&self) -> &str;

    /// Connect and complete the protocol handshake. `receiver` starts getting
    /// calls only after this returns successfully.
    async fn open(
        &self,
        url: &str,
        headers: HeaderProvider,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn HubConnection>, Error>;
}

/// A live connection. Never mutated after open; replaced on reconnect.
#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Invoke a hub method and wait for its completion. `Ok` carries the
    /// server's result (`Value::Null` when the method returns nothing).
    async fn send(&self, method: &str, args: Vec<Value>) -> Result<Value, Error>;

    /// Tear the connection down. Idempotent. Buffered deliveries are
    /// discarded and [`Receiver::closed`] is not called.
    fn stop(&self);
}
