//! Resilient client for a push-based real-time RPC hub.
//!
//! Opens a long-lived hub connection, receives server-initiated calls under
//! arbitrary method names, and keeps the session alive across failures.
//!
//! # Features
//! - Lifecycle state machine with exponential-backoff reconnection
//! - Heartbeat-based liveness detection
//! - Subscriptions recorded and replayed after every reconnect
//! - Bearer token rotation without rebuilding the client
//! - Decoding of Brotli / base64 / tilde-delimited market data payloads
//! - Pluggable transport, with a JSON hub protocol adapter over WebSocket
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), hub_client::Error> {
//! use std::sync::Arc;
//!
//! use hub_client::{HubClient, HubConfig, SignalRTransport, Value};
//!
//! let transport = Arc::new(SignalRTransport::new()?);
//! let client = HubClient::new(
//!     HubConfig::new("https://feed.example.com/marketHub", "token"),
//!     transport,
//! );
//! let Some(mut messages) = client.messages() else {
//!     return Ok(());
//! };
//!
//! client.subscribe("SubscribeToMarketStatusUpdatedEvent", vec![Value::from("DSE")])?;
//! client.connect().await?;
//!
//! while let Some(msg) = messages.recv().await {
//!     println!("{}: {:?}", msg.method, msg.decoded);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
pub mod decoder;
mod dispatcher;
pub mod handlers;
pub mod subscriptions;
pub mod transport;
mod types;
mod value;

pub use client::HubClient;
pub use decoder::Decoded;
pub use dispatcher::{KnownEvent, is_auth_error};
pub use handlers::{Handler, HandlerRegistry};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use transport::signalr::SignalRTransport;
pub use transport::{HeaderProvider, HubConnection, HubTransport, Receiver};
pub use types::{
    ConnectionState, ConnectionStats, Error, HubConfig, InboundMessage, Payload, TimingConfig,
};
pub use value::Value;
