//! Public types for the hub-client crate.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_tungstenite::tungstenite;

use crate::decoder::Decoded;
use crate::value::Value;

/// Lifecycle state of a [`HubClient`](crate::HubClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether `self -> next` is one of the legal lifecycle edges.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (_, Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by [`HubClient::connection_stats`](crate::HubClient::connection_stats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub status: ConnectionState,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    pub subscription_count: usize,
    /// Messages dropped because the outbound channel was full.
    pub dropped_messages: u64,
    /// Server heartbeats seen by the dispatcher.
    pub heartbeats_received: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Payload of an [`InboundMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// All call arguments, in order.
    Args(Vec<Value>),
    /// The single argument of a well-known data event.
    Single(Value),
}

/// A server-initiated call, delivered to exactly one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Method name exactly as the server sent it.
    pub method: String,
    pub data: Payload,
    /// Decoder output, present for well-known data events only.
    pub decoded: Option<Decoded>,
}

impl InboundMessage {
    pub fn new(method: impl Into<String>, data: Payload) -> Self {
        Self {
            method: method.into(),
            data,
            decoded: None,
        }
    }
}

/// Configuration for [`HubClient`](crate::HubClient).
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Hub endpoint, e.g. `https://example.com/marketHub`.
    pub url: String,
    /// Initial bearer token. Replace later with
    /// [`HubClient::update_token`](crate::HubClient::update_token).
    pub token: String,
    pub timing: TimingConfig,
}

impl HubConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            timing: TimingConfig::default(),
        }
    }
}

/// Timeouts, retry policy, and buffering.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Upper bound on waiting for a heartbeat `ping` result.
    pub ping_timeout: Duration,
    /// Upper bound on a single transport open (negotiate + handshake).
    pub connect_timeout: Duration,
    /// Capacity of the outbound message channel.
    pub message_buffer: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(120),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            message_buffer: 100,
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid header {name}: {message}")]
    Header { name: String, message: String },

    #[error("hub handshake failed: {0}")]
    Handshake(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("invocation of {method} failed: {message}")]
    Invocation { method: String, message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("client is closed")]
    Closed,

    #[error("method name must not be empty")]
    InvalidMethod,

    #[error("token must not be empty")]
    InvalidToken,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    const ALL: [ConnectionState; 4] = [Disconnected, Connecting, Connected, Reconnecting];

    #[test]
    fn only_defined_edges_are_legal() {
        let legal = [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connected, Reconnecting),
            (Reconnecting, Connecting),
        ];
        for from in ALL {
            for to in ALL {
                let expected = to == Disconnected || legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn no_edge_skips_a_state() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
    }

    #[test]
    fn timing_defaults() {
        let t = TimingConfig::default();
        assert_eq!(t.reconnect_base_delay, Duration::from_secs(2));
        assert_eq!(t.reconnect_max_delay, Duration::from_secs(120));
        assert_eq!(t.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(t.ping_timeout, Duration::from_secs(10));
        assert_eq!(t.message_buffer, 100);
    }
}
