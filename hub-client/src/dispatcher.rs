//! Routing of server-initiated calls.
//!
//! Every call goes to exactly one destination, decided by an ordered rule
//! table: heartbeat, custom handler, well-known data event, catch-all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::connection::Lifecycle;
use crate::decoder;
use crate::handlers::{Handler, HandlerRegistry, normalize_method};
use crate::types::{InboundMessage, Payload};
use crate::value::Value;

/// Substrings (lowercase) that mark an error text as an authentication failure.
const AUTH_ERROR_INDICATORS: [&str; 5] = [
    "401",
    "unauthorized",
    "token expired",
    "invalid token",
    "authentication",
];

const ERROR_METHOD: &str = "error";
const PING_METHOD: &str = "ping";
const PING_MESSAGE_TYPE: i64 = 6;

/// Data events whose payload goes through the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownEvent {
    PriceUpdate,
    MarketStatus,
}

impl KnownEvent {
    pub const SHARE_PRICE_UPDATED: &'static str = "SharePriceUpdated";
    pub const MARKET_STATUS_UPDATED: &'static str = "MarketStatusUpdated^^DSE~";

    /// Case-insensitive match on the server method name.
    pub fn from_method(method: &str) -> Option<Self> {
        if method.eq_ignore_ascii_case(Self::SHARE_PRICE_UPDATED) {
            Some(KnownEvent::PriceUpdate)
        } else if method.eq_ignore_ascii_case(Self::MARKET_STATUS_UPDATED) {
            Some(KnownEvent::MarketStatus)
        } else {
            None
        }
    }
}

enum Route {
    Heartbeat,
    Custom(Handler),
    WellKnown(KnownEvent),
    CatchAll,
}

/// Whether `text` looks like an authentication failure.
pub fn is_auth_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    AUTH_ERROR_INDICATORS.iter().any(|i| lower.contains(i))
}

fn is_ping_json(json: &serde_json::Value) -> bool {
    json.get("type").and_then(serde_json::Value::as_i64) == Some(PING_MESSAGE_TYPE)
}

fn is_ping_envelope(value: &Value) -> bool {
    match value {
        Value::Json(json) => is_ping_json(json),
        Value::Text(text) => serde_json::from_str::<serde_json::Value>(text)
            .map(|json| is_ping_json(&json))
            .unwrap_or(false),
        _ => false,
    }
}

pub(crate) fn is_heartbeat(method: &str, args: &[Value]) -> bool {
    if method.is_empty() {
        return true;
    }
    if let [only] = args
        && is_ping_envelope(only)
    {
        return true;
    }
    method.eq_ignore_ascii_case(PING_METHOD)
        && match args {
            [] => true,
            [only] => only.is_null() || only.as_str() == Some(""),
            _ => false,
        }
}

pub(crate) struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    outbound: RwLock<Option<mpsc::Sender<InboundMessage>>>,
    lifecycle: Arc<Lifecycle>,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        outbound: mpsc::Sender<InboundMessage>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            handlers,
            outbound: RwLock::new(Some(outbound)),
            lifecycle,
            dropped: AtomicU64::new(0),
        }
    }

    fn route(&self, method: &str, args: &[Value]) -> Route {
        if is_heartbeat(method, args) {
            return Route::Heartbeat;
        }
        if let Some(handler) = self.handlers.get(&normalize_method(method)) {
            return Route::Custom(handler);
        }
        if !args.is_empty()
            && let Some(event) = KnownEvent::from_method(method)
        {
            return Route::WellKnown(event);
        }
        Route::CatchAll
    }

    /// Handle one server call from the connection of `generation`.
    pub fn dispatch(&self, generation: u64, method: &str, args: Vec<Value>) {
        if method.eq_ignore_ascii_case(ERROR_METHOD) {
            let text = args
                .iter()
                .map(Value::coerce_to_text)
                .collect::<Vec<_>>()
                .join(" ");
            if is_auth_error(&text) {
                tracing::warn!(error = %decoder::truncate(&text, 200), "Server reported an authentication error");
                self.lifecycle
                    .report_failure(generation, format!("authentication error: {text}"));
            }
        }

        match self.route(method, &args) {
            Route::Heartbeat => self.lifecycle.record_heartbeat(),
            Route::Custom(handler) => {
                tracing::debug!(method, "Dispatching to custom handler");
                handler(InboundMessage::new(method, Payload::Args(args)));
            }
            Route::WellKnown(event) => {
                let first = args.into_iter().next().unwrap_or_default();
                let decoded = decoder::decode(&first);
                tracing::trace!(method, ?event, "Decoded data event");
                self.deliver(InboundMessage {
                    method: method.to_string(),
                    data: Payload::Single(first),
                    decoded: Some(decoded),
                });
            }
            Route::CatchAll => self.deliver(InboundMessage::new(method, Payload::Args(args))),
        }
    }

    /// The transport lost the connection of `generation`.
    pub fn connection_closed(&self, generation: u64, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "connection closed by server".to_string());
        if is_auth_error(&reason) {
            tracing::warn!(%reason, "Connection closed with an authentication error");
        }
        self.lifecycle.report_failure(generation, reason);
    }

    fn deliver(&self, msg: InboundMessage) {
        let outbound = self.outbound.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            tracing::debug!(method = %msg.method, "Client closed, discarding message");
            return;
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    method = %msg.method,
                    total_dropped = total,
                    "Message channel full, dropping message"
                );
            }
            Err(TrySendError::Closed(msg)) => {
                tracing::debug!(method = %msg.method, "Message receiver dropped, discarding message");
            }
        }
    }

    /// Drop the sender so the consumer sees end-of-stream. Idempotent.
    pub fn close_channel(&self) {
        self.outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
