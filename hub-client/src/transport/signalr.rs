//! SignalR JSON hub protocol over WebSocket.
//!
//! Frames are JSON records terminated by `0x1E`. A connection optionally
//! negotiates over HTTP, upgrades to WebSocket, exchanges the
//! `{"protocol":"json","version":1}` handshake, and then runs a reader task
//! and a writer task until stopped or closed by the server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;

use super::{HeaderProvider, HubConnection, HubTransport, Receiver};
use crate::types::Error;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Terminates every JSON hub record.
pub const RECORD_SEPARATOR: char = '\u{1e}';
const PROTOCOL: &str = "json";
const PROTOCOL_VERSION: u32 = 1;
const NEGOTIATE_VERSION: &str = "1";
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const OUTBOUND_CAPACITY: usize = 64;

/// Hub message `type` discriminators.
pub mod message_type {
    pub const INVOCATION: i32 = 1;
    pub const STREAM_ITEM: i32 = 2;
    pub const COMPLETION: i32 = 3;
    pub const STREAM_INVOCATION: i32 = 4;
    pub const CANCEL_INVOCATION: i32 = 5;
    pub const PING: i32 = 6;
    pub const CLOSE: i32 = 7;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

impl HubMessage {
    pub fn invocation(invocation_id: &str, target: &str, args: &[Value]) -> Self {
        HubMessage {
            kind: message_type::INVOCATION,
            invocation_id: Some(invocation_id.to_string()),
            target: Some(target.to_string()),
            arguments: Some(args.iter().map(Value::to_json).collect()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HandshakeResponse {
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct NegotiateResponse {
    connection_token: Option<String>,
    connection_id: Option<String>,
    error: Option<String>,
}

pub fn encode_frame<T: Serialize>(msg: &T) -> Result<String, Error> {
    let mut frame = serde_json::to_string(msg)?;
    frame.push(RECORD_SEPARATOR);
    Ok(frame)
}

pub fn decode_record(record: &str) -> Result<HubMessage, Error> {
    Ok(serde_json::from_str(record)?)
}

/// Non-empty records in a text frame. One frame may carry several.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

fn handshake_frame() -> Result<String, Error> {
    encode_frame(&HandshakeRequest {
        protocol: PROTOCOL,
        version: PROTOCOL_VERSION,
    })
}

// ---------------------------------------------------------------------------
// URL construction
// ---------------------------------------------------------------------------

/// `{url}/negotiate?negotiateVersion=1`, keeping any existing query.
pub fn build_negotiate_url(hub_url: &str) -> Result<String, Error> {
    let mut u = url::Url::parse(hub_url)?;
    let path = format!("{}/negotiate", u.path().trim_end_matches('/'));
    u.set_path(&path);
    u.query_pairs_mut()
        .append_pair("negotiateVersion", NEGOTIATE_VERSION);
    Ok(u.to_string())
}

/// Switch the hub URL to a WebSocket scheme and attach the negotiated id.
pub fn build_ws_url(hub_url: &str, connection_token: Option<&str>) -> Result<String, Error> {
    let mut u = url::Url::parse(hub_url)?;
    let scheme = match u.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::Handshake(format!("unsupported URL scheme: {other}")));
        }
    };
    u.set_scheme(scheme)
        .map_err(|()| Error::Handshake(format!("cannot switch {hub_url} to {scheme}")))?;
    if let Some(id) = connection_token {
        u.query_pairs_mut().append_pair("id", id);
    }
    Ok(u.to_string())
}

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, String>>>>>;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct SignalRTransport {
    http: reqwest::Client,
    skip_negotiation: bool,
}

impl SignalRTransport {
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(NEGOTIATE_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            skip_negotiation: false,
        }
    }

    /// Connect straight to the WebSocket endpoint without the HTTP negotiate step.
    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    async fn negotiate(
        &self,
        hub_url: &str,
        headers: &[(String, String)],
    ) -> Result<Option<String>, Error> {
        let mut req = self.http.post(build_negotiate_url(hub_url)?);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req
            .send()
            .await?
            .error_for_status()?
            .json::<NegotiateResponse>()
            .await?;
        if let Some(error) = resp.error {
            return Err(Error::Handshake(format!("negotiate rejected: {error}")));
        }
        Ok(resp.connection_token.or(resp.connection_id))
    }
}

#[async_trait]
impl HubTransport for SignalRTransport {
    fn name(&self) -> &str {
        "signalr-json"
    }

    async fn open(
        &self,
        url: &str,
        headers: HeaderProvider,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn HubConnection>, Error> {
        let header_list = headers();
        let connection_token = if self.skip_negotiation {
            None
        } else {
            self.negotiate(url, &header_list).await?
        };

        let ws_url = build_ws_url(url, connection_token.as_deref())?;
        let mut request = ws_url.as_str().into_client_request()?;
        for (name, value) in &header_list {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::Header {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| Error::Header {
                name: name.clone(),
                message: e.to_string(),
            })?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_write, mut ws_read) = ws.split();
        ws_write
            .send(tungstenite::Message::Text(handshake_frame()?.into()))
            .await?;
        let backlog = wait_for_handshake(&mut ws_read).await?;
        tracing::info!(negotiated = connection_token.is_some(), "hub handshake complete");

        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(run_writer(ws_write, out_rx, cancel.clone()));
        let reader = Reader {
            ws_read,
            receiver,
            pending: pending.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(run_reader(reader, backlog));

        Ok(Arc::new(SignalRConnection {
            out_tx,
            pending,
            next_id: AtomicU64::new(1),
            cancel,
        }))
    }
}

/// Wait for the handshake reply. Records that arrive in the same frame after
/// the reply are returned for the reader to process.
async fn wait_for_handshake(ws_read: &mut WsRead) -> Result<Vec<HubMessage>, Error> {
    while let Some(frame) = ws_read.next().await {
        let text = match frame? {
            tungstenite::Message::Text(text) => text.as_str().to_string(),
            tungstenite::Message::Binary(data) => String::from_utf8(data.to_vec())
                .map_err(|_| Error::Handshake("non-UTF-8 handshake reply".to_string()))?,
            tungstenite::Message::Close(_) => {
                return Err(Error::Handshake(
                    "server closed during handshake".to_string(),
                ));
            }
            _ => continue,
        };

        let mut records = split_records(&text);
        let Some(first) = records.next() else {
            continue;
        };
        let reply: HandshakeResponse = serde_json::from_str(first)?;
        if let Some(error) = reply.error {
            return Err(Error::Handshake(error));
        }

        let mut backlog = Vec::new();
        for record in records {
            match decode_record(record) {
                Ok(msg) => backlog.push(msg),
                Err(e) => tracing::warn!("Failed to decode hub record: {e}"),
            }
        }
        return Ok(backlog);
    }
    Err(Error::Handshake(
        "connection closed before handshake reply".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct SignalRConnection {
    out_tx: mpsc::Sender<tungstenite::Message>,
    pending: Pending,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

#[async_trait]
impl HubConnection for SignalRConnection {
    async fn send(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = encode_frame(&HubMessage::invocation(&id, method, &args))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        if self
            .out_tx
            .send(tungstenite::Message::Text(frame.into()))
            .await
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(Error::ConnectionClosed);
        }

        let outcome = tokio::select! {
            outcome = rx => outcome,
            () = self.cancel.cancelled() => {
                lock(&self.pending).remove(&id);
                return Err(Error::ConnectionClosed);
            }
        };
        match outcome {
            Ok(Ok(result)) => Ok(Value::from(result)),
            Ok(Err(message)) => Err(Error::Invocation {
                method: method.to_string(),
                message,
            }),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("Stopping hub connection");
            self.cancel.cancel();
        }
    }
}

impl Drop for SignalRConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn run_writer(
    mut ws_write: WsWrite,
    mut out_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            msg = out_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = ws_write.send(msg).await {
                        // The reader sees the same broken socket and reports it.
                        tracing::warn!("Hub write failed: {e}");
                        return;
                    }
                }
                None => break,
            },
        }
    }

    let close = HubMessage {
        kind: message_type::CLOSE,
        ..Default::default()
    };
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
        if let Ok(frame) = encode_frame(&close) {
            let _ = ws_write.send(tungstenite::Message::Text(frame.into())).await;
        }
        let _ = ws_write.close().await;
    })
    .await;
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

struct Reader {
    ws_read: WsRead,
    receiver: Arc<dyn Receiver>,
    pending: Pending,
    cancel: CancellationToken,
}

enum Flow {
    Continue,
    Closed(Option<String>),
}

impl Reader {
    fn handle_message(&self, msg: HubMessage) -> Flow {
        match msg.kind {
            message_type::INVOCATION => {
                let target = msg.target.unwrap_or_default();
                let args = msg
                    .arguments
                    .unwrap_or_default()
                    .into_iter()
                    .map(Value::from)
                    .collect();
                self.receiver.receive(&target, args);
            }
            message_type::COMPLETION => {
                let Some(id) = msg.invocation_id else {
                    tracing::debug!("Completion without invocation id");
                    return Flow::Continue;
                };
                let waiter = lock(&self.pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let outcome = match msg.error {
                            Some(error) => Err(error),
                            None => Ok(msg.result.unwrap_or(serde_json::Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => tracing::debug!(invocation_id = %id, "Completion for unknown invocation"),
                }
            }
            message_type::PING => self.receiver.receive("", Vec::new()),
            message_type::CLOSE => return Flow::Closed(msg.error),
            other => tracing::debug!(kind = other, "Ignoring hub message"),
        }
        Flow::Continue
    }

    fn handle_text(&self, text: &str) -> Flow {
        for record in split_records(text) {
            match decode_record(record) {
                Ok(msg) => {
                    if let Flow::Closed(reason) = self.handle_message(msg) {
                        return Flow::Closed(reason);
                    }
                }
                Err(e) => tracing::warn!("Failed to decode hub record: {e}"),
            }
        }
        Flow::Continue
    }
}

async fn run_reader(mut r: Reader, backlog: Vec<HubMessage>) {
    let mut reason = None;
    let mut closed = false;
    for msg in backlog {
        if let Flow::Closed(why) = r.handle_message(msg) {
            reason = why;
            closed = true;
            break;
        }
    }

    while !closed {
        let frame = tokio::select! {
            () = r.cancel.cancelled() => {
                lock(&r.pending).clear();
                return;
            }
            frame = r.ws_read.next() => frame,
        };
        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => {
                if let Flow::Closed(why) = r.handle_text(text.as_str()) {
                    tracing::info!(reason = ?why, "Server closed the hub connection");
                    reason = why;
                    closed = true;
                }
            }
            Some(Ok(tungstenite::Message::Close(frame))) => {
                tracing::info!(?frame, "WebSocket close frame");
                closed = true;
            }
            Some(Ok(_)) => {
                // Ignore binary, ping, pong frames
            }
            Some(Err(e)) => {
                tracing::warn!("WebSocket error: {e}");
                reason = Some(e.to_string());
                closed = true;
            }
            None => {
                tracing::info!("WebSocket stream ended");
                closed = true;
            }
        }
    }

    // A concurrent stop() wins: the owner already knows.
    let stopped = r.cancel.is_cancelled();
    r.cancel.cancel();
    lock(&r.pending).clear();
    if !stopped {
        r.receiver.closed(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_end_with_record_separator() {
        let frame = handshake_frame().unwrap();
        assert_eq!(frame, "{\"protocol\":\"json\",\"version\":1}\u{1e}");
    }

    #[test]
    fn invocation_serializes_camel_case() {
        let msg = HubMessage::invocation("7", "Subscribe", &[Value::from("DSE")]);
        let frame = encode_frame(&msg).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(frame.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": 1,
                "invocationId": "7",
                "target": "Subscribe",
                "arguments": ["DSE"]
            })
        );
    }

    #[test]
    fn decodes_server_invocation_and_completion() {
        let msg = decode_record(r#"{"type":1,"target":"SharePriceUpdated","arguments":["x"]}"#)
            .unwrap();
        assert_eq!(msg.kind, message_type::INVOCATION);
        assert_eq!(msg.target.as_deref(), Some("SharePriceUpdated"));
        assert_eq!(msg.arguments, Some(vec![serde_json::json!("x")]));

        let done = decode_record(r#"{"type":3,"invocationId":"2","error":"nope"}"#).unwrap();
        assert_eq!(done.kind, message_type::COMPLETION);
        assert_eq!(done.invocation_id.as_deref(), Some("2"));
        assert_eq!(done.error.as_deref(), Some("nope"));
        assert!(done.result.is_none());
    }

    #[test]
    fn splits_batched_records() {
        let text = "{\"type\":6}\u{1e}{\"type\":7,\"error\":\"bye\"}\u{1e}";
        let kinds: Vec<i32> = split_records(text)
            .map(|r| decode_record(r).unwrap().kind)
            .collect();
        assert_eq!(kinds, vec![message_type::PING, message_type::CLOSE]);
    }

    #[test]
    fn negotiate_url_keeps_query() {
        let url = build_negotiate_url("https://feed.example.com/marketHub/?tenant=a").unwrap();
        assert_eq!(
            url,
            "https://feed.example.com/marketHub/negotiate?tenant=a&negotiateVersion=1"
        );
    }

    #[test]
    fn ws_url_switches_scheme_and_adds_id() {
        assert_eq!(
            build_ws_url("https://feed.example.com/marketHub", Some("abc")).unwrap(),
            "wss://feed.example.com/marketHub?id=abc"
        );
        assert_eq!(
            build_ws_url("http://127.0.0.1:9000/hub", None).unwrap(),
            "ws://127.0.0.1:9000/hub"
        );
        assert!(build_ws_url("ftp://feed.example.com/hub", None).is_err());
    }
}
