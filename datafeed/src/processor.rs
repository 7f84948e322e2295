//! Consumer for the hub message channel.

use hub_client::{Decoded, InboundMessage, KnownEvent, Payload, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fields shown in a price update log line.
const PREVIEW_FIELDS: usize = 3;
const PREVIEW_CHARS: usize = 120;

/// What the processor made of one message.
#[derive(Debug, PartialEq)]
pub enum Summary {
    Price { count: usize, preview: Vec<String> },
    MarketStatus { status: String },
    Other { method: String, args: usize },
}

pub fn summarize(msg: &InboundMessage) -> Summary {
    match KnownEvent::from_method(&msg.method) {
        Some(KnownEvent::PriceUpdate) => match &msg.decoded {
            Some(Decoded::Fields(fields)) => Summary::Price {
                count: fields.len(),
                preview: fields.iter().take(PREVIEW_FIELDS).cloned().collect(),
            },
            Some(Decoded::Structured(json)) => Summary::Price {
                count: 1,
                preview: vec![truncate(&json.to_string())],
            },
            Some(Decoded::Text(text)) => Summary::Price {
                count: 1,
                preview: vec![truncate(text)],
            },
            None => other(msg),
        },
        Some(KnownEvent::MarketStatus) => {
            let status = match &msg.decoded {
                Some(Decoded::Fields(fields)) => fields.join("~"),
                Some(Decoded::Structured(json)) => json.to_string(),
                Some(Decoded::Text(text)) => text.clone(),
                None => payload_text(&msg.data),
            };
            Summary::MarketStatus {
                status: truncate(&status),
            }
        }
        None => other(msg),
    }
}

fn other(msg: &InboundMessage) -> Summary {
    let args = match &msg.data {
        Payload::Args(args) => args.len(),
        Payload::Single(_) => 1,
    };
    Summary::Other {
        method: msg.method.clone(),
        args,
    }
}

fn payload_text(data: &Payload) -> String {
    match data {
        Payload::Single(value) => value.coerce_to_text(),
        Payload::Args(args) => args
            .iter()
            .map(Value::coerce_to_text)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn truncate(s: &str) -> String {
    hub_client::decoder::truncate(s, PREVIEW_CHARS)
}

/// Drain `rx` until the channel closes or `cancel` fires. Returns the number
/// of messages processed.
pub async fn run(mut rx: mpsc::Receiver<InboundMessage>, cancel: CancellationToken) -> u64 {
    info!("message processor started");
    let mut processed = 0u64;
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        processed += 1;
        match summarize(&msg) {
            Summary::Price { count, preview } => {
                info!(method = %msg.method, fields = count, first = ?preview, "price update");
            }
            Summary::MarketStatus { status } => {
                info!(method = %msg.method, %status, "market status update");
            }
            Summary::Other { method, args } => {
                debug!(%method, args, "unhandled hub message");
            }
        }
    }
    info!(processed, "message processor stopped");
    processed
}
