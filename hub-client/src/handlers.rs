//! Custom per-method handlers, keyed by case-insensitive method name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::InboundMessage;

/// Callback invoked synchronously on the transport's reader task. Keep it short;
/// hand heavy work off to another task.
pub type Handler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Lookup key for a method name. Method names may contain any character
/// (`MarketStatusUpdated^^DSE~`), so only case is folded.
pub fn normalize_method(method: &str) -> String {
    method.to_lowercase()
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any earlier handler for the
    /// same normalized name.
    pub fn register(&self, method: &str, handler: Handler) {
        let key = normalize_method(method);
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler)
            .is_some();
        tracing::debug!(method, replaced, "registered custom handler");
    }

    /// Look up by an already-normalized name.
    pub fn get(&self, normalized: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(normalized)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::Payload;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = counter.clone();
        Arc::new(move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register("MarketStatusUpdated^^DSE~", counting_handler(&hits));

        let handler = registry
            .get(&normalize_method("marketstatusupdated^^dse~"))
            .unwrap();
        handler(InboundMessage::new("x", Payload::Args(vec![])));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register("Error", counting_handler(&first));
        registry.register("ERROR", counting_handler(&second));
        assert_eq!(registry.len(), 1);

        let handler = registry.get("error").unwrap();
        handler(InboundMessage::new("Error", Payload::Args(vec![])));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_method_has_no_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("nothing").is_none());
    }
}
