//! Subscription bookkeeping.
//!
//! The server forgets subscriptions when a connection drops, so every
//! successful subscribe is recorded here and replayed after a reconnect.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::types::Error;
use crate::value::Value;

/// A desired subscription: the hub method to invoke and its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub method: String,
    pub args: Vec<Value>,
    pub registered_at: DateTime<Utc>,
}

/// Subscriptions keyed by exact (case-sensitive) method name. Last write wins.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: &str, args: Vec<Value>) {
        let entry = Subscription {
            method: method.to_string(),
            args,
            registered_at: Utc::now(),
        };
        let replaced = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), entry)
            .is_some();
        tracing::debug!(method, replaced, "recorded subscription");
    }

    pub fn get(&self, method: &str) -> Option<Subscription> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries, in no particular order.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Call `invoke` once per stored subscription. Errors are logged and do
    /// not stop the replay. The lock is released before `invoke` runs.
    ///
    /// Returns the number of subscriptions replayed successfully.
    pub fn replay_all<F>(&self, mut invoke: F) -> usize
    where
        F: FnMut(&Subscription) -> Result<(), Error>,
    {
        let entries = self.snapshot();
        let total = entries.len();
        let mut ok = 0;
        for entry in &entries {
            match invoke(entry) {
                Ok(()) => ok += 1,
                Err(e) => {
                    tracing::warn!(method = %entry.method, "subscription replay failed: {e}");
                }
            }
        }
        tracing::info!(replayed = ok, total, "replayed subscriptions");
        ok
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn same_method_overwrites_arguments() {
        let registry = SubscriptionRegistry::new();
        registry.record("X", vec![Value::from("a")]);
        registry.record("X", vec![Value::from("b")]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("X").unwrap().args, vec![Value::from("b")]);
    }

    #[test]
    fn method_names_are_case_sensitive() {
        let registry = SubscriptionRegistry::new();
        registry.record("Sub", vec![]);
        registry.record("sub", vec![]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn replay_invokes_each_entry_once() {
        let registry = SubscriptionRegistry::new();
        registry.record("A", vec![Value::from("1")]);
        registry.record("B", vec![]);
        registry.record("C", vec![Value::from(true)]);

        let mut seen = Vec::new();
        let replayed = registry.replay_all(|sub| {
            seen.push(sub.method.clone());
            Ok(())
        });

        assert_eq!(replayed, 3);
        assert_eq!(seen.len(), 3);
        let unique: HashSet<_> = seen.into_iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn replay_continues_after_error() {
        let registry = SubscriptionRegistry::new();
        registry.record("A", vec![]);
        registry.record("B", vec![]);

        let mut calls = 0;
        let replayed = registry.replay_all(|sub| {
            calls += 1;
            if sub.method == "A" {
                Err(Error::ConnectionClosed)
            } else {
                Ok(())
            }
        });

        assert_eq!(calls, 2);
        assert_eq!(replayed, 1);
    }

    #[test]
    fn replay_may_record_without_deadlock() {
        let registry = SubscriptionRegistry::new();
        registry.record("A", vec![]);
        registry.replay_all(|_| {
            registry.record("B", vec![]);
            Ok(())
        });
        assert_eq!(registry.len(), 2);
    }
}
