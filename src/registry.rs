//! Registry of outbound senders, one per destination.
//!
//! Owned by the consumer-side service and shared with every orchestrator that schedules
//! retries. Entries are created on first registration and kept for the lifetime of the
//! registry; there is no eviction because destinations come from configuration.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::broker::{BrokerClient, MessageSender};
use tracing::debug;

/// Trait for sender registries (injectable into the orchestrator).
pub trait SenderRegistry: Send + Sync + std::fmt::Debug {
    /// Open and store a sender for `destination` unless one already exists.
    ///
    /// Idempotent: repeated calls for the same name open exactly one sender.
    fn register(&self, destination: &str);
    /// Get the sender for `destination`, if registered.
    fn get(&self, destination: &str) -> Option<Arc<dyn MessageSender>>;
    /// Registered destination names, sorted.
    fn destinations(&self) -> Vec<String>;
}

/// In-memory implementation backed by an RwLock.
///
/// Creation happens under the write lock so concurrent registrations of one name still open a
/// single sender.
#[derive(Clone, Debug)]
pub struct InMemorySenderRegistry {
    client: Arc<dyn BrokerClient>,
    inner: Arc<RwLock<HashMap<String, Arc<dyn MessageSender>>>>,
}

impl InMemorySenderRegistry {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self { client, inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SenderRegistry for InMemorySenderRegistry {
    fn register(&self, destination: &str) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(destination) {
            return;
        }
        let sender = self.client.create_sender(destination);
        debug!(target: "requeue::registry", destination = %destination, "sender registered");
        map.insert(destination.to_string(), sender);
    }

    fn get(&self, destination: &str) -> Option<Arc<dyn MessageSender>> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(destination).cloned()
    }

    fn destinations(&self) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}
