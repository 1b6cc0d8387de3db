//! In-process event bus.
//!
//! Listeners run synchronously in registration order. A listener that
//! returns an error or panics is logged and skipped; the rest still run.

use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

type Listener = Arc<dyn Fn(&[Value]) -> Result<()> + Send + Sync>;

/// Local `on`/`emit` fan-out. Nothing here crosses the transport.
#[derive(Clone, Default)]
pub struct LocalEvents {
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
}

impl LocalEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners for one event accumulate.
    pub fn on<F>(&self, event: &str, listener: F)
    where
        F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Invoke every listener of `event` with `args`.
    ///
    /// Returns how many listeners completed without error.
    pub fn emit(&self, event: &str, args: &[Value]) -> usize {
        // Snapshot so listeners may register further listeners
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .map(|map| map.get(event).cloned().unwrap_or_default())
            .unwrap_or_default();

        if listeners.is_empty() {
            debug!(event, "No local listeners");
            return 0;
        }

        let mut succeeded = 0;
        for listener in listeners {
            match std::panic::catch_unwind(AssertUnwindSafe(|| listener(args))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => error!(event, "Error in event listener: {}", e),
                Err(_) => error!(event, "Event listener panicked"),
            }
        }
        succeeded
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .map(|map| map.get(event).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl std::fmt::Debug for LocalEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self.listeners.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("LocalEvents").field("events", &events).finish()
    }
}
