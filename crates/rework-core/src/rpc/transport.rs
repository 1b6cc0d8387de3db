//! Transport adapters.
//!
//! A transport is a one-way, fire-and-forget named-message channel to exactly
//! one peer. Sending never waits for the peer; receiving happens through a
//! per-channel stream obtained from `subscribe`. Messages on one channel are
//! delivered in order; nothing is promised across channels.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receive side of one subscribed channel.
pub type Inbound = mpsc::UnboundedReceiver<Value>;

/// Named-message channel to a single peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a payload on a named channel. Delivery is not confirmed.
    async fn send(&self, channel: &str, payload: Value) -> Result<()>;

    /// Subscribe to a named channel.
    ///
    /// Subscribing again to the same channel replaces the previous stream,
    /// which then ends.
    fn subscribe(&self, channel: &str) -> Inbound;
}

/// Messages kept per channel while nobody is subscribed to it.
const MAX_HELD_PER_CHANNEL: usize = 256;

#[derive(Debug, Default)]
struct RouteTable {
    subscribers: HashMap<String, mpsc::UnboundedSender<Value>>,
    /// Only populated when the table holds unrouted messages.
    held: HashMap<String, Vec<Value>>,
    hold_unrouted: bool,
}

/// Channel name to subscriber table shared by the transports.
#[derive(Debug, Clone, Default)]
pub(crate) struct Routes {
    inner: Arc<Mutex<RouteTable>>,
}

impl Routes {
    /// Table that keeps messages for unsubscribed channels and replays them
    /// to the first subscriber. Used by network transports, where the peer
    /// may start talking before the local engine is listening.
    pub(crate) fn holding() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RouteTable {
                hold_unrouted: true,
                ..Default::default()
            })),
        }
    }

    fn table(&self) -> MutexGuard<'_, RouteTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self, channel: &str) -> Inbound {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.table();
        if let Some(held) = table.held.remove(channel) {
            debug!(channel, replayed = held.len(), "Replaying held messages");
            for payload in held {
                let _ = tx.send(payload);
            }
        }
        table.subscribers.insert(channel.to_string(), tx);
        debug!(channel, "Transport channel subscribed");
        rx
    }

    /// Hand a payload to the channel subscriber. Returns false when the
    /// payload was dropped.
    pub(crate) fn deliver(&self, channel: &str, payload: Value) -> bool {
        let mut table = self.table();

        if let Some(tx) = table.subscribers.get(channel) {
            return tx.send(payload).is_ok();
        }
        if !table.hold_unrouted {
            return false;
        }

        let held = table.held.entry(channel.to_string()).or_default();
        if held.len() >= MAX_HELD_PER_CHANNEL {
            warn!(channel, "Held message limit reached, dropping");
            return false;
        }
        held.push(payload);
        true
    }

    /// Drop every subscriber and held message, ending their streams.
    pub(crate) fn close_all(&self) {
        let mut table = self.table();
        table.subscribers.clear();
        table.held.clear();
    }
}

/// In-process transport. `pair()` returns two linked endpoints; whatever one
/// sends is delivered to the other's subscribers.
#[derive(Debug)]
pub struct MemoryTransport {
    local: Routes,
    peer: Routes,
}

impl MemoryTransport {
    /// Create two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let a = Routes::default();
        let b = Routes::default();
        (
            Self {
                local: a.clone(),
                peer: b.clone(),
            },
            Self { local: b, peer: a },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, channel: &str, payload: Value) -> Result<()> {
        if !self.peer.deliver(channel, payload) {
            debug!(channel, "No peer subscriber, message dropped");
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Inbound {
        self.local.subscribe(channel)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.local.close_all();
    }
}
