//! Correlation engine.
//!
//! Matches asynchronous calls to their responses across a transport. Each
//! call gets the next integer id, a pending entry and a deadline timer. The
//! pending entry is removed exactly once, under the pending-set mutex, by
//! whichever comes first of:
//!
//! - a response envelope carrying the id (`handle_incoming_response`)
//! - the deadline timer (caller gets `Timeout`)
//! - `cleanup()` (caller gets `Cancelled`)
//!
//! Calls arriving from the peer fan out to every handler registered for the
//! event, in registration order.

use super::handler::{CallHandler, FnHandler, Responder};
use super::protocol::{
    BatchEntry, BatchEnvelope, CallEnvelope, ResponseEnvelope, BATCH_CHANNEL, CALL_CHANNEL,
    RESPONSE_CHANNEL,
};
use super::transport::{Inbound, Transport};
use crate::config::EngineConfig;
use crate::{ReworkError, Result};
use futures::future::{join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A call awaiting its response.
struct PendingCall {
    event: String,
    sender: oneshot::Sender<Result<Value>>,
    deadline: JoinHandle<()>,
    created_at: Instant,
}

/// Fire-and-forget events waiting for the next batch flush.
#[derive(Default)]
struct Outbox {
    entries: Vec<BatchEntry>,
    flush_scheduled: bool,
}

/// Counters kept by the engine.
#[derive(Debug, Default)]
struct EngineStats {
    calls_sent: AtomicU64,
    responses_matched: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    stale_responses: AtomicU64,
    handler_errors: AtomicU64,
    batches_sent: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub calls_sent: u64,
    pub responses_matched: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub stale_responses: u64,
    pub handler_errors: u64,
    pub batches_sent: u64,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn CallHandler>>>>,
    outbox: Mutex<Outbox>,
    /// Held from taking the outbox until the batch is on the wire.
    flush_gate: tokio::sync::Mutex<()>,
    stats: EngineStats,
}

impl EngineInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delete-if-present: the single point where a pending call leaves the set.
    fn take_pending(&self, id: u64) -> Option<PendingCall> {
        self.pending().remove(&id)
    }

    fn handlers_for(&self, event: &str) -> Vec<Arc<dyn CallHandler>> {
        self.handlers
            .read()
            .map(|handlers| handlers.get(event).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Request/response engine bound to one transport.
///
/// Cloning is cheap and every clone drives the same pending set and handler
/// table. Calls and timers require a running tokio runtime.
#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<EngineInner>,
}

impl RpcEngine {
    /// Create an engine over a transport.
    pub fn new(transport: impl Transport, config: EngineConfig) -> Self {
        Self::with_shared_transport(Arc::new(transport), config)
    }

    pub fn with_shared_transport(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                config,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                outbox: Mutex::new(Outbox::default()),
                flush_gate: tokio::sync::Mutex::new(()),
                stats: EngineStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Call an event on the peer with the configured default timeout.
    pub async fn call(&self, event: &str, data: Value) -> Result<Value> {
        self.call_with_timeout(event, data, self.inner.config.request_timeout())
            .await
    }

    /// Call an event on the peer and wait for its response.
    ///
    /// Fails with `Timeout` when no response arrives within `timeout`, and
    /// with `Cancelled` when the engine is cleaned up first.
    pub async fn call_with_timeout(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if event.is_empty() {
            return Err(ReworkError::Validation {
                field: "event".to_string(),
                message: "event name must not be empty".to_string(),
            });
        }
        if timeout.is_zero() {
            return Err(ReworkError::Validation {
                field: "timeout".to_string(),
                message: "timeout must be greater than zero".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let payload = serde_json::to_value(CallEnvelope::new(id, event, data))?;
        let (tx, rx) = oneshot::channel();

        {
            // Timer is spawned under the lock so it cannot fire before the insert
            let mut pending = self.inner.pending();
            let deadline = tokio::spawn(Self::expire_after(self.inner.clone(), id, timeout));
            pending.insert(
                id,
                PendingCall {
                    event: event.to_string(),
                    sender: tx,
                    deadline,
                    created_at: Instant::now(),
                },
            );
        }

        if let Err(e) = self.inner.transport.send(CALL_CHANNEL, payload).await {
            if let Some(call) = self.inner.take_pending(id) {
                call.deadline.abort();
            }
            warn!(id, event, "RPC call could not be sent: {}", e);
            return Err(e);
        }

        self.inner.stats.calls_sent.fetch_add(1, Ordering::Relaxed);
        debug!(id, event, timeout_ms = timeout.as_millis() as u64, "RPC call sent");

        match rx.await {
            Ok(result) => result,
            // Sender dropped without a verdict
            Err(_) => Err(ReworkError::Cancelled {
                event: event.to_string(),
            }),
        }
    }

    async fn expire_after(inner: Arc<EngineInner>, id: u64, timeout: Duration) {
        tokio::time::sleep(timeout).await;

        if let Some(call) = inner.take_pending(id) {
            inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                id,
                event = call.event.as_str(),
                timeout_ms = timeout.as_millis() as u64,
                "RPC call timeout"
            );
            let _ = call.sender.send(Err(ReworkError::Timeout {
                event: call.event,
                after: timeout,
            }));
        }
    }

    /// Register an async closure for an event.
    ///
    /// ```rust,ignore
    /// engine.on("echo", |data, responder| async move {
    ///     if let Some(responder) = responder {
    ///         responder.send(data).await?;
    ///     }
    ///     Ok(())
    /// });
    /// ```
    pub fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Value, Option<Responder>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_handler(event, Arc::new(FnHandler(handler)));
    }

    /// Register a handler object for an event. Handlers accumulate.
    pub fn on_handler(&self, event: &str, handler: Arc<dyn CallHandler>) {
        match self.inner.handlers.write() {
            Ok(mut handlers) => {
                handlers.entry(event.to_string()).or_default().push(handler);
                debug!(event, "RPC handler registered");
            }
            Err(e) => error!("Failed to acquire handlers lock: {}", e),
        }
    }

    /// Number of handlers registered for an event.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .read()
            .map(|handlers| handlers.get(event).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Fan an incoming call out to its handlers, each with a responder.
    ///
    /// Completes once every handler future has finished.
    pub async fn handle_incoming_call(&self, envelope: CallEnvelope) {
        let handlers = self.inner.handlers_for(&envelope.event);
        if handlers.is_empty() {
            warn!(
                id = envelope.id,
                "{}",
                ReworkError::HandlerNotFound {
                    event: envelope.event.clone()
                }
            );
            return;
        }

        debug!(
            id = envelope.id,
            event = envelope.event.as_str(),
            handlers = handlers.len(),
            "Dispatching RPC call"
        );

        let answered = Arc::new(AtomicBool::new(false));
        let runs: Vec<_> = handlers
            .into_iter()
            .enumerate()
            .map(|(index, handler)| {
                let responder = Responder::new(
                    envelope.id,
                    &envelope.event,
                    self.inner.transport.clone(),
                    answered.clone(),
                );
                self.guarded(
                    envelope.event.clone(),
                    index,
                    handler,
                    envelope.data.clone(),
                    Some(responder),
                )
            })
            .collect();

        join_all(runs).await;
    }

    /// Resolve the pending call matching a response.
    ///
    /// Returns false (and discards the envelope) when the id is no longer
    /// pending.
    pub fn handle_incoming_response(&self, envelope: ResponseEnvelope) -> bool {
        match self.inner.take_pending(envelope.id) {
            Some(call) => {
                call.deadline.abort();
                self.inner
                    .stats
                    .responses_matched
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = envelope.id,
                    event = call.event.as_str(),
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "RPC response matched"
                );
                // Receiver may be gone if the caller stopped waiting
                let _ = call.sender.send(Ok(envelope.response));
                true
            }
            None => {
                self.inner
                    .stats
                    .stale_responses
                    .fetch_add(1, Ordering::Relaxed);
                warn!("{}", ReworkError::StaleResponse { id: envelope.id });
                false
            }
        }
    }

    /// Fan every batch entry out to its handlers, without responders.
    pub async fn handle_incoming_batch(&self, envelope: BatchEnvelope) {
        let mut runs = Vec::new();

        for entry in envelope.batch {
            let handlers = self.inner.handlers_for(&entry.event);
            if handlers.is_empty() {
                debug!(event = entry.event.as_str(), "No handler for batch event");
                continue;
            }
            for (index, handler) in handlers.into_iter().enumerate() {
                runs.push(self.guarded(
                    entry.event.clone(),
                    index,
                    handler,
                    entry.data.clone(),
                    None,
                ));
            }
        }

        join_all(runs).await;
    }

    /// Wrap one handler invocation so its error or panic is logged and
    /// contained.
    fn guarded(
        &self,
        event: String,
        index: usize,
        handler: Arc<dyn CallHandler>,
        data: Value,
        responder: Option<Responder>,
    ) -> BoxFuture<'static, ()> {
        let inner = self.inner.clone();
        async move {
            let outcome = AssertUnwindSafe(handler.handle(data, responder))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };

            inner.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
            error!(
                handler = index,
                "{}",
                ReworkError::HandlerFailed {
                    event,
                    message: failure
                }
            );
        }
        .boxed()
    }

    /// Queue a fire-and-forget event for the peer.
    ///
    /// The first event queued after a flush schedules the next flush one
    /// batch interval later; everything queued until then leaves as a single
    /// batch envelope.
    ///
    /// Fails with `Runtime` outside a tokio runtime, since the flush could
    /// never be scheduled.
    pub fn emit(&self, event: &str, data: Value) -> Result<()> {
        if event.is_empty() {
            return Err(ReworkError::Validation {
                field: "event".to_string(),
                message: "event name must not be empty".to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ReworkError::Runtime {
            message: e.to_string(),
        })?;

        let schedule = {
            let mut outbox = self.inner.outbox();
            outbox.entries.push(BatchEntry {
                event: event.to_string(),
                data,
            });
            !std::mem::replace(&mut outbox.flush_scheduled, true)
        };

        if schedule {
            let engine = self.clone();
            let interval = self.inner.config.batch_interval();
            runtime.spawn(async move {
                tokio::time::sleep(interval).await;
                if let Err(e) = engine.flush_batch().await {
                    warn!("Batch flush failed: {}", e);
                }
            });
        }

        Ok(())
    }

    /// Send every queued event now. Returns the number of events sent.
    pub async fn flush_batch(&self) -> Result<usize> {
        // Batches leave in the order their events were taken
        let _gate = self.inner.flush_gate.lock().await;
        let entries = {
            let mut outbox = self.inner.outbox();
            outbox.flush_scheduled = false;
            std::mem::take(&mut outbox.entries)
        };

        if entries.is_empty() {
            return Ok(0);
        }

        let count = entries.len();
        let envelope = BatchEnvelope { batch: entries };
        self.inner
            .transport
            .send(BATCH_CHANNEL, serde_json::to_value(&envelope)?)
            .await?;

        self.inner.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        debug!(events = count, "Batch flushed");
        Ok(count)
    }

    /// Subscribe to the inbound channels and start dispatching envelopes.
    ///
    /// Fan-outs are driven on the listener task: each one is polled once,
    /// which starts its handlers, before the next envelope is taken, so
    /// handlers start in arrival order. Fan-outs that suspend stay in flight
    /// alongside the loop, so a handler may itself call the peer. Responses
    /// are matched inline.
    pub fn listen(&self) -> EngineListener {
        let transport = &self.inner.transport;
        let calls = transport.subscribe(CALL_CHANNEL);
        let responses = transport.subscribe(RESPONSE_CHANNEL);
        let batches = transport.subscribe(BATCH_CHANNEL);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Self::dispatch_loop(
            self.clone(),
            calls,
            responses,
            batches,
            shutdown_rx,
        ));

        EngineListener {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn dispatch_loop(
        engine: RpcEngine,
        mut calls: Inbound,
        mut responses: Inbound,
        mut batches: Inbound,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(in_flight = in_flight.len(), "RPC listener shutting down");
                    info!("RPC listener stopped");
                    return;
                }
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                message = calls.recv() => {
                    let Some(payload) = message else { break };
                    match serde_json::from_value::<CallEnvelope>(payload) {
                        Ok(envelope) => {
                            let engine = engine.clone();
                            let fan_out =
                                async move { engine.handle_incoming_call(envelope).await }.boxed();
                            start_fan_out(&mut in_flight, fan_out).await;
                        }
                        Err(e) => warn!("Dropping malformed call envelope: {}", e),
                    }
                }
                message = responses.recv() => {
                    let Some(payload) = message else { break };
                    match serde_json::from_value::<ResponseEnvelope>(payload) {
                        Ok(envelope) => {
                            engine.handle_incoming_response(envelope);
                        }
                        Err(e) => warn!("Dropping malformed response envelope: {}", e),
                    }
                }
                message = batches.recv() => {
                    let Some(payload) = message else { break };
                    match serde_json::from_value::<BatchEnvelope>(payload) {
                        Ok(envelope) => {
                            let engine = engine.clone();
                            let fan_out =
                                async move { engine.handle_incoming_batch(envelope).await }.boxed();
                            start_fan_out(&mut in_flight, fan_out).await;
                        }
                        Err(e) => warn!("Dropping malformed batch envelope: {}", e),
                    }
                }
            }
        }

        // Transport closed: let running handlers finish
        while in_flight.next().await.is_some() {}
        info!("RPC listener stopped");
    }

    /// Number of calls still waiting for a verdict.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.inner.pending().contains_key(&id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        StatsSnapshot {
            calls_sent: stats.calls_sent.load(Ordering::Relaxed),
            responses_matched: stats.responses_matched.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            stale_responses: stats.stale_responses.load(Ordering::Relaxed),
            handler_errors: stats.handler_errors.load(Ordering::Relaxed),
            batches_sent: stats.batches_sent.load(Ordering::Relaxed),
        }
    }

    /// Stop all deadline timers, reject every outstanding call with
    /// `Cancelled`, drop queued batch events and clear the handler table.
    ///
    /// Returns the number of calls that were cancelled.
    pub fn cleanup(&self) -> usize {
        let drained: Vec<(u64, PendingCall)> = self.inner.pending().drain().collect();
        let cancelled = drained.len();

        for (id, call) in drained {
            call.deadline.abort();
            self.inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(id, event = call.event.as_str(), "RPC call cancelled by cleanup");
            let _ = call.sender.send(Err(ReworkError::Cancelled { event: call.event }));
        }

        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.clear();
        }

        {
            let mut outbox = self.inner.outbox();
            outbox.entries.clear();
        }

        info!(cancelled, "RPC engine cleanup complete");
        cancelled
    }
}

impl std::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("pending", &self.pending_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Poll a fan-out once so its handlers start now; keep it if it suspended.
async fn start_fan_out(
    in_flight: &mut FuturesUnordered<BoxFuture<'static, ()>>,
    mut fan_out: BoxFuture<'static, ()>,
) {
    if futures::poll!(&mut fan_out).is_pending() {
        in_flight.push(fan_out);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Handle to a running dispatch loop. Dropping stops the loop.
pub struct EngineListener {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EngineListener {
    /// Ask the loop to stop after the envelope it is handling.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Wait until the loop exits, either from `shutdown` or because the
    /// transport closed its inbound channels.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EngineListener {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
