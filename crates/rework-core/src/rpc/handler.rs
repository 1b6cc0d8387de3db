//! Call handlers and the one-shot responder handed to them.

use super::protocol::{ResponseEnvelope, RESPONSE_CHANNEL};
use super::transport::Transport;
use crate::{ReworkError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Handler for calls and batch events arriving from the peer.
///
/// `responder` is `Some` for direct calls and `None` for batch entries.
/// Returning an error (or panicking) is logged by the engine and does not
/// stop the other handlers registered for the same event.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(&self, data: Value, responder: Option<Responder>) -> Result<()>;
}

/// Adapts an async closure to `CallHandler`.
pub(crate) struct FnHandler<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> CallHandler for FnHandler<F>
where
    F: Fn(Value, Option<Responder>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, data: Value, responder: Option<Responder>) -> Result<()> {
        (self.0)(data, responder).await
    }
}

/// Sends the response for one incoming call.
///
/// Every handler in a fan-out gets its own `Responder`, but they share one
/// flag: only the first `send` for a call reaches the wire. Later sends
/// return `AlreadyResponded` without touching the transport.
pub struct Responder {
    id: u64,
    event: String,
    transport: Arc<dyn Transport>,
    answered: Arc<AtomicBool>,
}

impl Responder {
    pub(crate) fn new(
        id: u64,
        event: &str,
        transport: Arc<dyn Transport>,
        answered: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            event: event.to_string(),
            transport,
            answered,
        }
    }

    /// Correlation id of the call being answered.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Whether any responder of this call has already sent.
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// Send the response envelope back to the caller.
    pub async fn send(self, response: Value) -> Result<()> {
        if self.answered.swap(true, Ordering::SeqCst) {
            debug!(id = self.id, event = self.event.as_str(), "Duplicate response suppressed");
            return Err(ReworkError::AlreadyResponded { id: self.id });
        }

        let envelope = ResponseEnvelope::new(self.id, response);
        self.transport
            .send(RESPONSE_CHANNEL, serde_json::to_value(&envelope)?)
            .await
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("answered", &self.is_answered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::MemoryTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_emits_response_envelope() {
        let (local, peer) = MemoryTransport::pair();
        let mut responses = peer.subscribe(RESPONSE_CHANNEL);

        let responder = Responder::new(
            9,
            "echo",
            Arc::new(local),
            Arc::new(AtomicBool::new(false)),
        );
        responder.send(json!({"v": 1})).await.unwrap();

        let envelope: ResponseEnvelope =
            serde_json::from_value(responses.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.id, 9);
        assert_eq!(envelope.response, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_second_responder_is_suppressed() {
        let (local, peer) = MemoryTransport::pair();
        let mut responses = peer.subscribe(RESPONSE_CHANNEL);
        let transport: Arc<dyn Transport> = Arc::new(local);
        let answered = Arc::new(AtomicBool::new(false));

        let first = Responder::new(4, "x", transport.clone(), answered.clone());
        let second = Responder::new(4, "x", transport, answered);

        first.send(json!(1)).await.unwrap();
        assert!(second.is_answered());
        assert!(matches!(
            second.send(json!(2)).await,
            Err(ReworkError::AlreadyResponded { id: 4 })
        ));

        assert!(responses.recv().await.is_some());
        assert!(responses.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        let handler = FnHandler(|data: Value, responder: Option<Responder>| async move {
            assert!(responder.is_none());
            if data == json!("boom") {
                return Err(ReworkError::Other("boom".into()));
            }
            Ok(())
        });

        assert!(handler.handle(json!("ok"), None).await.is_ok());
        assert!(handler.handle(json!("boom"), None).await.is_err());
    }
}
