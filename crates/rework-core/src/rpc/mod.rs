//! Request/response messaging between two peer processes.
//!
//! # Architecture
//!
//! - **Protocol**: call, response and batch envelopes plus stream framing
//! - **Transport**: fire-and-forget named channels (`MemoryTransport`, `TcpTransport`)
//! - **Engine**: correlation ids, pending calls, deadlines and handler fan-out

pub mod engine;
pub mod handler;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use engine::{EngineListener, RpcEngine, StatsSnapshot};
pub use handler::{CallHandler, Responder};
pub use protocol::{
    BatchEntry, BatchEnvelope, CallEnvelope, ResponseEnvelope, BATCH_CHANNEL, CALL_CHANNEL,
    RESPONSE_CHANNEL,
};
pub use tcp::{TcpTransport, TcpTransportListener};
pub use transport::{Inbound, MemoryTransport, Transport};
