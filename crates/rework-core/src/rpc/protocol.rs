//! Wire envelopes and framing.
//!
//! Three named channels carry the envelopes between peers:
//!
//! ```text
//! rpc.call      {id, event, data, timestamp}
//! rpc.response  {id, response, timestamp}
//! rpc.batch     {batch: [{event, data}, ...]}
//! ```
//!
//! Stream transports wrap each message as `{channel, payload}` inside a
//! length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::{ReworkError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const CALL_CHANNEL: &str = "rpc.call";
pub const RESPONSE_CHANNEL: &str = "rpc.response";
pub const BATCH_CHANNEL: &str = "rpc.batch";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A call sent to the peer, answered by a `ResponseEnvelope` with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: u64,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: i64,
}

impl CallEnvelope {
    pub fn new(id: u64, event: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            event: event.into(),
            data,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(default)]
    pub response: Value,
    pub timestamp: i64,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Value) -> Self {
        Self {
            id,
            response,
            timestamp: now_millis(),
        }
    }
}

/// One fire-and-forget event inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub batch: Vec<BatchEntry>,
}

impl BatchEnvelope {
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Channel-tagged message carried by stream transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub channel: String,
    pub payload: Value,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(ReworkError::PayloadTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max_size: usize,
) -> Result<()> {
    if payload.len() > max_size {
        return Err(ReworkError::PayloadTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
