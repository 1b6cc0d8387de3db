//! TCP transport between two peer processes.
//!
//! Each message travels as one length-prefixed frame holding a JSON
//! `WireMessage`. A background task reads frames and routes them to the
//! channel subscribers; writes are serialized through a tokio `Mutex` so
//! concurrent senders never interleave frames.

use super::protocol::{read_frame, write_frame, WireMessage};
use super::transport::{Inbound, Routes, Transport};
use crate::config::EngineConfig;
use crate::{ReworkError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport over an established TCP connection.
pub struct TcpTransport {
    writer: Mutex<OwnedWriteHalf>,
    routes: Routes,
    peer_addr: SocketAddr,
    max_payload_size: usize,
    closed_rx: watch::Receiver<bool>,
    reader_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Connect to a listening peer, bounded by the configured connect timeout.
    pub async fn connect(addr: SocketAddr, config: &EngineConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ReworkError::transport(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| ReworkError::transport(format!("Failed to connect to {}: {}", addr, e)))?;

        debug!("Transport connected to {}", addr);
        Self::from_stream(stream, config)
    }

    /// Wrap an already connected stream and start its reader task.
    pub fn from_stream(stream: TcpStream, config: &EngineConfig) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let routes = Routes::holding();
        let (closed_tx, closed_rx) = watch::channel(false);
        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            routes.clone(),
            config.max_payload_size,
            peer_addr,
            closed_tx,
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            routes,
            peer_addr,
            max_payload_size: config.max_payload_size,
            closed_rx,
            reader_task: Some(reader_task),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Wait until the peer closes the connection or a read fails.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        routes: Routes,
        max_payload_size: usize,
        peer_addr: SocketAddr,
        closed_tx: watch::Sender<bool>,
    ) {
        loop {
            let frame = match read_frame(&mut reader, max_payload_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Peer {} closed the connection", peer_addr);
                    break;
                }
                Err(e) => {
                    warn!("Transport read from {} failed: {}", peer_addr, e);
                    break;
                }
            };

            let message: WireMessage = match serde_json::from_slice(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping malformed frame from {}: {}", peer_addr, e);
                    continue;
                }
            };

            if !routes.deliver(&message.channel, message.payload) {
                debug!(
                    channel = message.channel.as_str(),
                    "No subscriber for inbound message, dropped"
                );
            }
        }

        routes.close_all();
        let _ = closed_tx.send(true);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, channel: &str, payload: Value) -> Result<()> {
        let message = WireMessage {
            channel: channel.to_string(),
            payload,
        };
        let bytes = serde_json::to_vec(&message)?;

        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes, self.max_payload_size)
            .await
            .map_err(|e| match e {
                ReworkError::PayloadTooLarge { .. } => e,
                other => ReworkError::transport(format!(
                    "Failed to send to {}: {}",
                    self.peer_addr, other
                )),
            })
    }

    fn subscribe(&self, channel: &str) -> Inbound {
        self.routes.subscribe(channel)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_task.take() {
            handle.abort();
        }
    }
}

/// Listening side: accepts peer connections and wraps them as transports.
pub struct TcpTransportListener {
    listener: TcpListener,
    config: EngineConfig,
}

impl TcpTransportListener {
    /// Bind to `host:port` (port 0 lets the OS pick).
    pub async fn bind(host: &str, port: u16, config: EngineConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| ReworkError::Config {
                message: format!("Invalid listen address {}:{}: {}", host, port, e),
            })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Transport listening on {}", listener.local_addr()?);

        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next peer.
    pub async fn accept(&self) -> Result<TcpTransport> {
        let (stream, peer_addr) = self.listener.accept().await?;
        debug!("Transport connection from {}", peer_addr);
        TcpTransport::from_stream(stream, &self.config)
    }
}
