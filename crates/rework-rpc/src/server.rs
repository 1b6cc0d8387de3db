//! Accept loop: one engine, module registry and surface synchronizer per
//! connected peer.

use crate::handler::{register_handlers, HostModule};
use rework_core::{
    EngineConfig, ModuleRegistry, RpcEngine, SurfaceSynchronizer, TcpTransport,
    TcpTransportListener, Transport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Running server; dropping it stops the accept loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting peers and wait for the accept loop to exit.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Bind the listener and start accepting peers.
///
/// Returns once the socket is bound (useful when port=0).
pub async fn start_server(
    config: EngineConfig,
    host: &str,
    port: u16,
) -> anyhow::Result<ServerHandle> {
    let listener = TcpTransportListener::bind(host, port, config.clone()).await?;
    let local_addr = listener.local_addr()?;

    info!("Server listening on {}", local_addr);

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(transport) => {
                        tokio::spawn(serve_peer(Arc::new(transport), config.clone()));
                    }
                    Err(e) => warn!("Failed to accept peer: {}", e),
                }
            }
        }
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

/// Drive one peer until its connection closes.
async fn serve_peer(transport: Arc<TcpTransport>, config: EngineConfig) {
    let peer = transport.peer_addr();
    info!("Peer connected: {}", peer);

    let shared: Arc<dyn Transport> = transport.clone();
    let engine = RpcEngine::with_shared_transport(shared, config.clone());
    let registry = Arc::new(ModuleRegistry::new(engine.clone()));
    let surfaces = SurfaceSynchronizer::new(&config);

    // Everything a peer can query is in place before the first envelope is read
    register_handlers(&registry, &surfaces);
    registry.register("host", HostModule::new(engine.clone()));
    if !registry.enable("host").await {
        error!("Host module failed to start for {}", peer);
    }
    let listener = engine.listen();

    transport.closed().await;
    info!("Peer disconnected: {}", peer);

    drop(listener);
    surfaces.cleanup().await;
    registry.teardown().await;
}
