//! Builtin call handlers and the host module.

use async_trait::async_trait;
use rework_core::{Module, ModuleRegistry, Result, RpcEngine, SurfaceSynchronizer};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Event pushed to the peer once the host module is enabled.
pub const HOST_READY_EVENT: &str = "host:ready";

/// Announces the host to the peer when enabled.
pub struct HostModule {
    engine: RpcEngine,
}

impl HostModule {
    pub fn new(engine: RpcEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Module for HostModule {
    async fn initialize(&self) -> Result<()> {
        self.engine.emit(
            HOST_READY_EVENT,
            json!({ "version": env!("CARGO_PKG_VERSION") }),
        )
    }

    /// Flushes queued events. The peer may already be gone, so a send
    /// failure is logged and does not keep the module enabled.
    async fn cleanup(&self) -> Result<()> {
        if let Err(e) = self.engine.flush_batch().await {
            warn!("Dropped queued events on host shutdown: {}", e);
        }
        Ok(())
    }
}

fn module_name(data: &Value) -> Option<String> {
    data.get("name").and_then(Value::as_str).map(str::to_string)
}

/// Register every builtin call handler and bind the `ui:*` push events.
pub fn register_handlers(registry: &Arc<ModuleRegistry>, surfaces: &SurfaceSynchronizer) {
    let engine = registry.rpc().clone();

    engine.on("ping", |_, responder| async move {
        if let Some(responder) = responder {
            responder.send(json!("pong")).await?;
        }
        Ok(())
    });

    engine.on("echo", |data, responder| async move {
        if let Some(responder) = responder {
            responder.send(data).await?;
        }
        Ok(())
    });

    let reg = registry.clone();
    engine.on("modules:status", move |_, responder| {
        let reg = reg.clone();
        async move {
            if let Some(responder) = responder {
                responder.send(serde_json::to_value(reg.get_status())?).await?;
            }
            Ok(())
        }
    });

    let reg = registry.clone();
    engine.on("modules:enable", move |data, responder| {
        let reg = reg.clone();
        async move {
            let ok = match module_name(&data) {
                Some(name) => reg.enable(&name).await,
                None => false,
            };
            if let Some(responder) = responder {
                responder.send(json!({ "ok": ok })).await?;
            }
            Ok(())
        }
    });

    let reg = registry.clone();
    engine.on("modules:disable", move |data, responder| {
        let reg = reg.clone();
        async move {
            let ok = match module_name(&data) {
                Some(name) => reg.disable(&name).await,
                None => false,
            };
            if let Some(responder) = responder {
                responder.send(json!({ "ok": ok })).await?;
            }
            Ok(())
        }
    });

    let stats_engine = engine.clone();
    engine.on("rpc:stats", move |_, responder| {
        let stats = stats_engine.stats();
        async move {
            if let Some(responder) = responder {
                responder.send(serde_json::to_value(stats)?).await?;
            }
            Ok(())
        }
    });

    let sync = surfaces.clone();
    engine.on("ui:status", move |_, responder| {
        let status = sync.get_status();
        async move {
            if let Some(responder) = responder {
                responder.send(serde_json::to_value(status)?).await?;
            }
            Ok(())
        }
    });

    surfaces.bind(&engine);
    debug!("Builtin handlers registered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rework_core::rpc::Inbound;
    use rework_core::{EngineConfig, MemoryTransport, ReworkError, SurfaceKind, Transport};
    use std::time::Duration;

    fn peer_pair() -> (Arc<ModuleRegistry>, SurfaceSynchronizer, RpcEngine) {
        let (host_side, ui_side) = MemoryTransport::pair();
        let config = EngineConfig::default().with_request_timeout(Duration::from_millis(500));
        let host = RpcEngine::new(host_side, config.clone());
        let registry = Arc::new(ModuleRegistry::new(host.clone()));
        let surfaces = SurfaceSynchronizer::new(&config);
        register_handlers(&registry, &surfaces);
        let ui = RpcEngine::new(ui_side, config);
        (registry, surfaces, ui)
    }

    #[tokio::test]
    async fn test_ping_and_echo() {
        let (registry, _surfaces, ui) = peer_pair();
        let _host = registry.rpc().listen();
        let _ui = ui.listen();

        assert_eq!(ui.call("ping", Value::Null).await.unwrap(), json!("pong"));
        assert_eq!(
            ui.call("echo", json!({"n": [1, 2]})).await.unwrap(),
            json!({"n": [1, 2]})
        );
    }

    #[tokio::test]
    async fn test_module_handlers() {
        let (registry, _surfaces, ui) = peer_pair();
        registry.register("audio", rework_core::PassiveModule);
        let _host = registry.rpc().listen();
        let _ui = ui.listen();

        let enabled = ui.call("modules:enable", json!({"name": "audio"})).await.unwrap();
        assert_eq!(enabled, json!({"ok": true}));

        let status = ui.call("modules:status", Value::Null).await.unwrap();
        assert_eq!(status["audio"]["enabled"], json!(true));

        let missing = ui.call("modules:disable", json!({"name": "nope"})).await.unwrap();
        assert_eq!(missing, json!({"ok": false}));
    }

    #[tokio::test]
    async fn test_ui_push_and_status() {
        let (registry, surfaces, ui) = peer_pair();
        surfaces.register("hud", SurfaceKind::Vue, Default::default());
        let _host = registry.rpc().listen();
        let _ui = ui.listen();

        let shown = ui.call("ui:show", json!({"name": "hud"})).await.unwrap();
        assert_eq!(shown, json!({"ok": true}));

        let status = ui.call("ui:status", Value::Null).await.unwrap();
        assert_eq!(status["hud"]["visible"], json!(true));
        assert_eq!(status["hud"]["kind"], json!("vue"));
    }

    #[tokio::test]
    async fn test_host_module_announces_itself() {
        let (registry, _surfaces, ui) = peer_pair();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        ui.on(HOST_READY_EVENT, move |data, _| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(data);
            }
            async { Ok(()) }
        });
        let _ui = ui.listen();

        registry.register("host", HostModule::new(registry.rpc().clone()));
        assert!(registry.enable("host").await);

        let data = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["version"], json!(env!("CARGO_PKG_VERSION")));
    }

    /// Transport to a peer that has already disconnected.
    struct DisconnectedTransport;

    #[async_trait]
    impl Transport for DisconnectedTransport {
        async fn send(&self, _channel: &str, _payload: Value) -> Result<()> {
            Err(ReworkError::transport("connection reset"))
        }

        fn subscribe(&self, _channel: &str) -> Inbound {
            tokio::sync::mpsc::unbounded_channel().1
        }
    }

    #[tokio::test]
    async fn test_host_module_disables_after_peer_is_gone() {
        let engine = RpcEngine::new(DisconnectedTransport, EngineConfig::default());
        let registry = ModuleRegistry::new(engine.clone());
        registry.register("host", HostModule::new(engine));

        // Enabling queues host:ready; the flush can never reach the peer
        assert!(registry.enable("host").await);
        assert!(registry.disable("host").await);
        assert!(!registry.is_enabled("host"));
    }
}
