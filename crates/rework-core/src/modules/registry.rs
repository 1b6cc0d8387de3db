//! Module registry with enable/disable lifecycle.

use super::events::LocalEvents;
use crate::rpc::{Responder, RpcEngine};
use crate::{ReworkError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info, warn};

/// A named unit of functionality.
///
/// Both hooks are optional; the defaults do nothing.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Runs when the module is enabled. An error leaves it disabled.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Runs when the module is disabled. An error leaves it enabled.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Module without lifecycle hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveModule;

impl Module for PassiveModule {}

/// Lifecycle state of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

/// Status snapshot entry returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    pub enabled: bool,
}

struct ModuleRecord {
    module: Arc<dyn Module>,
    state: ModuleState,
}

#[derive(Default)]
struct Modules {
    /// Registration order.
    order: Vec<String>,
    records: HashMap<String, ModuleRecord>,
}

/// Registry of modules plus the engine and local event bus they share.
pub struct ModuleRegistry {
    engine: RpcEngine,
    events: LocalEvents,
    modules: RwLock<Modules>,
}

impl ModuleRegistry {
    /// Create a registry that owns `engine`.
    pub fn new(engine: RpcEngine) -> Self {
        Self {
            engine,
            events: LocalEvents::new(),
            modules: RwLock::new(Modules::default()),
        }
    }

    /// Register a module under a unique name. Starts disabled.
    ///
    /// Returns false and leaves the existing record alone if the name is
    /// taken.
    pub fn register(&self, name: &str, module: impl Module) -> bool {
        self.register_shared(name, Arc::new(module))
    }

    pub fn register_shared(&self, name: &str, module: Arc<dyn Module>) -> bool {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);

        if modules.records.contains_key(name) {
            warn!(
                "{}",
                ReworkError::DuplicateRegistration {
                    kind: "Module",
                    name: name.to_string()
                }
            );
            return false;
        }

        modules.order.push(name.to_string());
        modules.records.insert(
            name.to_string(),
            ModuleRecord {
                module,
                state: ModuleState::Disabled,
            },
        );

        info!("Module '{}' registered", name);
        true
    }

    /// Enable a disabled module, running its initialize hook.
    pub async fn enable(&self, name: &str) -> bool {
        let Some(module) = self.begin_transition(name, ModuleState::Disabled, ModuleState::Enabling)
        else {
            return false;
        };

        match run_hook(module.initialize()).await {
            Ok(()) => {
                self.set_state(name, ModuleState::Enabled);
                info!("Module '{}' enabled", name);
                true
            }
            Err(message) => {
                self.set_state(name, ModuleState::Disabled);
                error!("Failed to enable module '{}': {}", name, message);
                false
            }
        }
    }

    /// Disable an enabled module, running its cleanup hook.
    pub async fn disable(&self, name: &str) -> bool {
        let Some(module) = self.begin_transition(name, ModuleState::Enabled, ModuleState::Disabling)
        else {
            return false;
        };

        match run_hook(module.cleanup()).await {
            Ok(()) => {
                self.set_state(name, ModuleState::Disabled);
                info!("Module '{}' disabled", name);
                true
            }
            Err(message) => {
                self.set_state(name, ModuleState::Enabled);
                error!("Failed to disable module '{}': {}", name, message);
                false
            }
        }
    }

    /// Move `name` from `from` to the transitional state, returning its hooks.
    fn begin_transition(
        &self,
        name: &str,
        from: ModuleState,
        to: ModuleState,
    ) -> Option<Arc<dyn Module>> {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);

        let Some(record) = modules.records.get_mut(name) else {
            error!("{}", ReworkError::ModuleNotFound { name: name.to_string() });
            return None;
        };

        if record.state != from {
            warn!(
                "Module '{}' is {:?}, expected {:?}",
                name, record.state, from
            );
            return None;
        }

        record.state = to;
        Some(record.module.clone())
    }

    fn set_state(&self, name: &str, state: ModuleState) {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = modules.records.get_mut(name) {
            record.state = state;
        }
    }

    /// Snapshot of every module, keyed by name.
    pub fn get_status(&self) -> HashMap<String, ModuleStatus> {
        self.modules
            .read()
            .map(|modules| {
                modules
                    .records
                    .iter()
                    .map(|(name, record)| {
                        (
                            name.clone(),
                            ModuleStatus {
                                name: name.clone(),
                                enabled: record.state == ModuleState::Enabled,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<ModuleState> {
        self.modules
            .read()
            .ok()
            .and_then(|modules| modules.records.get(name).map(|r| r.state))
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name) == Some(ModuleState::Enabled)
    }

    /// Module names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.modules
            .read()
            .map(|modules| modules.order.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.modules.read().map(|m| m.order.len()).unwrap_or(0)
    }

    /// The engine shared by all modules.
    pub fn rpc(&self) -> &RpcEngine {
        &self.engine
    }

    pub fn events(&self) -> &LocalEvents {
        &self.events
    }

    /// Call an event on the peer with the default timeout.
    pub async fn rpc_call(&self, event: &str, data: Value) -> Result<Value> {
        self.engine.call(event, data).await
    }

    /// Register a handler for calls arriving from the peer.
    pub fn rpc_on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Value, Option<Responder>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.engine.on(event, handler);
    }

    /// Disable every enabled module in registration order, then release the
    /// engine's pending calls and handlers and the local listeners.
    pub async fn teardown(&self) {
        for name in self.names() {
            if self.is_enabled(&name) {
                self.disable(&name).await;
            }
        }

        self.engine.cleanup();
        self.events.clear();

        info!("Module registry teardown complete");
    }
}

/// Await a lifecycle hook, turning errors and panics into a message.
async fn run_hook<F>(hook: F) -> std::result::Result<(), String>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("hook panicked".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::rpc::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingModule {
        initialized: AtomicUsize,
        cleaned: AtomicUsize,
        fail_initialize: bool,
        fail_cleanup: bool,
    }

    #[async_trait]
    impl Module for Arc<CountingModule> {
        async fn initialize(&self) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            if self.fail_initialize {
                return Err(ReworkError::Other("initialize failed".into()));
            }
            Ok(())
        }

        async fn cleanup(&self) -> Result<()> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            if self.fail_cleanup {
                return Err(ReworkError::Other("cleanup failed".into()));
            }
            Ok(())
        }
    }

    fn registry() -> (ModuleRegistry, MemoryTransport) {
        let (local, peer) = MemoryTransport::pair();
        (
            ModuleRegistry::new(RpcEngine::new(local, EngineConfig::default())),
            peer,
        )
    }

    #[tokio::test]
    async fn test_register_starts_disabled() {
        let (registry, _peer) = registry();

        assert!(registry.register("auth", PassiveModule));
        assert_eq!(registry.get("auth"), Some(ModuleState::Disabled));
        assert!(!registry.is_enabled("auth"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_original() {
        let (registry, _peer) = registry();
        let original = Arc::new(CountingModule::default());

        assert!(registry.register("auth", original.clone()));
        assert!(registry.enable("auth").await);
        assert!(!registry.register("auth", PassiveModule));

        // Original record still enabled and still the one disabled
        assert!(registry.is_enabled("auth"));
        assert!(registry.disable("auth").await);
        assert_eq!(original.cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_enable_and_disable_run_hooks() {
        let (registry, _peer) = registry();
        let module = Arc::new(CountingModule::default());
        registry.register("db", module.clone());

        assert!(registry.enable("db").await);
        assert!(!registry.enable("db").await, "already enabled");
        assert_eq!(module.initialized.load(Ordering::SeqCst), 1);

        assert!(registry.disable("db").await);
        assert!(!registry.disable("db").await, "already disabled");
        assert_eq!(module.cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_module_disabled() {
        let (registry, _peer) = registry();
        let module = Arc::new(CountingModule {
            fail_initialize: true,
            ..Default::default()
        });
        registry.register("broken", module.clone());

        assert!(!registry.enable("broken").await);
        assert_eq!(registry.get("broken"), Some(ModuleState::Disabled));
        assert_eq!(module.cleaned.load(Ordering::SeqCst), 0);
        assert!(!registry.get_status()["broken"].enabled);
    }

    #[tokio::test]
    async fn test_failed_cleanup_leaves_module_enabled() {
        let (registry, _peer) = registry();
        let module = Arc::new(CountingModule {
            fail_cleanup: true,
            ..Default::default()
        });
        registry.register("sticky", module);

        assert!(registry.enable("sticky").await);
        assert!(!registry.disable("sticky").await);
        assert!(registry.is_enabled("sticky"));
    }

    #[tokio::test]
    async fn test_unknown_module() {
        let (registry, _peer) = registry();

        assert!(!registry.enable("ghost").await);
        assert!(!registry.disable("ghost").await);
        assert_eq!(registry.get("ghost"), None);
    }

    #[tokio::test]
    async fn test_get_status_snapshot() {
        let (registry, _peer) = registry();
        registry.register("a", PassiveModule);
        registry.register("b", PassiveModule);
        registry.enable("b").await;

        let status = registry.get_status();
        assert_eq!(status.len(), 2);
        assert_eq!(
            status["a"],
            ModuleStatus {
                name: "a".into(),
                enabled: false
            }
        );
        assert!(status["b"].enabled);
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_teardown_disables_in_order_and_cleans_engine() {
        let (registry, _peer) = registry();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Recording(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

        #[async_trait]
        impl Module for Recording {
            async fn cleanup(&self) -> Result<()> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
        }

        for name in ["first", "second", "third"] {
            registry.register(name, Recording(name, order.clone()));
        }
        registry.enable("first").await;
        registry.enable("third").await;
        registry.rpc_on("ping", |_data, _responder| async move { Ok(()) });
        registry.events().on("local", |_| Ok(()));

        registry.teardown().await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);
        assert!(registry.get_status().values().all(|s| !s.enabled));
        assert_eq!(registry.rpc().handler_count("ping"), 0);
        assert_eq!(registry.events().listener_count("local"), 0);
    }
}
