//! Maps push events from the peer onto named surfaces.
//!
//! Updates are merged into a surface's state immediately, but painting is
//! deferred: the first update after a flush schedules the next flush one
//! render delay later, and every update queued before it lands in the same
//! frame.

use super::surface::{RenderFrame, Surface, SurfaceHooks, SurfaceKind, SurfaceStatus};
use crate::config::{EngineConfig, UiConfig};
use crate::rpc::RpcEngine;
use crate::{ReworkError, Result};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub const UI_UPDATE_EVENT: &str = "ui:update";
pub const UI_SHOW_EVENT: &str = "ui:show";
pub const UI_HIDE_EVENT: &str = "ui:hide";

/// Payload of the `ui:*` push events.
#[derive(Debug, Deserialize)]
struct SurfacePush {
    name: String,
    #[serde(default)]
    data: Map<String, Value>,
}

#[derive(Default)]
struct RenderQueue {
    names: Vec<String>,
    flush_scheduled: bool,
}

struct SyncInner {
    surfaces: RwLock<HashMap<String, Surface>>,
    queue: Mutex<RenderQueue>,
    render_delay: Duration,
    frames: broadcast::Sender<RenderFrame>,
}

/// Registry of UI surfaces driven by the peer.
#[derive(Clone)]
pub struct SurfaceSynchronizer {
    inner: Arc<SyncInner>,
}

impl SurfaceSynchronizer {
    pub fn new(config: &EngineConfig) -> Self {
        let (frames, _) = broadcast::channel(UiConfig::RENDER_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SyncInner {
                surfaces: RwLock::new(HashMap::new()),
                queue: Mutex::new(RenderQueue::default()),
                render_delay: config.render_delay(),
                frames,
            }),
        }
    }

    /// Register a hidden surface. Returns false if the name is taken.
    pub fn register(&self, name: &str, kind: SurfaceKind, props: Map<String, Value>) -> bool {
        self.insert(name, Surface::new(kind, props, None))
    }

    pub fn register_with_hooks(
        &self,
        name: &str,
        kind: SurfaceKind,
        props: Map<String, Value>,
        hooks: Arc<dyn SurfaceHooks>,
    ) -> bool {
        self.insert(name, Surface::new(kind, props, Some(hooks)))
    }

    fn insert(&self, name: &str, surface: Surface) -> bool {
        let mut surfaces = self.surfaces_mut();
        if surfaces.contains_key(name) {
            warn!(
                "{}",
                ReworkError::DuplicateRegistration {
                    kind: "Surface",
                    name: name.to_string()
                }
            );
            return false;
        }

        info!("Surface '{}' registered ({})", name, surface.kind);
        surfaces.insert(name.to_string(), surface);
        true
    }

    /// Run the surface's initialize hook and mark it initialized.
    pub async fn initialize(&self, name: &str) -> bool {
        let Some(hooks) = self.hooks_of(name) else {
            return false;
        };

        if let Some(hooks) = hooks {
            if let Err(message) = run_hook(hooks.initialize()).await {
                error!("Failed to initialize surface '{}': {}", name, message);
                return false;
            }
        }

        match self.surfaces_mut().get_mut(name) {
            Some(surface) => {
                surface.initialized = true;
                debug!("Surface '{}' initialized", name);
                true
            }
            // Destroyed while the hook ran
            None => false,
        }
    }

    /// Merge `data` into the surface state and queue a render.
    ///
    /// Outside a tokio runtime the render is flushed immediately.
    pub fn update_data(&self, name: &str, data: Map<String, Value>) -> bool {
        {
            let mut surfaces = self.surfaces_mut();
            let Some(surface) = surfaces.get_mut(name) else {
                error!("{}", ReworkError::SurfaceNotFound { name: name.to_string() });
                return false;
            };

            if let Some(hooks) = &surface.hooks {
                if let Err(e) = hooks.set_data(&data) {
                    error!("Update failed for surface '{}': {}", name, e);
                    return false;
                }
            }

            surface.state.extend(data);
        }

        self.enqueue_render(name);
        true
    }

    pub fn show(&self, name: &str) -> bool {
        self.set_visible(name, true)
    }

    pub fn hide(&self, name: &str) -> bool {
        self.set_visible(name, false)
    }

    fn set_visible(&self, name: &str, visible: bool) -> bool {
        match self.surfaces_mut().get_mut(name) {
            Some(surface) => {
                surface.visible = visible;
                debug!(visible, "Surface '{}' visibility changed", name);
                true
            }
            None => {
                error!("{}", ReworkError::SurfaceNotFound { name: name.to_string() });
                false
            }
        }
    }

    /// Run the cleanup hook and remove the surface. A failing hook keeps the
    /// record.
    pub async fn destroy(&self, name: &str) -> bool {
        let Some(hooks) = self.hooks_of(name) else {
            return false;
        };

        if let Some(hooks) = hooks {
            if let Err(message) = run_hook(hooks.cleanup()).await {
                error!("Failed to destroy surface '{}': {}", name, message);
                return false;
            }
        }

        let removed = self.surfaces_mut().remove(name).is_some();
        if removed {
            info!("Surface '{}' destroyed", name);
        }
        removed
    }

    /// Destroy every surface.
    pub async fn cleanup(&self) {
        let names: Vec<String> = self
            .inner
            .surfaces
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();

        for name in names {
            self.destroy(&name).await;
        }

        info!("Surface synchronizer cleanup complete");
    }

    /// `None` when the surface does not exist, else its hooks (if any).
    fn hooks_of(&self, name: &str) -> Option<Option<Arc<dyn SurfaceHooks>>> {
        let surfaces = self
            .inner
            .surfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        match surfaces.get(name) {
            Some(surface) => Some(surface.hooks.clone()),
            None => {
                error!("{}", ReworkError::SurfaceNotFound { name: name.to_string() });
                None
            }
        }
    }

    fn enqueue_render(&self, name: &str) {
        let schedule = {
            let mut queue = self.queue();
            queue.names.push(name.to_string());
            !std::mem::replace(&mut queue.flush_scheduled, true)
        };

        if !schedule {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let sync = self.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(sync.inner.render_delay).await;
                    sync.flush_renders();
                });
            }
            Err(_) => {
                // No timer outside a runtime: paint right away
                debug!("No async runtime, flushing renders immediately");
                self.flush_renders();
            }
        }
    }

    /// Paint every queued visible surface once and publish the frame.
    pub fn flush_renders(&self) -> RenderFrame {
        let queued = {
            let mut queue = self.queue();
            queue.flush_scheduled = false;
            std::mem::take(&mut queue.names)
        };

        let mut painted = Vec::new();
        {
            let mut surfaces = self.surfaces_mut();
            let mut seen = HashSet::new();
            for name in queued {
                if !seen.insert(name.clone()) {
                    continue;
                }
                if let Some(surface) = surfaces.get_mut(&name) {
                    if surface.visible {
                        surface.renders += 1;
                        debug!("Rendering surface: {}", name);
                        painted.push(name);
                    }
                }
            }
        }

        let frame = RenderFrame { surfaces: painted };
        if !frame.surfaces.is_empty() {
            // No subscribers is fine
            let _ = self.inner.frames.send(frame.clone());
        }
        frame
    }

    /// Receive every non-empty render frame.
    pub fn subscribe_renders(&self) -> broadcast::Receiver<RenderFrame> {
        self.inner.frames.subscribe()
    }

    pub fn get_status(&self) -> HashMap<String, SurfaceStatus> {
        self.inner
            .surfaces
            .read()
            .map(|surfaces| {
                surfaces
                    .iter()
                    .map(|(name, surface)| (name.clone(), surface.status()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current merged state of a surface.
    pub fn state(&self, name: &str) -> Option<Map<String, Value>> {
        self.inner
            .surfaces
            .read()
            .ok()
            .and_then(|s| s.get(name).map(|surface| surface.state.clone()))
    }

    pub fn props(&self, name: &str) -> Option<Map<String, Value>> {
        self.inner
            .surfaces
            .read()
            .ok()
            .and_then(|s| s.get(name).map(|surface| surface.props.clone()))
    }

    /// How many frames have painted this surface.
    pub fn render_count(&self, name: &str) -> Option<u64> {
        self.inner
            .surfaces
            .read()
            .ok()
            .and_then(|s| s.get(name).map(|surface| surface.renders))
    }

    /// Register the `ui:update`, `ui:show` and `ui:hide` push handlers.
    ///
    /// Pushes may arrive as direct calls (answered with `{"ok": bool}`) or
    /// inside batches.
    pub fn bind(&self, engine: &RpcEngine) {
        self.bind_push(engine, UI_UPDATE_EVENT, |sync, push| {
            sync.update_data(&push.name, push.data)
        });
        self.bind_push(engine, UI_SHOW_EVENT, |sync, push| sync.show(&push.name));
        self.bind_push(engine, UI_HIDE_EVENT, |sync, push| sync.hide(&push.name));
    }

    fn bind_push<F>(&self, engine: &RpcEngine, event: &'static str, apply: F)
    where
        F: Fn(&SurfaceSynchronizer, SurfacePush) -> bool + Copy + Send + Sync + 'static,
    {
        let sync = self.clone();
        engine.on(event, move |data, responder| {
            let sync = sync.clone();
            async move {
                let push: SurfacePush = serde_json::from_value(data)?;
                let ok = apply(&sync, push);
                if let Some(responder) = responder {
                    responder.send(json!({ "ok": ok })).await?;
                }
                Ok(())
            }
        });
    }

    fn surfaces_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Surface>> {
        self.inner
            .surfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, RenderQueue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_hook<F>(hook: F) -> std::result::Result<(), String>
where
    F: std::future::Future<Output = Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("hook panicked".to_string()),
    }
}
