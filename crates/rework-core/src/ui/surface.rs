//! Surface records and hooks.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Front-end framework that renders a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    Vue,
    React,
}

impl SurfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceKind::Vue => "vue",
            SurfaceKind::React => "react",
        }
    }
}

impl std::fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional callbacks into the component behind a surface.
#[async_trait]
pub trait SurfaceHooks: Send + Sync + 'static {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Receives each update before it is merged into the surface state. An
    /// error rejects the update.
    fn set_data(&self, _data: &Map<String, Value>) -> Result<()> {
        Ok(())
    }
}

/// Status entry returned by `SurfaceSynchronizer::get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceStatus {
    pub kind: SurfaceKind,
    pub visible: bool,
    pub initialized: bool,
}

/// Surfaces painted by one render flush, in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFrame {
    pub surfaces: Vec<String>,
}

pub(crate) struct Surface {
    pub(crate) kind: SurfaceKind,
    pub(crate) props: Map<String, Value>,
    pub(crate) state: Map<String, Value>,
    pub(crate) visible: bool,
    pub(crate) initialized: bool,
    pub(crate) hooks: Option<Arc<dyn SurfaceHooks>>,
    pub(crate) renders: u64,
}

impl Surface {
    pub(crate) fn new(
        kind: SurfaceKind,
        props: Map<String, Value>,
        hooks: Option<Arc<dyn SurfaceHooks>>,
    ) -> Self {
        Self {
            kind,
            props,
            state: Map::new(),
            visible: false,
            initialized: false,
            hooks,
            renders: 0,
        }
    }

    pub(crate) fn status(&self) -> SurfaceStatus {
        SurfaceStatus {
            kind: self.kind,
            visible: self.visible,
            initialized: self.initialized,
        }
    }
}
