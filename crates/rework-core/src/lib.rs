//! ReWork Core - request/response messaging between a native host and a
//! browser-side UI.
//!
//! The crate has three layers:
//!
//! - [`rpc`]: the correlation engine. Outgoing calls get a numeric id and a
//!   deadline, incoming responses are matched back to their caller, incoming
//!   calls fan out to registered handlers, and fire-and-forget events are
//!   batched.
//! - [`modules`]: a registry of named modules with enable/disable lifecycle
//!   hooks and a local event bus.
//! - [`ui`]: a synchronizer that applies `ui:*` push events to named surfaces
//!   and coalesces their renders.
//!
//! # Example
//!
//! ```rust,ignore
//! use rework_core::{EngineConfig, MemoryTransport, RpcEngine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> rework_core::Result<()> {
//!     let (host_side, ui_side) = MemoryTransport::pair();
//!     let host = RpcEngine::new(host_side, EngineConfig::default());
//!     let ui = RpcEngine::new(ui_side, EngineConfig::default());
//!
//!     ui.on("echo", |data, responder| async move {
//!         if let Some(responder) = responder {
//!             responder.send(data).await?;
//!         }
//!         Ok(())
//!     });
//!     let _host_listener = host.listen();
//!     let _ui_listener = ui.listen();
//!
//!     let reply = host.call("echo", json!({"hello": "world"})).await?;
//!     assert_eq!(reply, json!({"hello": "world"}));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod modules;
pub mod rpc;
pub mod ui;

pub use config::{EngineConfig, RpcConfig, UiConfig};
pub use error::{ReworkError, Result};
pub use modules::{LocalEvents, Module, ModuleRegistry, ModuleState, ModuleStatus, PassiveModule};
pub use rpc::{
    CallHandler, EngineListener, MemoryTransport, Responder, RpcEngine, StatsSnapshot,
    TcpTransport, TcpTransportListener, Transport,
};
pub use ui::{RenderFrame, SurfaceHooks, SurfaceKind, SurfaceStatus, SurfaceSynchronizer};
