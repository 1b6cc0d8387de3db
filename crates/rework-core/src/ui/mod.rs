//! UI surface synchronization.
//!
//! Surfaces are named Vue or React components whose data and visibility are
//! driven by `ui:*` push events from the peer. Renders are coalesced per
//! render delay and published as `RenderFrame`s.

pub mod surface;
pub mod synchronizer;

pub use surface::{RenderFrame, SurfaceHooks, SurfaceKind, SurfaceStatus};
pub use synchronizer::{SurfaceSynchronizer, UI_HIDE_EVENT, UI_SHOW_EVENT, UI_UPDATE_EVENT};
