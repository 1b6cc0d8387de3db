//! Module lifecycle management.
//!
//! A `ModuleRegistry` owns the process's `RpcEngine` and a `LocalEvents` bus,
//! and tracks named modules through `register` / `enable` / `disable` /
//! `teardown`. Lookups and duplicate names are expected failures and are
//! reported as `false`, never as errors.

pub mod events;
pub mod registry;

pub use events::LocalEvents;
pub use registry::{Module, ModuleRegistry, ModuleState, ModuleStatus, PassiveModule};
