//! plugind runtime - local plugin runtime supervisor
//!
//! This crate provides:
//! - `EnvironmentProvisioner`: per-plugin isolated interpreter environments
//! - `Supervisor`: subprocess runner with concurrent output draining,
//!   idle watchdog and hard timeout
//! - `RuntimeHandle` / `RuntimeState`: the forward-only plugin lifecycle
//! - `RuntimeRegistry`: identity-keyed store consumed by the gateway
//! - `LocalPluginRuntime`: ties the above together and keeps the plugin
//!   process alive

mod activity;
mod environment;
mod error;
mod handle;
mod identity;
mod lifecycle;
mod local;
mod process;
mod registry;
mod state;
mod supervisor;

pub use activity::*;
pub use environment::*;
pub use error::*;
pub use handle::*;
pub use identity::*;
pub use lifecycle::*;
pub use local::*;
pub use process::*;
pub use registry::*;
pub use state::*;
pub use supervisor::*;
