use crate::error::Result;
use crate::handle::RuntimeHandle;
use async_trait::async_trait;
use std::sync::Arc;

/// Lifecycle shared by every runtime backend.
///
/// The local backend provisions an environment and supervises a child
/// process; remote backends implement the same steps against their own
/// transport and report through the same [`RuntimeHandle`].
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    fn handle(&self) -> &Arc<RuntimeHandle>;

    /// Bring the handle from `Uninitialized` to `Ready` or `Failed`.
    async fn init_environment(&self) -> Result<()>;

    /// Start serving. Requires `Ready`.
    async fn start(&self) -> Result<()>;

    /// Stop serving and move to `Stopped`.
    async fn stop(&self);
}
