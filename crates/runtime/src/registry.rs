//! Registry of active runtime handles, keyed by plugin identity

use crate::error::{Result, RuntimeError};
use crate::handle::{RuntimeHandle, RuntimeSnapshot};
use crate::identity::PluginIdentity;
use crate::state::RuntimeState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RuntimeRegistry {
    runtimes: DashMap<PluginIdentity, Arc<RuntimeHandle>>,
}

impl RuntimeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runtimes: DashMap::new(),
        })
    }

    /// Create and publish a fresh handle for `identity`.
    ///
    /// Allowed when no handle exists or the existing one is terminal, in
    /// which case it is replaced. Anything still alive is left alone.
    pub fn begin(
        &self,
        identity: PluginIdentity,
        working_path: impl Into<PathBuf>,
    ) -> Result<Arc<RuntimeHandle>> {
        match self.runtimes.entry(identity.clone()) {
            Entry::Occupied(mut existing) => {
                let state = existing.get().state();
                if !state.is_terminal() {
                    return Err(RuntimeError::AlreadyProvisioning(identity));
                }
                debug!("Replacing {} handle for {}", state.name(), identity);
                let handle = RuntimeHandle::new(identity, working_path);
                existing.insert(handle.clone());
                Ok(handle)
            }
            Entry::Vacant(slot) => {
                let handle = RuntimeHandle::new(identity, working_path);
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn lookup(&self, identity: &PluginIdentity) -> Option<Arc<RuntimeHandle>> {
        self.runtimes.get(identity).map(|entry| entry.value().clone())
    }

    /// Handle for `identity` only if it is `Ready`.
    pub fn lookup_ready(&self, identity: &PluginIdentity) -> Result<Arc<RuntimeHandle>> {
        let handle = self
            .lookup(identity)
            .ok_or_else(|| RuntimeError::NotFound(identity.clone()))?;
        let state = handle.state();
        if !state.is_ready() {
            return Err(RuntimeError::NotReady {
                identity: identity.clone(),
                state: state.name(),
            });
        }
        Ok(handle)
    }

    /// Remove the entry, stopping its process. Returns the evicted handle.
    pub async fn evict(&self, identity: &PluginIdentity) -> Option<Arc<RuntimeHandle>> {
        let (_, handle) = self.runtimes.remove(identity)?;
        stop_handle(&handle).await;
        info!("Evicted plugin {}", identity);
        Some(handle)
    }

    pub fn list(&self) -> Vec<RuntimeSnapshot> {
        let mut snapshots: Vec<_> = self
            .runtimes
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }

    /// Number of registered runtimes
    pub fn count(&self) -> usize {
        self.runtimes.len()
    }

    pub fn ready_count(&self) -> usize {
        self.runtimes
            .iter()
            .filter(|entry| entry.value().state().is_ready())
            .count()
    }

    /// Stop every runtime, keeping the entries for inspection.
    pub async fn shutdown_all(&self) {
        let handles: Vec<_> = self
            .runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            stop_handle(&handle).await;
        }
    }
}

/// Kill the process and move a ready handle to `Stopped`; anything still
/// in flight is failed instead.
pub(crate) async fn stop_handle(handle: &RuntimeHandle) {
    if let Some(process) = handle.take_process() {
        process.kill().await;
    }
    let state = handle.state();
    if state.is_ready() {
        let _ = handle.transition(RuntimeState::Stopped);
    } else if !state.is_terminal() {
        handle.fail("stopped before becoming ready");
    }
}
