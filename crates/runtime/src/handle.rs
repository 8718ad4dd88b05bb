//! Runtime handle: the per-plugin lifecycle record

use crate::error::{Result, RuntimeError};
use crate::identity::PluginIdentity;
use crate::process::{InvocationEvent, InvocationRequest, PluginProcess};
use crate::state::RuntimeState;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{OwnedMutexGuard, mpsc, watch};
use tracing::{debug, info, warn};

/// Serializable view of a handle
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub identity: PluginIdentity,
    pub working_path: PathBuf,
    #[serde(flatten)]
    pub state: RuntimeState,
    pub assets: Vec<String>,
    pub pid: Option<u32>,
    pub restarts: u32,
}

/// Lifecycle record of one plugin installation.
///
/// Lives as long as its registry entry. The process slot is replaced on
/// every restart.
pub struct RuntimeHandle {
    identity: PluginIdentity,
    working_path: PathBuf,
    state: watch::Sender<RuntimeState>,
    history: Mutex<Vec<RuntimeState>>,
    assets: RwLock<BTreeSet<String>>,
    process: RwLock<Option<Arc<PluginProcess>>>,
    provisioning: Arc<tokio::sync::Mutex<()>>,
    restarts: AtomicU32,
}

impl RuntimeHandle {
    pub fn new(identity: PluginIdentity, working_path: impl Into<PathBuf>) -> Arc<Self> {
        let (state, _) = watch::channel(RuntimeState::Uninitialized);
        Arc::new(Self {
            identity,
            working_path: working_path.into(),
            state,
            history: Mutex::new(vec![RuntimeState::Uninitialized]),
            assets: RwLock::new(BTreeSet::new()),
            process: RwLock::new(None),
            provisioning: Arc::new(tokio::sync::Mutex::new(())),
            restarts: AtomicU32::new(0),
        })
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn state(&self) -> RuntimeState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Every state this handle has been in, oldest first.
    pub fn history(&self) -> Vec<RuntimeState> {
        self.history.lock().clone()
    }

    /// Move to `next` if it is a legal step from the current state.
    pub fn transition(&self, next: RuntimeState) -> Result<()> {
        let mut history = self.history.lock();
        let current = self.state.borrow().clone();
        if !current.can_transition_to(&next) {
            return Err(RuntimeError::InvalidTransition {
                identity: self.identity.clone(),
                from: current.name(),
                to: next.name(),
            });
        }

        debug!("Plugin {} {} -> {}", self.identity, current.name(), next.name());
        history.push(next.clone());
        self.state.send_replace(next);
        Ok(())
    }

    /// Land in `Failed`, unless already terminal. Returns whether it applied.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        match self.transition(RuntimeState::Failed {
            reason: reason.clone(),
        }) {
            Ok(()) => {
                warn!("Plugin {} failed: {}", self.identity, reason);
                true
            }
            Err(_) => false,
        }
    }

    /// Claim the single provisioning slot for this identity.
    pub fn try_begin_provisioning(&self) -> Result<OwnedMutexGuard<()>> {
        self.provisioning
            .clone()
            .try_lock_owned()
            .map_err(|_| RuntimeError::AlreadyProvisioning(self.identity.clone()))
    }

    pub fn bind_assets<I>(&self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.assets.write().extend(ids);
    }

    pub fn assets(&self) -> Vec<String> {
        self.assets.read().iter().cloned().collect()
    }

    pub fn process(&self) -> Option<Arc<PluginProcess>> {
        self.process.read().clone()
    }

    /// Install a (new) plugin process; returns the one it replaces.
    ///
    /// Only a `Ready` handle may own a process.
    pub fn replace_process(
        &self,
        process: Arc<PluginProcess>,
    ) -> Result<Option<Arc<PluginProcess>>> {
        let state = self.state.borrow().clone();
        if !state.is_ready() {
            return Err(RuntimeError::NotReady {
                identity: self.identity.clone(),
                state: state.name(),
            });
        }
        let previous = self.process.write().replace(process);
        if previous.is_some() {
            let count = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Plugin {} process replaced (restart #{})", self.identity, count);
        }
        Ok(previous)
    }

    pub fn take_process(&self) -> Option<Arc<PluginProcess>> {
        self.process.write().take()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Issue a capability call. Fails with `NotReady` unless the handle is
    /// `Ready` and owns a process.
    pub async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<mpsc::UnboundedReceiver<InvocationEvent>> {
        let state = self.state();
        let process = match (state.is_ready(), self.process()) {
            (true, Some(process)) => process,
            _ => {
                return Err(RuntimeError::NotReady {
                    identity: self.identity.clone(),
                    state: state.name(),
                });
            }
        };
        process.invoke(request).await
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            identity: self.identity.clone(),
            working_path: self.working_path.clone(),
            state: self.state(),
            assets: self.assets(),
            pid: self.process().and_then(|p| p.pid()),
            restarts: self.restarts(),
        }
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("identity", &self.identity)
            .field("state", &self.state.borrow().name())
            .finish()
    }
}
