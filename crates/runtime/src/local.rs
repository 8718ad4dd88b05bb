//! Local plugin runtime
//!
//! Drives one handle through provisioning and dependency installation,
//! then launches the plugin process and keeps it alive.

use crate::environment::{EnvironmentProvisioner, ExecutionEnvironment};
use crate::error::{Result, RuntimeError};
use crate::handle::RuntimeHandle;
use crate::lifecycle::PluginRuntime;
use crate::process::PluginProcess;
use crate::registry::stop_handle;
use crate::state::RuntimeState;
use crate::supervisor::{Supervisor, ticker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct LocalRuntimeConfig {
    /// Module run with `python -m`
    pub entrypoint: String,

    /// Liveness poll period
    pub health_interval: Duration,

    /// Restarts allowed before the handle is failed
    pub max_restarts: u32,

    /// Pause before each restart
    pub restart_backoff: Duration,
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self {
            entrypoint: "main".to_string(),
            health_interval: Duration::from_secs(5),
            max_restarts: 3,
            restart_backoff: Duration::from_secs(1),
        }
    }
}

pub struct LocalPluginRuntime {
    handle: Arc<RuntimeHandle>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    supervisor: Supervisor,
    config: LocalRuntimeConfig,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl LocalPluginRuntime {
    pub fn new(
        handle: Arc<RuntimeHandle>,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        supervisor: Supervisor,
        config: LocalRuntimeConfig,
    ) -> Self {
        Self {
            handle,
            provisioner,
            supervisor,
            config,
            monitor: Mutex::new(None),
        }
    }

    async fn provision_and_install(&self) -> Result<PathBuf> {
        let identity = self.handle.identity();
        let provisioned = self
            .provisioner
            .provision(identity, self.handle.working_path())
            .await?;

        self.handle.transition(RuntimeState::InstallingDependencies)?;

        let environment = provisioned.environment;
        if provisioned.reused {
            verify_reused(&environment).await?;
        } else {
            self.provisioner
                .install_dependencies(identity, &environment, &self.supervisor)
                .await?;
        }

        Ok(environment.interpreter)
    }
}

/// A reused environment is not re-provisioned, but the interpreter and
/// dependency manifest must still be there before the handle may go ready.
/// A stale environment is removed so the next attempt rebuilds it.
async fn verify_reused(environment: &ExecutionEnvironment) -> Result<()> {
    if !tokio::fs::try_exists(&environment.interpreter)
        .await
        .unwrap_or(false)
    {
        environment.remove().await;
        return Err(RuntimeError::InterpreterNotFound(
            environment.interpreter.clone(),
        ));
    }
    if !tokio::fs::try_exists(&environment.dependency_manifest)
        .await
        .unwrap_or(false)
    {
        return Err(RuntimeError::ManifestNotFound(
            environment.dependency_manifest.clone(),
        ));
    }
    Ok(())
}

async fn launch(handle: &RuntimeHandle, entrypoint: &str) -> Result<Arc<PluginProcess>> {
    let state = handle.state();
    let Some(interpreter) = state.interpreter() else {
        return Err(RuntimeError::NotReady {
            identity: handle.identity().clone(),
            state: state.name(),
        });
    };
    let process = PluginProcess::spawn(
        handle.identity().clone(),
        interpreter,
        handle.working_path(),
        entrypoint,
    )
    .await?;
    Ok(Arc::new(process))
}

async fn monitor(handle: Arc<RuntimeHandle>, config: LocalRuntimeConfig) {
    let mut ticker = ticker(config.health_interval);
    ticker.tick().await;
    let mut restarts = 0u32;

    loop {
        ticker.tick().await;

        if !handle.state().is_ready() {
            return;
        }
        let Some(process) = handle.process() else {
            return;
        };
        let Some(status) = process.try_exited().await else {
            continue;
        };

        if restarts >= config.max_restarts {
            handle.take_process();
            handle.fail(format!(
                "plugin process exited ({status}) after {restarts} restarts"
            ));
            return;
        }

        warn!("Plugin {} exited ({}), restarting", handle.identity(), status);
        tokio::time::sleep(config.restart_backoff).await;
        restarts += 1;

        match launch(&handle, &config.entrypoint).await {
            Ok(process) => match handle.replace_process(process.clone()) {
                Ok(Some(previous)) => previous.kill().await,
                Ok(None) => {}
                Err(e) => {
                    // stopped while we were restarting
                    process.kill().await;
                    info!("Plugin {} restart abandoned: {}", handle.identity(), e);
                    return;
                }
            },
            Err(e) => {
                error!("Plugin {} restart failed: {}", handle.identity(), e);
                handle.take_process();
                handle.fail(format!("restart failed: {e}"));
                return;
            }
        }
    }
}

#[async_trait]
impl PluginRuntime for LocalPluginRuntime {
    fn handle(&self) -> &Arc<RuntimeHandle> {
        &self.handle
    }

    async fn init_environment(&self) -> Result<()> {
        let _slot = self.handle.try_begin_provisioning()?;
        self.handle.transition(RuntimeState::Provisioning)?;

        match self.provision_and_install().await {
            Ok(interpreter) => {
                self.handle.transition(RuntimeState::Ready { interpreter })?;
                info!("Plugin {} ready", self.handle.identity());
                Ok(())
            }
            Err(e) => {
                self.handle.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<()> {
        let process = launch(&self.handle, &self.config.entrypoint).await?;
        match self.handle.replace_process(process.clone()) {
            Ok(Some(previous)) => previous.kill().await,
            Ok(None) => {}
            Err(e) => {
                process.kill().await;
                return Err(e);
            }
        }

        let task = tokio::spawn(monitor(self.handle.clone(), self.config.clone()));
        if let Some(previous) = self.monitor.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) {
        let task = self.monitor.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        stop_handle(&self.handle).await;
    }
}

impl Drop for LocalPluginRuntime {
    fn drop(&mut self) {
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
        }
    }
}
