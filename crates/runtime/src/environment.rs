//! Environment provisioning
//!
//! One isolated interpreter environment per plugin installation, rooted at
//! the plugin's working directory:
//!
//! ```text
//! <working>/.venv/bin/python
//! <working>/.venv/bin/pip
//! <working>/requirements.txt
//! ```

use crate::activity::CapturedOutput;
use crate::error::{Result, RuntimeError};
use crate::identity::PluginIdentity;
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment directory; its presence means "already provisioned".
pub const ENV_MARKER: &str = ".venv";

/// Dependency manifest expected at the root of the working directory.
pub const DEPENDENCY_MANIFEST: &str = "requirements.txt";

/// Paths of one provisioned (or to-be-provisioned) environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEnvironment {
    pub working_path: PathBuf,
    pub root: PathBuf,
    pub interpreter: PathBuf,
    pub package_manager: PathBuf,
    pub dependency_manifest: PathBuf,
}

impl ExecutionEnvironment {
    /// Python venv layout under `working_path`. Nothing is checked.
    pub fn python(working_path: impl Into<PathBuf>) -> Self {
        let working_path = working_path.into();
        let root = working_path.join(ENV_MARKER);
        Self {
            interpreter: root.join("bin").join("python"),
            package_manager: root.join("bin").join("pip"),
            dependency_manifest: working_path.join(DEPENDENCY_MANIFEST),
            root,
            working_path,
        }
    }

    pub async fn marker_exists(&self) -> bool {
        tokio::fs::try_exists(&self.root).await.unwrap_or(false)
    }

    /// Remove the environment directory. Missing is fine.
    pub async fn remove(&self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!("Removed environment {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove environment {}: {}", self.root.display(), e),
        }
    }
}

/// Outcome of [`EnvironmentProvisioner::provision`]
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub environment: ExecutionEnvironment,
    /// True when the marker already existed and nothing was run.
    pub reused: bool,
}

/// Builds language-specific execution environments
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Runner language this provisioner handles, e.g. `python`.
    fn language(&self) -> &'static str;

    /// Create the environment under `working_path` unless it already exists.
    async fn provision(&self, identity: &PluginIdentity, working_path: &Path)
        -> Result<Provisioned>;

    /// Install declared dependencies into a freshly created environment.
    /// On failure the environment is removed.
    async fn install_dependencies(
        &self,
        identity: &PluginIdentity,
        environment: &ExecutionEnvironment,
        supervisor: &Supervisor,
    ) -> Result<()>;
}

/// Python `venv` + `pip` provisioner
#[derive(Debug, Clone)]
pub struct PythonProvisioner {
    /// Interpreter used to create environments
    base_interpreter: PathBuf,
    /// Cap on captured `venv` output
    output_limit: usize,
}

impl PythonProvisioner {
    pub fn new(base_interpreter: impl Into<PathBuf>) -> Self {
        Self {
            base_interpreter: base_interpreter.into(),
            output_limit: 16 * 1024,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }
}

impl Default for PythonProvisioner {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl EnvironmentProvisioner for PythonProvisioner {
    fn language(&self) -> &'static str {
        "python"
    }

    async fn provision(
        &self,
        identity: &PluginIdentity,
        working_path: &Path,
    ) -> Result<Provisioned> {
        let working_path = std::path::absolute(working_path)?;
        let environment = ExecutionEnvironment::python(&working_path);

        // Trust an existing environment on restart.
        if environment.marker_exists().await {
            debug!("{} reusing environment at {}", identity, environment.root.display());
            return Ok(Provisioned {
                environment,
                reused: true,
            });
        }

        if !tokio::fs::try_exists(&environment.dependency_manifest).await? {
            return Err(RuntimeError::ManifestNotFound(
                environment.dependency_manifest.clone(),
            ));
        }

        info!("{} creating environment with {}", identity, self.base_interpreter.display());

        let output = Command::new(&self.base_interpreter)
            .args(["-m", "venv", ENV_MARKER])
            .current_dir(&working_path)
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(source) => {
                environment.remove().await;
                return Err(RuntimeError::ProcessStart {
                    command: format!("{} -m venv", self.base_interpreter.display()),
                    source,
                });
            }
        };

        if !output.status.success() {
            let combined = CapturedOutput::new(self.output_limit);
            combined.append(&output.stdout);
            combined.append(&output.stderr);
            environment.remove().await;
            return Err(RuntimeError::EnvironmentCreation {
                identity: identity.clone(),
                output: format!("{}: {}", output.status, combined.text()),
            });
        }

        for path in [&environment.package_manager, &environment.interpreter] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                environment.remove().await;
                return Err(RuntimeError::InterpreterNotFound(path.clone()));
            }
        }

        Ok(Provisioned {
            environment,
            reused: false,
        })
    }

    async fn install_dependencies(
        &self,
        identity: &PluginIdentity,
        environment: &ExecutionEnvironment,
        supervisor: &Supervisor,
    ) -> Result<()> {
        let mut command = Command::new(&environment.package_manager);
        command
            .args(["install", "-r", DEPENDENCY_MANIFEST])
            .current_dir(&environment.working_path);

        let label = format!("installing {identity}");
        match supervisor.run(command, &label).await {
            Ok(_) => Ok(()),
            Err(e) => {
                environment.remove().await;
                Err(e)
            }
        }
    }
}
