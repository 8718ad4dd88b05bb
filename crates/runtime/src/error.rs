//! Runtime errors

use crate::identity::PluginIdentity;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to create environment for {identity}: {output}")]
    EnvironmentCreation {
        identity: PluginIdentity,
        output: String,
    },

    #[error("Interpreter not found: {0}")]
    InterpreterNotFound(PathBuf),

    #[error("Dependency manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Failed to start {command}: {source}")]
    ProcessStart {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} failed ({status}), output: {output}")]
    ProcessFailed {
        label: String,
        status: String,
        output: String,
    },

    #[error("{label} timed out after {after:?}, output: {output}")]
    Timeout {
        label: String,
        after: Duration,
        output: String,
    },

    #[error("{label} produced no output for {idle:?}, output: {output}")]
    IdleTimeout {
        label: String,
        idle: Duration,
        output: String,
    },

    #[error("Provisioning already in flight for {0}")]
    AlreadyProvisioning(PluginIdentity),

    #[error("Invalid state transition for {identity}: {from} -> {to}")]
    InvalidTransition {
        identity: PluginIdentity,
        from: &'static str,
        to: &'static str,
    },

    #[error("Plugin {identity} is not ready ({state})")]
    NotReady {
        identity: PluginIdentity,
        state: &'static str,
    },

    #[error("Plugin not found: {0}")]
    NotFound(PluginIdentity),

    #[error("Invocation error: {0}")]
    Invocation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Captured subprocess output carried by the error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::EnvironmentCreation { output, .. }
            | Self::ProcessFailed { output, .. }
            | Self::Timeout { output, .. }
            | Self::IdleTimeout { output, .. } => Some(output),
            _ => None,
        }
    }

    /// True when the failure means "the plugin cannot serve", as opposed to
    /// a single call that went wrong.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::NotFound(_))
    }
}
