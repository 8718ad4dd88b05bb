//! Runtime lifecycle states

use serde::Serialize;
use std::path::PathBuf;

/// Lifecycle state of one runtime handle.
///
/// Forward-only: `Uninitialized -> Provisioning -> InstallingDependencies
/// -> Ready -> Stopped`, with any non-terminal state able to drop to
/// `Failed`. The interpreter path only exists once `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RuntimeState {
    Uninitialized,
    Provisioning,
    InstallingDependencies,
    Ready { interpreter: PathBuf },
    Failed { reason: String },
    Stopped,
}

impl RuntimeState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Provisioning => "provisioning",
            Self::InstallingDependencies => "installing_dependencies",
            Self::Ready { .. } => "ready",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Provisioning => 1,
            Self::InstallingDependencies => 2,
            Self::Ready { .. } => 3,
            Self::Stopped => 4,
            Self::Failed { .. } => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Stopped)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Provisioning or installing.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Provisioning | Self::InstallingDependencies)
    }

    pub fn interpreter(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready { interpreter } => Some(interpreter),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal single step.
    pub fn can_transition_to(&self, next: &RuntimeState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed { .. } => true,
            // only a ready runtime is stopped; earlier stages fail instead
            Self::Stopped => self.is_ready(),
            _ => next.rank() == self.rank() + 1,
        }
    }
}
