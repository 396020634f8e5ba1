//! VM state vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a VM as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Running,
    /// Guest has shut down but the VMM process is still around.
    Shutdown,
    /// Created or stopped, not currently executing.
    Shutoff,
    Crashed,
    Unknown,
}

impl VmState {
    /// Map a state string reported by the VMM's `vm.info` endpoint.
    ///
    /// Matching is case-insensitive. `Created` and `Paused` VMs are not
    /// executing, so they map to [`VmState::Shutoff`].
    pub fn from_vmm(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "shutdown" => Self::Shutdown,
            "shutoff" | "created" | "paused" => Self::Shutoff,
            "crashed" | "breakpoint" => Self::Crashed,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Shutoff => write!(f, "shutoff"),
            Self::Crashed => write!(f, "crashed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vmm() {
        assert_eq!(VmState::from_vmm("Running"), VmState::Running);
        assert_eq!(VmState::from_vmm("RUNNING"), VmState::Running);
        assert_eq!(VmState::from_vmm("Shutdown"), VmState::Shutdown);
        assert_eq!(VmState::from_vmm("Created"), VmState::Shutoff);
        assert_eq!(VmState::from_vmm("crashed"), VmState::Crashed);
        assert_eq!(VmState::from_vmm("Migrating"), VmState::Unknown);
        assert_eq!(VmState::from_vmm(""), VmState::Unknown);
    }

    #[test]
    fn test_is_running() {
        assert!(VmState::from_vmm("running").is_running());
        assert!(!VmState::Shutoff.is_running());
        assert!(!VmState::Unknown.is_running());
    }

    #[test]
    fn test_display() {
        assert_eq!(VmState::Running.to_string(), "running");
        assert_eq!(VmState::Unknown.to_string(), "unknown");
    }
}
