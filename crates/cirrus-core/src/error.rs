//! Error types for cirrus-core.

use crate::firewall::Rule;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Fatal configuration problems, reported at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("required binary not found: {0}")]
    MissingBinary(PathBuf),
}

/// IP pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("no available IP addresses in pool")]
    NoAvailableAddress,

    #[error("static IP {0} is outside the subnet")]
    OutsideSubnet(Ipv4Addr),

    #[error("static IP {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    #[error("static IP {0} is the gateway address")]
    Gateway(Ipv4Addr),
}

/// VFIO passthrough errors. Each names the device it concerns.
#[derive(Debug, Error)]
pub enum VfioError {
    #[error("invalid PCI address format: {0:?}")]
    InvalidAddress(String),

    #[error("PCI device not found: {0}")]
    NotFound(String),

    #[error("device {device} ({vendor}:{device_id}) not in allowlist")]
    NotAllowed {
        device: String,
        vendor: String,
        device_id: String,
    },

    #[error("device {0} has no IOMMU group")]
    NoIommuGroup(String),

    #[error("VFIO group device {path} for {device} does not exist")]
    GroupDeviceMissing { device: String, path: PathBuf },

    #[error("failed to {action} device {device}: {source}")]
    Io {
        device: String,
        action: &'static str,
        source: std::io::Error,
    },
}

/// A single firewall rule that could not be removed.
#[derive(Debug, Clone)]
pub struct RuleFailure {
    pub rule: Rule,
    pub message: String,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} [{}]: {}",
            self.rule.table,
            self.rule.chain,
            self.rule.args.join(" "),
            self.message
        )
    }
}

/// Port-forwarding setup and teardown errors.
#[derive(Debug, Error)]
pub enum PortForwardError {
    #[error("invalid port-forward request: {0}")]
    Invalid(String),

    #[error("bridge {0} does not exist")]
    MissingBridge(String),

    #[error("no host interface owns {0}")]
    NoInterface(Ipv4Addr),

    #[error("unable to determine guest IP for {0}")]
    NoGuestIp(String),

    #[error("firewall: {0}")]
    Firewall(String),

    #[error("lease file {0} not found")]
    LeaseFileMissing(PathBuf),

    #[error("failed to read lease file {path}: {source}")]
    LeaseRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no active lease for MAC {0}")]
    NoActiveLease(String),

    #[error("failed to remove {} rule(s): {}", .0.len(), join_failures(.0))]
    Teardown(Vec<RuleFailure>),
}

fn join_failures(failures: &[RuleFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures running host tools or managing host processes.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{program} failed: {message}")]
    Command {
        program: String,
        /// Exit code, when the process ran to completion.
        status: Option<i32>,
        message: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{0} did not appear before the startup timeout")]
    SocketWait(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle step during which a creation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    WorkDir,
    AllocateIp,
    BootConfig,
    Networking,
    FsMounts,
    BuildConfig,
    Vfio,
    Launch,
    Boot,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validate => "validate",
            Self::WorkDir => "work dir",
            Self::AllocateIp => "allocate ip",
            Self::BootConfig => "boot config",
            Self::Networking => "networking",
            Self::FsMounts => "fs mounts",
            Self::BuildConfig => "build config",
            Self::Vfio => "vfio",
            Self::Launch => "launch",
            Self::Boot => "boot",
        };
        f.write_str(s)
    }
}

/// Errors returned by the lifecycle controller.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Vfio(#[from] VfioError),

    #[error(transparent)]
    PortForward(#[from] PortForwardError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("VMM error: {0}")]
    Vmm(#[from] cirrus_vmm::VmmError),

    /// Every violation found in a domain configuration.
    #[error("invalid domain config: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("domain {0} already exists")]
    AlreadyExists(String),

    #[error("domain {0} not found")]
    NotFound(String),

    #[error("failed to create domain {name} during {stage}: {source}")]
    Create {
        name: String,
        stage: Stage,
        source: Box<DriverError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Attach the VM name and failing stage to a creation error.
    pub(crate) fn during(self, name: &str, stage: Stage) -> Self {
        Self::Create {
            name: name.to_string(),
            stage,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_error_lists_every_failure() {
        let failures = vec![
            RuleFailure {
                rule: Rule::new("nat", "CIRRUS_PRT", ["-d", "10.0.0.1"]),
                message: "exit status 4".into(),
            },
            RuleFailure {
                rule: Rule::new("filter", "CIRRUS_FW", ["-d", "10.0.0.2"]),
                message: "exit status 1".into(),
            },
        ];
        let msg = PortForwardError::Teardown(failures).to_string();
        assert!(msg.starts_with("failed to remove 2 rule(s)"));
        assert!(msg.contains("nat/CIRRUS_PRT [-d 10.0.0.1]: exit status 4"));
        assert!(msg.contains("filter/CIRRUS_FW"));
    }

    #[test]
    fn test_create_error_context() {
        let err = DriverError::from(AllocError::NoAvailableAddress).during("web-1", Stage::AllocateIp);
        assert_eq!(
            err.to_string(),
            "failed to create domain web-1 during allocate ip: no available IP addresses in pool"
        );
    }

    #[test]
    fn test_validation_joins_messages() {
        let err = DriverError::Validation(vec!["name is empty".into(), "no CPUs".into()]);
        assert_eq!(err.to_string(), "invalid domain config: name is empty; no CPUs");
    }
}
