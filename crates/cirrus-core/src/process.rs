//! Registry records for live VMs and the shapes returned by queries.

use chrono::{DateTime, Utc};
use cirrus_vmm::{VmConfig, VmState};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// One live VM, owned by the driver.
#[derive(Debug, Clone)]
pub struct VmProcess {
    pub name: String,
    pub pid: u32,
    pub api_socket: PathBuf,
    pub log_file: PathBuf,
    pub work_dir: PathBuf,
    pub bridge: String,
    pub tap: String,
    pub mac: String,
    pub ip: Ipv4Addr,
    /// virtiofsd helpers.
    pub helper_pids: Vec<u32>,
    /// Devices this VM moved onto vfio-pci; handed back on destroy.
    pub vfio_devices: Vec<String>,
    pub config: VmConfig,
    pub started_at: DateTime<Utc>,
}

/// State of a registered VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub state: VmState,
    /// Bytes, when the VMM reported it.
    pub memory: Option<u64>,
    pub max_memory: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub network_name: String,
    pub device_name: String,
    pub mac: String,
    pub model: String,
    pub driver: String,
    pub addrs: Vec<Ipv4Addr>,
}

/// Host-level facts about the virtualizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualizerInfo {
    pub model: String,
    /// Major version, 0 when unknown.
    pub emulator_version: u32,
    pub running_domains: usize,
}

/// Major version from `cloud-hypervisor v48.0.0`.
pub fn parse_major_version(output: &str) -> u32 {
    output
        .split_whitespace()
        .nth(1)
        .map(|v| v.trim_start_matches('v'))
        .and_then(|v| v.split('.').next())
        .and_then(|major| major.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_major_version() {
        assert_eq!(parse_major_version("cloud-hypervisor v48.0.0"), 48);
        assert_eq!(parse_major_version("cloud-hypervisor v41.0-12-gabcdef"), 41);
        assert_eq!(parse_major_version("cloud-hypervisor 39"), 39);
        assert_eq!(parse_major_version("cloud-hypervisor"), 0);
        assert_eq!(parse_major_version(""), 0);
    }
}
