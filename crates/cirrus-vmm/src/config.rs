//! Payload types for the Cloud Hypervisor `vm.create` API.
//!
//! The JSON shape follows the VMM's REST schema; optional sections are
//! omitted from the document when unset.

use crate::error::{Result, VmmError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Full declarative payload sent to the VMM on creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<NetConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng: Option<RngConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fs: Vec<FsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceConfig>,
    pub console: ConsoleConfig,
    pub serial: SerialConfig,
}

impl VmConfig {
    /// Validate the payload before it is handed to the VMM.
    ///
    /// # Errors
    /// Returns an error if any section is inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.cpus.boot_vcpus == 0 {
            return Err(VmmError::Config("boot_vcpus must be > 0".into()));
        }
        if self.cpus.max_vcpus < self.cpus.boot_vcpus {
            return Err(VmmError::Config(format!(
                "max_vcpus ({}) must be >= boot_vcpus ({})",
                self.cpus.max_vcpus, self.cpus.boot_vcpus
            )));
        }
        if self.memory.size == 0 {
            return Err(VmmError::Config("memory size must be > 0".into()));
        }

        match &self.payload {
            Some(p) if p.kernel.is_some() || p.firmware.is_some() => {}
            _ => {
                return Err(VmmError::Config(
                    "payload requires a kernel or firmware".into(),
                ))
            }
        }

        // Shared-filesystem devices need memory the helper can map.
        if !self.fs.is_empty() && !self.memory.shared {
            return Err(VmmError::Config(
                "fs devices require shared memory".into(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if let Some(id) = &device.id {
                if !ids.insert(id.as_str()) {
                    return Err(VmmError::Config(format!("duplicate device id: {id}")));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpusConfig {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

/// Guest memory shape. `size` and `hotplug_size` are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub size: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub shared: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hugepages: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotplug_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotplug_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<PathBuf>,
    #[serde(default)]
    pub cmdline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "is_false")]
    pub readonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

/// A virtio-net interface backed by a host TAP device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    pub tap: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RngConfig {
    pub src: PathBuf,
}

impl Default for RngConfig {
    fn default() -> Self {
        Self {
            src: PathBuf::from("/dev/urandom"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VsockConfig {
    pub cid: u32,
    pub socket: PathBuf,
}

/// A virtio-fs share served by a virtiofsd helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsConfig {
    pub tag: String,
    pub socket: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_queues: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_pci_segments: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iommu_segments: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iommu_address_width: Option<u8>,
}

/// A passthrough device. For VFIO, `path` is the IOMMU group's
/// `/dev/vfio/<group>` node or the device's sysfs directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub iommu: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pci_segment: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub mode: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { mode: "Off".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            mode: "Null".into(),
            file: None,
        }
    }
}

impl SerialConfig {
    /// Serial output captured to a host file.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: "File".into(),
            file: Some(path.into()),
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}
