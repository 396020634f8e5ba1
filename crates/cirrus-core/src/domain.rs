//! Per-VM request model.

use cirrus_vmm::{DeviceConfig, DiskConfig, PlatformConfig, RngConfig, VsockConfig};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

/// Smallest guest memory the driver will launch, in MiB.
pub const MIN_MEMORY_MIB: u64 = 256;

/// Everything needed to create one VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub name: String,
    pub cpus: u32,
    pub memory_mib: u64,
    /// Root disk image.
    pub base_image: PathBuf,

    pub hostname: Option<String>,
    pub user_data: Option<String>,
    pub cmds: Vec<String>,
    pub default_user_ssh_key: Option<String>,
    pub default_user_password: Option<String>,
    /// Files written into the guest by the boot-configuration volume.
    pub files: Vec<GuestFile>,

    pub network_interfaces: Vec<NetworkInterfaceConfig>,

    pub kernel: Option<PathBuf>,
    pub initramfs: Option<PathBuf>,
    pub cmdline: Option<String>,
    pub max_vcpus: Option<u32>,
    pub features: Vec<String>,
    pub memory_hugepages: bool,
    pub memory_shared: bool,
    pub hotplug_method: Option<String>,
    /// Hotplug headroom in MiB.
    pub hotplug_size_mib: Option<u64>,

    pub disks: Vec<DiskConfig>,
    pub fs_mounts: Vec<FsMount>,
    pub vsock: Option<VsockConfig>,
    pub rng: Option<RngConfig>,
    pub devices: Vec<DeviceConfig>,
    pub platform: Option<PlatformConfig>,
    /// PCI addresses to pass through with VFIO.
    pub vfio_devices: Vec<String>,
}

/// A file delivered into the guest at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestFile {
    pub path: String,
    pub permissions: String,
    /// Content encoding, e.g. `b64`. Empty means plain text.
    pub encoding: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaceConfig {
    pub bridge: Option<BridgeConfig>,
}

/// Bridge attachment and optional static addressing for a guest NIC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub name: String,
    /// Port labels to forward to the guest.
    pub ports: Vec<String>,
    pub static_ip: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    /// Prefix length as written by the user, e.g. `"24"`.
    pub netmask: Option<String>,
    pub dns: Vec<Ipv4Addr>,
}

/// A host directory shared into the guest over virtio-fs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsMount {
    pub tag: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub num_queues: Option<u32>,
    #[serde(default)]
    pub queue_size: Option<u32>,
}

impl DomainConfig {
    /// The first interface's bridge settings, the only ones honoured.
    pub fn bridge(&self) -> Option<&BridgeConfig> {
        self.network_interfaces
            .first()
            .and_then(|iface| iface.bridge.as_ref())
    }

    /// Check the request, collecting every problem rather than stopping at
    /// the first.
    pub fn validate(&self, image_paths: &[PathBuf]) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("missing domain name".to_string());
        }
        if self.base_image.as_os_str().is_empty() {
            errors.push("missing base image".to_string());
        } else if !path_allowed(&self.base_image, image_paths) {
            errors.push(format!(
                "image path {} is not in an allowed directory",
                self.base_image.display()
            ));
        }
        if self.memory_mib < MIN_MEMORY_MIB {
            errors.push(format!(
                "not enough memory: {} MiB (minimum {MIN_MEMORY_MIB} MiB)",
                self.memory_mib
            ));
        }
        if self.cpus == 0 {
            errors.push("no CPUs assigned".to_string());
        }
        if self.network_interfaces.len() > 1 {
            errors.push("only one network interface can be configured".to_string());
        }
        for (i, iface) in self.network_interfaces.iter().enumerate() {
            if let Some(bridge) = &iface.bridge {
                if bridge.name.trim().is_empty() {
                    errors.push(format!("network interface bridge {i} requires a name"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// `..` is refused outright since `starts_with` compares components lexically.
fn path_allowed(path: &Path, allowed: &[PathBuf]) -> bool {
    if path.components().any(|c| c == Component::ParentDir) {
        return false;
    }
    allowed.iter().any(|dir| path.starts_with(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<PathBuf> {
        vec![PathBuf::from("/allowed/path")]
    }

    fn valid() -> DomainConfig {
        DomainConfig {
            name: "test-domain".into(),
            cpus: 2,
            memory_mib: 600,
            base_image: PathBuf::from("/allowed/path/image.img"),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate(&allowed()).is_ok());
    }

    #[test]
    fn test_image_path_not_allowed() {
        let config = DomainConfig {
            base_image: PathBuf::from("/path/not/allowed/image.img"),
            ..valid()
        };
        let errors = config.validate(&allowed()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not in an allowed directory"));
    }

    #[test]
    fn test_user_specific_paths() {
        let paths = vec![PathBuf::from("/root"), PathBuf::from("/var/lib/viper")];
        let config = DomainConfig {
            base_image: PathBuf::from("/root/my-image.img"),
            ..valid()
        };
        assert!(config.validate(&paths).is_ok());

        let config = DomainConfig {
            base_image: PathBuf::from("/opt/my-image.img"),
            ..valid()
        };
        assert!(config.validate(&paths).is_err());
    }

    #[test]
    fn test_prefix_is_component_wise() {
        let config = DomainConfig {
            base_image: PathBuf::from("/allowed/pathology/image.img"),
            ..valid()
        };
        assert!(config.validate(&allowed()).is_err());
    }

    #[test]
    fn test_parent_dir_cannot_escape() {
        let paths = vec![PathBuf::from("/var/lib/nomad")];
        let config = DomainConfig {
            base_image: PathBuf::from("/var/lib/nomad/../../../etc/shadow"),
            ..valid()
        };
        let errors = config.validate(&paths).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not in an allowed directory"));

        let config = DomainConfig {
            base_image: PathBuf::from("/var/lib/nomad/images/../jammy.img"),
            ..valid()
        };
        assert!(config.validate(&paths).is_err());
    }

    #[test]
    fn test_collects_every_violation() {
        let config = DomainConfig {
            name: String::new(),
            cpus: 0,
            memory_mib: 2,
            base_image: PathBuf::new(),
            network_interfaces: vec![
                NetworkInterfaceConfig {
                    bridge: Some(BridgeConfig::default()),
                },
                NetworkInterfaceConfig::default(),
            ],
            ..Default::default()
        };
        let errors = config.validate(&allowed()).unwrap_err();
        assert_eq!(errors.len(), 6, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("missing domain name")));
        assert!(errors.iter().any(|e| e.contains("missing base image")));
        assert!(errors.iter().any(|e| e.contains("not enough memory")));
        assert!(errors.iter().any(|e| e.contains("no CPUs")));
        assert!(errors.iter().any(|e| e.contains("only one network interface")));
        assert!(errors.iter().any(|e| e.contains("requires a name")));
    }

    #[test]
    fn test_bridge_accessor() {
        let mut config = valid();
        assert!(config.bridge().is_none());
        config.network_interfaces.push(NetworkInterfaceConfig {
            bridge: Some(BridgeConfig {
                name: "br0".into(),
                ..Default::default()
            }),
        });
        assert_eq!(config.bridge().unwrap().name, "br0");
    }
}
