//! Driver configuration.
//!
//! Loaded from a TOML file; every field has a default so an absent file or
//! an empty section yields a usable host setup.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CIRRUS_CONFIG";
/// Environment variable overriding `data_dir`.
pub const DATA_DIR_ENV: &str = "CIRRUS_DATA_DIR";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cirrus/cirrus.toml";

/// Complete driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub cloud_hypervisor: CloudHypervisorConfig,
    pub network: NetworkConfig,
    pub vfio: VfioConfig,
    /// Root for per-VM work directories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directories disk images may be loaded from.
    #[serde(default = "default_image_paths")]
    pub image_paths: Vec<PathBuf>,
    /// Skip the startup check that configured binaries exist.
    pub skip_binary_validation: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cloud_hypervisor: CloudHypervisorConfig::default(),
            network: NetworkConfig::default(),
            vfio: VfioConfig::default(),
            data_dir: default_data_dir(),
            image_paths: default_image_paths(),
            skip_binary_validation: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cirrus")
}

fn default_image_paths() -> Vec<PathBuf> {
    ["/var/lib/nomad", "/tmp", "/root", "/opt", "/var/lib"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

/// VMM binaries, boot defaults and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudHypervisorConfig {
    #[serde(default = "default_ch_bin")]
    pub bin: PathBuf,
    #[serde(default = "default_remote_bin")]
    pub remote_bin: PathBuf,
    #[serde(default = "default_virtiofsd_bin")]
    pub virtiofsd_bin: PathBuf,
    pub default_kernel: Option<PathBuf>,
    pub default_initramfs: Option<PathBuf>,
    /// Firmware used when neither the task nor the driver names a kernel.
    pub firmware: Option<PathBuf>,
    pub seccomp: bool,
    /// Overrides the per-VM `vmm.log` location.
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

impl Default for CloudHypervisorConfig {
    fn default() -> Self {
        Self {
            bin: default_ch_bin(),
            remote_bin: default_remote_bin(),
            virtiofsd_bin: default_virtiofsd_bin(),
            default_kernel: None,
            default_initramfs: None,
            firmware: None,
            seccomp: false,
            log_file: None,
            startup_timeout_secs: default_startup_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            api_timeout_secs: default_api_timeout(),
        }
    }
}

impl CloudHypervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

fn default_ch_bin() -> PathBuf {
    PathBuf::from("/usr/bin/cloud-hypervisor")
}

fn default_remote_bin() -> PathBuf {
    PathBuf::from("/usr/bin/ch-remote")
}

fn default_virtiofsd_bin() -> PathBuf {
    PathBuf::from("/usr/libexec/virtiofsd")
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_api_timeout() -> u64 {
    30
}

/// Bridge, subnet and address pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default = "default_subnet")]
    pub subnet_cidr: String,
    /// When unset, the first usable subnet address is the gateway.
    pub gateway: Option<Ipv4Addr>,
    #[serde(default = "default_pool_start")]
    pub ip_pool_start: Ipv4Addr,
    #[serde(default = "default_pool_end")]
    pub ip_pool_end: Ipv4Addr,
    #[serde(default = "default_tap_prefix")]
    pub tap_prefix: String,
    #[serde(default = "default_mac_prefix")]
    pub mac_prefix: String,
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: default_bridge(),
            subnet_cidr: default_subnet(),
            gateway: None,
            ip_pool_start: default_pool_start(),
            ip_pool_end: default_pool_end(),
            tap_prefix: default_tap_prefix(),
            mac_prefix: default_mac_prefix(),
            nameservers: default_nameservers(),
        }
    }
}

fn default_bridge() -> String {
    "br0".to_string()
}

fn default_subnet() -> String {
    "192.168.254.0/24".to_string()
}

fn default_pool_start() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 254, 10)
}

fn default_pool_end() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 254, 200)
}

fn default_tap_prefix() -> String {
    "tap".to_string()
}

fn default_mac_prefix() -> String {
    "52:54:00".to_string()
}

fn default_nameservers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)]
}

/// Passthrough policy and platform topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfioConfig {
    /// `vendor:device` or `vendor:*` entries. Empty permits every device.
    pub allowlist: Vec<String>,
    pub iommu_address_width: Option<u8>,
    pub pci_segments: Option<u16>,
}

impl DriverConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Load from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CIRRUS_CONFIG` | `/etc/cirrus/cirrus.toml` |
    /// | `CIRRUS_DATA_DIR` | value of `data_dir` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load(&path)?;
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Check that the configured binaries exist.
    ///
    /// The VMM binary is required; the remote CLI and virtiofsd only
    /// produce warnings since not every VM needs them.
    pub fn validate_binaries(&self) -> Result<(), ConfigError> {
        if self.skip_binary_validation {
            return Ok(());
        }
        let ch = &self.cloud_hypervisor;
        if !ch.bin.exists() {
            return Err(ConfigError::MissingBinary(ch.bin.clone()));
        }
        for optional in [&ch.remote_bin, &ch.virtiofsd_bin] {
            if !optional.exists() {
                tracing::warn!(path = %optional.display(), "Optional binary not found");
            }
        }
        Ok(())
    }
}
