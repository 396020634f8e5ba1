//! Builder pattern for assembling a [`VmConfig`] payload.

use crate::config::{
    CpusConfig, DeviceConfig, DiskConfig, FsConfig, MemoryConfig, NetConfig, PayloadConfig,
    PlatformConfig, RngConfig, SerialConfig, VmConfig, VsockConfig,
};
use crate::error::{Result, VmmError};
use std::path::PathBuf;

const MIB: u64 = 1024 * 1024;

/// Fluent builder for a Cloud Hypervisor creation payload.
///
/// # Example
///
/// ```
/// use cirrus_vmm::VmConfigBuilder;
///
/// let config = VmConfigBuilder::new()
///     .vcpus(2)
///     .memory_mib(512)
///     .kernel("/var/lib/cirrus/vmlinux")
///     .cmdline("console=ttyS0 root=/dev/vda1")
///     .disk("/var/lib/cirrus/images/rootfs.img", false)
///     .build()
///     .unwrap();
/// assert_eq!(config.cpus.boot_vcpus, 2);
/// ```
#[derive(Debug, Clone)]
pub struct VmConfigBuilder {
    config: VmConfig,
    payload: PayloadConfig,
    /// First size that did not fit in bytes; reported by [`Self::build`].
    overflow: Option<String>,
}

impl Default for VmConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfigBuilder {
    /// Create a builder with one vCPU and 256 MiB of memory.
    pub fn new() -> Self {
        Self {
            config: VmConfig {
                cpus: CpusConfig {
                    boot_vcpus: 1,
                    max_vcpus: 1,
                    features: Vec::new(),
                },
                memory: MemoryConfig {
                    size: 256 * MIB,
                    ..Default::default()
                },
                ..Default::default()
            },
            payload: PayloadConfig::default(),
            overflow: None,
        }
    }

    /// MiB to bytes, remembering the first value that overflows.
    fn bytes(&mut self, what: &str, mib: u64) -> u64 {
        match mib.checked_mul(MIB) {
            Some(bytes) => bytes,
            None => {
                self.overflow
                    .get_or_insert_with(|| format!("{what} of {mib} MiB is too large"));
                u64::MAX
            }
        }
    }

    /// Set boot and max vCPUs to the same count.
    pub fn vcpus(mut self, count: u32) -> Self {
        self.config.cpus.boot_vcpus = count;
        self.config.cpus.max_vcpus = count;
        self
    }

    /// Raise the hotplug ceiling above the boot count.
    pub fn max_vcpus(mut self, count: u32) -> Self {
        self.config.cpus.max_vcpus = count;
        self
    }

    pub fn cpu_feature(mut self, feature: impl Into<String>) -> Self {
        self.config.cpus.features.push(feature.into());
        self
    }

    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.config.memory.size = self.bytes("memory size", mib);
        self
    }

    /// Back guest memory with a shared mapping (required for virtio-fs).
    pub fn shared_memory(mut self, shared: bool) -> Self {
        self.config.memory.shared = shared;
        self
    }

    pub fn hugepages(mut self, enabled: bool) -> Self {
        self.config.memory.hugepages = enabled;
        self
    }

    pub fn memory_hotplug(mut self, method: impl Into<String>, size_mib: u64) -> Self {
        self.config.memory.hotplug_method = Some(method.into());
        self.config.memory.hotplug_size = Some(self.bytes("hotplug size", size_mib));
        self
    }

    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.payload.kernel = Some(path.into());
        self
    }

    pub fn firmware(mut self, path: impl Into<PathBuf>) -> Self {
        self.payload.firmware = Some(path.into());
        self
    }

    pub fn initramfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.payload.initramfs = Some(path.into());
        self
    }

    /// Set the kernel command line, replacing any previous value.
    pub fn cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.payload.cmdline = cmdline.into();
        self
    }

    /// Append a parameter to the kernel command line.
    pub fn cmdline_arg(mut self, arg: impl AsRef<str>) -> Self {
        let arg = arg.as_ref();
        if arg.is_empty() {
            return self;
        }
        if !self.payload.cmdline.is_empty() {
            self.payload.cmdline.push(' ');
        }
        self.payload.cmdline.push_str(arg);
        self
    }

    pub fn disk(mut self, path: impl Into<PathBuf>, readonly: bool) -> Self {
        self.config.disks.push(DiskConfig {
            path: path.into(),
            readonly,
            serial: None,
        });
        self
    }

    pub fn with_disk_config(mut self, disk: DiskConfig) -> Self {
        self.config.disks.push(disk);
        self
    }

    pub fn net(mut self, net: NetConfig) -> Self {
        self.config.net.push(net);
        self
    }

    pub fn rng(mut self, src: impl Into<PathBuf>) -> Self {
        self.config.rng = Some(RngConfig { src: src.into() });
        self
    }

    pub fn vsock(mut self, cid: u32, socket: impl Into<PathBuf>) -> Self {
        self.config.vsock = Some(VsockConfig {
            cid,
            socket: socket.into(),
        });
        self
    }

    /// Add a virtio-fs share. Also switches memory to shared.
    pub fn fs(mut self, fs: FsConfig) -> Self {
        self.config.fs.push(fs);
        self.config.memory.shared = true;
        self
    }

    pub fn platform(mut self, platform: PlatformConfig) -> Self {
        self.config.platform = Some(platform);
        self
    }

    pub fn device(mut self, device: DeviceConfig) -> Self {
        self.config.devices.push(device);
        self
    }

    pub fn serial(mut self, serial: SerialConfig) -> Self {
        self.config.serial = serial;
        self
    }

    /// Return the payload without validating it. Oversized memory values
    /// are clamped to `u64::MAX` bytes.
    pub fn build_unchecked(mut self) -> VmConfig {
        if self.payload != PayloadConfig::default() {
            self.config.payload = Some(self.payload);
        }
        self.config
    }

    /// Assemble and validate the payload.
    ///
    /// # Errors
    /// Returns an error if a memory size overflows or the assembled payload
    /// fails [`VmConfig::validate`].
    pub fn build(mut self) -> Result<VmConfig> {
        if let Some(msg) = self.overflow.take() {
            return Err(VmmError::Config(msg));
        }
        let config = self.build_unchecked();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_builder() {
        let config = VmConfigBuilder::new().build_unchecked();
        assert_eq!(config.cpus.boot_vcpus, 1);
        assert_eq!(config.memory.size, 256 * MIB);
        assert!(config.payload.is_none());
        assert!(config.net.is_empty());
    }

    #[test]
    fn test_builder_requires_kernel() {
        assert!(VmConfigBuilder::new().build().is_err());
        assert!(VmConfigBuilder::new().kernel("/vmlinux").build().is_ok());
    }

    #[test]
    fn test_builder_vcpus_memory() {
        let config = VmConfigBuilder::new()
            .vcpus(4)
            .max_vcpus(8)
            .memory_mib(2048)
            .kernel("/vmlinux")
            .build()
            .unwrap();

        assert_eq!(config.cpus.boot_vcpus, 4);
        assert_eq!(config.cpus.max_vcpus, 8);
        assert_eq!(config.memory.size, 2048 * MIB);
    }

    #[test]
    fn test_oversized_memory_is_rejected() {
        let err = VmConfigBuilder::new()
            .memory_mib(u64::MAX / 1024)
            .kernel("/vmlinux")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("memory size"), "{err}");

        let err = VmConfigBuilder::new()
            .memory_mib(512)
            .memory_hotplug("acpi", u64::MAX)
            .kernel("/vmlinux")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("hotplug size"), "{err}");

        let config = VmConfigBuilder::new()
            .memory_mib(u64::MAX)
            .build_unchecked();
        assert_eq!(config.memory.size, u64::MAX);
    }

    #[test]
    fn test_cmdline_arg_appends() {
        let config = VmConfigBuilder::new()
            .kernel("/vmlinux")
            .cmdline("console=ttyS0")
            .cmdline_arg("ip=10.0.0.2::10.0.0.1:255.255.255.0::eth0:off")
            .cmdline_arg("")
            .build_unchecked();

        assert_eq!(
            config.payload.unwrap().cmdline,
            "console=ttyS0 ip=10.0.0.2::10.0.0.1:255.255.255.0::eth0:off"
        );
    }

    #[test]
    fn test_fs_enables_shared_memory() {
        let config = VmConfigBuilder::new()
            .kernel("/vmlinux")
            .fs(FsConfig {
                tag: "data".into(),
                socket: PathBuf::from("/run/fs-data.sock"),
                num_queues: Some(1),
                queue_size: Some(1024),
            })
            .build()
            .unwrap();

        assert!(config.memory.shared);
        assert_eq!(config.fs.len(), 1);
    }

    #[test]
    fn test_builder_devices() {
        let config = VmConfigBuilder::new()
            .kernel("/vmlinux")
            .platform(PlatformConfig {
                num_pci_segments: Some(1),
                iommu_segments: vec![0],
                iommu_address_width: Some(48),
            })
            .device(DeviceConfig {
                path: PathBuf::from("/dev/vfio/42"),
                id: Some("vfio-0".into()),
                iommu: true,
                pci_segment: 0,
            })
            .build()
            .unwrap();

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.platform.unwrap().iommu_address_width, Some(48));
    }
}
