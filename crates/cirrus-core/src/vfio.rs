//! VFIO passthrough: validation, IOMMU grouping and driver binding of PCI
//! devices through sysfs.
//!
//! All host access goes through [`SysFs`] so the logic can be exercised
//! against an in-memory tree.

use crate::error::VfioError;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PCI_DEVICES: &str = "/sys/bus/pci/devices";
const VFIO_DRIVER: &str = "vfio-pci";
const VFIO_BIND: &str = "/sys/bus/pci/drivers/vfio-pci/bind";
const VFIO_UNBIND: &str = "/sys/bus/pci/drivers/vfio-pci/unbind";
const DRIVERS_PROBE: &str = "/sys/bus/pci/drivers_probe";
const VFIO_DEV_DIR: &str = "/dev/vfio";

/// Minimal filesystem surface needed for sysfs device management.
pub trait SysFs: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
}

/// [`SysFs`] over the real host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSysFs;

impl SysFs for HostSysFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }
}

/// A PCI device as described by sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    pub address: String,
    pub vendor: String,
    pub device: String,
    pub driver: Option<String>,
    pub iommu_group: Option<String>,
}

/// Devices sharing one IOMMU group. They can only be passed through
/// together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IommuGroup {
    pub id: String,
    pub devices: Vec<String>,
}

/// Whether `addr` has the `dddd:bb:dd.f` form, hex digits and a function
/// number from 0 to 7.
pub fn is_valid_pci_address(addr: &str) -> bool {
    let bytes = addr.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    let hex = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_hexdigit);
    hex(0..4)
        && bytes[4] == b':'
        && hex(5..7)
        && bytes[7] == b':'
        && hex(8..10)
        && bytes[10] == b'.'
        && (b'0'..=b'7').contains(&bytes[11])
}

/// Whether a `vendor:device` pair is permitted. Entries are `vendor:device`
/// or `vendor:*`; comparison ignores case. An empty allowlist permits all.
pub fn matches_allowlist(vendor: &str, device: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|entry| {
        let Some((v, d)) = entry.trim().split_once(':') else {
            return false;
        };
        v.eq_ignore_ascii_case(vendor) && (d == "*" || d.eq_ignore_ascii_case(device))
    })
}

/// Manages binding of PCI devices to `vfio-pci`.
#[derive(Clone)]
pub struct VfioManager {
    fs: Arc<dyn SysFs>,
}

impl std::fmt::Debug for VfioManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfioManager").finish_non_exhaustive()
    }
}

impl Default for VfioManager {
    fn default() -> Self {
        Self::new(Arc::new(HostSysFs))
    }
}

impl VfioManager {
    pub fn new(fs: Arc<dyn SysFs>) -> Self {
        Self { fs }
    }

    fn device_dir(addr: &str) -> PathBuf {
        Path::new(PCI_DEVICES).join(addr)
    }

    fn check_address(addr: &str) -> Result<(), VfioError> {
        if is_valid_pci_address(addr) {
            Ok(())
        } else {
            Err(VfioError::InvalidAddress(addr.to_string()))
        }
    }

    /// Read a sysfs id attribute such as `vendor`, dropping the `0x` prefix.
    fn read_id(&self, addr: &str, attr: &str) -> Result<String, VfioError> {
        let raw = self
            .fs
            .read_to_string(&Self::device_dir(addr).join(attr))
            .map_err(|_| VfioError::NotFound(addr.to_string()))?;
        let trimmed = raw.trim();
        Ok(trimmed
            .strip_prefix("0x")
            .unwrap_or(trimmed)
            .to_ascii_lowercase())
    }

    /// Final path component of a sysfs symlink, e.g. the driver name.
    fn link_name(&self, path: &Path) -> Option<String> {
        self.fs
            .read_link(path)
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
    }

    fn driver(&self, addr: &str) -> Option<String> {
        self.link_name(&Self::device_dir(addr).join("driver"))
    }

    fn iommu_group(&self, addr: &str) -> Option<String> {
        self.link_name(&Self::device_dir(addr).join("iommu_group"))
    }

    /// Whether the device is currently bound to `vfio-pci`.
    pub fn is_bound(&self, addr: &str) -> bool {
        self.driver(addr).as_deref() == Some(VFIO_DRIVER)
    }

    /// Describe one device.
    pub fn device_info(&self, addr: &str) -> Result<PciDevice, VfioError> {
        Self::check_address(addr)?;
        if !self.fs.exists(&Self::device_dir(addr)) {
            return Err(VfioError::NotFound(addr.to_string()));
        }
        Ok(PciDevice {
            address: addr.to_string(),
            vendor: self.read_id(addr, "vendor")?,
            device: self.read_id(addr, "device")?,
            driver: self.driver(addr),
            iommu_group: self.iommu_group(addr),
        })
    }

    /// Check that every device exists and is permitted by `allowlist`.
    pub fn validate_devices(&self, devices: &[String], allowlist: &[String]) -> Result<(), VfioError> {
        for addr in devices {
            Self::check_address(addr)?;
            if !self.fs.exists(&Self::device_dir(addr)) {
                return Err(VfioError::NotFound(addr.clone()));
            }
            let vendor = self.read_id(addr, "vendor")?;
            let device_id = self.read_id(addr, "device")?;
            if !matches_allowlist(&vendor, &device_id, allowlist) {
                return Err(VfioError::NotAllowed {
                    device: addr.clone(),
                    vendor,
                    device_id,
                });
            }
            tracing::debug!(device = %addr, vendor = %vendor, device_id = %device_id, "VFIO device validated");
        }
        Ok(())
    }

    /// Resolve IOMMU groups, merging devices that share one. Groups are
    /// returned in ascending id order.
    pub fn check_iommu_groups(&self, devices: &[String]) -> Result<Vec<IommuGroup>, VfioError> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for addr in devices {
            Self::check_address(addr)?;
            let group = self
                .iommu_group(addr)
                .ok_or_else(|| VfioError::NoIommuGroup(addr.clone()))?;
            groups.entry(group).or_default().push(addr.clone());
        }
        Ok(groups
            .into_iter()
            .map(|(id, devices)| IommuGroup { id, devices })
            .collect())
    }

    /// Bind every device to `vfio-pci`. Devices already bound are left
    /// alone. Returns the devices this call bound, in order.
    ///
    /// A failure stops at the failing device; earlier devices stay bound
    /// and it is up to the caller to unbind them.
    pub fn bind_devices(&self, devices: &[String]) -> Result<Vec<String>, VfioError> {
        let mut bound = Vec::new();
        for addr in devices {
            Self::check_address(addr)?;
            let dir = Self::device_dir(addr);

            match self.driver(addr) {
                Some(driver) if driver == VFIO_DRIVER => {
                    tracing::debug!(device = %addr, "Device already bound to vfio-pci");
                    continue;
                }
                Some(driver) => {
                    tracing::info!(device = %addr, driver = %driver, "Detaching device from host driver");
                    self.write(addr, "unbind", &dir.join("driver").join("unbind"), addr)?;
                }
                None => {}
            }

            self.write(addr, "bind", &dir.join("driver_override"), VFIO_DRIVER)?;
            self.write(addr, "bind", Path::new(VFIO_BIND), addr)?;
            tracing::info!(device = %addr, "Bound device to vfio-pci");
            bound.push(addr.clone());
        }
        Ok(bound)
    }

    /// `/dev/vfio/<group>` paths for the devices, one per group, in
    /// first-seen order.
    pub fn group_paths(&self, devices: &[String]) -> Result<Vec<PathBuf>, VfioError> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for addr in devices {
            Self::check_address(addr)?;
            let group = self
                .iommu_group(addr)
                .ok_or_else(|| VfioError::NoIommuGroup(addr.clone()))?;
            let path = Path::new(VFIO_DEV_DIR).join(&group);
            if !self.fs.exists(&path) {
                return Err(VfioError::GroupDeviceMissing {
                    device: addr.clone(),
                    path,
                });
            }
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Release devices from `vfio-pci` and hand them back to the host.
    /// Devices not bound to `vfio-pci` are skipped.
    pub fn unbind_devices(&self, devices: &[String]) -> Result<(), VfioError> {
        for addr in devices {
            Self::check_address(addr)?;
            if self.driver(addr).as_deref() != Some(VFIO_DRIVER) {
                tracing::debug!(device = %addr, "Device not bound to vfio-pci, skipping");
                continue;
            }

            self.write(addr, "unbind", Path::new(VFIO_UNBIND), addr)?;

            // Let the host driver reclaim the device.
            let dir = Self::device_dir(addr);
            if let Err(e) = self.fs.write(&dir.join("driver_override"), b"\n") {
                tracing::warn!(device = %addr, error = %e, "Failed to clear driver_override");
            }
            if let Err(e) = self.fs.write(Path::new(DRIVERS_PROBE), addr.as_bytes()) {
                tracing::warn!(device = %addr, error = %e, "Failed to reprobe device");
            }
            tracing::info!(device = %addr, "Unbound device from vfio-pci");
        }
        Ok(())
    }

    fn write(&self, addr: &str, action: &'static str, path: &Path, data: &str) -> Result<(), VfioError> {
        self.fs
            .write(path, data.as_bytes())
            .map_err(|source| VfioError::Io {
                device: addr.to_string(),
                action,
                source,
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory sysfs tree.
    #[derive(Default)]
    pub(crate) struct FakeSysFs {
        pub files: Mutex<HashMap<PathBuf, String>>,
        pub links: Mutex<HashMap<PathBuf, PathBuf>>,
        pub writes: Mutex<Vec<(PathBuf, String)>>,
        pub fail_writes: Mutex<HashSet<PathBuf>>,
    }

    impl FakeSysFs {
        pub fn add_device(&self, addr: &str, vendor: &str, device: &str, driver: &str, group: &str) {
            let dir = Path::new(PCI_DEVICES).join(addr);
            let mut files = self.files.lock().unwrap();
            files.insert(dir.clone(), String::new());
            files.insert(dir.join("vendor"), format!("0x{vendor}\n"));
            files.insert(dir.join("device"), format!("0x{device}\n"));

            let mut links = self.links.lock().unwrap();
            if !driver.is_empty() {
                links.insert(
                    dir.join("driver"),
                    PathBuf::from(format!("../../../bus/pci/drivers/{driver}")),
                );
            }
            if !group.is_empty() {
                links.insert(
                    dir.join("iommu_group"),
                    PathBuf::from(format!("../../../../kernel/iommu_groups/{group}")),
                );
                files.insert(Path::new(VFIO_DEV_DIR).join(group), String::new());
            }
        }

        pub fn wrote_to(&self, path: &str) -> bool {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .any(|(p, _)| p == Path::new(path))
        }
    }

    impl SysFs for FakeSysFs {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            if self.fail_writes.lock().unwrap().contains(path) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.writes
                .lock()
                .unwrap()
                .push((path.to_path_buf(), String::from_utf8_lossy(data).into_owned()));

            // Binding is reflected in the driver link, like the kernel does.
            let data = String::from_utf8_lossy(data).into_owned();
            let driver_link = Path::new(PCI_DEVICES).join(&data).join("driver");
            if path == Path::new(VFIO_BIND) {
                self.links.lock().unwrap().insert(
                    driver_link,
                    PathBuf::from("../../../bus/pci/drivers/vfio-pci"),
                );
            } else if path == Path::new(VFIO_UNBIND) {
                self.links.lock().unwrap().remove(&driver_link);
            }
            Ok(())
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(path) || self.links.lock().unwrap().contains_key(path)
        }

        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            self.links
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn manager(fs: &Arc<FakeSysFs>) -> VfioManager {
        VfioManager::new(fs.clone())
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pci_address_format() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:0a:00.7"));
        assert!(is_valid_pci_address("0000:AF:1F.3"));
        assert!(!is_valid_pci_address("0000:01:00.8"));
        assert!(!is_valid_pci_address("01:00.0"));
        assert!(!is_valid_pci_address("0000:01:00"));
        assert!(!is_valid_pci_address("000g:01:00.0"));
        assert!(!is_valid_pci_address(" 0000:01:00.0"));
        assert!(!is_valid_pci_address(""));
    }

    #[test]
    fn test_allowlist() {
        let nvidia = vec!["10de:*".to_string()];
        assert!(matches_allowlist("10de", "2204", &nvidia));
        assert!(!matches_allowlist("8086", "0d26", &nvidia));
        assert!(matches_allowlist("8086", "0d26", &[]));
        assert!(matches_allowlist("10DE", "2204", &nvidia));
        assert!(matches_allowlist("10de", "2204", &["10DE:2204".to_string()]));
        assert!(!matches_allowlist("10de", "2205", &["10de:2204".to_string()]));
        assert!(!matches_allowlist("10de", "2204", &["garbage".to_string()]));
    }

    #[test]
    fn test_validate_devices() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "nvidia", "42");
        fs.add_device("0000:02:00.0", "8086", "0d26", "ixgbe", "43");
        let mgr = manager(&fs);

        assert!(mgr.validate_devices(&addrs(&["0000:01:00.0"]), &[]).is_ok());
        assert!(mgr
            .validate_devices(&addrs(&["0000:01:00.0"]), &["10de:*".into()])
            .is_ok());

        let err = mgr
            .validate_devices(&addrs(&["0000:02:00.0"]), &["10de:*".into()])
            .unwrap_err();
        assert!(err.to_string().contains("not in allowlist"));

        let err = mgr.validate_devices(&addrs(&["0000:09:00.0"]), &[]).unwrap_err();
        assert!(err.to_string().contains("PCI device not found"));

        let err = mgr.validate_devices(&addrs(&["bogus"]), &[]).unwrap_err();
        assert!(err.to_string().contains("invalid PCI address format"));
    }

    #[test]
    fn test_check_iommu_groups() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "nvidia", "42");
        fs.add_device("0000:01:00.1", "10de", "1aef", "snd_hda_intel", "42");
        fs.add_device("0000:02:00.0", "8086", "0d26", "ixgbe", "43");
        fs.add_device("0000:03:00.0", "8086", "0d26", "ixgbe", "");
        let mgr = manager(&fs);

        let groups = mgr
            .check_iommu_groups(&addrs(&["0000:01:00.0", "0000:01:00.1", "0000:02:00.0"]))
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, "42");
        assert_eq!(groups[0].devices.len(), 2);

        let err = mgr.check_iommu_groups(&addrs(&["0000:03:00.0"])).unwrap_err();
        assert!(err.to_string().contains("has no IOMMU group"));
    }

    #[test]
    fn test_bind_devices() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "nvidia", "42");
        fs.add_device("0000:02:00.0", "8086", "0d26", "vfio-pci", "43");
        let mgr = manager(&fs);

        let bound = mgr
            .bind_devices(&addrs(&["0000:01:00.0", "0000:02:00.0"]))
            .unwrap();
        assert_eq!(bound, addrs(&["0000:01:00.0"]));
        assert!(fs.wrote_to(VFIO_BIND));
        assert!(fs.wrote_to("/sys/bus/pci/devices/0000:01:00.0/driver/unbind"));
        assert_eq!(mgr.driver("0000:01:00.0").as_deref(), Some("vfio-pci"));

        assert!(mgr.bind_devices(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_bind_failure_reports_device() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "", "42");
        fs.fail_writes.lock().unwrap().insert(PathBuf::from(VFIO_BIND));
        let mgr = manager(&fs);

        let err = mgr.bind_devices(&addrs(&["0000:01:00.0"])).unwrap_err();
        assert!(err.to_string().contains("0000:01:00.0"));
    }

    #[test]
    fn test_group_paths_dedup() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "vfio-pci", "42");
        fs.add_device("0000:01:00.1", "10de", "2205", "vfio-pci", "42");
        fs.add_device("0000:02:00.0", "8086", "0d26", "vfio-pci", "43");
        let mgr = manager(&fs);

        let paths = mgr
            .group_paths(&addrs(&["0000:01:00.0", "0000:01:00.1"]))
            .unwrap();
        assert_eq!(paths, vec![PathBuf::from("/dev/vfio/42")]);

        let paths = mgr
            .group_paths(&addrs(&["0000:02:00.0", "0000:01:00.0"]))
            .unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from("/dev/vfio/43"), PathBuf::from("/dev/vfio/42")]
        );
    }

    #[test]
    fn test_group_path_missing() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "vfio-pci", "42");
        fs.files.lock().unwrap().remove(Path::new("/dev/vfio/42"));
        let mgr = manager(&fs);

        assert!(matches!(
            mgr.group_paths(&addrs(&["0000:01:00.0"])),
            Err(VfioError::GroupDeviceMissing { .. })
        ));
    }

    #[test]
    fn test_device_info() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "nvidia", "42");
        let mgr = manager(&fs);

        let info = mgr.device_info("0000:01:00.0").unwrap();
        assert_eq!(info.vendor, "10de");
        assert_eq!(info.device, "2204");
        assert_eq!(info.driver.as_deref(), Some("nvidia"));
        assert_eq!(info.iommu_group.as_deref(), Some("42"));

        assert!(mgr.device_info("invalid").is_err());
        assert!(mgr.device_info("0000:05:00.0").is_err());
    }

    #[test]
    fn test_unbind_devices() {
        let fs = Arc::new(FakeSysFs::default());
        fs.add_device("0000:01:00.0", "10de", "2204", "vfio-pci", "42");
        fs.add_device("0000:02:00.0", "8086", "0d26", "ixgbe", "43");
        let mgr = manager(&fs);

        mgr.unbind_devices(&addrs(&["0000:01:00.0", "0000:02:00.0"]))
            .unwrap();
        let writes = fs.writes.lock().unwrap();
        let unbinds: Vec<_> = writes
            .iter()
            .filter(|(p, _)| p == Path::new(VFIO_UNBIND))
            .collect();
        assert_eq!(unbinds.len(), 1);
        assert_eq!(unbinds[0].1, "0000:01:00.0");
    }
}
