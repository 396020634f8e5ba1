//! VM lifecycle controller.
//!
//! The [`Driver`] owns the registry of running VMs and the IP pool. A
//! creation runs every step under the registry write lock and records an
//! undo action for each completed step, so a failure anywhere unwinds the
//! host back to where it started before the error is returned.

use crate::allocator::IpAllocator;
use crate::bootconfig::{BootConfig, BootConfigWriter, CloudLocalds, SEED_IMAGE};
use crate::config::DriverConfig;
use crate::domain::DomainConfig;
use crate::envfile::{env_file, upsert_file};
use crate::error::{ConfigError, DriverError, Result, Stage};
use crate::host::{HostNetwork, HostProcesses, IpRoute2, ProcessLauncher, VirtiofsdLaunch, VmmLaunch};
use crate::identity::{derive_mac, derive_tap_name, parse_mac_prefix};
use crate::process::{parse_major_version, DomainInfo, NetworkInterface, VirtualizerInfo, VmProcess};
use crate::settings::{derive_network_settings, with_ip_param, NetworkDefaults, NetworkSettings};
use crate::vfio::{HostSysFs, SysFs, VfioManager};
use chrono::Utc;
use cirrus_vmm::{
    ControlPlane, DeviceConfig, FsConfig, NetConfig, PlatformConfig, SerialConfig, UnixSocketControl,
    VmConfig, VmConfigBuilder, VmState,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Kernel command line used when neither the task nor the driver sets one.
pub const DEFAULT_CMDLINE: &str = "console=ttyS0 root=/dev/vda1 rw";

const DEFAULT_PCI_SEGMENTS: u16 = 1;
const DEFAULT_IOMMU_ADDRESS_WIDTH: u8 = 48;

/// The host-facing collaborators the driver works through.
#[derive(Clone)]
pub struct HostCapabilities {
    pub control: Arc<dyn ControlPlane>,
    pub network: Arc<dyn HostNetwork>,
    pub processes: Arc<dyn ProcessLauncher>,
    pub sysfs: Arc<dyn SysFs>,
    /// `None` skips the seed volume.
    pub boot_config: Option<Arc<dyn BootConfigWriter>>,
}

impl HostCapabilities {
    /// Real implementations for this host.
    pub fn system(config: &DriverConfig) -> Self {
        Self {
            control: Arc::new(UnixSocketControl::new(config.cloud_hypervisor.api_timeout())),
            network: Arc::new(IpRoute2::default()),
            processes: Arc::new(HostProcesses::new()),
            sysfs: Arc::new(HostSysFs),
            boot_config: CloudLocalds::detect().map(|w| Arc::new(w) as Arc<dyn BootConfigWriter>),
        }
    }
}

struct Registry {
    processes: HashMap<String, VmProcess>,
    allocator: IpAllocator,
}

/// A completed creation step and how to reverse it.
#[derive(Debug)]
enum Undo {
    ReleaseIp(Ipv4Addr),
    DeleteTap(String),
    StopHelper(u32),
    UnbindVfio(Vec<String>),
    KillVmm(u32),
}

trait StageExt<T> {
    fn stage(self, name: &str, stage: Stage) -> Result<T>;
}

impl<T, E: Into<DriverError>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, name: &str, stage: Stage) -> Result<T> {
        self.map_err(|e| e.into().during(name, stage))
    }
}

/// Lifecycle controller for Cloud Hypervisor VMs on this host.
///
/// Creation and destruction take the registry write lock for their whole
/// duration; queries share the read lock.
///
/// Port-forwarding rules are not owned here. The caller keeps the
/// [`TeardownSpec`](crate::TeardownSpec) returned by
/// [`PortForwarder::vm_started_build`](crate::PortForwarder::vm_started_build)
/// and passes it, unmodified, to
/// [`PortForwarder::vm_terminated_teardown`](crate::PortForwarder::vm_terminated_teardown)
/// after [`Driver::destroy_domain`] returns.
pub struct Driver {
    config: DriverConfig,
    state: RwLock<Registry>,
    vfio: VfioManager,
    control: Arc<dyn ControlPlane>,
    network: Arc<dyn HostNetwork>,
    processes: Arc<dyn ProcessLauncher>,
    boot_config: Option<Arc<dyn BootConfigWriter>>,
    mac_prefix: Vec<u8>,
    defaults: NetworkDefaults,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("data_dir", &self.config.data_dir)
            .field("bridge", &self.config.network.bridge)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Validate the network configuration and build the driver. Nothing on
    /// the host is touched until [`Driver::start`].
    ///
    /// # Errors
    /// Any network configuration problem is returned here.
    pub fn new(config: DriverConfig, host: HostCapabilities) -> std::result::Result<Self, ConfigError> {
        let allocator = IpAllocator::from_config(&config.network)?;
        let mac_prefix = parse_mac_prefix(&config.network.mac_prefix)?;
        let defaults = NetworkDefaults {
            subnet: allocator.subnet(),
            gateway: allocator.gateway(),
            nameservers: config.network.nameservers.clone(),
        };

        tracing::info!(
            bridge = %config.network.bridge,
            subnet = %defaults.subnet,
            gateway = %defaults.gateway,
            pool_start = %config.network.ip_pool_start,
            pool_end = %config.network.ip_pool_end,
            "Network configuration validated"
        );

        Ok(Self {
            state: RwLock::new(Registry {
                processes: HashMap::new(),
                allocator,
            }),
            vfio: VfioManager::new(host.sysfs),
            control: host.control,
            network: host.network,
            processes: host.processes,
            boot_config: host.boot_config,
            mac_prefix,
            defaults,
            config,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Prepare the host: check binaries, bring up the bridge and create the
    /// data directory.
    pub async fn start(&self) -> Result<()> {
        self.config.validate_binaries()?;

        let bridge = &self.config.network.bridge;
        self.network
            .ensure_bridge(bridge, self.defaults.gateway, self.defaults.subnet.prefix())
            .await?;

        tokio::fs::create_dir_all(&self.config.data_dir).await?;

        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            bridge = %bridge,
            "Cloud Hypervisor driver started"
        );
        Ok(())
    }

    /// Create and boot a VM.
    ///
    /// `env` is published to the guest through the environment hand-off
    /// file, extended with the VM's network settings.
    ///
    /// # Errors
    /// Returns [`DriverError::AlreadyExists`] for a duplicate name before
    /// anything is allocated. Any later failure is wrapped with the stage
    /// that failed, after every completed step has been reversed.
    pub async fn create_domain(&self, config: DomainConfig, env: HashMap<String, String>) -> Result<()> {
        let name = config.name.clone();
        let mut state = self.state.write().await;

        if state.processes.contains_key(&name) {
            return Err(DriverError::AlreadyExists(name));
        }

        tracing::info!(vm = %name, "Creating VM");

        let mut undo = Vec::new();
        match self.build(&mut state.allocator, config, env, &mut undo).await {
            Ok(proc) => {
                tracing::info!(
                    vm = %name,
                    pid = proc.pid,
                    ip = %proc.ip,
                    mac = %proc.mac,
                    tap = %proc.tap,
                    "VM created"
                );
                state.processes.insert(name, proc);
                Ok(())
            }
            Err(e) => {
                tracing::error!(vm = %name, error = %e, "VM creation failed, rolling back");
                self.unwind(&name, &mut state.allocator, undo).await;
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        allocator: &mut IpAllocator,
        mut config: DomainConfig,
        mut env: HashMap<String, String>,
        undo: &mut Vec<Undo>,
    ) -> Result<VmProcess> {
        let name = config.name.clone();
        let ch = &self.config.cloud_hypervisor;

        config
            .validate(&self.config.image_paths)
            .map_err(DriverError::Validation)
            .stage(&name, Stage::Validate)?;

        let work_dir = self.config.data_dir.join(name.replace('/', "-"));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .stage(&name, Stage::WorkDir)?;
        let api_socket = work_dir.join("api.sock");
        let log_file = ch.log_file.clone().unwrap_or_else(|| work_dir.join("vmm.log"));

        let ip = match config.bridge().and_then(|b| b.static_ip) {
            Some(ip) => {
                tracing::info!(vm = %name, %ip, "Using task-specified static IP");
                allocator.reserve(ip)
            }
            None => allocator.allocate(),
        }
        .stage(&name, Stage::AllocateIp)?;
        undo.push(Undo::ReleaseIp(ip));
        tracing::debug!(vm = %name, %ip, "Allocated IP");

        let mac = derive_mac(&self.mac_prefix, &name);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let tap = derive_tap_name(&self.config.network.tap_prefix, &name, nanos);

        let settings = derive_network_settings(&config, Some(ip), &self.defaults);
        if let Some(settings) = &settings {
            settings.apply_to_env(&mut env);
        }
        if let Some(file) = env_file(&env) {
            upsert_file(&mut config.files, file);
        }

        let seed = match &self.boot_config {
            Some(writer) => {
                let path = work_dir.join(SEED_IMAGE);
                let boot = BootConfig::for_domain(&config, &mac, settings.clone());
                writer.write(&boot, &path).await.stage(&name, Stage::BootConfig)?;
                Some(path)
            }
            None => {
                tracing::debug!(vm = %name, "No boot config writer, skipping seed volume");
                None
            }
        };

        let bridge = config
            .bridge()
            .map(|b| b.name.clone())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| self.config.network.bridge.clone());
        self.network
            .create_tap(&tap, &bridge)
            .await
            .stage(&name, Stage::Networking)?;
        undo.push(Undo::DeleteTap(tap.clone()));

        let mut helper_pids = Vec::new();
        let mut shares = Vec::new();
        for mount in &config.fs_mounts {
            let socket = work_dir.join(format!("fs-{}.sock", mount.tag));
            let launch = VirtiofsdLaunch {
                bin: ch.virtiofsd_bin.clone(),
                socket: socket.clone(),
                shared_dir: mount.source.clone(),
                log_file: work_dir.join(format!("virtiofsd-{}.log", mount.tag)),
                startup_timeout: ch.startup_timeout(),
            };
            let pid = self
                .processes
                .launch_virtiofsd(&launch)
                .await
                .stage(&name, Stage::FsMounts)?;
            undo.push(Undo::StopHelper(pid));
            helper_pids.push(pid);
            shares.push(FsConfig {
                tag: mount.tag.clone(),
                socket,
                num_queues: mount.num_queues,
                queue_size: mount.queue_size,
            });
        }

        let nic = NetConfig {
            tap: tap.clone(),
            mac: mac.clone(),
            ip: Some(ip.to_string()),
            mask: settings.as_ref().map(NetworkSettings::netmask),
        };
        let mut vm_config = self
            .vm_config(&config, nic, settings.as_ref(), &work_dir, seed.as_deref(), shares)
            .stage(&name, Stage::BuildConfig)?;

        let vfio_devices = if config.vfio_devices.is_empty() {
            Vec::new()
        } else {
            self.attach_vfio(&config, &mut vm_config, undo)
                .stage(&name, Stage::Vfio)?
        };

        let launch = VmmLaunch {
            bin: ch.bin.clone(),
            api_socket: api_socket.clone(),
            log_file: log_file.clone(),
            seccomp: ch.seccomp,
            startup_timeout: ch.startup_timeout(),
        };
        let pid = self
            .processes
            .launch_vmm(&launch)
            .await
            .stage(&name, Stage::Launch)?;
        undo.push(Undo::KillVmm(pid));

        self.control
            .create_and_boot(&api_socket, &vm_config)
            .await
            .stage(&name, Stage::Boot)?;

        Ok(VmProcess {
            name,
            pid,
            api_socket,
            log_file,
            work_dir,
            bridge,
            tap,
            mac,
            ip,
            helper_pids,
            vfio_devices,
            config: vm_config,
            started_at: Utc::now(),
        })
    }

    /// Assemble the VMM payload for a domain.
    fn vm_config(
        &self,
        config: &DomainConfig,
        nic: NetConfig,
        settings: Option<&NetworkSettings>,
        work_dir: &Path,
        seed: Option<&Path>,
        shares: Vec<FsConfig>,
    ) -> Result<VmConfig> {
        let ch = &self.config.cloud_hypervisor;

        let mut builder = VmConfigBuilder::new()
            .vcpus(config.cpus)
            .memory_mib(config.memory_mib)
            .shared_memory(config.memory_shared)
            .hugepages(config.memory_hugepages);
        if let Some(max) = config.max_vcpus {
            builder = builder.max_vcpus(max.max(config.cpus));
        }
        for feature in &config.features {
            builder = builder.cpu_feature(feature);
        }
        if let Some(method) = &config.hotplug_method {
            builder = builder.memory_hotplug(method, config.hotplug_size_mib.unwrap_or(0));
        }

        match config.kernel.as_ref().or(ch.default_kernel.as_ref()) {
            Some(kernel) => {
                builder = builder.kernel(kernel);
                if let Some(initramfs) = config.initramfs.as_ref().or(ch.default_initramfs.as_ref()) {
                    builder = builder.initramfs(initramfs);
                }
                let base = config.cmdline.as_deref().unwrap_or(DEFAULT_CMDLINE);
                let cmdline = match settings {
                    Some(settings) => with_ip_param(base, settings),
                    None => base.to_string(),
                };
                builder = builder.cmdline(cmdline);
            }
            None => match &ch.firmware {
                Some(firmware) => builder = builder.firmware(firmware),
                None => {
                    return Err(ConfigError::Invalid(
                        "no kernel or firmware configured".into(),
                    )
                    .into())
                }
            },
        }

        builder = builder.disk(&config.base_image, false);
        if let Some(seed) = seed {
            builder = builder.disk(seed, true);
        }
        for disk in &config.disks {
            builder = builder.with_disk_config(disk.clone());
        }

        builder = builder.net(nic);
        builder = match &config.rng {
            Some(rng) => builder.rng(&rng.src),
            None => builder.rng(cirrus_vmm::RngConfig::default().src),
        };
        if let Some(vsock) = &config.vsock {
            builder = builder.vsock(vsock.cid, &vsock.socket);
        }
        for share in shares {
            builder = builder.fs(share);
        }
        if let Some(platform) = &config.platform {
            builder = builder.platform(platform.clone());
        }
        for device in &config.devices {
            builder = builder.device(device.clone());
        }
        builder = builder.serial(SerialConfig::to_file(work_dir.join("serial.log")));

        Ok(builder.build()?)
    }

    /// Validate, bind and attach the domain's passthrough devices. Returns
    /// the devices this call moved onto `vfio-pci`.
    fn attach_vfio(
        &self,
        config: &DomainConfig,
        vm_config: &mut VmConfig,
        undo: &mut Vec<Undo>,
    ) -> Result<Vec<String>> {
        let devices = &config.vfio_devices;
        let vfio_config = &self.config.vfio;

        tracing::info!(vm = %config.name, devices = ?devices, "Configuring VFIO passthrough");
        if vfio_config.allowlist.is_empty() {
            tracing::warn!(vm = %config.name, "No VFIO allowlist configured, all devices are allowed");
        }

        self.vfio.validate_devices(devices, &vfio_config.allowlist)?;
        let groups = self.vfio.check_iommu_groups(devices)?;
        for group in &groups {
            tracing::debug!(group = %group.id, devices = ?group.devices, "IOMMU group");
        }

        // Devices already on vfio-pci belong to someone else.
        let ours: Vec<String> = devices
            .iter()
            .filter(|d| !self.vfio.is_bound(d))
            .cloned()
            .collect();
        undo.push(Undo::UnbindVfio(ours.clone()));

        self.vfio.bind_devices(devices)?;
        let group_paths = self.vfio.group_paths(devices)?;

        let platform = vm_config.platform.get_or_insert_with(PlatformConfig::default);
        if platform.num_pci_segments.is_none() {
            platform.num_pci_segments = Some(vfio_config.pci_segments.unwrap_or(DEFAULT_PCI_SEGMENTS));
        }
        if platform.iommu_address_width.is_none() {
            platform.iommu_address_width =
                Some(vfio_config.iommu_address_width.unwrap_or(DEFAULT_IOMMU_ADDRESS_WIDTH));
        }
        if platform.iommu_segments.is_empty() {
            platform.iommu_segments = vec![0];
        }

        for (i, path) in group_paths.iter().enumerate() {
            vm_config.devices.push(DeviceConfig {
                path: path.clone(),
                id: Some(format!("vfio-{i}")),
                iommu: true,
                pci_segment: 0,
            });
        }
        vm_config.validate()?;

        tracing::info!(
            vm = %config.name,
            devices = devices.len(),
            groups = group_paths.len(),
            "VFIO passthrough configured"
        );
        Ok(ours)
    }

    /// Reverse completed creation steps, newest first. Failures are logged
    /// so the rest of the unwind still runs.
    async fn unwind(&self, name: &str, allocator: &mut IpAllocator, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            tracing::debug!(vm = %name, step = ?step, "Rolling back");
            match step {
                Undo::KillVmm(pid) | Undo::StopHelper(pid) => {
                    if let Err(e) = self.processes.terminate(pid, Duration::ZERO).await {
                        tracing::warn!(vm = %name, pid, error = %e, "Failed to kill process");
                    }
                }
                Undo::UnbindVfio(devices) => {
                    if let Err(e) = self.vfio.unbind_devices(&devices) {
                        tracing::warn!(vm = %name, error = %e, "Failed to unbind VFIO devices");
                    }
                }
                Undo::DeleteTap(tap) => {
                    if let Err(e) = self.network.delete_tap(&tap).await {
                        tracing::warn!(vm = %name, tap = %tap, error = %e, "Failed to delete TAP");
                    }
                }
                Undo::ReleaseIp(ip) => allocator.release(ip),
            }
        }
    }

    /// Shut a VM down, killing the VMM if the guest does not respond. The
    /// registry entry and IP stay in place.
    pub async fn stop_domain(&self, name: &str) -> Result<()> {
        let state = self.state.write().await;
        let proc = state
            .processes
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        tracing::info!(vm = %name, "Stopping VM");
        if let Err(e) = self.control.shutdown(&proc.api_socket).await {
            tracing::warn!(vm = %name, error = %e, "Graceful shutdown failed, forcing stop");
            self.processes.terminate(proc.pid, Duration::ZERO).await?;
        }
        Ok(())
    }

    /// Stop a VM and release everything it holds.
    pub async fn destroy_domain(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let proc = state
            .processes
            .remove(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        tracing::info!(vm = %name, "Destroying VM");
        if let Err(e) = self.control.shutdown(&proc.api_socket).await {
            tracing::debug!(vm = %name, error = %e, "Graceful shutdown failed");
        }
        self.release(&proc, self.config.cloud_hypervisor.shutdown_timeout())
            .await;
        state.allocator.release(proc.ip);

        tracing::info!(vm = %name, "VM destroyed");
        Ok(())
    }

    /// Force-stop every registered VM. Used when the daemon exits.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.write().await;
        let procs: Vec<VmProcess> = state.processes.drain().map(|(_, p)| p).collect();
        if procs.is_empty() {
            return;
        }

        tracing::info!(count = procs.len(), "Stopping all VMs");
        for proc in procs {
            self.release(&proc, Duration::ZERO).await;
            state.allocator.release(proc.ip);
            tracing::info!(vm = %proc.name, "VM stopped");
        }
    }

    /// Tear down a VM's processes and host resources.
    async fn release(&self, proc: &VmProcess, grace: Duration) {
        if let Err(e) = self.processes.terminate(proc.pid, grace).await {
            tracing::warn!(vm = %proc.name, pid = proc.pid, error = %e, "Failed to stop VMM");
        }
        for pid in &proc.helper_pids {
            if let Err(e) = self.processes.terminate(*pid, grace).await {
                tracing::warn!(vm = %proc.name, pid, error = %e, "Failed to stop virtiofsd");
            }
        }
        if !proc.vfio_devices.is_empty() {
            if let Err(e) = self.vfio.unbind_devices(&proc.vfio_devices) {
                tracing::warn!(vm = %proc.name, error = %e, "Failed to unbind VFIO devices");
            }
        }
        if let Err(e) = self.network.delete_tap(&proc.tap).await {
            tracing::warn!(vm = %proc.name, tap = %proc.tap, error = %e, "Failed to delete TAP");
        }
        if let Err(e) = tokio::fs::remove_file(&proc.api_socket).await {
            tracing::debug!(
                vm = %proc.name,
                socket = %proc.api_socket.display(),
                error = %e,
                "API socket not removed"
            );
        }
    }

    /// Current state of a VM, or `None` if it is not registered.
    ///
    /// When the VMM API does not answer, the process is checked directly.
    pub async fn get_domain(&self, name: &str) -> Result<Option<DomainInfo>> {
        let state = self.state.read().await;
        let Some(proc) = state.processes.get(name) else {
            return Ok(None);
        };

        match self.control.info(&proc.api_socket).await {
            Ok(info) => Ok(Some(DomainInfo {
                state: info.state,
                memory: info.memory_actual_size,
                max_memory: info.memory_actual_size,
            })),
            Err(e) => {
                let alive = proc.pid > 0 && self.processes.is_alive(proc.pid);
                tracing::debug!(vm = %name, error = %e, alive, "VM info unavailable, checked process");
                Ok(Some(DomainInfo {
                    state: if alive { VmState::Running } else { VmState::Shutoff },
                    memory: None,
                    max_memory: None,
                }))
            }
        }
    }

    pub async fn get_network_interfaces(&self, name: &str) -> Result<Vec<NetworkInterface>> {
        let state = self.state.read().await;
        let proc = state
            .processes
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        Ok(vec![NetworkInterface {
            network_name: proc.bridge.clone(),
            device_name: proc.tap.clone(),
            mac: proc.mac.clone(),
            model: "virtio".to_string(),
            driver: "virtio-net".to_string(),
            addrs: vec![proc.ip],
        }])
    }

    pub async fn get_info(&self) -> VirtualizerInfo {
        let emulator_version = match self.processes.version(&self.config.cloud_hypervisor.bin).await {
            Ok(output) => parse_major_version(&output),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read VMM version");
                0
            }
        };
        VirtualizerInfo {
            model: "cloud-hypervisor".to_string(),
            emulator_version,
            running_domains: self.state.read().await.processes.len(),
        }
    }

    /// Names of registered VMs, sorted.
    pub async fn list_domains(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.processes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of a registered VM.
    pub async fn process(&self, name: &str) -> Option<VmProcess> {
        self.state.read().await.processes.get(name).cloned()
    }

    /// Work directory a VM with this name uses.
    pub fn work_dir(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name.replace('/', "-"))
    }
}
