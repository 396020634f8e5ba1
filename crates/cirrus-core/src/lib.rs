//! # cirrus-core
//!
//! Host-side lifecycle management for Cloud Hypervisor VMs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    cirrus-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │     Driver      │────▶│  HashMap<name,VmProcess> │    │
//! │  │  - create()     │     │  IpAllocator             │    │
//! │  │  - stop()       │     └──────────────────────────┘    │
//! │  │  - destroy()    │                                     │
//! │  └─────────────────┘                                     │
//! │     │       │      │                                     │
//! │     ▼       ▼      ▼                                     │
//! │  ip(8)   sysfs   cloud-hypervisor ── api.sock (REST)     │
//! │  TAPs    VFIO    virtiofsd                               │
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  PortForwarder  │────▶│ iptables CIRRUS_PRT/_FW  │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cirrus_core::{Driver, DriverConfig, DomainConfig, HostCapabilities};
//! use std::collections::HashMap;
//!
//! # async fn example() -> cirrus_core::Result<()> {
//! let config = DriverConfig::from_env()?;
//! let driver = Driver::new(config.clone(), HostCapabilities::system(&config))?;
//! driver.start().await?;
//!
//! let domain = DomainConfig {
//!     name: "web-1".into(),
//!     cpus: 2,
//!     memory_mib: 1024,
//!     base_image: "/var/lib/cirrus/images/jammy.img".into(),
//!     ..Default::default()
//! };
//! driver.create_domain(domain, HashMap::new()).await?;
//! println!("{:?}", driver.get_domain("web-1").await?);
//!
//! driver.destroy_domain("web-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod bootconfig;
mod config;
mod domain;
mod driver;
pub mod envfile;
mod error;
pub mod firewall;
pub mod host;
pub mod identity;
pub mod lease;
mod portforward;
mod process;
pub mod settings;
pub mod vfio;

pub use allocator::{IpAllocator, Ipv4Net};
pub use bootconfig::{BootConfig, BootConfigWriter, CloudLocalds};
pub use config::{
    CloudHypervisorConfig, DriverConfig, NetworkConfig, VfioConfig, CONFIG_ENV, DATA_DIR_ENV,
    DEFAULT_CONFIG_PATH,
};
pub use domain::{BridgeConfig, DomainConfig, FsMount, GuestFile, NetworkInterfaceConfig, MIN_MEMORY_MIB};
pub use driver::{Driver, HostCapabilities, DEFAULT_CMDLINE};
pub use error::{
    AllocError, ConfigError, DriverError, HostError, PortForwardError, Result, RuleFailure, Stage,
    VfioError,
};
pub use firewall::{Iptables, PacketFilter, Rule};
pub use portforward::{
    PortForwarder, ReservedPort, TeardownSpec, VmStartedBuildRequest, VmStartedBuildResponse,
    FILTER_TABLE, FORWARD_CHAIN, NAT_TABLE, PREROUTING_CHAIN,
};
pub use process::{DomainInfo, NetworkInterface, VirtualizerInfo, VmProcess};
pub use vfio::{SysFs, VfioManager};
