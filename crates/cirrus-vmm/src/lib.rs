//! # cirrus-vmm
//!
//! Control layer for Cloud Hypervisor: the `vm.create` payload model and a
//! small client for the per-VM REST API socket.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cirrus_vmm::{VmConfigBuilder, VmmClient, VmState};
//!
//! # async fn example() -> cirrus_vmm::Result<()> {
//! let config = VmConfigBuilder::new()
//!     .vcpus(2)
//!     .memory_mib(512)
//!     .kernel("/var/lib/cirrus/vmlinux")
//!     .disk("/var/lib/cirrus/images/rootfs.img", false)
//!     .build()?;
//!
//! // The VMM process must already be listening on the socket.
//! let client = VmmClient::new("/var/lib/cirrus/vm1/api.sock");
//! client.create_and_boot(&config).await?;
//! assert_eq!(client.info().await?.state, VmState::Running);
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
mod config;
mod error;
mod state;

pub use builder::VmConfigBuilder;
pub use client::{
    ControlPlane, UnixSocketControl, VmInfo, VmmClient, VmmPing, DEFAULT_REQUEST_TIMEOUT,
};
pub use config::{
    ConsoleConfig, CpusConfig, DeviceConfig, DiskConfig, FsConfig, MemoryConfig, NetConfig,
    PayloadConfig, PlatformConfig, RngConfig, SerialConfig, VmConfig, VsockConfig,
};
pub use error::{Result, VmmError};
pub use state::VmState;
