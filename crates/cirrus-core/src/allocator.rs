//! IPv4 subnet arithmetic and the guest address pool.

use crate::config::NetworkConfig;
use crate::error::{AllocError, ConfigError};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network in CIDR form, normalised to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ConfigError> {
        if prefix > 32 {
            return Err(ConfigError::Invalid(format!(
                "prefix length {prefix} exceeds 32"
            )));
        }
        let network = Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix));
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix) == u32::from(self.network)
    }

    /// The address after the network address, used as the implicit gateway.
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network).saturating_add(1))
    }
}

impl FromStr for Ipv4Net {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("invalid CIDR {s:?}"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Netmask for a prefix length, `0` through `32`.
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

/// Dotted-quad netmask for a prefix length. Out-of-range lengths yield `None`.
pub fn netmask_dotted(prefix: u8) -> Option<String> {
    (prefix <= 32).then(|| Ipv4Addr::from(prefix_mask(prefix)).to_string())
}

/// Guest address pool.
///
/// Every allocated address lies inside the subnet and is never the gateway.
/// Allocation walks the pool in address order from `pool_start` and fails
/// once `pool_end` is reached; it never wraps.
#[derive(Debug, Clone)]
pub struct IpAllocator {
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    pool_start: Ipv4Addr,
    pool_end: Ipv4Addr,
    allocated: HashSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Build and validate a pool from the driver network settings.
    ///
    /// # Errors
    /// Returns a configuration error if the bridge name is missing, the
    /// subnet does not parse, the gateway or pool bounds fall outside the
    /// subnet, the pool is inverted, or the gateway equals the pool start.
    pub fn from_config(config: &NetworkConfig) -> Result<Self, ConfigError> {
        if config.bridge.trim().is_empty() {
            return Err(ConfigError::Invalid("network bridge is not configured".into()));
        }
        let subnet: Ipv4Net = config.subnet_cidr.parse()?;
        let gateway = config.gateway.unwrap_or_else(|| subnet.first_host());
        Self::new(subnet, gateway, config.ip_pool_start, config.ip_pool_end)
    }

    pub fn new(
        subnet: Ipv4Net,
        gateway: Ipv4Addr,
        pool_start: Ipv4Addr,
        pool_end: Ipv4Addr,
    ) -> Result<Self, ConfigError> {
        if !subnet.contains(gateway) {
            return Err(ConfigError::Invalid(format!(
                "gateway {gateway} must be within {subnet}"
            )));
        }
        if !subnet.contains(pool_start) || !subnet.contains(pool_end) {
            return Err(ConfigError::Invalid(format!(
                "IP pool {pool_start}-{pool_end} must fall within subnet {subnet}"
            )));
        }
        if pool_end < pool_start {
            return Err(ConfigError::Invalid(format!(
                "ip_pool_end {pool_end} precedes ip_pool_start {pool_start}"
            )));
        }
        if gateway == pool_start {
            return Err(ConfigError::Invalid(format!(
                "gateway {gateway} conflicts with ip_pool_start"
            )));
        }

        Ok(Self {
            subnet,
            gateway,
            pool_start,
            pool_end,
            allocated: HashSet::new(),
        })
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Take the lowest free address in the pool.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, AllocError> {
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);

        for raw in start..=end {
            let ip = Ipv4Addr::from(raw);
            if ip == self.gateway || self.allocated.contains(&ip) {
                continue;
            }
            self.allocated.insert(ip);
            return Ok(ip);
        }

        Err(AllocError::NoAvailableAddress)
    }

    /// Reserve a caller-chosen address. It may lie outside the pool but
    /// must be inside the subnet.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> Result<Ipv4Addr, AllocError> {
        if !self.subnet.contains(ip) {
            return Err(AllocError::OutsideSubnet(ip));
        }
        if ip == self.gateway {
            return Err(AllocError::Gateway(ip));
        }
        if !self.allocated.insert(ip) {
            return Err(AllocError::AlreadyAllocated(ip));
        }
        Ok(ip)
    }

    /// Return an address to the pool. Unknown addresses are ignored.
    pub fn release(&mut self, ip: Ipv4Addr) {
        self.allocated.remove(&ip);
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated.contains(&ip)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}
