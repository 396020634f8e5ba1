//! Guest network settings derived from the driver defaults, the task's
//! bridge override and the address actually assigned to the VM.

use crate::allocator::{netmask_dotted, Ipv4Net};
use crate::domain::DomainConfig;
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub const GUEST_INTERFACE: &str = "eth0";
const FALLBACK_NETMASK: &str = "255.255.255.0";

/// Driver-wide defaults used when the task does not override them.
#[derive(Debug, Clone)]
pub struct NetworkDefaults {
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub nameservers: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub address: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub prefix_len: u8,
    pub nameservers: Vec<Ipv4Addr>,
    pub interface: String,
}

impl NetworkSettings {
    pub fn netmask(&self) -> String {
        netmask_dotted(self.prefix_len).unwrap_or_else(|| FALLBACK_NETMASK.to_string())
    }

    /// Kernel `ip=` parameter: `ip=<addr>::<gw>:<mask>::<iface>:off`.
    pub fn kernel_ip_param(&self) -> String {
        let gateway = self.gateway.map(|g| g.to_string()).unwrap_or_default();
        format!(
            "ip={}::{}:{}::{}:off",
            self.address,
            gateway,
            self.netmask(),
            self.interface
        )
    }

    /// Publish the settings as `VM_*` variables, replacing stale values.
    pub fn apply_to_env(&self, env: &mut HashMap<String, String>) {
        env.insert("VM_IP".into(), self.address.to_string());
        env.insert("VM_CIDR".into(), self.prefix_len.to_string());
        match self.gateway {
            Some(gw) => {
                env.insert("VM_GATEWAY".into(), gw.to_string());
            }
            None => {
                env.remove("VM_GATEWAY");
            }
        }
        if self.nameservers.is_empty() {
            env.remove("VM_DNS");
        } else {
            let dns = self
                .nameservers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            env.insert("VM_DNS".into(), dns);
        }
    }
}

/// Resolve the guest network settings.
///
/// The address comes from the VM's assigned IP when there is one, else the
/// bridge `static_ip`. Gateway, prefix length and nameservers come from the
/// bridge override when present, else the driver defaults. Returns `None`
/// when no address can be resolved.
pub fn derive_network_settings(
    config: &DomainConfig,
    assigned: Option<Ipv4Addr>,
    defaults: &NetworkDefaults,
) -> Option<NetworkSettings> {
    let bridge = config.bridge();

    let address = assigned.or_else(|| bridge.and_then(|b| b.static_ip))?;

    let mut settings = NetworkSettings {
        address,
        gateway: Some(defaults.gateway),
        prefix_len: defaults.subnet.prefix(),
        nameservers: defaults.nameservers.clone(),
        interface: GUEST_INTERFACE.to_string(),
    };

    if let Some(bridge) = bridge {
        if let Some(gw) = bridge.gateway {
            settings.gateway = Some(gw);
        }
        if let Some(mask) = bridge.netmask.as_deref().filter(|m| !m.is_empty()) {
            match mask.trim().parse::<u8>() {
                Ok(bits) if bits <= 32 => settings.prefix_len = bits,
                _ => tracing::warn!(
                    vm = %config.name,
                    value = mask,
                    "Invalid bridge netmask, using default prefix length"
                ),
            }
        }
        if !bridge.dns.is_empty() {
            settings.nameservers = bridge.dns.clone();
        }
    }

    Some(settings)
}

/// Append the kernel `ip=` parameter unless the command line already
/// carries one.
pub fn with_ip_param(cmdline: &str, settings: &NetworkSettings) -> String {
    if cmdline.split_whitespace().any(|arg| arg.starts_with("ip=")) {
        return cmdline.to_string();
    }
    let param = settings.kernel_ip_param();
    if cmdline.trim().is_empty() {
        param
    } else {
        format!("{} {param}", cmdline.trim_end())
    }
}
