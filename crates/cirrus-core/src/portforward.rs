//! Inbound port mapping through two driver-owned firewall chains.
//!
//! `CIRRUS_PRT` in the nat table holds the DNAT rules and is jumped to from
//! `PREROUTING`; `CIRRUS_FW` in the filter table accepts the forwarded
//! connections and is jumped to from `FORWARD`. Every rule added for a VM is
//! returned in a [`TeardownSpec`] so removal replays exactly what was added.

use crate::config::NetworkConfig;
use crate::domain::NetworkInterfaceConfig;
use crate::error::{ConfigError, HostError, PortForwardError, RuleFailure};
use crate::firewall::{Iptables, PacketFilter, Rule};
use crate::host::{HostInterfaces, InterfaceResolver};
use crate::identity::{derive_mac, parse_mac_prefix};
use crate::lease::{lookup_lease, DEFAULT_LEASE_FILE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

pub const NAT_TABLE: &str = "nat";
pub const FILTER_TABLE: &str = "filter";
pub const PREROUTING_CHAIN: &str = "CIRRUS_PRT";
pub const FORWARD_CHAIN: &str = "CIRRUS_FW";

/// A host port reserved for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedPort {
    pub host_ip: Ipv4Addr,
    /// Port on the host.
    pub value: u16,
    /// Port inside the guest.
    pub to: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmStartedBuildRequest {
    pub domain_name: String,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    /// Reserved ports by label.
    pub reserved_ports: HashMap<String, ReservedPort>,
    /// Addresses reported for the guest, best first.
    pub guest_ips: Vec<Ipv4Addr>,
}

/// Everything needed to undo a VM's port mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownSpec {
    pub rules: Vec<Rule>,
    /// Bridge the VM was attached to.
    pub network: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStartedBuildResponse {
    pub ip: Option<Ipv4Addr>,
    pub teardown: TeardownSpec,
    pub network: String,
}

pub struct PortForwarder {
    filter: Option<Arc<dyn PacketFilter>>,
    interfaces: Arc<dyn InterfaceResolver>,
    default_bridge: String,
    mac_prefix: Vec<u8>,
    lease_file: PathBuf,
}

impl std::fmt::Debug for PortForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwarder")
            .field("firewall", &self.filter.is_some())
            .field("default_bridge", &self.default_bridge)
            .finish()
    }
}

impl PortForwarder {
    /// `filter` is `None` on hosts without firewall tooling; every
    /// operation then degrades to a warning.
    pub fn new(
        filter: Option<Arc<dyn PacketFilter>>,
        interfaces: Arc<dyn InterfaceResolver>,
        default_bridge: impl Into<String>,
        mac_prefix: Vec<u8>,
    ) -> Self {
        Self {
            filter,
            interfaces,
            default_bridge: default_bridge.into(),
            mac_prefix,
            lease_file: PathBuf::from(DEFAULT_LEASE_FILE),
        }
    }

    /// Forwarder using the host's iptables and interface table.
    pub fn from_host(config: &NetworkConfig) -> Result<Self, ConfigError> {
        let filter = Iptables::detect().map(|ipt| Arc::new(ipt) as Arc<dyn PacketFilter>);
        Ok(Self::new(
            filter,
            Arc::new(HostInterfaces),
            config.bridge.clone(),
            parse_mac_prefix(&config.mac_prefix)?,
        ))
    }

    pub fn with_lease_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lease_file = path.into();
        self
    }

    /// Create both chains and their jump rules.
    pub async fn init(&self) -> Result<(), PortForwardError> {
        let Some(filter) = &self.filter else {
            tracing::warn!("iptables not available, skipping port forwarding setup");
            return Ok(());
        };

        for (table, parent, chain) in [
            (NAT_TABLE, "PREROUTING", PREROUTING_CHAIN),
            (FILTER_TABLE, "FORWARD", FORWARD_CHAIN),
        ] {
            let created = ensure_chain(filter.as_ref(), table, chain)
                .await
                .map_err(|e| PortForwardError::Firewall(format!("failed to create chain {chain}: {e}")))?;
            if created {
                let jump = Rule::new(table, parent, ["-j", chain]);
                filter.insert(&jump, 1).await.map_err(firewall)?;
                tracing::info!(table, chain, "Created port forwarding chain");
            }
        }
        Ok(())
    }

    /// Install forwarding rules once the VM is up and report its address.
    pub async fn vm_started_build(
        &self,
        req: &VmStartedBuildRequest,
    ) -> Result<VmStartedBuildResponse, PortForwardError> {
        if req.domain_name.is_empty() {
            return Err(PortForwardError::Invalid("missing domain name".into()));
        }

        // Only the first interface is supported.
        let Some(iface) = req.network_interfaces.first() else {
            tracing::debug!(vm = %req.domain_name, "No network interface configured");
            return Ok(VmStartedBuildResponse::default());
        };
        let bridge_cfg = iface.bridge.as_ref();

        let bridge = bridge_cfg
            .map(|b| b.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(self.default_bridge.as_str())
            .to_string();
        if bridge.is_empty() {
            return Err(PortForwardError::Invalid("bridge name cannot be empty".into()));
        }
        if !self.interfaces.interface_exists(&bridge) {
            return Err(PortForwardError::MissingBridge(bridge));
        }

        let ip = self.guest_ip(req, bridge_cfg.and_then(|b| b.static_ip))?;

        let ports: &[String] = bridge_cfg.map(|b| b.ports.as_slice()).unwrap_or_default();
        let rules = self.configure_rules(req, ports, ip).await?;

        Ok(VmStartedBuildResponse {
            ip: Some(ip),
            teardown: TeardownSpec {
                rules,
                network: bridge.clone(),
            },
            network: bridge,
        })
    }

    /// Remove every rule in `spec`. Rules already gone are skipped, and all
    /// failures are reported together.
    pub async fn vm_terminated_teardown(&self, spec: &TeardownSpec) -> Result<(), PortForwardError> {
        let Some(filter) = &self.filter else {
            tracing::warn!("iptables not available, skipping port forwarding teardown");
            return Ok(());
        };

        let mut failures = Vec::new();
        for rule in &spec.rules {
            if let Err(e) = filter.delete_if_exists(rule).await {
                tracing::warn!(table = %rule.table, chain = %rule.chain, error = %e, "Failed to delete rule");
                failures.push(RuleFailure {
                    rule: rule.clone(),
                    message: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PortForwardError::Teardown(failures))
        }
    }

    /// Reported address, then the static override, then the lease file.
    fn guest_ip(
        &self,
        req: &VmStartedBuildRequest,
        static_ip: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, PortForwardError> {
        if let Some(ip) = req.guest_ips.first() {
            tracing::debug!(vm = %req.domain_name, %ip, "Using reported guest IP");
            return Ok(*ip);
        }
        if let Some(ip) = static_ip {
            tracing::debug!(vm = %req.domain_name, %ip, "Using static IP");
            return Ok(ip);
        }

        let mac = derive_mac(&self.mac_prefix, &req.domain_name);
        let now = chrono::Utc::now().timestamp();
        lookup_lease(&self.lease_file, &mac, now).map_err(|e| {
            tracing::error!(vm = %req.domain_name, %mac, error = %e, "No guest IP available");
            PortForwardError::NoGuestIp(req.domain_name.clone())
        })
    }

    async fn configure_rules(
        &self,
        req: &VmStartedBuildRequest,
        ports: &[String],
        ip: Ipv4Addr,
    ) -> Result<Vec<Rule>, PortForwardError> {
        let Some(filter) = &self.filter else {
            tracing::warn!(vm = %req.domain_name, "iptables not available, ports will not be forwarded");
            return Ok(Vec::new());
        };

        let mut added: Vec<Rule> = Vec::new();
        let mut iface_by_ip: HashMap<Ipv4Addr, String> = HashMap::new();

        for label in ports {
            let Some(port) = req.reserved_ports.get(label) else {
                tracing::error!(vm = %req.domain_name, port = %label, "Failed to find reserved port");
                continue;
            };

            let iface = match iface_by_ip.get(&port.host_ip) {
                Some(name) => name.clone(),
                None => {
                    let Some(name) = self.interfaces.interface_by_ip(port.host_ip) else {
                        self.rollback(filter.as_ref(), &added).await;
                        return Err(PortForwardError::NoInterface(port.host_ip));
                    };
                    iface_by_ip.insert(port.host_ip, name.clone());
                    name
                }
            };

            for rule in [nat_rule(port, &iface, ip), accept_rule(port, ip)] {
                if let Err(e) = filter.append(&rule).await {
                    self.rollback(filter.as_ref(), &added).await;
                    return Err(firewall(e));
                }
                tracing::debug!(table = %rule.table, args = ?rule.args, "Added rule");
                added.push(rule);
            }

            tracing::info!(
                vm = %req.domain_name,
                port = %label,
                src_ip = %port.host_ip,
                src_port = port.value,
                dst_ip = %ip,
                dst_port = port.to,
                "Configured port forwarding"
            );
        }

        Ok(added)
    }

    async fn rollback(&self, filter: &dyn PacketFilter, added: &[Rule]) {
        for rule in added.iter().rev() {
            if let Err(e) = filter.delete_if_exists(rule).await {
                tracing::warn!(chain = %rule.chain, error = %e, "Failed to remove rule during rollback");
            }
        }
    }
}

/// Returns true when the chain was created by this call.
async fn ensure_chain(filter: &dyn PacketFilter, table: &str, chain: &str) -> Result<bool, HostError> {
    if filter.list_chains(table).await?.iter().any(|c| c == chain) {
        return Ok(false);
    }
    match filter.new_chain(table, chain).await {
        Ok(()) => Ok(true),
        // Exit status 1: another process created it first.
        Err(HostError::Command { status: Some(1), .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn nat_rule(port: &ReservedPort, iface: &str, guest: Ipv4Addr) -> Rule {
    Rule::new(
        NAT_TABLE,
        PREROUTING_CHAIN,
        [
            "-d".to_string(),
            port.host_ip.to_string(),
            "-i".to_string(),
            iface.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            port.value.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{guest}:{}", port.to),
        ],
    )
}

fn accept_rule(port: &ReservedPort, guest: Ipv4Addr) -> Rule {
    Rule::new(
        FILTER_TABLE,
        FORWARD_CHAIN,
        [
            "-d".to_string(),
            guest.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "state".to_string(),
            "--state".to_string(),
            "NEW".to_string(),
            "-m".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            port.to.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ],
    )
}

fn firewall(e: HostError) -> PortForwardError {
    PortForwardError::Firewall(e.to_string())
}
