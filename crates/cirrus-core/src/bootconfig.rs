//! First-boot guest configuration, delivered as a NoCloud seed volume.

use crate::domain::{DomainConfig, GuestFile};
use crate::error::HostError;
use crate::host::{run, COMMAND_TIMEOUT};
use crate::settings::NetworkSettings;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

/// File name of the seed volume inside a VM's work directory.
pub const SEED_IMAGE: &str = "cidata.iso";

/// What the guest needs on first boot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootConfig {
    pub instance_id: String,
    pub hostname: String,
    /// Raw user-data. When set it replaces the generated cloud-config.
    pub user_data: Option<String>,
    pub ssh_key: Option<String>,
    pub password: Option<String>,
    pub cmds: Vec<String>,
    pub files: Vec<GuestFile>,
    pub network: Option<NetworkSettings>,
    pub mac: String,
}

impl BootConfig {
    pub fn for_domain(config: &DomainConfig, mac: &str, network: Option<NetworkSettings>) -> Self {
        Self {
            instance_id: config.name.clone(),
            hostname: config.hostname.clone().unwrap_or_else(|| config.name.clone()),
            user_data: config.user_data.clone(),
            ssh_key: config.default_user_ssh_key.clone(),
            password: config.default_user_password.clone(),
            cmds: config.cmds.clone(),
            files: config.files.clone(),
            network,
            mac: mac.to_string(),
        }
    }

    pub fn meta_data(&self) -> String {
        json!({
            "instance-id": self.instance_id,
            "local-hostname": self.hostname,
        })
        .to_string()
    }

    /// `#cloud-config` document. JSON is valid YAML, so the body is JSON.
    pub fn user_data(&self) -> String {
        if let Some(raw) = &self.user_data {
            return raw.clone();
        }

        let mut doc = Map::new();
        doc.insert("hostname".into(), json!(self.hostname));
        if let Some(key) = &self.ssh_key {
            doc.insert("ssh_authorized_keys".into(), json!([key]));
        }
        if let Some(password) = &self.password {
            doc.insert("password".into(), json!(password));
            doc.insert("chpasswd".into(), json!({ "expire": false }));
            doc.insert("ssh_pwauth".into(), json!(true));
        }
        if !self.files.is_empty() {
            let files: Vec<Value> = self.files.iter().map(write_file_entry).collect();
            doc.insert("write_files".into(), Value::Array(files));
        }
        if !self.cmds.is_empty() {
            doc.insert("runcmd".into(), json!(self.cmds));
        }

        format!("#cloud-config\n{}\n", Value::Object(doc))
    }

    /// Network config v2 matching the NIC by MAC.
    pub fn network_config(&self) -> Option<String> {
        let net = self.network.as_ref()?;

        let mut eth = Map::new();
        eth.insert("match".into(), json!({ "macaddress": self.mac }));
        eth.insert("set-name".into(), json!(net.interface));
        eth.insert(
            "addresses".into(),
            json!([format!("{}/{}", net.address, net.prefix_len)]),
        );
        if let Some(gw) = net.gateway {
            eth.insert("routes".into(), json!([{ "to": "default", "via": gw.to_string() }]));
        }
        if !net.nameservers.is_empty() {
            let dns: Vec<String> = net.nameservers.iter().map(ToString::to_string).collect();
            eth.insert("nameservers".into(), json!({ "addresses": dns }));
        }

        let mut ethernets = Map::new();
        ethernets.insert(net.interface.clone(), Value::Object(eth));
        Some(json!({ "version": 2, "ethernets": ethernets }).to_string())
    }
}

fn write_file_entry(file: &GuestFile) -> Value {
    let mut entry = Map::new();
    entry.insert("path".into(), json!(file.path));
    entry.insert("content".into(), json!(file.content));
    if !file.permissions.is_empty() {
        let perms = if file.permissions.starts_with('0') {
            file.permissions.clone()
        } else {
            format!("0{}", file.permissions)
        };
        entry.insert("permissions".into(), json!(perms));
    }
    if !file.encoding.is_empty() {
        entry.insert("encoding".into(), json!(file.encoding));
    }
    Value::Object(entry)
}

/// Produces the seed volume attached to a VM.
#[async_trait]
pub trait BootConfigWriter: Send + Sync {
    async fn write(&self, config: &BootConfig, dest: &Path) -> Result<(), HostError>;
}

/// [`BootConfigWriter`] using `cloud-localds`.
#[derive(Debug, Clone)]
pub struct CloudLocalds {
    bin: PathBuf,
}

impl CloudLocalds {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn detect() -> Option<Self> {
        match which::which("cloud-localds") {
            Ok(bin) => Some(Self::new(bin)),
            Err(e) => {
                tracing::warn!(error = %e, "cloud-localds not found, guests boot without a seed volume");
                None
            }
        }
    }
}

#[async_trait]
impl BootConfigWriter for CloudLocalds {
    async fn write(&self, config: &BootConfig, dest: &Path) -> Result<(), HostError> {
        let staging = dest.with_extension("d");
        tokio::fs::create_dir_all(&staging).await?;

        let user_data = staging.join("user-data");
        let meta_data = staging.join("meta-data");
        tokio::fs::write(&user_data, config.user_data()).await?;
        tokio::fs::write(&meta_data, config.meta_data()).await?;

        let mut args = Vec::new();
        if let Some(network) = config.network_config() {
            let path = staging.join("network-config");
            tokio::fs::write(&path, network).await?;
            args.push(format!("--network-config={}", path.display()));
        }
        args.push(dest.display().to_string());
        args.push(user_data.display().to_string());
        args.push(meta_data.display().to_string());

        run(&self.bin, &args, COMMAND_TIMEOUT).await?;
        tracing::debug!(vm = %config.instance_id, path = %dest.display(), "Seed volume written");
        Ok(())
    }
}
