//! Packet filter abstraction and the iptables backend.

use crate::error::HostError;
use crate::host::{run, COMMAND_TIMEOUT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A rule addressed by table and chain, with its match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
}

impl Rule {
    pub fn new<I, S>(table: impl Into<String>, chain: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            chain: chain.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Operations the port forwarder needs from the host firewall.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// User-defined and built-in chains in `table`.
    async fn list_chains(&self, table: &str) -> Result<Vec<String>, HostError>;
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), HostError>;
    /// Insert at 1-based `position`.
    async fn insert(&self, rule: &Rule, position: u32) -> Result<(), HostError>;
    async fn append(&self, rule: &Rule) -> Result<(), HostError>;
    async fn exists(&self, rule: &Rule) -> Result<bool, HostError>;
    async fn delete(&self, rule: &Rule) -> Result<(), HostError>;

    /// Delete `rule` if present.
    async fn delete_if_exists(&self, rule: &Rule) -> Result<(), HostError> {
        if self.exists(rule).await? {
            self.delete(rule).await?;
        }
        Ok(())
    }
}

/// [`PacketFilter`] that shells out to `iptables`.
#[derive(Debug, Clone)]
pub struct Iptables {
    bin: PathBuf,
    timeout: Duration,
}

impl Iptables {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Locate `iptables` on PATH. `None` when the host has no iptables.
    pub fn detect() -> Option<Self> {
        match which::which("iptables") {
            Ok(bin) => Some(Self::new(bin)),
            Err(e) => {
                tracing::warn!(error = %e, "iptables not found, port forwarding disabled");
                None
            }
        }
    }

    async fn iptables(&self, table: &str, args: Vec<String>) -> Result<String, HostError> {
        let mut full = vec!["--wait".to_string(), "-t".to_string(), table.to_string()];
        full.extend(args);
        tracing::debug!(args = ?full, "iptables");
        run(&self.bin, &full, self.timeout).await
    }

    fn rule_args(op: &str, rule: &Rule) -> Vec<String> {
        let mut args = vec![op.to_string(), rule.chain.clone()];
        args.extend(rule.args.iter().cloned());
        args
    }
}

/// Chain names from `iptables -S` output (`-P` built-ins and `-N` user chains).
pub(crate) fn parse_chains(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("-P") | Some("-N") => parts.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

#[async_trait]
impl PacketFilter for Iptables {
    async fn list_chains(&self, table: &str) -> Result<Vec<String>, HostError> {
        let out = self.iptables(table, vec!["-S".to_string()]).await?;
        Ok(parse_chains(&out))
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), HostError> {
        self.iptables(table, vec!["-N".to_string(), chain.to_string()])
            .await
            .map(|_| ())
    }

    async fn insert(&self, rule: &Rule, position: u32) -> Result<(), HostError> {
        let mut args = vec!["-I".to_string(), rule.chain.clone(), position.to_string()];
        args.extend(rule.args.iter().cloned());
        self.iptables(&rule.table, args).await.map(|_| ())
    }

    async fn append(&self, rule: &Rule) -> Result<(), HostError> {
        self.iptables(&rule.table, Self::rule_args("-A", rule))
            .await
            .map(|_| ())
    }

    async fn exists(&self, rule: &Rule) -> Result<bool, HostError> {
        match self.iptables(&rule.table, Self::rule_args("-C", rule)).await {
            Ok(_) => Ok(true),
            // `-C` exits 1 when the rule is absent.
            Err(HostError::Command { status: Some(1), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, rule: &Rule) -> Result<(), HostError> {
        self.iptables(&rule.table, Self::rule_args("-D", rule))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory packet filter.
    #[derive(Debug, Default)]
    pub(crate) struct FakeFilter {
        pub chains: Mutex<HashMap<String, HashSet<String>>>,
        pub rules: Mutex<Vec<Rule>>,
        /// Rules whose deletion fails.
        pub undeletable: Mutex<Vec<Rule>>,
        pub created: Mutex<Vec<(String, String)>>,
        /// Report no chains, as if another process created them after listing.
        pub stale_listing: Mutex<bool>,
    }

    impl FakeFilter {
        pub fn with_builtins() -> Self {
            let fake = Self::default();
            {
                let mut chains = fake.chains.lock().unwrap();
                chains.insert(
                    "nat".into(),
                    ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                );
                chains.insert(
                    "filter".into(),
                    ["INPUT", "FORWARD", "OUTPUT"].iter().map(|s| s.to_string()).collect(),
                );
            }
            fake
        }

        pub fn rules(&self) -> Vec<Rule> {
            self.rules.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PacketFilter for FakeFilter {
        async fn list_chains(&self, table: &str) -> Result<Vec<String>, HostError> {
            if *self.stale_listing.lock().unwrap() {
                return Ok(Vec::new());
            }
            Ok(self
                .chains
                .lock()
                .unwrap()
                .get(table)
                .map(|c| c.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn new_chain(&self, table: &str, chain: &str) -> Result<(), HostError> {
            let inserted = self
                .chains
                .lock()
                .unwrap()
                .entry(table.to_string())
                .or_default()
                .insert(chain.to_string());
            if !inserted {
                return Err(HostError::Command {
                    program: "iptables".into(),
                    status: Some(1),
                    message: "Chain already exists.".into(),
                });
            }
            self.created
                .lock()
                .unwrap()
                .push((table.to_string(), chain.to_string()));
            Ok(())
        }

        async fn insert(&self, rule: &Rule, position: u32) -> Result<(), HostError> {
            let mut rules = self.rules.lock().unwrap();
            let idx = (position.saturating_sub(1) as usize).min(rules.len());
            rules.insert(idx, rule.clone());
            Ok(())
        }

        async fn append(&self, rule: &Rule) -> Result<(), HostError> {
            self.rules.lock().unwrap().push(rule.clone());
            Ok(())
        }

        async fn exists(&self, rule: &Rule) -> Result<bool, HostError> {
            Ok(self.rules.lock().unwrap().contains(rule))
        }

        async fn delete(&self, rule: &Rule) -> Result<(), HostError> {
            if self.undeletable.lock().unwrap().contains(rule) {
                return Err(HostError::Command {
                    program: "iptables".into(),
                    status: Some(4),
                    message: "resource busy".into(),
                });
            }
            let mut rules = self.rules.lock().unwrap();
            if let Some(pos) = rules.iter().position(|r| r == rule) {
                rules.remove(pos);
            }
            Ok(())
        }
    }

    #[test]
    fn test_parse_chains() {
        let listing = "-P PREROUTING ACCEPT\n-P INPUT ACCEPT\n-N CIRRUS_PRT\n-A PREROUTING -j CIRRUS_PRT\n";
        assert_eq!(parse_chains(listing), vec!["PREROUTING", "INPUT", "CIRRUS_PRT"]);
    }

    #[test]
    fn test_rule_args() {
        let rule = Rule::new("filter", "CIRRUS_FW", ["-d", "10.0.0.5", "-j", "ACCEPT"]);
        assert_eq!(
            Iptables::rule_args("-C", &rule),
            vec!["-C", "CIRRUS_FW", "-d", "10.0.0.5", "-j", "ACCEPT"]
        );
    }

    #[tokio::test]
    async fn test_delete_if_exists() {
        let filter = FakeFilter::with_builtins();
        let rule = Rule::new("nat", "CIRRUS_PRT", ["-j", "DNAT"]);
        filter.append(&rule).await.unwrap();

        filter.delete_if_exists(&rule).await.unwrap();
        assert!(filter.rules().is_empty());
        // Second call is a no-op.
        filter.delete_if_exists(&rule).await.unwrap();
    }
}
