//! # palaver-config: Cluster topology configuration
//!
//! The replica table is static and identical on every node and every
//! client: each replica's name, host, and its four ports (INTERNAL,
//! CLIENT, HEALTH, NOTIF). Everything directional is *derived* from
//! lexicographic order over names, never stored: for two names a < b,
//! a listens and b dials, so every replica pair forms exactly one
//! INTERNAL channel, and the lexicographically smallest living replica
//! is the primary.
//!
//! Configuration merges, in precedence order: built-in defaults (the
//! three-replica localhost topology), `palaver.toml` in the project
//! directory, `palaver.local.toml` (gitignored overrides), and
//! `PALAVER_*` environment variables.

mod error;
mod loader;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use palaver_types::ReplicaName;

/// One replica's row in the static table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    /// Stable name; lexicographic order drives leadership and dialing.
    pub name: String,
    /// Host the replica binds and is reachable on.
    pub host: String,
    /// Peer replication channel.
    pub internal_port: u16,
    /// Client request/response channel.
    pub client_port: u16,
    /// Heartbeat channel.
    pub health_port: u16,
    /// Push notification channel.
    pub notif_port: u16,
}

impl ReplicaSpec {
    pub fn name(&self) -> ReplicaName {
        ReplicaName::from(self.name.as_str())
    }

    pub fn internal_addr(&self) -> String {
        format!("{}:{}", self.host, self.internal_port)
    }

    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.host, self.health_port)
    }

    pub fn notif_addr(&self) -> String {
        format!("{}:{}", self.host, self.notif_port)
    }
}

/// The resolved Palaver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PalaverConfig {
    /// Directory holding the durable operation logs.
    pub data_dir: PathBuf,
    /// The static replica table, identical everywhere.
    pub replicas: Vec<ReplicaSpec>,
}

impl Default for PalaverConfig {
    /// The three-replica localhost topology used by the development
    /// cluster and the test suite.
    fn default() -> Self {
        let replica = |name: &str, base: u16| ReplicaSpec {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            internal_port: base,
            client_port: base + 1,
            health_port: base + 2,
            notif_port: base + 3,
        };
        Self {
            data_dir: PathBuf::from("data"),
            replicas: vec![
                replica("A", 50051),
                replica("B", 50061),
                replica("C", 50071),
            ],
        }
    }
}

impl PalaverConfig {
    /// Checks structural validity: at least one replica, unique non-empty
    /// names.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.replicas.is_empty() {
            return Err(ConfigError::EmptyReplicaTable);
        }
        let mut names: Vec<&str> = self.replicas.iter().map(|r| r.name.as_str()).collect();
        if names.iter().any(|n| n.is_empty()) {
            return Err(ConfigError::UnnamedReplica);
        }
        names.sort_unstable();
        names.dedup();
        if names.len() != self.replicas.len() {
            return Err(ConfigError::DuplicateReplicaName);
        }
        Ok(())
    }

    /// Looks up a replica by name.
    pub fn replica(&self, name: &str) -> ConfigResult<&ReplicaSpec> {
        self.replicas
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownReplica(name.to_string()))
    }

    /// All replicas except `name`.
    pub fn siblings(&self, name: &str) -> Vec<&ReplicaSpec> {
        self.replicas.iter().filter(|r| r.name != name).collect()
    }

    /// Replica specs in lexicographic name order: the client connector's
    /// search order, and the leadership order.
    pub fn ordered(&self) -> Vec<&ReplicaSpec> {
        let mut replicas: Vec<&ReplicaSpec> = self.replicas.iter().collect();
        replicas.sort_by(|a, b| a.name.cmp(&b.name));
        replicas
    }

    /// The peers `name` must dial out to: every lexicographically
    /// smaller name (the smaller side of each pair listens).
    pub fn dial_targets(&self, name: &str) -> Vec<&ReplicaSpec> {
        let mut targets: Vec<&ReplicaSpec> = self
            .replicas
            .iter()
            .filter(|r| r.name.as_str() < name)
            .collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }

    /// How many inbound INTERNAL connections `name` must accept: one per
    /// lexicographically greater name.
    pub fn num_listens(&self, name: &str) -> usize {
        self.replicas.iter().filter(|r| r.name.as_str() > name).count()
    }

    /// The durable log path for a replica.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topology_is_three_localhost_replicas() {
        let cfg = PalaverConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.replicas.len(), 3);
        assert_eq!(cfg.replica("A").unwrap().internal_addr(), "127.0.0.1:50051");
        assert_eq!(cfg.replica("C").unwrap().notif_addr(), "127.0.0.1:50074");
    }

    #[test]
    fn dial_direction_follows_lexicographic_order() {
        let cfg = PalaverConfig::default();

        // A listens for both, dials nobody.
        assert!(cfg.dial_targets("A").is_empty());
        assert_eq!(cfg.num_listens("A"), 2);

        // B dials A, listens for C.
        let b_dials: Vec<&str> = cfg.dial_targets("B").iter().map(|r| r.name.as_str()).collect();
        assert_eq!(b_dials, ["A"]);
        assert_eq!(cfg.num_listens("B"), 1);

        // C dials both, listens for nobody.
        let c_dials: Vec<&str> = cfg.dial_targets("C").iter().map(|r| r.name.as_str()).collect();
        assert_eq!(c_dials, ["A", "B"]);
        assert_eq!(cfg.num_listens("C"), 0);
    }

    #[test]
    fn every_pair_forms_exactly_one_channel() {
        let cfg = PalaverConfig::default();
        let mut channels = 0;
        for r in &cfg.replicas {
            channels += cfg.dial_targets(&r.name).len();
        }
        // 3 replicas -> 3 unordered pairs.
        assert_eq!(channels, 3);
        let listens: usize = cfg.replicas.iter().map(|r| cfg.num_listens(&r.name)).sum();
        assert_eq!(listens, channels);
    }

    #[test]
    fn unknown_replica_is_an_error() {
        let cfg = PalaverConfig::default();
        assert!(matches!(
            cfg.replica("Z"),
            Err(ConfigError::UnknownReplica(_))
        ));
    }

    #[test]
    fn duplicate_names_fail_validation() {
        let mut cfg = PalaverConfig::default();
        cfg.replicas[2].name = "A".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateReplicaName)
        ));
    }

    #[test]
    fn log_path_is_per_replica() {
        let cfg = PalaverConfig::default();
        assert_eq!(cfg.log_path("B"), PathBuf::from("data/B.log"));
    }
}
