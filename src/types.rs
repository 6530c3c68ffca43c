//! Core type definitions for the masterswitch recovery engine.
//!
//! This module contains the fundamental data types used throughout the
//! engine: instance identity, binary-log coordinates, the replication
//! analysis model produced by the external analyzer, and the instance
//! snapshot read from the metadata store.
//!
//! # Key Types
//!
//! - [`InstanceKey`]: host:port identity of every node in a topology
//! - [`BinlogCoordinates`]: position within a master's binary log
//! - [`ReplicationAnalysis`]: one analyzer verdict about one instance
//! - [`Instance`]: point-in-time snapshot of a server's replication state

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identity of a topology node: hostname and port, canonicalized to a
/// case-insensitive string code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Canonical case-insensitive string code, used as map key everywhere.
    pub fn string_code(&self) -> String {
        format!("{}:{}", self.hostname.to_lowercase(), self.port)
    }

    /// A key is valid when it carries a non-empty hostname and a port.
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port != 0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl Default for InstanceKey {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 0,
        }
    }
}

/// Ordered set of instance keys with deterministic iteration.
pub type InstanceKeySet = BTreeSet<InstanceKey>;

/// Render a key set as a comma-delimited list of string codes.
pub fn keys_to_comma_delimited(keys: &InstanceKeySet) -> String {
    keys.iter()
        .map(|k| k.string_code())
        .collect::<Vec<_>>()
        .join(",")
}

/// A position within a binary log: file name plus offset.
///
/// File names carry a numeric suffix (`binlog.000042`), so comparing the
/// file component lexically after length is a correct total order within
/// one server's log series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: u64,
}

impl BinlogCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
        }
    }

    /// True when `self` is strictly behind `other`.
    pub fn smaller_than(&self, other: &BinlogCoordinates) -> bool {
        if self.log_file == other.log_file {
            return self.log_pos < other.log_pos;
        }
        if self.log_file.len() == other.log_file.len() {
            return self.log_file < other.log_file;
        }
        self.log_file.len() < other.log_file.len()
    }

    /// True when `self` is behind or equal to `other`.
    pub fn smaller_than_or_equals(&self, other: &BinlogCoordinates) -> bool {
        self == other || self.smaller_than(other)
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Per-instance promotion preference assigned by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionRule {
    MustPromote,
    PreferPromote,
    Neutral,
    PreferNotPromote,
    MustNotPromote,
}

impl PromotionRule {
    /// Instances carrying this rule are banned from ever being promoted.
    pub fn is_banned(&self) -> bool {
        matches!(self, PromotionRule::MustNotPromote)
    }
}

impl Default for PromotionRule {
    fn default() -> Self {
        PromotionRule::Neutral
    }
}

/// GTID usage hint for repoint/change-master operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GtidHint {
    Deny,
    Neutral,
    Force,
}

/// Classification code attached to an analysis entry by the external
/// failure analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisCode {
    NoProblem,
    DeadMaster,
    DeadMasterAndSomeReplicas,
    DeadMasterAndReplicas,
    UnreachableMaster,
    UnreachableMasterWithLaggingReplicas,
    AllMasterReplicasNotReplicating,
    AllMasterReplicasNotReplicatingOrDead,
    DeadIntermediateMaster,
    DeadIntermediateMasterAndSomeReplicas,
    DeadIntermediateMasterAndReplicas,
    DeadIntermediateMasterWithSingleReplicaFailingToConnect,
    AllIntermediateMasterReplicasFailingToConnectOrDead,
    DeadCoMaster,
    DeadCoMasterAndSomeReplicas,
    FirstTierReplicaFailingToConnectToMaster,
}

impl fmt::Display for AnalysisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Default for AnalysisCode {
    fn default() -> Self {
        AnalysisCode::NoProblem
    }
}

/// Cluster identity and per-cluster recovery policy, as reported by the
/// analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub cluster_alias: String,
    pub cluster_domain: String,
    /// Operator policy: automated dead-master recovery enabled for this cluster.
    pub automated_master_recovery: bool,
    /// Operator policy: automated intermediate-master recovery enabled.
    pub automated_intermediate_master_recovery: bool,
}

/// Command hints injected by operator-driven recovery paths.
pub mod command_hint {
    pub const FORCE_MASTER_FAILOVER: &str = "force-master-failover";
    pub const FORCE_MASTER_TAKEOVER: &str = "force-master-takeover";
    pub const GRACEFUL_MASTER_TAKEOVER: &str = "graceful-master-takeover";
}

/// One analyzer verdict: a snapshot classification of a single instance
/// and its immediate neighborhood. Ephemeral; lives within one dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationAnalysis {
    pub analyzed_key: InstanceKey,
    /// Master of the analyzed instance; for co-masters, the other co-master.
    pub analyzed_master_key: Option<InstanceKey>,
    pub code: AnalysisCode,
    pub description: String,
    /// Free-form hint set by operator-driven paths; empty for automated ones.
    pub command_hint: String,
    pub cluster: ClusterInfo,
    pub count_replicas: usize,
    pub replica_hosts: InstanceKeySet,
    /// Geographic attributes of the analyzed instance.
    pub data_center: String,
    pub region: String,
    pub physical_environment: String,
    /// The analyzed instance's replicas all speak GTID directly.
    pub gtid_immediate_topology: bool,
    /// The analyzed instance's immediate replica layer is binlog servers.
    pub binlog_server_immediate_topology: bool,
    pub is_downtimed: bool,
    /// Downtimed instances are skipped unless explicitly requested.
    pub skippable_due_to_downtime: bool,
    /// Filled by the dispatcher while routing.
    pub is_actionable: bool,
}

/// Hints controlling which entries the analyzer returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisHints {
    pub include_downtimed: bool,
    pub include_no_problem: bool,
    pub audit_analysis: bool,
}

/// Replication credentials stored for an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationCredentials {
    pub user: String,
    pub password: String,
}

/// Point-in-time snapshot of one server's replication state, as read from
/// the metadata store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    pub key: InstanceKey,
    /// Master this instance replicates from; `None` for a topology root.
    pub master_key: Option<InstanceKey>,
    pub alias: String,
    pub cluster_name: String,
    pub version: String,
    pub data_center: String,
    pub region: String,
    pub physical_environment: String,
    pub binlog_format: String,
    pub log_bin_enabled: bool,
    pub log_replica_updates_enabled: bool,
    pub is_binlog_server: bool,
    pub has_replication_filters: bool,
    pub allow_tls: bool,
    pub has_replication_credentials: bool,
    pub read_only: bool,
    /// The instance responded to its most recent poll.
    pub is_last_check_valid: bool,
    pub is_candidate: bool,
    pub promotion_rule: PromotionRule,
    pub is_downtimed: bool,
    pub downtime_reason: String,
    pub replication_io_running: bool,
    pub replication_sql_running: bool,
    /// Position of this server's own binary log.
    pub self_coordinates: BinlogCoordinates,
    /// Master coordinates received by the IO thread.
    pub read_coordinates: BinlogCoordinates,
    /// Master coordinates applied by the SQL thread.
    pub exec_coordinates: BinlogCoordinates,
    /// Master host was deliberately mangled to an unresolvable form.
    pub master_host_detached: bool,
    pub count_replicas: usize,
    pub replication_lag_seconds: u64,
    pub using_gtid: bool,
}

impl Instance {
    /// Both replication threads are running.
    pub fn replica_running(&self) -> bool {
        self.replication_io_running && self.replication_sql_running
    }

    /// The SQL thread has applied everything the IO thread retrieved.
    pub fn sql_thread_up_to_date(&self) -> bool {
        !self.exec_coordinates.smaller_than(&self.read_coordinates)
    }

    /// This instance replicates from somewhere (has a configured master).
    pub fn is_replica(&self) -> bool {
        self.master_key.is_some()
    }

    /// Major.minor version tuple for compatibility checks.
    fn major_version(&self) -> (u32, u32) {
        let mut parts = self.version.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        (major, minor)
    }

    /// Whether this instance could be repointed to replicate from `other`.
    ///
    /// Checks binary logging on the prospective master, log-replica-updates
    /// when the prospective master is itself a replica, and version
    /// compatibility (a replica must not be older than its master).
    pub fn can_replicate_from(&self, other: &Instance) -> Result<(), String> {
        if self.key == other.key {
            return Err("an instance cannot replicate from itself".into());
        }
        if !other.log_bin_enabled {
            return Err(format!("{} does not have binary logs enabled", other.key));
        }
        if other.is_replica() && !other.log_replica_updates_enabled {
            return Err(format!("{} does not log replica updates", other.key));
        }
        if self.major_version() < other.major_version() {
            return Err(format!(
                "version incompatibility: {} ({}) is older than {} ({})",
                self.key, self.version, other.key, other.version
            ));
        }
        Ok(())
    }

    /// Replication lag is within the operator's maintenance bound.
    pub fn has_reasonable_maintenance_lag(&self, bound_seconds: u64) -> bool {
        self.replication_lag_seconds <= bound_seconds
    }
}

/// Extract the set of keys from a list of instances.
pub fn instance_keys(instances: &[Instance]) -> InstanceKeySet {
    instances.iter().map(|i| i.key.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(file: &str, pos: u64) -> BinlogCoordinates {
        BinlogCoordinates::new(file, pos)
    }

    #[test]
    fn test_string_code_case_insensitive() {
        let key = InstanceKey::new("DB1.Example.Com", 3306);
        assert_eq!(key.string_code(), "db1.example.com:3306");
    }

    #[test]
    fn test_coordinate_ordering() {
        assert!(coords("binlog.000001", 100).smaller_than(&coords("binlog.000001", 200)));
        assert!(coords("binlog.000001", 900).smaller_than(&coords("binlog.000002", 100)));
        assert!(coords("binlog.000009", 900).smaller_than(&coords("binlog.000010", 0)));
        assert!(!coords("binlog.000002", 0).smaller_than(&coords("binlog.000001", 999)));
        assert!(coords("binlog.000002", 4).smaller_than_or_equals(&coords("binlog.000002", 4)));
    }

    #[test]
    fn test_sql_thread_up_to_date() {
        let mut instance = Instance {
            read_coordinates: coords("master-bin.000003", 5000),
            exec_coordinates: coords("master-bin.000003", 5000),
            ..Default::default()
        };
        assert!(instance.sql_thread_up_to_date());

        instance.exec_coordinates = coords("master-bin.000003", 4000);
        assert!(!instance.sql_thread_up_to_date());
    }

    #[test]
    fn test_can_replicate_from() {
        let master = Instance {
            key: InstanceKey::new("db1", 3306),
            version: "8.0.32".into(),
            log_bin_enabled: true,
            ..Default::default()
        };
        let replica = Instance {
            key: InstanceKey::new("db2", 3306),
            version: "8.0.32".into(),
            ..Default::default()
        };
        assert!(replica.can_replicate_from(&master).is_ok());

        let old_replica = Instance {
            version: "5.7.40".into(),
            ..replica.clone()
        };
        assert!(old_replica.can_replicate_from(&master).is_err());

        let no_binlog = Instance {
            log_bin_enabled: false,
            ..master.clone()
        };
        assert!(replica.can_replicate_from(&no_binlog).is_err());
    }

    #[test]
    fn test_keys_to_comma_delimited() {
        let mut keys = InstanceKeySet::new();
        keys.insert(InstanceKey::new("db2", 3306));
        keys.insert(InstanceKey::new("db1", 3306));
        assert_eq!(keys_to_comma_delimited(&keys), "db1:3306,db2:3306");
    }
}
