// Shared fixtures for failover integration tests.

use masterswitch::config::RecoveryConfig;
use masterswitch::consensus::{ConsensusLog, LocalLog};
use masterswitch::hooks::RecordingHookRunner;
use masterswitch::kv::MemoryKv;
use masterswitch::recovery::RecoveryEngine;
use masterswitch::topology::MemoryTopology;
use masterswitch::types::{
    AnalysisCode, BinlogCoordinates, ClusterInfo, Instance, InstanceKey, ReplicationAnalysis,
};
use std::sync::Arc;

pub const CLUSTER: &str = "main";
pub const CLUSTER_ALIAS: &str = "main-alias";
pub const CLUSTER_DOMAIN: &str = "main.example.com";

pub fn key(host: &str) -> InstanceKey {
    InstanceKey::new(host, 3306)
}

/// A healthy GTID replica with sensible defaults. Masters pass
/// `master = None` and get `read_only = false`.
pub fn server(host: &str, master: Option<&str>, exec_pos: u64) -> Instance {
    Instance {
        key: key(host),
        master_key: master.map(key),
        alias: format!("{}-alias", host),
        cluster_name: CLUSTER.to_string(),
        version: "8.0.32".to_string(),
        data_center: "dc1".to_string(),
        region: "eu".to_string(),
        physical_environment: "env1".to_string(),
        binlog_format: "ROW".to_string(),
        log_bin_enabled: true,
        log_replica_updates_enabled: true,
        is_last_check_valid: true,
        read_only: master.is_some(),
        replication_io_running: master.is_some(),
        replication_sql_running: master.is_some(),
        using_gtid: master.is_some(),
        self_coordinates: BinlogCoordinates::new(format!("{}-bin.000010", host), 1000),
        read_coordinates: BinlogCoordinates::new("master-bin.000010", exec_pos),
        exec_coordinates: BinlogCoordinates::new("master-bin.000010", exec_pos),
        ..Default::default()
    }
}

pub fn cluster_info(automated_master: bool, automated_intermediate: bool) -> ClusterInfo {
    ClusterInfo {
        cluster_name: CLUSTER.to_string(),
        cluster_alias: CLUSTER_ALIAS.to_string(),
        cluster_domain: CLUSTER_DOMAIN.to_string(),
        automated_master_recovery: automated_master,
        automated_intermediate_master_recovery: automated_intermediate,
    }
}

pub fn analysis(code: AnalysisCode, failed: &str, master: Option<&str>) -> ReplicationAnalysis {
    ReplicationAnalysis {
        analyzed_key: key(failed),
        analyzed_master_key: master.map(key),
        code,
        description: format!("{:?} detected on {}", code, failed),
        cluster: cluster_info(true, true),
        data_center: "dc1".to_string(),
        region: "eu".to_string(),
        physical_environment: "env1".to_string(),
        gtid_immediate_topology: true,
        ..Default::default()
    }
}

pub struct Harness {
    pub engine: Arc<RecoveryEngine>,
    pub topology: Arc<MemoryTopology>,
    pub kv: Arc<MemoryKv>,
    pub hooks: Arc<RecordingHookRunner>,
    pub config: Arc<RecoveryConfig>,
}

pub fn harness(mut config: RecoveryConfig) -> Harness {
    config.hostname = "orc-test".to_string();
    harness_with_consensus(config, Arc::new(LocalLog))
}

pub fn harness_with_consensus(
    config: RecoveryConfig,
    consensus: Arc<dyn ConsensusLog>,
) -> Harness {
    harness_full(config, consensus, Arc::new(RecordingHookRunner::new()))
}

pub fn harness_full(
    mut config: RecoveryConfig,
    consensus: Arc<dyn ConsensusLog>,
    hooks: Arc<RecordingHookRunner>,
) -> Harness {
    if config.hostname.is_empty() {
        config.hostname = "orc-test".to_string();
    }
    let config = Arc::new(config);
    let topology = Arc::new(MemoryTopology::new());
    topology.add_cluster(cluster_info(true, true));
    let kv = Arc::new(MemoryKv::new());
    let engine = Arc::new(RecoveryEngine::new(
        Arc::clone(&config),
        Arc::clone(&topology) as Arc<dyn masterswitch::topology::TopologyAccess>,
        Arc::clone(&kv) as Arc<dyn masterswitch::kv::KvStore>,
        consensus,
        Arc::clone(&hooks) as Arc<dyn masterswitch::hooks::HookRunner>,
    ));
    Harness {
        engine,
        topology,
        kv,
        hooks,
        config,
    }
}
