//! Emergency probes.
//!
//! When the analyzer reports a suspicious-but-not-yet-actionable state,
//! the dispatcher nudges the topology to speed up analysis convergence:
//! re-read the suspect instance out of band, re-read its replicas, or
//! restart replication on its replicas so they re-authenticate and notice
//! a bad master. All probes are throttled through short-TTL first-writer
//! -wins sets and run as fire-and-forget tasks; their only observable
//! effect is a fresher metadata store for the next analysis round.

use crate::config::ProbeConfig;
use crate::topology::TopologyAccess;
use crate::types::{AnalysisCode, InstanceKey, ReplicationAnalysis};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A set of string keys whose membership expires after a TTL.
/// First writer wins: `try_add` returns `false` while a live entry exists.
#[derive(Debug, Default)]
struct TtlSet {
    entries: Mutex<HashMap<String, Instant>>,
}

impl TtlSet {
    fn try_add(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires_at| *expires_at > now);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), now + ttl);
        true
    }

    fn set(&self, key: &str, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires_at| *expires_at > now);
        entries.insert(key.to_string(), now + ttl);
    }

    fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires_at| *expires_at > now);
        entries.contains_key(key)
    }
}

/// Throttled out-of-band reads and replication nudges.
pub struct EmergencyProbes {
    config: ProbeConfig,
    topology: Arc<dyn TopologyAccess>,
    emergent_reads: Arc<TtlSet>,
    emergent_restarts: Arc<TtlSet>,
    grace_period: Arc<TtlSet>,
}

impl EmergencyProbes {
    pub fn new(config: ProbeConfig, topology: Arc<dyn TopologyAccess>) -> Self {
        Self {
            config,
            topology,
            emergent_reads: Arc::new(TtlSet::default()),
            emergent_restarts: Arc::new(TtlSet::default()),
            grace_period: Arc::new(TtlSet::default()),
        }
    }

    /// Dispatch emergent operations for an analysis entry. Fire-and-forget.
    pub fn run_emergent_operations(&self, analysis: &ReplicationAnalysis) {
        match analysis.code {
            AnalysisCode::DeadMasterAndReplicas => {
                if let Some(master_key) = &analysis.analyzed_master_key {
                    self.emergently_read_instance(master_key, analysis.code);
                }
            }
            AnalysisCode::UnreachableMaster => {
                self.emergently_read_instance(&analysis.analyzed_key, analysis.code);
                self.emergently_read_replicas(&analysis.analyzed_key, analysis.code);
            }
            AnalysisCode::UnreachableMasterWithLaggingReplicas => {
                self.emergently_restart_replication_on_replicas(
                    &analysis.analyzed_key,
                    analysis.code,
                );
            }
            AnalysisCode::AllMasterReplicasNotReplicating
            | AnalysisCode::AllMasterReplicasNotReplicatingOrDead => {
                self.emergently_read_instance(&analysis.analyzed_key, analysis.code);
            }
            AnalysisCode::FirstTierReplicaFailingToConnectToMaster => {
                if let Some(master_key) = &analysis.analyzed_master_key {
                    self.emergently_read_instance(master_key, analysis.code);
                }
            }
            _ => {}
        }
    }

    /// An emergent operation recently targeted this instance; analysis
    /// codes on it are treated as non-actionable while the window lasts.
    pub fn in_grace_period(&self, key: &InstanceKey) -> bool {
        self.grace_period.contains(&key.string_code())
    }

    /// Force a re-read of one instance, deduplicated on a short TTL.
    fn emergently_read_instance(&self, key: &InstanceKey, code: AnalysisCode) {
        if !self
            .emergent_reads
            .try_add(&key.string_code(), self.config.emergent_read_ttl())
        {
            // Just recently attempted.
            return;
        }
        debug!(instance = %key, code = %code, "Emergently re-reading instance");
        let topology = Arc::clone(&self.topology);
        let key = key.clone();
        tokio::spawn(async move {
            let _ = topology.read_instance(&key).await;
            topology
                .audit_operation("emergently-read-topology-instance", &key, &code.to_string())
                .await;
        });
    }

    /// Force a re-read of all replicas of an instance, each deduplicated
    /// on the same short TTL as single-instance reads.
    fn emergently_read_replicas(&self, key: &InstanceKey, code: AnalysisCode) {
        let topology = Arc::clone(&self.topology);
        let reads = Arc::clone(&self.emergent_reads);
        let ttl = self.config.emergent_read_ttl();
        let key = key.clone();
        tokio::spawn({
            let code = code.to_string();
            async move {
                if let Ok(replicas) = topology
                    .read_replicas_including_binlog_server_sub_replicas(&key)
                    .await
                {
                    for replica in replicas {
                        if !reads.try_add(&replica.key.string_code(), ttl) {
                            continue;
                        }
                        let _ = topology.read_instance(&replica.key).await;
                        topology
                            .audit_operation(
                                "emergently-read-topology-instance",
                                &replica.key,
                                &code,
                            )
                            .await;
                    }
                }
            }
        });
    }

    /// Restart replication on all replicas of an instance, opening the
    /// grace window on the instance itself.
    fn emergently_restart_replication_on_replicas(&self, key: &InstanceKey, code: AnalysisCode) {
        if !self
            .emergent_restarts
            .try_add(&key.string_code(), self.config.emergent_restart_ttl())
        {
            // Per-replica restarts are throttled on their own; this grand
            // throttle avoids re-enumerating replicas every round.
            return;
        }
        self.grace_period
            .set(&key.string_code(), self.config.grace_period_ttl());

        debug!(instance = %key, code = %code, "Emergently restarting replication on replicas");
        let topology = Arc::clone(&self.topology);
        let restarts = Arc::clone(&self.emergent_restarts);
        let ttl = self.config.emergent_restart_ttl();
        let key = key.clone();
        tokio::spawn({
            let code = code.to_string();
            async move {
                if let Ok(replicas) = topology
                    .read_replicas_including_binlog_server_sub_replicas(&key)
                    .await
                {
                    for replica in replicas {
                        if !restarts.try_add(&replica.key.string_code(), ttl) {
                            continue;
                        }
                        let _ = topology.restart_replication_io_thread(&replica.key).await;
                        topology
                            .audit_operation(
                                "emergently-restart-replication-topology-instance",
                                &replica.key,
                                &code,
                            )
                            .await;
                    }
                }
            }
        });
    }
}
