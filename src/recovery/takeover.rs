//! Operator-driven takeovers.
//!
//! These flows synthesize a dead-master analysis for a live (or
//! presumed-dead) master and push it through the regular dispatcher with
//! the force flag set. Force overrides the automated-recovery policy and
//! the global disabled gate; it never bypasses per-instance registration
//! serialization.

use super::engine::RecoveryEngine;
use super::selection::is_banned_from_promotion;
use super::{MasterRecoveryType, TopologyRecovery};
use crate::error::{RecoveryError, Result};
use crate::types::{
    command_hint, AnalysisCode, AnalysisHints, BinlogCoordinates, GtidHint, Instance, InstanceKey,
    ReplicationAnalysis,
};
use tracing::{info, warn};

impl RecoveryEngine {
    /// Build an analysis entry for a recovery the operator wants, copying
    /// the latest observed entry for the failed key when one exists and
    /// overwriting its code and command hint.
    async fn force_analysis_entry(
        &self,
        cluster: &str,
        code: AnalysisCode,
        hint: &str,
        failed_key: &InstanceKey,
    ) -> Result<ReplicationAnalysis> {
        let cluster_info = self.topology.read_cluster_info(cluster).await?;
        let hints = AnalysisHints {
            include_downtimed: true,
            include_no_problem: true,
            ..Default::default()
        };
        let entries = self
            .topology
            .replication_analysis(Some(cluster), hints)
            .await?;

        let mut analysis = entries
            .into_iter()
            .find(|entry| &entry.analyzed_key == failed_key)
            .unwrap_or_default();
        analysis.code = code;
        analysis.command_hint = hint.to_string();
        analysis.cluster = cluster_info;
        analysis.analyzed_key = failed_key.clone();
        Ok(analysis)
    }

    /// Issue a recovery even when analysis sees no failure. The caller
    /// injects the analysis it wishes the engine to assume, and takes
    /// responsibility for its actions.
    pub async fn force_execute_recovery(
        &self,
        analysis: ReplicationAnalysis,
        candidate_key: Option<InstanceKey>,
        skip_processes: bool,
    ) -> Result<(bool, Option<TopologyRecovery>)> {
        self.execute_check_and_recover(analysis, candidate_key, true, skip_processes)
            .await
    }

    /// Trust that the master of the given cluster is dead and fail over.
    pub async fn force_master_failover(&self, cluster: &str) -> Result<TopologyRecovery> {
        let master = self.single_cluster_master(cluster, false).await?;
        let analysis = self
            .force_analysis_entry(
                cluster,
                AnalysisCode::DeadMaster,
                command_hint::FORCE_MASTER_FAILOVER,
                &master.key,
            )
            .await?;
        let (attempted, recovery) = self.force_execute_recovery(analysis, None, false).await?;
        Self::require_promotion(attempted, recovery)
    }

    /// Trust that the master of the given cluster is dead and fail over
    /// to a designated destination, which must be its direct replica.
    pub async fn force_master_takeover(
        &self,
        cluster: &str,
        destination_key: &InstanceKey,
    ) -> Result<TopologyRecovery> {
        let master = self.single_cluster_master(cluster, true).await?;
        let destination = self
            .topology
            .read_instance(destination_key)
            .await?
            .ok_or_else(|| RecoveryError::InstanceNotFound(destination_key.string_code()))?;
        if destination.master_key.as_ref() != Some(&master.key) {
            return Err(RecoveryError::TakeoverPrecondition(format!(
                "you may only promote a direct child of the master {}; the master of {} is {:?}",
                master.key, destination.key, destination.master_key
            )));
        }
        info!(demote = %master.key, promote = %destination.key, "Forced master takeover");

        let analysis = self
            .force_analysis_entry(
                cluster,
                AnalysisCode::DeadMaster,
                command_hint::FORCE_MASTER_TAKEOVER,
                &master.key,
            )
            .await?;
        let (attempted, recovery) = self
            .force_execute_recovery(analysis, Some(destination.key), false)
            .await?;
        Self::require_promotion(attempted, recovery)
    }

    /// Demote the master of a topology in an orderly fashion and promote
    /// its direct replica instead.
    ///
    /// Locks down the master, waits (bounded) for the designated replica
    /// to catch up to the frozen coordinates, dispatches a forced
    /// dead-master recovery with the designated replica as candidate, and
    /// finally points the demoted master at the promoted one at the
    /// recorded coordinates, replication deliberately not started.
    /// Returns the recovery and the promoted master's coordinates.
    pub async fn graceful_master_takeover(
        &self,
        cluster: &str,
        designated_key: Option<&InstanceKey>,
    ) -> Result<(TopologyRecovery, BinlogCoordinates)> {
        let cluster_master = self.single_cluster_master(cluster, false).await?;
        let direct_replicas = self.topology.read_replicas(&cluster_master.key).await?;
        if direct_replicas.is_empty() {
            return Err(RecoveryError::TakeoverPrecondition(format!(
                "master {} doesn't seem to have replicas",
                cluster_master.key
            )));
        }

        // An empty or invalid key is as good as no key.
        let designated_key = designated_key.filter(|k| k.is_valid());
        let designated = match designated_key {
            None => {
                if direct_replicas.len() > 1 {
                    return Err(RecoveryError::TakeoverPrecondition(format!(
                        "when no target instance is indicated, master {} should only have one replica (making the takeover safe and simple), but has {}",
                        cluster_master.key,
                        direct_replicas.len()
                    )));
                }
                let designated = direct_replicas[0].clone();
                info!(designated = %designated.key, "Graceful takeover: designated master deduced");
                designated
            }
            Some(key) => {
                let designated = direct_replicas
                    .iter()
                    .find(|replica| &replica.key == key)
                    .cloned()
                    .ok_or_else(|| {
                        RecoveryError::TakeoverPrecondition(format!(
                            "designated instance {} must be directly replicating from the master {}",
                            key, cluster_master.key
                        ))
                    })?;
                info!(designated = %designated.key, "Graceful takeover: designated master instructed");
                designated
            }
        };

        if is_banned_from_promotion(&designated) {
            return Err(RecoveryError::TakeoverPrecondition(format!(
                "designated instance {} cannot be promoted due to its promotion rule",
                designated.key
            )));
        }
        if !designated.has_reasonable_maintenance_lag(
            self.config.reasonable_maintenance_replication_lag_seconds,
        ) {
            return Err(RecoveryError::TakeoverPrecondition(format!(
                "designated instance {} is lagging too much for this operation",
                designated.key
            )));
        }

        if direct_replicas.len() > 1 {
            info!(designated = %designated.key, "Graceful takeover: letting designated replica take over its siblings");
            let (relocated, _errors) = self
                .rewirer
                .relocate_replicas(&cluster_master.key, &designated.key)
                .await?;
            let relocated_keys: Vec<&InstanceKey> = relocated.iter().map(|r| &r.key).collect();
            for replica in &direct_replicas {
                if replica.key == designated.key || relocated_keys.contains(&&replica.key) {
                    continue;
                }
                if replica.is_downtimed {
                    // A downtimed straggler is not worth aborting over.
                    warn!(
                        replica = %replica.key,
                        reason = %replica.downtime_reason,
                        "Unable to relocate below designated, but it is downtimed; proceeding"
                    );
                    continue;
                }
                return Err(RecoveryError::TakeoverPrecondition(format!(
                    "designated instance {} cannot take over all of its siblings; {} was not relocated",
                    designated.key, replica.key
                )));
            }
        }
        info!(
            demote = %cluster_master.key,
            promote = %designated.key,
            "Graceful takeover: will demote and promote"
        );

        let credentials = self
            .topology
            .read_replication_credentials(&designated.key)
            .await
            .unwrap_or(None);

        let analysis = self
            .force_analysis_entry(
                cluster,
                AnalysisCode::DeadMaster,
                command_hint::GRACEFUL_MASTER_TAKEOVER,
                &cluster_master.key,
            )
            .await?;

        let pre_takeover_shell =
            TopologyRecovery::new(analysis.clone(), self.config.hostname.clone());
        self.execute_hook_batch(
            &self.config.hooks.pre_graceful_takeover_processes,
            "PreGracefulTakeoverProcesses",
            &pre_takeover_shell,
            true,
        )
        .await
        .map_err(|e| {
            RecoveryError::HookFailed(format!("failed running PreGracefulTakeoverProcesses: {}", e))
        })?;

        info!(master = %cluster_master.key, "Graceful takeover: setting master read-only");
        let frozen_master = self.topology.set_read_only(&cluster_master.key, true).await?;
        let demoted_coordinates = frozen_master.self_coordinates.clone();

        info!(
            designated = %designated.key,
            coordinates = %demoted_coordinates,
            "Graceful takeover: waiting for designated replica to reach master coordinates"
        );
        let designated = self
            .topology
            .wait_for_exec_coordinates_to_reach(
                &designated.key,
                &demoted_coordinates,
                self.config.reasonable_maintenance_replication_lag(),
            )
            .await?;
        let promoted_coordinates = designated.self_coordinates.clone();

        info!("Graceful takeover: attempting recovery");
        let (attempted, recovery) = match self
            .force_execute_recovery(analysis, Some(designated.key.clone()), false)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Graceful takeover: noting an error, proceeding");
                (false, None)
            }
        };
        if !attempted {
            return Err(RecoveryError::Internal(
                "graceful takeover: recovery not attempted; this should not happen".into(),
            ));
        }
        let recovery = recovery.ok_or_else(|| {
            RecoveryError::Internal(
                "graceful takeover: recovery attempted but with no results; this should not happen"
                    .into(),
            )
        })?;
        if recovery.successor_key.is_none() {
            // Promotion failed: undo the read-only freeze.
            let _ = self.topology.set_read_only(&cluster_master.key, false).await;
            return Err(RecoveryError::NoSuccessorPromoted(
                cluster_master.key.string_code(),
            ));
        }

        let gtid_hint = if recovery.recovery_type == MasterRecoveryType::Gtid {
            GtidHint::Force
        } else {
            GtidHint::Neutral
        };
        let demoted_master = self
            .topology
            .change_master_to(
                &cluster_master.key,
                &designated.key,
                &promoted_coordinates,
                true,
                gtid_hint,
            )
            .await?;
        if demoted_master.self_coordinates != demoted_coordinates {
            warn!(
                expected = %demoted_coordinates,
                actual = %demoted_master.self_coordinates,
                "Graceful takeover: demoted master's coordinates changed while supposed to have been frozen"
            );
        }

        if !demoted_master.has_replication_credentials {
            if let Some(credentials) = &credentials {
                if let Err(e) = self
                    .topology
                    .change_master_credentials(&cluster_master.key, credentials)
                    .await
                {
                    warn!(error = %e, "Graceful takeover: could not propagate replication credentials");
                }
            }
        }
        if designated.allow_tls {
            if let Err(e) = self.topology.enable_master_ssl(&cluster_master.key).await {
                warn!(error = %e, "Graceful takeover: could not enable TLS toward new master");
            }
        }

        self.execute_hook_batch(
            &self.config.hooks.post_graceful_takeover_processes,
            "PostGracefulTakeoverProcesses",
            &recovery,
            false,
        )
        .await
        .ok();

        Ok((recovery, promoted_coordinates))
    }

    /// The single master of a cluster, or an error when there is not
    /// exactly one.
    async fn single_cluster_master(&self, cluster: &str, writeable: bool) -> Result<Instance> {
        let mut masters = if writeable {
            self.topology.read_cluster_writeable_master(cluster).await?
        } else {
            self.topology.read_cluster_master(cluster).await?
        };
        if masters.len() != 1 {
            return Err(RecoveryError::TakeoverPrecondition(format!(
                "cannot deduce cluster master for {}: found {} potential masters",
                cluster,
                masters.len()
            )));
        }
        masters.pop().ok_or_else(|| {
            RecoveryError::Internal(format!("no master found for {}", cluster))
        })
    }

    fn require_promotion(
        attempted: bool,
        recovery: Option<TopologyRecovery>,
    ) -> Result<TopologyRecovery> {
        if !attempted {
            return Err(RecoveryError::Internal(
                "recovery not attempted; this should not happen".into(),
            ));
        }
        let recovery = recovery.ok_or_else(|| {
            RecoveryError::Internal("recovery attempted but with no results".into())
        })?;
        if recovery.successor_key.is_none() {
            return Err(RecoveryError::NoSuccessorPromoted(
                recovery.analysis_entry.analyzed_key.string_code(),
            ));
        }
        Ok(recovery)
    }
}
