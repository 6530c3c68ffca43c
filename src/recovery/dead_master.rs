//! Dead-master recovery executor.

use super::engine::RecoveryEngine;
use super::selection::{
    self, geographic_constraint_violation, suggest_replacement_for_promoted_replica,
    ReplacementSearch,
};
use super::rewire::{RegroupOutcome, Rewirer};
use super::{FailureClass, MasterRecoveryType, TopologyRecovery};
use crate::kv::cluster_master_kv_pairs;
use crate::topology::{DOWNTIME_LOST_IN_RECOVERY, MAINTENANCE_OWNER};
use crate::types::{command_hint, Instance, InstanceKey, PromotionRule};
use metrics::counter;
use std::sync::Arc;
use tracing::warn;

impl RecoveryEngine {
    /// Check a dead-master analysis, decide whether to act, and possibly
    /// recover. Returns whether action was taken.
    pub(crate) async fn check_and_recover_dead_master(
        &self,
        analysis: crate::types::ReplicationAnalysis,
        candidate_key: Option<InstanceKey>,
        force: bool,
        skip_processes: bool,
    ) -> (bool, Option<TopologyRecovery>) {
        if !(force || analysis.cluster.automated_master_recovery) {
            return (false, None);
        }
        let registration = self
            .store
            .register_attempt(&analysis, !force, !force)
            .await;
        let mut recovery = match registration {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    &format!(
                        "found an active or recent recovery on {}. Will not issue another dead-master recovery.",
                        analysis.analyzed_key
                    ),
                )
                .await;
                return (false, None);
            }
            Err(e) => {
                warn!(error = %e, "Recovery registration failed");
                return (false, None);
            }
        };

        self.audit(
            Some(&recovery),
            &format!(
                "will handle dead-master event on {}",
                analysis.cluster.cluster_name
            ),
        )
        .await;
        counter!("recover.dead_master.start").increment(1);

        let (mut promoted, lost_replicas) = self
            .recover_dead_master(&mut recovery, candidate_key.as_ref(), skip_processes)
            .await;
        for replica in &lost_replicas {
            recovery.lost_replicas.insert(replica.key.clone());
        }

        // Override gates: the rewirer may have succeeded and the promotion
        // still be unacceptable.
        if let Some(instance) = promoted.take() {
            promoted = self.override_master_promotion(&mut recovery, instance).await;
        }

        if let Err(e) = self.store.resolve(&mut recovery, promoted.as_ref()).await {
            warn!(error = %e, "Failed to resolve recovery");
        }

        if let Some(promoted_instance) = &promoted {
            counter!("recover.dead_master.success").increment(1);
            self.audit(
                Some(&recovery),
                &format!("successfully promoted {}", promoted_instance.key),
            )
            .await;
            self.finalize_master_promotion(&mut recovery, promoted_instance, skip_processes)
                .await;
        } else {
            counter!("recover.dead_master.fail").increment(1);
        }

        (true, Some(recovery))
    }

    /// Apply the post-rewiring promotion gates: geography, and the SQL
    /// thread freshness policies. The fail gate takes precedence over the
    /// delay gate when both are set.
    async fn override_master_promotion(
        &self,
        recovery: &mut TopologyRecovery,
        promoted: Instance,
    ) -> Option<Instance> {
        if let Some(reason) =
            geographic_constraint_violation(&self.config, &recovery.analysis_entry, &promoted)
        {
            let message = format!("failed {} promotion; {}", promoted.key, reason);
            self.audit(Some(recovery), &message).await;
            recovery.add_error(&message);
            return None;
        }
        if self.config.fail_master_promotion_if_sql_thread_not_up_to_date
            && !promoted.sql_thread_up_to_date()
        {
            let message = format!(
                "failed promotion: promoted replica {} has unapplied relay logs and FailMasterPromotionIfSQLThreadNotUpToDate is set",
                promoted.key
            );
            self.audit(Some(recovery), &message).await;
            recovery.add_error(&message);
            return None;
        }
        if self.config.delay_master_promotion_if_sql_thread_not_up_to_date
            && !promoted.sql_thread_up_to_date()
        {
            self.audit(
                Some(recovery),
                &format!("waiting for SQL thread to catch up on {}", promoted.key),
            )
            .await;
            match self
                .topology
                .wait_for_sql_thread_up_to_date(&promoted.key)
                .await
            {
                Ok(caught_up) => {
                    self.audit(
                        Some(recovery),
                        &format!("SQL thread caught up on {}", caught_up.key),
                    )
                    .await;
                    return Some(caught_up);
                }
                Err(e) => {
                    let message = format!("error waiting for SQL thread on {}: {}", promoted.key, e);
                    self.audit(Some(recovery), &message).await;
                    recovery.add_error(&message);
                    return None;
                }
            }
        }
        Some(promoted)
    }

    /// The rewiring body of a dead-master recovery: pre-hooks, regroup in
    /// the mode the analysis calls for, lost-replica bookkeeping, and the
    /// candidate-replacement pass.
    async fn recover_dead_master(
        &self,
        recovery: &mut TopologyRecovery,
        candidate_key: Option<&InstanceKey>,
        skip_processes: bool,
    ) -> (Option<Instance>, Vec<Instance>) {
        recovery.failure_class = Some(FailureClass::Master);
        let failed_key = recovery.analysis_entry.analyzed_key.clone();
        self.topology
            .audit_operation("recover-dead-master", &failed_key, "problem found; will recover")
            .await;

        if !skip_processes {
            if let Err(e) = self
                .execute_hook_batch(
                    &self.config.hooks.pre_failover_processes,
                    "PreFailoverProcesses",
                    recovery,
                    true,
                )
                .await
            {
                recovery.add_error(&e);
                return (None, Vec::new());
            }
        }

        self.audit(Some(recovery), &format!("will recover {}", failed_key))
            .await;

        let recovery_type = if recovery.analysis_entry.gtid_immediate_topology {
            MasterRecoveryType::Gtid
        } else if recovery.analysis_entry.binlog_server_immediate_topology {
            MasterRecoveryType::BinlogServer
        } else {
            MasterRecoveryType::PseudoGtid
        };
        recovery.recovery_type = recovery_type;
        self.audit(
            Some(recovery),
            &format!("master recovery type: {:?}", recovery_type),
        )
        .await;

        let ideal_candidate = candidate_key.cloned();
        let ideal_data_center = recovery.analysis_entry.data_center.clone();
        let ideal_environment = recovery.analysis_entry.physical_environment.clone();
        let promoted_replica_is_ideal = move |promoted: &Instance| -> bool {
            if let Some(candidate) = &ideal_candidate {
                return &promoted.key == candidate;
            }
            matches!(
                promoted.promotion_rule,
                PromotionRule::MustPromote | PromotionRule::PreferPromote
            ) && promoted.data_center == ideal_data_center
                && promoted.physical_environment == ideal_environment
        };

        let outcome = match recovery_type {
            MasterRecoveryType::Gtid => {
                self.audit(Some(recovery), "regrouping replicas via GTID").await;
                self.rewirer
                    .regroup_replicas_gtid(
                        &failed_key,
                        &promoted_replica_is_ideal,
                        Some(&recovery.postponed),
                    )
                    .await
            }
            MasterRecoveryType::PseudoGtid => {
                self.audit(Some(recovery), "regrouping replicas via pseudo-GTID")
                    .await;
                self.rewirer
                    .regroup_replicas_pseudo_gtid(
                        &failed_key,
                        &promoted_replica_is_ideal,
                        Some(&recovery.postponed),
                    )
                    .await
            }
            MasterRecoveryType::BinlogServer | MasterRecoveryType::NotMasterRecovery => {
                self.audit(Some(recovery), "recovering via binlog servers").await;
                self.rewirer
                    .recover_master_via_binlog_servers(&failed_key, &recovery.postponed)
                    .await
                    .map(|promoted| RegroupOutcome {
                        promoted,
                        ..Default::default()
                    })
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                recovery.add_error(&e);
                RegroupOutcome::default()
            }
        };
        let mut promoted = outcome.promoted;
        // The ideal-candidate shortcut only holds when no explicit
        // candidate steered the election.
        let postponed_all = outcome.promoted_is_ideal && candidate_key.is_none();
        if postponed_all {
            self.audit(
                Some(recovery),
                "promoted replica is an ideal candidate; non-essential moves were postponed",
            )
            .await;
        }

        let mut lost_replicas = outcome.lost_replicas;
        lost_replicas.extend(outcome.cannot_replicate);
        for replica in &lost_replicas {
            self.audit(Some(recovery), &format!("- lost replica: {}", replica.key))
                .await;
        }

        if promoted.is_some()
            && !lost_replicas.is_empty()
            && self.config.detach_lost_replicas_after_master_failover
        {
            let topology = Arc::clone(&self.topology);
            let lost_keys: Vec<InstanceKey> =
                lost_replicas.iter().map(|r| r.key.clone()).collect();
            recovery.postponed.add(
                format!("detach {} lost replicas", lost_keys.len()),
                Box::pin(async move {
                    for key in lost_keys {
                        if let Err(e) = topology.detach_replica_master_host(&key).await {
                            warn!(replica = %key, error = %e, "Could not detach lost replica");
                        }
                    }
                    Ok(())
                }),
            );
        }

        self.downtime_and_acknowledge(&failed_key, &lost_replicas).await;

        self.audit(
            Some(recovery),
            &format!("{} postponed functions", recovery.postponed.len()),
        )
        .await;

        if let Some(instance) = promoted.take() {
            promoted = Some(if postponed_all {
                instance
            } else {
                self.replace_promoted_replica_with_candidate(
                    recovery,
                    &failed_key,
                    instance,
                    candidate_key,
                )
                .await
            });
        }

        match &promoted {
            None => {
                let message = "Failure: no replica promoted.";
                self.audit(Some(recovery), message).await;
                self.topology
                    .audit_operation("recover-dead-master", &failed_key, message)
                    .await;
            }
            Some(instance) => {
                let message = format!("promoted replica: {}", instance.key);
                self.audit(Some(recovery), &message).await;
                self.topology
                    .audit_operation("recover-dead-master", &failed_key, &message)
                    .await;
            }
        }
        (promoted, lost_replicas)
    }

    /// Downtime the failed instance and every lost replica, and mark the
    /// originating detection as handled.
    pub(crate) async fn downtime_and_acknowledge(
        &self,
        failed_key: &InstanceKey,
        lost_replicas: &[Instance],
    ) {
        let duration = self.config.lost_in_recovery_downtime();
        if let Err(e) = self
            .topology
            .begin_downtime(failed_key, MAINTENANCE_OWNER, DOWNTIME_LOST_IN_RECOVERY, duration)
            .await
        {
            warn!(instance = %failed_key, error = %e, "Could not downtime failed instance");
        }
        self.store.acknowledge_failure_detection(failed_key);
        for replica in lost_replicas {
            if let Err(e) = self
                .topology
                .begin_downtime(&replica.key, MAINTENANCE_OWNER, DOWNTIME_LOST_IN_RECOVERY, duration)
                .await
            {
                warn!(instance = %replica.key, error = %e, "Could not downtime lost replica");
            }
        }
    }

    /// A master (or co-master) died and `promoted` replaced it. Is there
    /// an even better replica to put on top? With `candidate_key` given,
    /// that candidate is forced; otherwise the tiered search decides.
    pub(crate) async fn replace_promoted_replica_with_candidate(
        &self,
        recovery: &mut TopologyRecovery,
        dead_key: &InstanceKey,
        promoted: Instance,
        candidate_key: Option<&InstanceKey>,
    ) -> Instance {
        self.audit(
            Some(recovery),
            "checking if should replace promoted replica with a better candidate",
        )
        .await;

        let candidate_replicas = self
            .topology
            .read_cluster_candidate_instances(&promoted.cluster_name)
            .await
            .unwrap_or_default();
        let candidate_replicas = selection::remove_instance(candidate_replicas, dead_key);
        let neutral_replicas = self
            .topology
            .read_cluster_neutral_instances(&promoted.cluster_name)
            .await
            .unwrap_or_default();
        let dead_instance = self.topology.read_instance(dead_key).await.ok().flatten();
        let supplied_candidate = match candidate_key {
            Some(key) => self.topology.read_instance(key).await.ok().flatten(),
            None => None,
        };

        let suggestion = suggest_replacement_for_promoted_replica(&ReplacementSearch {
            config: &self.config,
            analysis: &recovery.analysis_entry,
            promoted: &promoted,
            dead_instance: dead_instance.as_ref(),
            supplied_candidate: supplied_candidate.as_ref(),
            candidate_replicas: &candidate_replicas,
            neutral_replicas: &neutral_replicas,
        });
        for note in &suggestion.notes {
            self.audit(Some(recovery), note).await;
        }
        if !suggestion.action_required {
            self.audit(
                Some(recovery),
                &format!("promoted instance {} requires no further action", promoted.key),
            )
            .await;
            return promoted;
        }

        let candidate = suggestion.replacement;
        self.audit(
            Some(recovery),
            &format!(
                "promoted instance {} is not the suggested candidate {}. Will see what can be done",
                promoted.key, candidate.key
            ),
        )
        .await;

        if candidate.master_key.as_ref() != Some(&promoted.key) {
            self.audit(
                Some(recovery),
                &format!("could not manage to promote suggested candidate {}", candidate.key),
            )
            .await;
            return promoted;
        }

        self.audit(
            Some(recovery),
            &format!(
                "suggested candidate {} is a replica of promoted instance {}. Will take its master",
                candidate.key, promoted.key
            ),
        )
        .await;
        let allow_taking_co_master = recovery.failure_class == Some(FailureClass::CoMaster);
        match self
            .topology
            .take_master(&candidate.key, allow_taking_co_master)
            .await
        {
            Ok(candidate) => {
                self.audit(
                    Some(recovery),
                    &format!("success promoting {} over {}", candidate.key, promoted.key),
                )
                .await;
                recovery.participating_keys.insert(candidate.key.clone());

                // The rest of the promoted server's replicas follow the
                // winner off the critical path.
                let topology = Arc::clone(&self.topology);
                let from = promoted.key.clone();
                let to = candidate.key.clone();
                recovery.postponed.add(
                    format!("relocate replicas of {} below {}", promoted.key, candidate.key),
                    Box::pin(async move {
                        let rewirer = Rewirer::new(topology);
                        let (relocated, errors) = rewirer.relocate_replicas(&from, &to).await?;
                        if !errors.is_empty() {
                            warn!(
                                relocated = relocated.len(),
                                failed = errors.len(),
                                "Partial relocation under replacement candidate"
                            );
                        }
                        Ok(())
                    }),
                );
                candidate
            }
            Err(e) => {
                recovery.add_error(&e);
                self.audit(
                    Some(recovery),
                    &format!("could not manage to promote suggested candidate {}: {}", candidate.key, e),
                )
                .await;
                promoted
            }
        }
    }

    /// Success-path side effects of a master promotion: MySQL promotion
    /// statements, key-value advertisement, alias and attribute updates,
    /// and the post-master-failover hook batch.
    async fn finalize_master_promotion(
        &self,
        recovery: &mut TopologyRecovery,
        promoted: &Instance,
        skip_processes: bool,
    ) {
        let analysis = recovery.analysis_entry.clone();

        if self.config.apply_mysql_promotion_after_master_failover
            || analysis.command_hint == command_hint::GRACEFUL_MASTER_TAKEOVER
        {
            // On graceful takeover, clearing replication config and
            // read-only always makes sense, whatever the operator default.
            self.audit(Some(recovery), "will apply MySQL changes to promoted master")
                .await;
            let mut reset = self.topology.reset_replication(&promoted.key).await;
            if reset.is_err() {
                // This matters enough for a second try.
                reset = self.topology.reset_replication(&promoted.key).await;
            }
            self.audit(
                Some(recovery),
                &format!(
                    "applying reset-replication on promoted master: success={}",
                    reset.is_ok()
                ),
            )
            .await;
            if reset.is_err() {
                self.audit(
                    Some(recovery),
                    &format!(
                        "NOTE: {} is promoted even though it may still show a configured master",
                        promoted.key
                    ),
                )
                .await;
            }

            let read_only_cleared = self.topology.set_read_only(&promoted.key, false).await;
            self.audit(
                Some(recovery),
                &format!(
                    "applying read-only=0 on promoted master: success={}",
                    read_only_cleared.is_ok()
                ),
            )
            .await;

            // Best effort on the demoted master; it may well be dead.
            let topology = Arc::clone(&self.topology);
            let old_master_key = analysis.analyzed_key.clone();
            tokio::spawn(async move {
                let _ = topology.set_read_only(&old_master_key, true).await;
            });
        }

        let kv_pairs = cluster_master_kv_pairs(
            &self.config.kv_cluster_master_prefix,
            &analysis.cluster.cluster_alias,
            &promoted.key,
        );
        self.audit(Some(recovery), &format!("writing {} KV pairs", kv_pairs.len()))
            .await;
        if self.consensus.is_enabled() {
            for pair in &kv_pairs {
                if let Err(e) = self
                    .consensus
                    .publish_command(
                        "put-key-value",
                        serde_json::to_value(pair).unwrap_or(serde_json::Value::Null),
                    )
                    .await
                {
                    warn!(error = %e, "Failed to publish KV pair");
                }
            }
            // Followers re-apply put-key-value on startup; a snapshot in
            // the near future mitigates replays against third parties.
            let consensus = Arc::clone(&self.consensus);
            tokio::spawn(async move {
                let _ = consensus
                    .publish_command("async-snapshot", serde_json::Value::String(String::new()))
                    .await;
            });
        } else {
            for pair in &kv_pairs {
                if let Err(e) = self.kv.put(pair).await {
                    warn!(key = %pair.key, error = %e, "Failed to write KV pair");
                }
            }
        }
        self.audit(Some(recovery), "distributing KV pairs").await;
        if let Err(e) = self.kv.distribute(&kv_pairs).await {
            warn!(error = %e, "Failed to distribute KV pairs");
        }

        if self.config.master_failover_detach_replica_master_host {
            let topology = Arc::clone(&self.topology);
            let promoted_key = promoted.key.clone();
            recovery.postponed.add(
                format!("detach master host on promoted master {}", promoted_key),
                Box::pin(async move {
                    topology.detach_replica_master_host(&promoted_key).await?;
                    Ok(())
                }),
            );
        }

        let before = analysis.analyzed_key.string_code();
        let after = promoted.key.string_code();
        self.audit(
            Some(recovery),
            &format!("updating cluster alias: {} -> {}", before, after),
        )
        .await;
        if analysis.cluster.cluster_alias.is_empty() {
            if let Err(e) = self
                .topology
                .replace_alias_cluster_name(&before, &after)
                .await
            {
                warn!(error = %e, "Failed to replace alias cluster name");
            }
        } else if let Err(e) = self
            .topology
            .set_cluster_alias(&after, &analysis.cluster.cluster_alias)
            .await
        {
            warn!(error = %e, "Failed to update cluster alias");
        }

        if !analysis.cluster.cluster_domain.is_empty() {
            if let Err(e) = self
                .topology
                .set_general_attribute(&analysis.cluster.cluster_domain, &after)
                .await
            {
                warn!(error = %e, "Failed to set cluster domain attribute");
            }
        }

        if !skip_processes {
            self.execute_hook_batch(
                &self.config.hooks.post_master_failover_processes,
                "PostMasterFailoverProcesses",
                recovery,
                false,
            )
            .await
            .ok();
        }
    }
}
