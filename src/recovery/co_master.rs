//! Dead-co-master recovery executor.
//!
//! Co-masters replicate from each other with at most one writable at a
//! time. When one dies, its replicas regroup as in master recovery, but
//! the surviving co-master may have to be the promotion target: always
//! when it is writable, and whenever the operator demands it. When a
//! plain replica wins the promotion instead, it is detached from its
//! former master, or the remaining topology would close into a
//! three-node replication cycle.

use super::engine::RecoveryEngine;
use super::{FailureClass, MasterRecoveryType, TopologyRecovery};
use crate::types::{Instance, InstanceKey, ReplicationAnalysis};
use metrics::counter;
use std::sync::Arc;
use tracing::warn;

impl RecoveryEngine {
    pub(crate) async fn check_and_recover_dead_co_master(
        &self,
        analysis: ReplicationAnalysis,
        force: bool,
        skip_processes: bool,
    ) -> (bool, Option<TopologyRecovery>) {
        if !(force || analysis.cluster.automated_master_recovery) {
            return (false, None);
        }
        let mut recovery = match self.store.register_attempt(&analysis, !force, !force).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    &format!(
                        "found an active or recent recovery on {}. Will not issue another co-master recovery.",
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

        counter!("recover.dead_co_master.start").increment(1);
        let failed_key = recovery.analysis_entry.analyzed_key.clone();
        let (mut promoted, lost_replicas) = self
            .recover_dead_co_master(&mut recovery, skip_processes)
            .await;
        for replica in &lost_replicas {
            recovery.lost_replicas.insert(replica.key.clone());
        }

        // Freshness gate, after rewiring and before resolution: the
        // promotion is discarded, the lost-replica state remains.
        if let Some(instance) = &promoted {
            if self.config.fail_master_promotion_if_sql_thread_not_up_to_date
                && !instance.sql_thread_up_to_date()
            {
                let message = format!(
                    "promoted replica {} has unapplied relay logs and FailMasterPromotionIfSQLThreadNotUpToDate is set; aborting promotion",
                    instance.key
                );
                self.audit(Some(&recovery), &message).await;
                recovery.add_error(&message);
                promoted = None;
            }
        }

        if let Err(e) = self.store.resolve(&mut recovery, promoted.as_ref()).await {
            warn!(error = %e, "Failed to resolve recovery");
        }
        match &promoted {
            None => {
                self.topology
                    .audit_operation(
                        "recover-dead-co-master",
                        &failed_key,
                        "Failure: no replica promoted.",
                    )
                    .await;
            }
            Some(instance) => {
                self.topology
                    .audit_operation(
                        "recover-dead-co-master",
                        &failed_key,
                        &format!("promoted: {}", instance.key),
                    )
                    .await;
            }
        }

        if let Some(instance) = &promoted {
            counter!("recover.dead_co_master.success").increment(1);
            if self.config.apply_mysql_promotion_after_master_failover {
                self.audit(
                    Some(&recovery),
                    "will apply MySQL changes to promoted master",
                )
                .await;
                if let Err(e) = self.topology.set_read_only(&instance.key, false).await {
                    recovery.add_error(&e);
                }
            }
            if !skip_processes {
                self.execute_hook_batch(
                    &self.config.hooks.post_master_failover_processes,
                    "PostMasterFailoverProcesses",
                    &recovery,
                    false,
                )
                .await
                .ok();
            }
        } else {
            counter!("recover.dead_co_master.fail").increment(1);
        }
        (true, Some(recovery))
    }

    async fn recover_dead_co_master(
        &self,
        recovery: &mut TopologyRecovery,
        skip_processes: bool,
    ) -> (Option<Instance>, Vec<Instance>) {
        recovery.failure_class = Some(FailureClass::CoMaster);
        let analysis: ReplicationAnalysis = recovery.analysis_entry.clone();
        let failed_key = analysis.analyzed_key.clone();

        let Some(other_co_master_key) = analysis.analyzed_master_key.clone() else {
            recovery.add_error(&format!("no co-master known for {}", failed_key));
            return (None, Vec::new());
        };
        let other_co_master = match self.topology.read_instance(&other_co_master_key).await {
            Ok(Some(instance)) => instance,
            Ok(None) | Err(_) => {
                recovery.add_error(&format!(
                    "could not read info for co-master {} of {}",
                    other_co_master_key, failed_key
                ));
                return (None, Vec::new());
            }
        };

        self.topology
            .audit_operation("recover-dead-co-master", &failed_key, "problem found; will recover")
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

        let recovery_type = if analysis.gtid_immediate_topology {
            MasterRecoveryType::Gtid
        } else {
            MasterRecoveryType::PseudoGtid
        };
        recovery.recovery_type = recovery_type;
        self.audit(
            Some(recovery),
            &format!("co-master recovery type: {:?}", recovery_type),
        )
        .await;

        let outcome = match recovery_type {
            MasterRecoveryType::Gtid => {
                self.rewirer
                    .regroup_replicas_gtid(&failed_key, &|_| false, Some(&recovery.postponed))
                    .await
            }
            _ => {
                self.rewirer
                    .regroup_replicas_pseudo_gtid(&failed_key, &|_| false, Some(&recovery.postponed))
                    .await
            }
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                recovery.add_error(&e);
                Default::default()
            }
        };
        let mut promoted = outcome.promoted;
        let mut lost_replicas = outcome.lost_replicas;
        lost_replicas.extend(outcome.cannot_replicate);

        let mut must_promote_other = self.config.co_master_recovery_must_promote_other_co_master;
        if !other_co_master.read_only {
            self.audit(
                Some(recovery),
                &format!(
                    "other co-master {} is writeable hence has to be promoted",
                    other_co_master.key
                ),
            )
            .await;
            must_promote_other = true;
        }
        self.audit(
            Some(recovery),
            &format!("must-promote-other-co-master: {}", must_promote_other),
        )
        .await;

        if let Some(instance) = promoted.take() {
            recovery.participating_keys.insert(instance.key.clone());
            let forced_candidate = if must_promote_other {
                self.audit(
                    Some(recovery),
                    &format!(
                        "verifying that {} is/can be promoted",
                        other_co_master_key
                    ),
                )
                .await;
                Some(other_co_master_key.clone())
            } else {
                None
            };
            promoted = Some(
                self.replace_promoted_replica_with_candidate(
                    recovery,
                    &failed_key,
                    instance,
                    forced_candidate.as_ref(),
                )
                .await,
            );
        }

        if must_promote_other {
            if let Some(instance) = &promoted {
                if instance.key != other_co_master_key {
                    recovery.add_error(&format!(
                        "could not promote other co-master {}; was only able to promote {}; CoMasterRecoveryMustPromoteOtherCoMaster is set, therefore failing",
                        other_co_master_key, instance.key
                    ));
                    promoted = None;
                }
            }
        }

        if let Some(instance) = promoted.take() {
            if self.config.delay_master_promotion_if_sql_thread_not_up_to_date
                && !instance.sql_thread_up_to_date()
            {
                self.audit(
                    Some(recovery),
                    &format!("waiting for SQL thread to catch up on {}", instance.key),
                )
                .await;
                match self.topology.wait_for_sql_thread_up_to_date(&instance.key).await {
                    Ok(caught_up) => {
                        self.audit(
                            Some(recovery),
                            &format!("SQL thread caught up on {}", caught_up.key),
                        )
                        .await;
                        promoted = Some(caught_up);
                    }
                    Err(e) => {
                        recovery.add_error(&e);
                        promoted = Some(instance);
                    }
                }
            } else {
                promoted = Some(instance);
            }
            if let Some(instance) = &promoted {
                recovery.participating_keys.insert(instance.key.clone());
            }
        }

        // Say we started with M1<->M2 and a replica R under M2, M2 failed
        // and R was promoted. R remembers M2, M2 remembers M1, and M1 now
        // follows R: a three-node circle that must be broken. Detaching R
        // from its former master is reversible and breaks it for sure.
        if let Some(instance) = &promoted {
            if instance.key != other_co_master_key {
                if let Err(e) = self.topology.detach_replica_master_host(&instance.key).await {
                    recovery.add_error(&e);
                }
            }
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

        (promoted, lost_replicas)
    }
}
