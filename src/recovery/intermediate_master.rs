//! Dead-intermediate-master recovery executor.
//!
//! An intermediate master carries replicas but is itself a replica; its
//! loss never costs writability, so recovery is about re-homing its
//! subtree. Four plans, in order: relocate beneath a same-DC sibling,
//! regroup locally, relocate beneath an other-DC sibling, and finally
//! relocate up beneath the failed node's own master. The first plan that
//! moves at least one replica decides the successor.

use super::engine::RecoveryEngine;
use super::selection::choose_candidate_sibling;
use super::{FailureClass, TopologyRecovery};
use crate::types::{Instance, InstanceKey, ReplicationAnalysis};
use metrics::counter;
use tracing::warn;

impl RecoveryEngine {
    pub(crate) async fn check_and_recover_dead_intermediate_master(
        &self,
        analysis: ReplicationAnalysis,
        force: bool,
        skip_processes: bool,
    ) -> (bool, Option<TopologyRecovery>) {
        if !(force || analysis.cluster.automated_intermediate_master_recovery) {
            return (false, None);
        }
        let mut recovery = match self.store.register_attempt(&analysis, !force, !force).await {
            Ok(Some(recovery)) => recovery,
            Ok(None) => {
                self.audit(
                    None,
                    &format!(
                        "found an active or recent recovery on {}. Will not issue another intermediate-master recovery.",
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

        counter!("recover.dead_intermediate_master.start").increment(1);
        let successor = self
            .recover_dead_intermediate_master(&mut recovery, skip_processes)
            .await;

        if successor.is_some() {
            counter!("recover.dead_intermediate_master.success").increment(1);
            if !skip_processes {
                self.execute_hook_batch(
                    &self.config.hooks.post_intermediate_master_failover_processes,
                    "PostIntermediateMasterFailoverProcesses",
                    &recovery,
                    false,
                )
                .await
                .ok();
            }
        } else {
            counter!("recover.dead_intermediate_master.fail").increment(1);
        }
        (true, Some(recovery))
    }

    async fn recover_dead_intermediate_master(
        &self,
        recovery: &mut TopologyRecovery,
        skip_processes: bool,
    ) -> Option<Instance> {
        recovery.failure_class = Some(FailureClass::IntermediateMaster);
        let failed_key = recovery.analysis_entry.analyzed_key.clone();
        self.topology
            .audit_operation(
                "recover-dead-intermediate-master",
                &failed_key,
                "problem found; will recover",
            )
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
                if let Err(e) = self.store.resolve(recovery, None).await {
                    warn!(error = %e, "Failed to resolve recovery");
                }
                return None;
            }
        }

        let intermediate_master = match self.topology.read_instance(&failed_key).await {
            Ok(Some(instance)) => instance,
            Ok(None) | Err(_) => {
                recovery.add_error(&format!("cannot read instance {}", failed_key));
                if let Err(e) = self.store.resolve(recovery, None).await {
                    warn!(error = %e, "Failed to resolve recovery");
                }
                return None;
            }
        };

        let candidate_sibling = self.candidate_sibling_of(recovery, &intermediate_master).await;

        let mut resolved = false;
        let mut successor: Option<Instance> = None;

        // Plan A: a replacement intermediate master in the same data
        // center.
        if let Some(sibling) = candidate_sibling
            .as_ref()
            .filter(|s| s.data_center == intermediate_master.data_center)
        {
            if let Some(instance) = self
                .relocate_replicas_to_sibling(recovery, &failed_key, sibling)
                .await
            {
                resolved = true;
                successor = Some(instance);
            }
        }

        if !resolved {
            // Plan B: regroup. A local replica takes over its siblings,
            // which keeps replication streams within the failure domain.
            self.audit(Some(recovery), "will next attempt regrouping of replicas")
                .await;
            match self.rewirer.regroup_replicas(&failed_key).await {
                Ok(outcome) => {
                    if let Some(promoted) = outcome.promoted {
                        self.audit(
                            Some(recovery),
                            &format!(
                                "regrouped under {}, with {} lost replicas",
                                promoted.key,
                                outcome.lost_replicas.len()
                            ),
                        )
                        .await;
                        recovery.participating_keys.insert(promoted.key.clone());
                        if outcome.lost_replicas.is_empty() && outcome.cannot_replicate.is_empty() {
                            // Flawless regroup: the local takeover is a
                            // valid successor. Plans C/D may still improve
                            // on where it hangs.
                            successor = Some(promoted);
                        }
                    }
                }
                Err(e) => {
                    self.audit(Some(recovery), &format!("regroup failed: {}", e)).await;
                    recovery.add_error(&e);
                }
            }

            // Plan C: a sibling in another data center is better than
            // nothing.
            if let Some(sibling) = candidate_sibling
                .as_ref()
                .filter(|s| s.data_center != intermediate_master.data_center)
            {
                self.audit(
                    Some(recovery),
                    "will next attempt relocating to another DC server",
                )
                .await;
                if let Some(instance) = self
                    .relocate_replicas_to_sibling(recovery, &failed_key, sibling)
                    .await
                {
                    resolved = true;
                    successor = Some(instance);
                }
            }
        }

        if !resolved {
            // Plan D: match up whatever is left under the failed node's
            // own master. Still valid when the regroup partially failed;
            // anything not regrouped is simply promoted up.
            self.audit(
                Some(recovery),
                &format!("will next attempt to relocate up from {}", failed_key),
            )
            .await;
            match &intermediate_master.master_key {
                Some(master_key) => {
                    match self.rewirer.relocate_replicas(&failed_key, master_key).await {
                        Ok((relocated, errors)) => {
                            recovery.add_errors(&errors);
                            recovery.participating_keys.insert(master_key.clone());
                            if !relocated.is_empty() {
                                resolved = true;
                                if successor.is_none() {
                                    successor =
                                        self.topology.read_instance(master_key).await.ok().flatten();
                                }
                                self.topology
                                    .audit_operation(
                                        "recover-dead-intermediate-master",
                                        &failed_key,
                                        &format!(
                                            "relocated {} replicas under {} with {} errors",
                                            relocated.len(),
                                            master_key,
                                            errors.len()
                                        ),
                                    )
                                    .await;
                            } else {
                                recovery.add_error(&format!(
                                    "failed to match up any replica from {}",
                                    failed_key
                                ));
                            }
                        }
                        Err(e) => recovery.add_error(&e),
                    }
                }
                None => {
                    recovery.add_error(&format!(
                        "{} has no master to relocate replicas up to",
                        failed_key
                    ));
                }
            }
        }

        if !resolved {
            successor = None;
        }
        self.downtime_and_acknowledge(&failed_key, &[]).await;
        if let Err(e) = self.store.resolve(recovery, successor.as_ref()).await {
            warn!(error = %e, "Failed to resolve recovery");
        }
        successor
    }

    /// The best sibling of a dead intermediate master, or none.
    async fn candidate_sibling_of(
        &self,
        recovery: &mut TopologyRecovery,
        intermediate_master: &Instance,
    ) -> Option<Instance> {
        let master_key = intermediate_master.master_key.as_ref()?;
        let siblings = self.topology.read_replicas(master_key).await.ok()?;
        if siblings.len() <= 1 {
            return None;
        }
        self.audit(
            Some(recovery),
            &format!(
                "searching for the best candidate sibling of dead intermediate master {}",
                intermediate_master.key
            ),
        )
        .await;
        let chosen = choose_candidate_sibling(intermediate_master, &siblings);
        match &chosen {
            Some(sibling) => {
                self.audit(
                    Some(recovery),
                    &format!("found {} as candidate sibling", sibling.key),
                )
                .await
            }
            None => {
                self.audit(
                    Some(recovery),
                    &format!(
                        "cannot find candidate sibling of {}",
                        intermediate_master.key
                    ),
                )
                .await
            }
        }
        chosen
    }

    /// Attempt moving all of the failed node's replicas beneath a sibling.
    /// Success requires every replica to move cleanly.
    async fn relocate_replicas_to_sibling(
        &self,
        recovery: &mut TopologyRecovery,
        failed_key: &InstanceKey,
        sibling: &Instance,
    ) -> Option<Instance> {
        self.audit(
            Some(recovery),
            &format!("will attempt a candidate intermediate master: {}", sibling.key),
        )
        .await;
        let (relocated, errors) = match self
            .rewirer
            .relocate_replicas(failed_key, &sibling.key)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                recovery.add_error(&e);
                return None;
            }
        };
        recovery.add_errors(&errors);
        recovery.participating_keys.insert(sibling.key.clone());

        if relocated.is_empty() {
            self.audit(
                Some(recovery),
                &format!(
                    "failed to move any replica to candidate intermediate master {}",
                    sibling.key
                ),
            )
            .await;
            return None;
        }
        if !errors.is_empty() {
            self.audit(
                Some(recovery),
                &format!(
                    "move to candidate intermediate master {} did not complete: {} errors",
                    sibling.key,
                    errors.len()
                ),
            )
            .await;
            return None;
        }
        self.topology
            .audit_operation(
                "recover-dead-intermediate-master",
                failed_key,
                &format!(
                    "relocated {} replicas under candidate sibling {}",
                    relocated.len(),
                    sibling.key
                ),
            )
            .await;
        Some(sibling.clone())
    }
}
