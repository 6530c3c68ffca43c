//! The recovery dispatcher.
//!
//! Routes each analysis entry to the executor for its failure class,
//! enforces the leader-only rule under consensus, honors the global
//! recovery-disabled gate, runs emergency probes and failure-detection
//! hooks, and drains postponed functions before a dispatch returns.

use super::probes::EmergencyProbes;
use super::rewire::Rewirer;
use super::store::RecoveryStore;
use super::TopologyRecovery;
use crate::config::RecoveryConfig;
use crate::consensus::ConsensusLog;
use crate::error::Result;
use crate::hooks::{self, HookRunner};
use crate::kv::KvStore;
use crate::topology::TopologyAccess;
use crate::types::{AnalysisCode, AnalysisHints, InstanceKey, ReplicationAnalysis};
use metrics::gauge;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Which executor an analysis code routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryProcedure {
    DeadMaster,
    DeadIntermediateMaster,
    DeadCoMaster,
    /// Recognized but non-actionable: probes may fire, nothing else does.
    GenericProblem,
}

/// The recovery engine: dispatcher plus executors.
pub struct RecoveryEngine {
    pub(crate) config: Arc<RecoveryConfig>,
    pub(crate) topology: Arc<dyn TopologyAccess>,
    pub(crate) store: Arc<RecoveryStore>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) consensus: Arc<dyn ConsensusLog>,
    pub(crate) hooks: Arc<dyn HookRunner>,
    pub(crate) rewirer: Rewirer,
    probes: EmergencyProbes,
    pending_recoveries: AtomicI64,
}

impl RecoveryEngine {
    pub fn new(
        config: Arc<RecoveryConfig>,
        topology: Arc<dyn TopologyAccess>,
        kv: Arc<dyn KvStore>,
        consensus: Arc<dyn ConsensusLog>,
        hooks: Arc<dyn HookRunner>,
    ) -> Self {
        let store = Arc::new(RecoveryStore::new(
            Arc::clone(&config),
            Arc::clone(&consensus),
        ));
        let probes = EmergencyProbes::new(config.probes.clone(), Arc::clone(&topology));
        let rewirer = Rewirer::new(Arc::clone(&topology));
        Self {
            config,
            topology,
            store,
            kv,
            consensus,
            hooks,
            rewirer,
            probes,
            pending_recoveries: AtomicI64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<RecoveryStore> {
        &self.store
    }

    pub fn topology(&self) -> &Arc<dyn TopologyAccess> {
        &self.topology
    }

    /// Number of dispatches currently in flight.
    pub fn pending_recoveries(&self) -> i64 {
        self.pending_recoveries.load(Ordering::SeqCst)
    }

    /// Routing table: analysis code to executor plus actionability.
    pub(crate) fn recovery_procedure(
        &self,
        code: AnalysisCode,
        analyzed_key: &InstanceKey,
    ) -> (Option<RecoveryProcedure>, bool) {
        use AnalysisCode::*;
        match code {
            DeadMaster | DeadMasterAndSomeReplicas => {
                if self.probes.in_grace_period(analyzed_key) {
                    // An emergent nudge just went out; give the topology a
                    // moment to show whether it resolved the issue.
                    (Some(RecoveryProcedure::GenericProblem), false)
                } else {
                    (Some(RecoveryProcedure::DeadMaster), true)
                }
            }
            DeadIntermediateMaster
            | DeadIntermediateMasterAndSomeReplicas
            | DeadIntermediateMasterWithSingleReplicaFailingToConnect
            | AllIntermediateMasterReplicasFailingToConnectOrDead => {
                (Some(RecoveryProcedure::DeadIntermediateMaster), true)
            }
            DeadIntermediateMasterAndReplicas => (Some(RecoveryProcedure::GenericProblem), false),
            DeadCoMaster | DeadCoMasterAndSomeReplicas => {
                (Some(RecoveryProcedure::DeadCoMaster), true)
            }
            DeadMasterAndReplicas
            | UnreachableMaster
            | UnreachableMasterWithLaggingReplicas
            | AllMasterReplicasNotReplicating
            | AllMasterReplicasNotReplicatingOrDead => {
                (Some(RecoveryProcedure::GenericProblem), false)
            }
            NoProblem | FirstTierReplicaFailingToConnectToMaster => (None, false),
        }
    }

    /// Audit one recovery step: logged, persisted, and published.
    pub(crate) async fn audit(&self, recovery: Option<&TopologyRecovery>, message: &str) {
        info!(target: "topology_recovery", "{}", message);
        if let Some(recovery) = recovery {
            if let Err(e) = self.store.write_step(&recovery.uid, message).await {
                warn!(error = %e, "Failed to persist recovery step");
            }
        }
    }

    /// Run a hook batch sequentially with placeholder substitution.
    /// With `fail_on_error`, the first failing hook aborts the batch.
    pub(crate) async fn execute_hook_batch(
        &self,
        commands: &[String],
        description: &str,
        recovery: &TopologyRecovery,
        fail_on_error: bool,
    ) -> Result<()> {
        if commands.is_empty() {
            self.audit(Some(recovery), &format!("No {} hooks to run", description))
                .await;
            return Ok(());
        }

        self.audit(
            Some(recovery),
            &format!("Running {} {} hooks", commands.len(), description),
        )
        .await;
        let mut first_error: Option<crate::error::RecoveryError> = None;
        for (i, command) in commands.iter().enumerate() {
            let full_description = format!("{} hook {} of {}", description, i + 1, commands.len());
            let command = hooks::apply_placeholders(command, recovery, &self.config.hostname);
            let env = hooks::hook_environment(recovery, &self.config.hostname);

            self.audit(
                Some(recovery),
                &format!("Running {}: {}", full_description, command),
            )
            .await;
            let start = std::time::Instant::now();
            match self.hooks.run(&command, &env).await {
                Ok(()) => {
                    self.audit(
                        Some(recovery),
                        &format!("Completed {} in {:?}", full_description, start.elapsed()),
                    )
                    .await;
                }
                Err(e) => {
                    let message = format!(
                        "Execution of {} failed in {:?} with error: {}",
                        full_description,
                        start.elapsed(),
                        e
                    );
                    self.audit(Some(recovery), &message).await;
                    error!("{}", message);
                    if fail_on_error {
                        self.audit(
                            Some(recovery),
                            &format!("Not running further {} hooks", description),
                        )
                        .await;
                        return Err(e);
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        self.audit(
            Some(recovery),
            &format!("done running {} hooks", description),
        )
        .await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register the failure detection and run on-detection hooks.
    async fn check_and_execute_failure_detection(
        &self,
        analysis: &ReplicationAnalysis,
        skip_processes: bool,
    ) -> Result<bool> {
        if !self.store.register_failure_detection(analysis) {
            return Ok(false);
        }
        info!(
            code = %analysis.code,
            instance = %analysis.analyzed_key,
            "Detected failure"
        );
        if self.consensus.is_enabled() {
            if let Err(e) = self
                .consensus
                .publish_command(
                    "register-failure-detection",
                    serde_json::to_value(analysis)?,
                )
                .await
            {
                warn!(error = %e, "Failed to publish failure detection");
            }
        }
        if skip_processes {
            return Ok(true);
        }
        // Detection hooks run against a transient recovery shell; no
        // registration has happened yet.
        let shell = TopologyRecovery::new(analysis.clone(), self.config.hostname.clone());
        self.execute_hook_batch(
            &self.config.hooks.on_failure_detection_processes,
            "OnFailureDetectionProcesses",
            &shell,
            true,
        )
        .await?;
        Ok(true)
    }

    /// Choose and run the recovery path for one analysis entry.
    pub async fn execute_check_and_recover(
        &self,
        analysis: ReplicationAnalysis,
        candidate_key: Option<InstanceKey>,
        force: bool,
        skip_processes: bool,
    ) -> Result<(bool, Option<TopologyRecovery>)> {
        self.pending_recoveries.fetch_add(1, Ordering::SeqCst);
        gauge!("recover.pending").increment(1.0);
        let result = self
            .execute_check_and_recover_inner(analysis, candidate_key, force, skip_processes)
            .await;
        self.pending_recoveries.fetch_sub(1, Ordering::SeqCst);
        gauge!("recover.pending").decrement(1.0);
        result
    }

    async fn execute_check_and_recover_inner(
        &self,
        mut analysis: ReplicationAnalysis,
        candidate_key: Option<InstanceKey>,
        force: bool,
        skip_processes: bool,
    ) -> Result<(bool, Option<TopologyRecovery>)> {
        let (procedure, actionable) =
            self.recovery_procedure(analysis.code, &analysis.analyzed_key);
        analysis.is_actionable = actionable;
        self.probes.run_emergent_operations(&analysis);

        let Some(procedure) = procedure else {
            if analysis.code != AnalysisCode::NoProblem {
                warn!(
                    code = %analysis.code,
                    instance = %analysis.analyzed_key,
                    "Ignoring analysis entry with no action plan"
                );
            }
            return Ok((false, None));
        };

        if self.consensus.is_enabled() && !self.consensus.is_leader() {
            // All nodes analyze; only the leader detects and recovers.
            info!(
                code = %analysis.code,
                instance = %analysis.analyzed_key,
                "Not recovering: consensus non-leader"
            );
            return Ok((false, None));
        }

        self.check_and_execute_failure_detection(&analysis, skip_processes)
            .await?;

        if self.store.is_recovery_disabled() {
            if !force {
                info!(
                    code = %analysis.code,
                    instance = %analysis.analyzed_key,
                    "Not recovering: recoveries disabled globally"
                );
                return Ok((false, None));
            }
            info!(
                instance = %analysis.analyzed_key,
                "Recoveries disabled globally but forcing this recovery"
            );
        }

        let (attempted, recovery) = match procedure {
            RecoveryProcedure::DeadMaster => {
                self.check_and_recover_dead_master(analysis, candidate_key, force, skip_processes)
                    .await
            }
            RecoveryProcedure::DeadIntermediateMaster => {
                self.check_and_recover_dead_intermediate_master(analysis, force, skip_processes)
                    .await
            }
            RecoveryProcedure::DeadCoMaster => {
                self.check_and_recover_dead_co_master(analysis, force, skip_processes)
                    .await
            }
            RecoveryProcedure::GenericProblem => (false, None),
        };

        let Some(mut recovery) = recovery else {
            return Ok((attempted, None));
        };

        if !skip_processes {
            if recovery.successor_key.is_none() {
                self.execute_hook_batch(
                    &self.config.hooks.post_unsuccessful_failover_processes,
                    "PostUnsuccessfulFailoverProcesses",
                    &recovery,
                    false,
                )
                .await
                .ok();
            } else {
                if let Some(successor_key) = recovery.successor_key.clone() {
                    if let Err(e) = self.topology.end_downtime(&successor_key).await {
                        warn!(successor = %successor_key, error = %e, "Could not end successor downtime");
                    }
                }
                self.execute_hook_batch(
                    &self.config.hooks.post_failover_processes,
                    "PostFailoverProcesses",
                    &recovery,
                    false,
                )
                .await
                .ok();
            }
        }

        self.audit(
            Some(&recovery),
            &format!("Waiting for {} postponed functions", recovery.postponed.len()),
        )
        .await;
        let failures = recovery.postponed.drain().await;
        for (description, e) in &failures {
            recovery.add_error(&format!("postponed {}: {}", description, e));
        }
        let executed = recovery.postponed.executed_descriptions();
        self.audit(
            Some(&recovery),
            &format!("Executed {} postponed functions", executed.len()),
        )
        .await;
        if !executed.is_empty() {
            self.audit(
                Some(&recovery),
                &format!("Executed postponed functions: {}", executed.join(", ")),
            )
            .await;
        }

        Ok((attempted, Some(recovery)))
    }

    /// Main entry point: fetch all current analysis entries and dispatch
    /// each.
    ///
    /// With `specific_key`, runs synchronously, honors downtimed
    /// instances, and forces the recovery; otherwise spawns one task per
    /// entry and skips downtimed instances. Entries are visited in random
    /// order so no single cluster monopolizes a stuck worker across
    /// leader changes.
    pub async fn check_and_recover(
        self: &Arc<Self>,
        specific_key: Option<InstanceKey>,
        candidate_key: Option<InstanceKey>,
        skip_processes: bool,
    ) -> Result<(bool, Option<InstanceKey>)> {
        let hints = AnalysisHints {
            include_downtimed: true,
            audit_analysis: true,
            ..Default::default()
        };
        let mut entries = self.topology.replication_analysis(None, hints).await?;
        entries.shuffle(&mut rand::thread_rng());

        let mut attempted = false;
        let mut promoted_key: Option<InstanceKey> = None;
        for analysis in entries {
            if let Some(specific) = &specific_key {
                if specific != &analysis.analyzed_key {
                    continue;
                }
            }
            if analysis.skippable_due_to_downtime && specific_key.is_none() {
                // Only recover a downtimed server when explicitly asked to.
                continue;
            }

            if specific_key.is_some() {
                let (was_attempted, recovery) = self
                    .execute_check_and_recover(
                        analysis,
                        candidate_key.clone(),
                        true,
                        skip_processes,
                    )
                    .await?;
                attempted = attempted || was_attempted;
                if let Some(recovery) = recovery {
                    promoted_key = recovery.successor_key.clone();
                }
            } else {
                let engine = Arc::clone(self);
                let candidate_key = candidate_key.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine
                        .execute_check_and_recover(analysis, candidate_key, false, skip_processes)
                        .await
                    {
                        error!(error = %e, "Recovery dispatch failed");
                    }
                });
            }
        }
        Ok((attempted, promoted_key))
    }
}
