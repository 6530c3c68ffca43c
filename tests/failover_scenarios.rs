//! End-to-end failover scenarios against the in-memory topology.
//!
//! Each test builds a small replication tree, feeds the engine an
//! analysis entry the way the external analyzer would, and verifies the
//! rewired topology, the recovery record, hook execution and key-value
//! advertisement.

#[allow(dead_code)]
mod common;

use common::*;
use masterswitch::config::RecoveryConfig;
use masterswitch::consensus::RecordingLog;
use masterswitch::hooks::RecordingHookRunner;
use masterswitch::types::{AnalysisCode, BinlogCoordinates, PromotionRule};
use std::sync::Arc;

/// Clean GTID master failover: the marked candidate in the failed
/// master's data center is promoted, the other replica is reparented
/// beneath it, and the cluster's KV entries advertise the new master.
#[tokio::test]
async fn test_clean_gtid_master_failover() {
    let mut config = RecoveryConfig::default();
    config.hooks.pre_failover_processes = vec!["echo pre {failedHost}".to_string()];
    config.hooks.post_failover_processes = vec!["echo post {successorHost}".to_string()];
    config.hooks.post_master_failover_processes =
        vec!["echo post-master {successorHost}".to_string()];
    let h = harness(config);

    let master = server("m", None, 0);
    h.topology.add_instance(master);
    let mut r1 = server("r1", Some("m"), 1000);
    r1.is_candidate = true;
    r1.promotion_rule = PromotionRule::PreferPromote;
    h.topology.add_instance(r1);
    let mut r2 = server("r2", Some("m"), 900);
    r2.data_center = "dc2".to_string();
    h.topology.add_instance(r2);
    h.topology.fail_instance(&key("m"));

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    assert!(attempted);
    let recovery = recovery.unwrap();

    assert!(recovery.is_successful);
    assert_eq!(recovery.successor_key, Some(key("r1")));
    assert!(recovery.lost_replicas.is_empty());

    // Topology: r1 is a standalone writable master, r2 follows it.
    let r1 = h.topology.get(&key("r1")).unwrap();
    assert_eq!(r1.master_key, None);
    assert!(!r1.read_only);
    assert_eq!(h.topology.get(&key("r2")).unwrap().master_key, Some(key("r1")));

    // KV advertisement.
    assert_eq!(
        h.kv.get(&format!("mysql/master/{}", CLUSTER_ALIAS)).as_deref(),
        Some("r1:3306")
    );
    assert_eq!(h.kv.distributed().len(), 3);

    // Cluster bookkeeping.
    assert_eq!(h.topology.alias_of(CLUSTER_ALIAS).as_deref(), Some("r1:3306"));
    assert_eq!(h.topology.attribute(CLUSTER_DOMAIN).as_deref(), Some("r1:3306"));

    // Hooks ran with substituted placeholders, in order.
    let commands = h.hooks.commands();
    assert!(commands.contains(&"echo pre m".to_string()));
    assert!(commands.contains(&"echo post-master r1".to_string()));
    assert!(commands.contains(&"echo post r1".to_string()));

    // The failed master is downtimed; an audit trail exists.
    assert!(h.topology.is_downtimed(&key("m")));
    assert!(!h.engine.store().steps_for(&recovery.uid).is_empty());

    // Every postponed function ran before the dispatch returned.
    assert!(recovery
        .postponed
        .executed_descriptions()
        .iter()
        .any(|d| d.contains("r2")));
    assert_eq!(h.engine.pending_recoveries(), 0);
}

/// Cross-DC rejection: the rewirer promotes the most advanced replica,
/// which sits in the wrong data center; the override gate discards the
/// promotion and the recovery resolves unsuccessfully.
#[tokio::test]
async fn test_cross_dc_promotion_rejected() {
    let mut config = RecoveryConfig::default();
    config.prevent_cross_data_center_master_failover = true;
    config.hooks.post_unsuccessful_failover_processes =
        vec!["echo unsuccessful {failedHost}".to_string()];
    let h = harness(config);

    h.topology.add_instance(server("m", None, 0));
    let mut r1 = server("r1", Some("m"), 1000);
    r1.data_center = "dc2".to_string();
    h.topology.add_instance(r1);
    // A plain leaf in the right DC: no log-replica-updates, so it can
    // never be elected nor take over.
    let mut r2 = server("r2", Some("m"), 900);
    r2.log_replica_updates_enabled = false;
    h.topology.add_instance(r2);
    h.topology.fail_instance(&key("m"));

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    assert!(attempted);
    let recovery = recovery.unwrap();

    assert!(!recovery.is_successful);
    assert_eq!(recovery.successor_key, None);
    assert!(recovery
        .all_errors
        .iter()
        .any(|e| e.contains("PreventCrossDataCenterMasterFailover")));

    // The rewiring itself is not rolled back.
    assert_eq!(h.topology.get(&key("r2")).unwrap().master_key, Some(key("r1")));
    // No KV was advertised for the discarded promotion.
    assert!(h.kv.get(&format!("mysql/master/{}", CLUSTER_ALIAS)).is_none());
    assert!(h
        .hooks
        .commands()
        .contains(&"echo unsuccessful m".to_string()));
}

/// Delayed promotion: the promoted replica has unapplied relay logs and
/// the delay policy makes the executor wait for its SQL thread before
/// declaring success.
#[tokio::test]
async fn test_delayed_promotion_waits_for_sql_thread() {
    let mut config = RecoveryConfig::default();
    config.delay_master_promotion_if_sql_thread_not_up_to_date = true;
    let h = harness(config);

    h.topology.add_instance(server("m", None, 0));
    let mut r1 = server("r1", Some("m"), 1000);
    // The IO thread has retrieved more than the SQL thread applied.
    r1.read_coordinates = BinlogCoordinates::new("master-bin.000010", 1100);
    h.topology.add_instance(r1);
    h.topology.fail_instance(&key("m"));

    let (_, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    let recovery = recovery.unwrap();

    assert!(recovery.is_successful);
    assert_eq!(recovery.successor_key, Some(key("r1")));

    let steps = h.engine.store().steps_for(&recovery.uid);
    assert!(steps
        .iter()
        .any(|s| s.message.contains("waiting for SQL thread")));
    assert!(steps.iter().any(|s| s.message.contains("caught up")));
}

/// Fail gate beats delay gate when both are set.
#[tokio::test]
async fn test_fail_gate_takes_precedence_over_delay_gate() {
    let mut config = RecoveryConfig::default();
    config.fail_master_promotion_if_sql_thread_not_up_to_date = true;
    config.delay_master_promotion_if_sql_thread_not_up_to_date = true;
    let h = harness(config);

    h.topology.add_instance(server("m", None, 0));
    let mut r1 = server("r1", Some("m"), 1000);
    r1.read_coordinates = BinlogCoordinates::new("master-bin.000010", 1100);
    h.topology.add_instance(r1);
    h.topology.fail_instance(&key("m"));

    let (_, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    let recovery = recovery.unwrap();
    assert!(!recovery.is_successful);
    assert!(recovery
        .all_errors
        .iter()
        .any(|e| e.contains("FailMasterPromotionIfSQLThreadNotUpToDate")));
}

/// Pre-failover hook failure is fatal: no rewiring, no KV, resolution
/// with nil successor.
#[tokio::test]
async fn test_pre_hook_failure_aborts_before_rewiring() {
    let mut config = RecoveryConfig::default();
    config.hooks.pre_failover_processes = vec!["pre-fail-marker {failedHost}".to_string()];
    config.hooks.post_unsuccessful_failover_processes = vec!["echo unsuccessful".to_string()];
    let h = harness_full(
        config,
        Arc::new(masterswitch::consensus::LocalLog),
        Arc::new(RecordingHookRunner::failing_on("pre-fail-marker")),
    );

    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("r1", Some("m"), 1000));
    h.topology.add_instance(server("r2", Some("m"), 900));
    h.topology.fail_instance(&key("m"));

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    assert!(attempted);
    let recovery = recovery.unwrap();

    assert!(!recovery.is_successful);
    // No rewiring happened: both replicas still point at the dead master.
    assert_eq!(h.topology.get(&key("r1")).unwrap().master_key, Some(key("m")));
    assert_eq!(h.topology.get(&key("r2")).unwrap().master_key, Some(key("m")));
    assert!(h.kv.get(&format!("mysql/master/{}", CLUSTER_ALIAS)).is_none());
    assert!(h.hooks.commands().contains(&"echo unsuccessful".to_string()));
}

/// Intermediate-master Plan B: with no qualifying sibling, the generic
/// regroup promotes the most advanced child, and Plan D relocates it up
/// under the failed node's own master.
#[tokio::test]
async fn test_intermediate_master_plan_b_regroup() {
    let mut config = RecoveryConfig::default();
    config.hooks.post_intermediate_master_failover_processes =
        vec!["echo im-post {successorHost}".to_string()];
    let h = harness(config);

    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("im", Some("m"), 500));
    // The only sibling carries replication filters; it never qualifies.
    let mut s1 = server("s1", Some("m"), 800);
    s1.has_replication_filters = true;
    h.topology.add_instance(s1);
    h.topology.add_instance(server("c1", Some("im"), 1000));
    h.topology.add_instance(server("c2", Some("im"), 900));
    h.topology.add_instance(server("c3", Some("im"), 800));
    h.topology.fail_instance(&key("im"));

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(
            analysis(AnalysisCode::DeadIntermediateMaster, "im", Some("m")),
            None,
            false,
            false,
        )
        .await
        .unwrap();
    assert!(attempted);
    let recovery = recovery.unwrap();

    assert!(recovery.is_successful);
    assert_eq!(recovery.successor_key, Some(key("c1")));

    // c1 took over its siblings and was relocated up under m.
    assert_eq!(h.topology.get(&key("c2")).unwrap().master_key, Some(key("c1")));
    assert_eq!(h.topology.get(&key("c3")).unwrap().master_key, Some(key("c1")));
    assert_eq!(h.topology.get(&key("c1")).unwrap().master_key, Some(key("m")));

    assert!(h.hooks.commands().contains(&"echo im-post c1".to_string()));
}

/// Intermediate-master Plan A: a marked candidate sibling in the same DC
/// adopts the failed node's replicas directly.
#[tokio::test]
async fn test_intermediate_master_plan_a_sibling_relocation() {
    let h = harness(RecoveryConfig::default());

    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("im", Some("m"), 500));
    let mut s1 = server("s1", Some("m"), 800);
    s1.is_candidate = true;
    h.topology.add_instance(s1);
    h.topology.add_instance(server("c1", Some("im"), 1000));
    h.topology.add_instance(server("c2", Some("im"), 900));
    h.topology.fail_instance(&key("im"));

    let (_, recovery) = h
        .engine
        .execute_check_and_recover(
            analysis(AnalysisCode::DeadIntermediateMaster, "im", Some("m")),
            None,
            false,
            false,
        )
        .await
        .unwrap();
    let recovery = recovery.unwrap();

    assert_eq!(recovery.successor_key, Some(key("s1")));
    assert_eq!(h.topology.get(&key("c1")).unwrap().master_key, Some(key("s1")));
    assert_eq!(h.topology.get(&key("c2")).unwrap().master_key, Some(key("s1")));
}

/// Co-master cycle avoidance: when a plain replica wins the promotion
/// over the surviving co-master, it is detached from its former master so
/// the remaining topology cannot close into a three-node cycle.
#[tokio::test]
async fn test_co_master_cycle_avoidance() {
    let mut config = RecoveryConfig::default();
    config.co_master_recovery_must_promote_other_co_master = false;
    let h = harness(config);

    // m1 <-> m2, with m2 writable and failing; r replicates from m2.
    let mut m1 = server("m1", Some("m2"), 900);
    m1.read_only = true;
    h.topology.add_instance(m1);
    let mut m2 = server("m2", Some("m1"), 950);
    m2.read_only = false;
    h.topology.add_instance(m2);
    h.topology.add_instance(server("r", Some("m2"), 1000));
    h.topology.fail_instance(&key("m2"));

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(
            analysis(AnalysisCode::DeadCoMaster, "m2", Some("m1")),
            None,
            false,
            false,
        )
        .await
        .unwrap();
    assert!(attempted);
    let recovery = recovery.unwrap();

    assert!(recovery.is_successful);
    assert_eq!(recovery.successor_key, Some(key("r")));

    // r no longer chains back toward m2.
    let r = h.topology.get(&key("r")).unwrap();
    assert!(r.master_host_detached);
    assert!(!r.read_only);
    // The surviving co-master follows the promoted replica.
    assert_eq!(h.topology.get(&key("m1")).unwrap().master_key, Some(key("r")));
}

/// Co-master recovery with must-promote-other: promoting anything but
/// the surviving co-master is a failure.
#[tokio::test]
async fn test_co_master_must_promote_other() {
    let h = harness(RecoveryConfig::default()); // must-promote defaults to true

    let mut m1 = server("m1", Some("m2"), 900);
    m1.read_only = true;
    h.topology.add_instance(m1);
    let mut m2 = server("m2", Some("m1"), 950);
    m2.read_only = false;
    h.topology.add_instance(m2);
    h.topology.add_instance(server("r", Some("m2"), 1000));
    h.topology.fail_instance(&key("m2"));
    // The surviving co-master is also unreachable: it cannot be regrouped
    // under the promoted replica, so it cannot take over.
    h.topology.fail_instance(&key("m1"));

    let (_, recovery) = h
        .engine
        .execute_check_and_recover(
            analysis(AnalysisCode::DeadCoMaster, "m2", Some("m1")),
            None,
            false,
            false,
        )
        .await
        .unwrap();
    let recovery = recovery.unwrap();

    assert!(!recovery.is_successful);
    assert!(recovery
        .all_errors
        .iter()
        .any(|e| e.contains("CoMasterRecoveryMustPromoteOtherCoMaster")));
}

/// Re-issuing a recovery for the same instance within the cooldown is a
/// silent no-op.
#[tokio::test]
async fn test_cooldown_blocks_repeat_recovery() {
    let h = harness(RecoveryConfig::default());
    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("r1", Some("m"), 1000));
    h.topology.fail_instance(&key("m"));

    let entry = analysis(AnalysisCode::DeadMaster, "m", None);
    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(entry.clone(), None, false, false)
        .await
        .unwrap();
    assert!(attempted);
    assert!(recovery.is_some());

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(entry, None, false, false)
        .await
        .unwrap();
    assert!(!attempted);
    assert!(recovery.is_none());
    assert!(h.engine.store().is_blocked(&key("m")));
}

/// Under consensus, a non-leader never detects or recovers.
#[tokio::test]
async fn test_non_leader_does_not_recover() {
    let consensus = Arc::new(RecordingLog::new(false));
    let h = harness_with_consensus(RecoveryConfig::default(), Arc::clone(&consensus) as _);

    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("r1", Some("m"), 1000));
    h.topology.fail_instance(&key("m"));

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    assert!(!attempted);
    assert!(recovery.is_none());
    assert!(h.engine.store().all_records().is_empty());
    assert!(consensus.published().is_empty());
}

/// Under consensus with leadership, record mutations and KV pairs are
/// published to the log.
#[tokio::test]
async fn test_leader_publishes_through_consensus() {
    let consensus = Arc::new(RecordingLog::new(true));
    let h = harness_with_consensus(RecoveryConfig::default(), Arc::clone(&consensus) as _);

    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("r1", Some("m"), 1000));
    h.topology.fail_instance(&key("m"));

    let (_, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    assert!(recovery.unwrap().is_successful);

    assert_eq!(consensus.published_named("register-recovery").len(), 1);
    assert_eq!(consensus.published_named("resolve-recovery").len(), 1);
    assert_eq!(consensus.published_named("register-failure-detection").len(), 1);
    assert_eq!(consensus.published_named("put-key-value").len(), 3);
    assert!(!consensus.published_named("write-recovery-step").is_empty());
}

/// The global recovery-disabled gate stops automated recoveries but not
/// forced ones.
#[tokio::test]
async fn test_global_disabled_gate_honors_force() {
    let h = harness(RecoveryConfig::default());
    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("r1", Some("m"), 1000));
    h.topology.fail_instance(&key("m"));
    h.engine.store().set_recovery_disabled(true);

    let entry = analysis(AnalysisCode::DeadMaster, "m", None);
    let (attempted, _) = h
        .engine
        .execute_check_and_recover(entry.clone(), None, false, false)
        .await
        .unwrap();
    assert!(!attempted);

    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(entry, None, true, false)
        .await
        .unwrap();
    assert!(attempted);
    assert!(recovery.unwrap().is_successful);
}

/// An emergent replication-restart opens the grace window, during which a
/// dead-master analysis on the instance is not actionable.
#[tokio::test]
async fn test_grace_window_downgrades_dead_master() {
    let h = harness(RecoveryConfig::default());
    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("r1", Some("m"), 1000));

    // The lagging-replicas analysis triggers the restart nudge.
    let (attempted, _) = h
        .engine
        .execute_check_and_recover(
            analysis(AnalysisCode::UnreachableMasterWithLaggingReplicas, "m", None),
            None,
            false,
            false,
        )
        .await
        .unwrap();
    assert!(!attempted);

    h.topology.fail_instance(&key("m"));
    let (attempted, recovery) = h
        .engine
        .execute_check_and_recover(analysis(AnalysisCode::DeadMaster, "m", None), None, false, false)
        .await
        .unwrap();
    assert!(!attempted);
    assert!(recovery.is_none());
    // Nothing was registered while the window lasted.
    assert!(h.engine.store().all_records().is_empty());
}

/// The check-and-recover entry point resolves a specific instance
/// synchronously and reports the promoted key.
#[tokio::test]
async fn test_check_and_recover_specific_instance() {
    let h = harness(RecoveryConfig::default());
    h.topology.add_instance(server("m", None, 0));
    h.topology.add_instance(server("r1", Some("m"), 1000));
    h.topology.add_instance(server("r2", Some("m"), 900));
    h.topology.fail_instance(&key("m"));
    h.topology
        .set_analysis_entries(vec![analysis(AnalysisCode::DeadMaster, "m", None)]);

    let (attempted, promoted) = h
        .engine
        .check_and_recover(Some(key("m")), None, false)
        .await
        .unwrap();
    assert!(attempted);
    assert_eq!(promoted, Some(key("r1")));
}

/// Binlog-server chain recovery end to end through the dispatcher.
#[tokio::test]
async fn test_dead_master_binlog_server_topology() {
    let h = harness(RecoveryConfig::default());
    h.topology.add_instance(server("m", None, 0));
    let mut bls = server("bls", Some("m"), 900);
    bls.is_binlog_server = true;
    h.topology.add_instance(bls);
    h.topology.add_instance(server("r1", Some("bls"), 850));
    h.topology.fail_instance(&key("m"));

    let mut entry = analysis(AnalysisCode::DeadMaster, "m", None);
    entry.gtid_immediate_topology = false;
    entry.binlog_server_immediate_topology = true;

    let (_, recovery) = h
        .engine
        .execute_check_and_recover(entry, None, false, false)
        .await
        .unwrap();
    let recovery = recovery.unwrap();

    assert!(recovery.is_successful);
    assert_eq!(recovery.successor_key, Some(key("r1")));
    assert_eq!(h.topology.get(&key("bls")).unwrap().master_key, Some(key("r1")));
}
