//! Topology rewiring.
//!
//! The algorithms that re-parent surviving replicas around a failed node,
//! parameterized by resynchronization mode: GTID position matching,
//! pseudo-GTID coordinate search, or a binlog-server chain. This is the
//! only component issuing side-effecting replication calls; everything
//! else reads snapshots and decides.
//!
//! Partial failure is normal here. A replica that cannot be re-attached
//! lands in the lost set and the regroup keeps going; only a missing
//! promotion makes the recovery itself a failure.

use super::postpone::PostponedFunctions;
use super::selection;
use crate::error::{RecoveryError, Result};
use crate::topology::{ResyncMode, TopologyAccess};
use crate::types::{GtidHint, Instance, InstanceKey, PromotionRule};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of regrouping a failed node's replicas.
#[derive(Debug, Default)]
pub struct RegroupOutcome {
    /// Replicas that could not be re-attached to the promoted server.
    pub lost_replicas: Vec<Instance>,
    /// Replicas structurally unable to replicate from the promoted server
    /// (configuration or version). Subset of the failure domain, kept
    /// separate so executors can report them distinctly.
    pub cannot_replicate: Vec<Instance>,
    /// The replica elected as the new local master, if any.
    pub promoted: Option<Instance>,
    /// The promoted replica matched the caller's ideal-candidate check,
    /// so sibling reparenting was postponed rather than done inline.
    pub promoted_is_ideal: bool,
}

/// Issues the re-parenting operations for all three failure classes.
pub struct Rewirer {
    topology: Arc<dyn TopologyAccess>,
}

/// Promotion-rule weight used to break exact coordinate ties.
fn promotion_preference(rule: PromotionRule) -> u8 {
    match rule {
        PromotionRule::MustPromote => 4,
        PromotionRule::PreferPromote => 3,
        PromotionRule::Neutral => 2,
        PromotionRule::PreferNotPromote => 1,
        PromotionRule::MustNotPromote => 0,
    }
}

impl Rewirer {
    pub fn new(topology: Arc<dyn TopologyAccess>) -> Self {
        Self { topology }
    }

    /// Regroup the replicas of a failed master via GTID.
    pub async fn regroup_replicas_gtid(
        &self,
        failed_key: &InstanceKey,
        ideal: &(dyn Fn(&Instance) -> bool + Sync),
        postponed: Option<&PostponedFunctions>,
    ) -> Result<RegroupOutcome> {
        self.regroup_replicas_with_mode(failed_key, ResyncMode::Gtid, ideal, postponed)
            .await
    }

    /// Regroup the replicas of a failed master via pseudo-GTID,
    /// first pulling sub-replicas of binlog servers up into the regroup
    /// pool.
    pub async fn regroup_replicas_pseudo_gtid(
        &self,
        failed_key: &InstanceKey,
        ideal: &(dyn Fn(&Instance) -> bool + Sync),
        postponed: Option<&PostponedFunctions>,
    ) -> Result<RegroupOutcome> {
        let replicas = self.topology.read_replicas(failed_key).await?;
        for binlog_server in replicas.iter().filter(|r| r.is_binlog_server) {
            let sub_replicas = self.topology.read_replicas(&binlog_server.key).await?;
            for sub_replica in sub_replicas {
                // A binlog server mirrors its master's binlog, so moving a
                // sub-replica up is a plain repoint at unchanged coordinates.
                if let Err(e) = self
                    .topology
                    .repoint(&sub_replica.key, failed_key, GtidHint::Deny)
                    .await
                {
                    warn!(replica = %sub_replica.key, error = %e, "Could not move binlog-server sub-replica up");
                }
            }
        }
        self.regroup_replicas_with_mode(failed_key, ResyncMode::PseudoGtid, ideal, postponed)
            .await
    }

    /// Generic regroup with no ideal-candidate optimization: used for
    /// intermediate-master recovery where any local takeover works.
    pub async fn regroup_replicas(&self, failed_key: &InstanceKey) -> Result<RegroupOutcome> {
        let replicas = self.topology.read_replicas(failed_key).await?;
        let mode = if !replicas.is_empty() && replicas.iter().all(|r| r.using_gtid) {
            ResyncMode::Gtid
        } else {
            ResyncMode::PseudoGtid
        };
        self.regroup_replicas_with_mode(failed_key, mode, &|_| false, None)
            .await
    }

    async fn regroup_replicas_with_mode(
        &self,
        failed_key: &InstanceKey,
        mode: ResyncMode,
        ideal: &(dyn Fn(&Instance) -> bool + Sync),
        postponed: Option<&PostponedFunctions>,
    ) -> Result<RegroupOutcome> {
        let replicas = self.topology.read_replicas(failed_key).await?;
        let mut outcome = RegroupOutcome::default();
        if replicas.is_empty() {
            return Ok(outcome);
        }

        // Partition: unreachable replicas are lost outright; among the
        // rest, elect the most advanced eligible replica, preferring
        // better promotion rules on exact coordinate ties.
        let mut eligible: Vec<Instance> = Vec::new();
        let mut others: Vec<Instance> = Vec::new();
        for replica in replicas {
            if !replica.is_last_check_valid {
                outcome.lost_replicas.push(replica);
            } else if selection::is_generally_valid_as_would_be_master(&replica, true) {
                eligible.push(replica);
            } else {
                others.push(replica);
            }
        }
        eligible.sort_by(|a, b| {
            if a.exec_coordinates.smaller_than(&b.exec_coordinates) {
                std::cmp::Ordering::Greater
            } else if b.exec_coordinates.smaller_than(&a.exec_coordinates) {
                std::cmp::Ordering::Less
            } else {
                promotion_preference(b.promotion_rule).cmp(&promotion_preference(a.promotion_rule))
            }
        });

        let Some(promoted) = eligible.first().cloned() else {
            outcome.lost_replicas.extend(others);
            return Ok(outcome);
        };
        info!(promoted = %promoted.key, mode = ?mode, "Regroup elected promotion candidate");

        // Everything else re-parents under the promoted replica, unless it
        // structurally cannot.
        let mut to_move: Vec<Instance> = Vec::new();
        for replica in eligible.into_iter().skip(1).chain(others) {
            match replica.can_replicate_from(&promoted) {
                Ok(()) => to_move.push(replica),
                Err(reason) => {
                    debug!(replica = %replica.key, %reason, "Replica cannot follow promoted server");
                    outcome.cannot_replicate.push(replica);
                }
            }
        }

        outcome.promoted_is_ideal = ideal(&promoted);
        match (outcome.promoted_is_ideal, postponed) {
            (true, Some(container)) => {
                // The candidate is already where we want it; sibling moves
                // are not on the critical path.
                for replica in to_move {
                    let topology = Arc::clone(&self.topology);
                    let replica_key = replica.key.clone();
                    let promoted_key = promoted.key.clone();
                    container.add(
                        format!("regroup: move {} below {}", replica_key, promoted_key),
                        Box::pin(async move {
                            topology.reparent(&replica_key, &promoted_key, mode).await?;
                            Ok(())
                        }),
                    );
                }
            }
            _ => {
                for replica in to_move {
                    match self
                        .topology
                        .reparent(&replica.key, &promoted.key, mode)
                        .await
                    {
                        Ok(_) => {}
                        Err(e) => {
                            warn!(replica = %replica.key, error = %e, "Failed to re-parent replica; marking lost");
                            outcome.lost_replicas.push(replica);
                        }
                    }
                }
            }
        }

        outcome.promoted = Some(promoted);
        Ok(outcome)
    }

    /// Elect the most advanced binlog server among a failed master's
    /// binlog-server replicas and gather its siblings beneath it.
    pub async fn regroup_binlog_servers(
        &self,
        failed_key: &InstanceKey,
    ) -> Result<Option<Instance>> {
        let mut binlog_servers: Vec<Instance> = self
            .topology
            .read_replicas(failed_key)
            .await?
            .into_iter()
            .filter(|r| r.is_binlog_server && r.is_last_check_valid)
            .collect();
        if binlog_servers.is_empty() {
            return Ok(None);
        }
        binlog_servers.sort_by(|a, b| {
            if a.exec_coordinates.smaller_than(&b.exec_coordinates) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            }
        });
        let promoted = binlog_servers.remove(0);
        for sibling in binlog_servers {
            if let Err(e) = self
                .topology
                .repoint(&sibling.key, &promoted.key, GtidHint::Deny)
                .await
            {
                warn!(sibling = %sibling.key, error = %e, "Could not gather binlog server under promoted one");
            }
        }
        Ok(Some(promoted))
    }

    /// The most advanced real replica beneath a binlog server, eligible
    /// for master promotion.
    async fn candidate_replica_of_binlog_server(
        &self,
        binlog_server_key: &InstanceKey,
    ) -> Result<Option<Instance>> {
        let mut replicas: Vec<Instance> = self
            .topology
            .read_replicas(binlog_server_key)
            .await?
            .into_iter()
            .filter(|r| selection::is_generally_valid_as_would_be_master(r, false))
            .collect();
        replicas.sort_by(|a, b| {
            if a.exec_coordinates.smaller_than(&b.exec_coordinates) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            }
        });
        Ok(replicas.into_iter().next())
    }

    /// Recover a dead master whose immediate replica layer is binlog
    /// servers. Elects a binlog server, advances a real replica to its
    /// coordinates, rebases that replica's binary logs and repoints the
    /// binlog server beneath it. Moving surviving binlog-server replicas
    /// happens postponed: they must first observe the promoted server's
    /// next binlog.
    pub async fn recover_master_via_binlog_servers(
        &self,
        failed_key: &InstanceKey,
        postponed: &PostponedFunctions,
    ) -> Result<Option<Instance>> {
        const MAX_BINLOG_SERVERS_TO_PROMOTE: usize = 3;

        let Some(promoted_bls) = self.regroup_binlog_servers(failed_key).await? else {
            return Ok(None);
        };
        let promoted_bls = self.topology.stop_replication(&promoted_bls.key).await?;

        let Some(candidate) = self
            .candidate_replica_of_binlog_server(&promoted_bls.key)
            .await?
        else {
            return Err(RecoveryError::NoSuccessorPromoted(format!(
                "no candidate replica beneath binlog server {}",
                promoted_bls.key
            )));
        };

        // Align the candidate with the binlog server's coordinates, then
        // give it a fresh log baseline of its own.
        self.topology.stop_replication(&candidate.key).await?;
        self.topology
            .start_replication_until(&candidate.key, &promoted_bls.exec_coordinates)
            .await?;
        self.topology.stop_replication(&candidate.key).await?;
        self.topology.reset_replication(&candidate.key).await?;
        // The candidate's log series must first reach the binlog server's
        // current file: the server will ask the new master for the file
        // after it, and that file has to exist.
        self.topology
            .flush_binary_logs_to(&candidate.key, &promoted_bls.exec_coordinates.log_file)
            .await?;
        self.topology.flush_binary_logs(&candidate.key, 1).await?;
        let candidate = self
            .topology
            .purge_binary_logs_to_latest(&candidate.key)
            .await?;

        // The binlog server asks the new master for the "next" binlog;
        // that is exactly the file the flush created.
        let promoted_bls = self
            .topology
            .skip_to_next_binary_log(&promoted_bls.key)
            .await?;
        self.topology
            .repoint(&promoted_bls.key, &candidate.key, GtidHint::Deny)
            .await?;

        let bls_replicas: Vec<Instance> = self
            .topology
            .read_replicas(&promoted_bls.key)
            .await?
            .into_iter()
            .filter(|r| r.is_binlog_server)
            .take(MAX_BINLOG_SERVERS_TO_PROMOTE)
            .collect();
        for bls_replica in bls_replicas {
            let topology = Arc::clone(&self.topology);
            let replica_key = bls_replica.key.clone();
            let candidate_key = candidate.key.clone();
            let bls_coordinates = promoted_bls.exec_coordinates.clone();
            postponed.add(
                format!("binlog-server recovery: move binlog server {}", replica_key),
                Box::pin(async move {
                    let replica = topology.stop_replication(&replica_key).await?;
                    if replica.exec_coordinates.smaller_than(&bls_coordinates) {
                        topology
                            .start_replication_until(&replica_key, &bls_coordinates)
                            .await?;
                    }
                    topology
                        .repoint(&replica_key, &candidate_key, GtidHint::Deny)
                        .await?;
                    Ok(())
                }),
            );
        }

        Ok(Some(candidate))
    }

    /// Bulk parent change: move every replica of `from` beneath `to`.
    /// Tolerates per-replica failures; returns the moved instances and
    /// the errors encountered.
    pub async fn relocate_replicas(
        &self,
        from: &InstanceKey,
        to: &InstanceKey,
    ) -> Result<(Vec<Instance>, Vec<RecoveryError>)> {
        let replicas = self.topology.read_replicas(from).await?;
        let mut relocated = Vec::new();
        let mut errors = Vec::new();
        for replica in replicas {
            if &replica.key == to {
                continue;
            }
            let mode = if replica.using_gtid {
                ResyncMode::Gtid
            } else {
                ResyncMode::PseudoGtid
            };
            match self.topology.reparent(&replica.key, to, mode).await {
                Ok(moved) => relocated.push(moved),
                Err(e) => {
                    warn!(replica = %replica.key, target = %to, error = %e, "Relocation failed");
                    errors.push(e);
                }
            }
        }
        Ok((relocated, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::MemoryTopology;
    use crate::types::BinlogCoordinates;

    fn key(host: &str) -> InstanceKey {
        InstanceKey::new(host, 3306)
    }

    fn replica(host: &str, master: &str, pos: u64) -> Instance {
        Instance {
            key: key(host),
            master_key: Some(key(master)),
            cluster_name: "main".into(),
            version: "8.0.32".into(),
            log_bin_enabled: true,
            log_replica_updates_enabled: true,
            is_last_check_valid: true,
            replication_io_running: true,
            replication_sql_running: true,
            using_gtid: true,
            self_coordinates: BinlogCoordinates::new(format!("{}-bin.000001", host), pos),
            exec_coordinates: BinlogCoordinates::new("master-bin.000009", pos),
            read_coordinates: BinlogCoordinates::new("master-bin.000009", pos),
            ..Default::default()
        }
    }

    fn dead_master_topology() -> Arc<MemoryTopology> {
        let topology = Arc::new(MemoryTopology::new());
        let mut master = replica("m", "nobody", 0);
        master.master_key = None;
        topology.add_instance(master);
        topology.add_instance(replica("r1", "m", 500));
        topology.add_instance(replica("r2", "m", 300));
        topology.add_instance(replica("r3", "m", 100));
        topology.fail_instance(&key("m"));
        topology
    }

    #[tokio::test]
    async fn test_gtid_regroup_promotes_most_advanced() {
        let topology = dead_master_topology();
        let rewirer = Rewirer::new(Arc::clone(&topology) as Arc<dyn TopologyAccess>);

        let outcome = rewirer
            .regroup_replicas_gtid(&key("m"), &|_| false, None)
            .await
            .unwrap();

        let promoted = outcome.promoted.unwrap();
        assert_eq!(promoted.key, key("r1"));
        assert!(outcome.lost_replicas.is_empty());
        assert!(outcome.cannot_replicate.is_empty());
        assert_eq!(topology.get(&key("r2")).unwrap().master_key, Some(key("r1")));
        assert_eq!(topology.get(&key("r3")).unwrap().master_key, Some(key("r1")));
    }

    #[tokio::test]
    async fn test_regroup_partitions_incapable_replicas() {
        let topology = dead_master_topology();
        // r3 runs an older major version than everyone else: it can stay
        // under the old master but cannot follow a newer promoted one.
        let mut old = replica("r3", "m", 100);
        old.version = "5.7.40".into();
        topology.add_instance(old);
        let rewirer = Rewirer::new(Arc::clone(&topology) as Arc<dyn TopologyAccess>);

        let outcome = rewirer
            .regroup_replicas_gtid(&key("m"), &|_| false, None)
            .await
            .unwrap();
        assert_eq!(outcome.promoted.unwrap().key, key("r1"));
        assert_eq!(outcome.cannot_replicate.len(), 1);
        assert_eq!(outcome.cannot_replicate[0].key, key("r3"));
    }

    #[tokio::test]
    async fn test_regroup_postpones_moves_for_ideal_candidate() {
        let topology = dead_master_topology();
        let rewirer = Rewirer::new(Arc::clone(&topology) as Arc<dyn TopologyAccess>);
        let postponed = PostponedFunctions::new();

        let outcome = rewirer
            .regroup_replicas_gtid(&key("m"), &|i| i.key == key("r1"), Some(&postponed))
            .await
            .unwrap();
        assert!(outcome.promoted_is_ideal);
        // Moves deferred: siblings still point at the dead master.
        assert_eq!(topology.get(&key("r2")).unwrap().master_key, Some(key("m")));
        assert_eq!(postponed.len(), 2);

        postponed.drain().await;
        assert_eq!(topology.get(&key("r2")).unwrap().master_key, Some(key("r1")));
        assert_eq!(topology.get(&key("r3")).unwrap().master_key, Some(key("r1")));
    }

    #[tokio::test]
    async fn test_regroup_marks_unreachable_replicas_lost() {
        let topology = dead_master_topology();
        topology.fail_instance(&key("r2"));
        let rewirer = Rewirer::new(Arc::clone(&topology) as Arc<dyn TopologyAccess>);

        let outcome = rewirer
            .regroup_replicas_gtid(&key("m"), &|_| false, None)
            .await
            .unwrap();
        assert_eq!(outcome.promoted.unwrap().key, key("r1"));
        assert_eq!(outcome.lost_replicas.len(), 1);
        assert_eq!(outcome.lost_replicas[0].key, key("r2"));
    }

    #[tokio::test]
    async fn test_relocate_replicas_tolerates_partial_failure() {
        let topology = dead_master_topology();
        topology.restore_instance(&key("m"));
        topology.fail_instance(&key("r3"));
        let rewirer = Rewirer::new(Arc::clone(&topology) as Arc<dyn TopologyAccess>);

        let (relocated, errors) = rewirer.relocate_replicas(&key("m"), &key("r1")).await.unwrap();
        assert_eq!(relocated.len(), 1); // r2 moved; r1 skipped; r3 failed
        assert_eq!(errors.len(), 1);
        assert_eq!(topology.get(&key("r2")).unwrap().master_key, Some(key("r1")));
    }

    #[tokio::test]
    async fn test_binlog_server_chain_recovery() {
        let topology = Arc::new(MemoryTopology::new());
        let mut master = replica("m", "nobody", 900);
        master.master_key = None;
        topology.add_instance(master);
        let mut bls1 = replica("bls1", "m", 800);
        bls1.is_binlog_server = true;
        bls1.exec_coordinates = BinlogCoordinates::new("master-bin.000009", 800);
        topology.add_instance(bls1);
        let mut bls2 = replica("bls2", "m", 700);
        bls2.is_binlog_server = true;
        topology.add_instance(bls2);
        // A real replica beneath the advanced binlog server.
        let mut real = replica("r1", "bls1", 750);
        real.self_coordinates = BinlogCoordinates::new("r1-bin.000004", 750);
        topology.add_instance(real);
        topology.fail_instance(&key("m"));

        let rewirer = Rewirer::new(Arc::clone(&topology) as Arc<dyn TopologyAccess>);
        let postponed = PostponedFunctions::new();
        let promoted = rewirer
            .recover_master_via_binlog_servers(&key("m"), &postponed)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(promoted.key, key("r1"));
        // The promoted replica's log series caught up to the binlog
        // server's file, then rotated once past it.
        assert_eq!(promoted.self_coordinates.log_file, "master-bin.000010");
        // The binlog server now chains from the promoted replica, and the
        // "next" binlog it will request is exactly the file the flush
        // created.
        let bls1 = topology.get(&key("bls1")).unwrap();
        assert_eq!(bls1.master_key, Some(key("r1")));
        assert_eq!(bls1.exec_coordinates.log_file, promoted.self_coordinates.log_file);
        // Its sibling was gathered beneath it during the regroup.
        assert_eq!(topology.get(&key("bls2")).unwrap().master_key, Some(key("bls1")));

        let ops = topology.operations();
        assert!(ops
            .iter()
            .any(|op| op.starts_with("flush-binary-logs-to r1:3306 master-bin.000009")));
        assert!(ops.iter().any(|op| op.starts_with("flush-binary-logs r1")));
        assert!(ops.iter().any(|op| op.starts_with("purge-binary-logs-to-latest r1")));
        assert!(ops.iter().any(|op| op.starts_with("skip-to-next-binary-log bls1")));
    }
}
