//! External topology collaborator contract.
//!
//! The recovery engine never talks to database servers directly. All
//! instance reads and side-effecting replication calls go through the
//! [`TopologyAccess`] trait, implemented by the embedding process against
//! its metadata datastore and replication plumbing. An in-memory
//! implementation ([`MemoryTopology`]) backs tests and local
//! experimentation.

pub mod memory;

pub use memory::MemoryTopology;

use crate::error::Result;
use crate::types::{
    AnalysisHints, BinlogCoordinates, ClusterInfo, GtidHint, Instance, InstanceKey,
    ReplicationAnalysis, ReplicationCredentials,
};
use async_trait::async_trait;
use std::time::Duration;

/// Downtime owner recorded for engine-initiated downtimes.
pub const MAINTENANCE_OWNER: &str = "masterswitch";

/// Downtime reason for instances lost during a recovery.
pub const DOWNTIME_LOST_IN_RECOVERY: &str = "lost-in-recovery";

/// How a replica is caught up when moved below a new master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncMode {
    /// Position matching via globally-unique transaction identifiers.
    Gtid,
    /// Coordinate search over log-embedded markers.
    PseudoGtid,
}

/// Read and write access to the instance-metadata store and the low-level
/// replication primitives.
///
/// Implementations are expected to be safe for concurrent use; the engine
/// funnels all writes affecting a single instance through the executor
/// holding that instance's recovery record.
#[async_trait]
pub trait TopologyAccess: Send + Sync {
    // ---- reads ----

    /// Read one instance's current snapshot. `Ok(None)` when unknown.
    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>>;

    /// Direct replicas of an instance.
    async fn read_replicas(&self, key: &InstanceKey) -> Result<Vec<Instance>>;

    /// Direct replicas plus replicas of any binlog servers among them.
    async fn read_replicas_including_binlog_server_sub_replicas(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>>;

    /// Masters (roots) of a cluster. More than one indicates co-masters or
    /// a split.
    async fn read_cluster_master(&self, cluster: &str) -> Result<Vec<Instance>>;

    /// Writable masters of a cluster.
    async fn read_cluster_writeable_master(&self, cluster: &str) -> Result<Vec<Instance>>;

    async fn read_cluster_info(&self, cluster: &str) -> Result<ClusterInfo>;

    /// Instances of the cluster marked as promotion candidates.
    async fn read_cluster_candidate_instances(&self, cluster: &str) -> Result<Vec<Instance>>;

    /// Instances of the cluster with a neutral promotion rule and no
    /// candidate marking.
    async fn read_cluster_neutral_instances(&self, cluster: &str) -> Result<Vec<Instance>>;

    /// Current analyzer verdicts. `cluster` narrows to one cluster.
    async fn replication_analysis(
        &self,
        cluster: Option<&str>,
        hints: AnalysisHints,
    ) -> Result<Vec<ReplicationAnalysis>>;

    /// Stored replication credentials for an instance, if any.
    async fn read_replication_credentials(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<ReplicationCredentials>>;

    // ---- downtime ----

    async fn begin_downtime(
        &self,
        key: &InstanceKey,
        owner: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<()>;

    async fn end_downtime(&self, key: &InstanceKey) -> Result<()>;

    // ---- replication primitives ----

    /// Stop both replication threads.
    async fn stop_replication(&self, key: &InstanceKey) -> Result<Instance>;

    /// Start replication until the given master coordinates are reached,
    /// then stop.
    async fn start_replication_until(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Result<Instance>;

    /// Restart the IO thread, forcing re-authentication against the
    /// master.
    async fn restart_replication_io_thread(&self, key: &InstanceKey) -> Result<Instance>;

    /// Forget all replication configuration.
    async fn reset_replication(&self, key: &InstanceKey) -> Result<Instance>;

    /// Point a replica at a new master at its current coordinates, without
    /// position matching.
    async fn repoint(
        &self,
        key: &InstanceKey,
        new_master: &InstanceKey,
        gtid_hint: GtidHint,
    ) -> Result<Instance>;

    /// Move a replica below a new master with full position matching.
    async fn reparent(
        &self,
        key: &InstanceKey,
        new_master: &InstanceKey,
        mode: ResyncMode,
    ) -> Result<Instance>;

    /// Rotate the binary log forward by `count` files.
    async fn flush_binary_logs(&self, key: &InstanceKey, count: usize) -> Result<Instance>;

    /// Rotate the binary log forward until the instance's own log series
    /// reaches the named file.
    async fn flush_binary_logs_to(&self, key: &InstanceKey, log_file: &str) -> Result<Instance>;

    /// Purge binary logs up to the latest file.
    async fn purge_binary_logs_to_latest(&self, key: &InstanceKey) -> Result<Instance>;

    /// Advance a binlog server to serve its next binary log file.
    async fn skip_to_next_binary_log(&self, key: &InstanceKey) -> Result<Instance>;

    /// Full change-master: point `key` at `new_master` at the given
    /// coordinates. Replication is not started when `skip_start` is set.
    async fn change_master_to(
        &self,
        key: &InstanceKey,
        new_master: &InstanceKey,
        coordinates: &BinlogCoordinates,
        skip_start: bool,
        gtid_hint: GtidHint,
    ) -> Result<Instance>;

    async fn change_master_credentials(
        &self,
        key: &InstanceKey,
        credentials: &ReplicationCredentials,
    ) -> Result<Instance>;

    /// Enable TLS on the replication channel toward the master.
    async fn enable_master_ssl(&self, key: &InstanceKey) -> Result<Instance>;

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<Instance>;

    /// Mangle the master host setting into an unresolvable (but
    /// reversible) form, so the replica cannot reconnect.
    async fn detach_replica_master_host(&self, key: &InstanceKey) -> Result<Instance>;

    /// Make an instance the master of its own master.
    async fn take_master(
        &self,
        key: &InstanceKey,
        allow_taking_co_master: bool,
    ) -> Result<Instance>;

    /// Block until the instance's SQL thread has applied all retrieved
    /// relay logs. No deadline.
    async fn wait_for_sql_thread_up_to_date(&self, key: &InstanceKey) -> Result<Instance>;

    /// Block until the instance's exec coordinates reach `coordinates`,
    /// bounded by `timeout`.
    async fn wait_for_exec_coordinates_to_reach(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        timeout: Duration,
    ) -> Result<Instance>;

    // ---- cluster bookkeeping ----

    /// Make `master_code` the canonical endpoint of `alias`.
    async fn set_cluster_alias(&self, master_code: &str, alias: &str) -> Result<()>;

    /// Rename an alias-to-cluster mapping when no explicit alias exists.
    async fn replace_alias_cluster_name(&self, before: &str, after: &str) -> Result<()>;

    /// Set a free-form attribute, e.g. cluster domain -> master code.
    async fn set_general_attribute(&self, attribute: &str, value: &str) -> Result<()>;

    /// Append to the operational audit trail. Failures are swallowed by
    /// implementations; auditing never fails a recovery.
    async fn audit_operation(&self, operation: &str, key: &InstanceKey, message: &str);
}
