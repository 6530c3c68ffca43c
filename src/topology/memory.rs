//! In-memory topology implementation.
//!
//! Maintains a full replication graph in process memory and implements
//! every [`TopologyAccess`] primitive against it with simulated
//! semantics: reparenting catches a replica up to its new master,
//! unreachable instances fail side-effecting calls but still serve their
//! last-known snapshot, and so on. Backs the test suite and local
//! experimentation.

use super::{ResyncMode, TopologyAccess};
use crate::error::{RecoveryError, Result};
use crate::types::{
    AnalysisHints, BinlogCoordinates, ClusterInfo, GtidHint, Instance, InstanceKey,
    ReplicationAnalysis, ReplicationCredentials,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Downtime {
    /// Recorded for inspection only.
    #[allow(dead_code)]
    owner: String,
    reason: String,
    #[allow(dead_code)]
    duration: Duration,
}

/// In-memory topology graph.
#[derive(Default)]
pub struct MemoryTopology {
    instances: RwLock<HashMap<InstanceKey, Instance>>,
    clusters: RwLock<HashMap<String, ClusterInfo>>,
    analyses: RwLock<Vec<ReplicationAnalysis>>,
    credentials: RwLock<HashMap<InstanceKey, ReplicationCredentials>>,
    downtimes: RwLock<HashMap<InstanceKey, Downtime>>,
    /// Instances whose side-effecting operations fail. Reads keep serving
    /// the last-known snapshot, as a backing datastore would.
    unreachable: RwLock<HashSet<InstanceKey>>,
    aliases: RwLock<HashMap<String, String>>,
    attributes: RwLock<HashMap<String, String>>,
    audit_log: RwLock<Vec<(String, InstanceKey, String)>>,
    operations: RwLock<Vec<String>>,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- test/builder surface ----

    pub fn add_instance(&self, instance: Instance) {
        self.instances
            .write()
            .insert(instance.key.clone(), instance);
    }

    pub fn add_cluster(&self, info: ClusterInfo) {
        self.clusters
            .write()
            .insert(info.cluster_name.clone(), info);
    }

    pub fn set_analysis_entries(&self, entries: Vec<ReplicationAnalysis>) {
        *self.analyses.write() = entries;
    }

    pub fn set_credentials(&self, key: &InstanceKey, credentials: ReplicationCredentials) {
        self.credentials.write().insert(key.clone(), credentials);
    }

    /// Mark an instance as failed: side-effecting calls on it error out
    /// and its snapshot stops looking healthy.
    pub fn fail_instance(&self, key: &InstanceKey) {
        self.unreachable.write().insert(key.clone());
        if let Some(instance) = self.instances.write().get_mut(key) {
            instance.is_last_check_valid = false;
        }
    }

    pub fn restore_instance(&self, key: &InstanceKey) {
        self.unreachable.write().remove(key);
        if let Some(instance) = self.instances.write().get_mut(key) {
            instance.is_last_check_valid = true;
        }
    }

    /// Latest snapshot of one instance, replica count included.
    pub fn get(&self, key: &InstanceKey) -> Option<Instance> {
        let instances = self.instances.read();
        instances.get(key).map(|i| self.with_count(i, &instances))
    }

    /// Names of primitive operations executed so far, e.g.
    /// `"repoint bls1:3306 -> db2:3306"`.
    pub fn operations(&self) -> Vec<String> {
        self.operations.read().clone()
    }

    pub fn audit_entries(&self) -> Vec<(String, InstanceKey, String)> {
        self.audit_log.read().clone()
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.read().get(name).cloned()
    }

    pub fn alias_of(&self, alias: &str) -> Option<String> {
        self.aliases.read().get(alias).cloned()
    }

    pub fn is_downtimed(&self, key: &InstanceKey) -> bool {
        self.downtimes.read().contains_key(key)
    }

    pub fn downtime_reason(&self, key: &InstanceKey) -> Option<String> {
        self.downtimes.read().get(key).map(|d| d.reason.clone())
    }

    // ---- internals ----

    fn with_count(&self, instance: &Instance, all: &HashMap<InstanceKey, Instance>) -> Instance {
        let mut instance = instance.clone();
        instance.count_replicas = all
            .values()
            .filter(|r| r.master_key.as_ref() == Some(&instance.key))
            .count();
        instance.is_downtimed = self.downtimes.read().contains_key(&instance.key);
        instance
    }

    fn ensure_reachable(&self, key: &InstanceKey) -> Result<()> {
        if self.unreachable.read().contains(key) {
            return Err(RecoveryError::InstanceUnreachable(key.string_code()));
        }
        Ok(())
    }

    fn record(&self, operation: String) {
        self.operations.write().push(operation);
    }

    fn update<F>(&self, key: &InstanceKey, f: F) -> Result<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(key)
            .ok_or_else(|| RecoveryError::InstanceNotFound(key.string_code()))?;
        f(instance);
        let snapshot = instance.clone();
        drop(instances);
        let instances = self.instances.read();
        Ok(self.with_count(&snapshot, &instances))
    }

    fn snapshot(&self, key: &InstanceKey) -> Result<Instance> {
        self.get(key)
            .ok_or_else(|| RecoveryError::InstanceNotFound(key.string_code()))
    }

    fn replicas_of(&self, key: &InstanceKey) -> Vec<Instance> {
        let instances = self.instances.read();
        let mut replicas: Vec<Instance> = instances
            .values()
            .filter(|i| i.master_key.as_ref() == Some(key))
            .map(|i| self.with_count(i, &instances))
            .collect();
        replicas.sort_by_key(|i| i.key.clone());
        replicas
    }

    /// Bump a binary log file's numeric suffix.
    fn advance_log_file(file: &str, by: usize) -> String {
        match file.rsplit_once('.') {
            Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => {
                let next = suffix.parse::<u64>().unwrap_or(0) + by as u64;
                format!("{}.{:0width$}", base, next, width = suffix.len())
            }
            _ => file.to_string(),
        }
    }
}

#[async_trait]
impl TopologyAccess for MemoryTopology {
    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>> {
        Ok(self.get(key))
    }

    async fn read_replicas(&self, key: &InstanceKey) -> Result<Vec<Instance>> {
        Ok(self.replicas_of(key))
    }

    async fn read_replicas_including_binlog_server_sub_replicas(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>> {
        let mut replicas = self.replicas_of(key);
        let binlog_servers: Vec<InstanceKey> = replicas
            .iter()
            .filter(|r| r.is_binlog_server)
            .map(|r| r.key.clone())
            .collect();
        for bls in binlog_servers {
            replicas.extend(self.replicas_of(&bls));
        }
        Ok(replicas)
    }

    async fn read_cluster_master(&self, cluster: &str) -> Result<Vec<Instance>> {
        let instances = self.instances.read();
        let masters: Vec<Instance> = instances
            .values()
            .filter(|i| i.cluster_name == cluster)
            .filter(|i| match &i.master_key {
                None => true,
                // Co-masters replicate from each other; both are roots.
                Some(master) => instances
                    .get(master)
                    .map(|m| m.master_key.as_ref() == Some(&i.key))
                    .unwrap_or(false),
            })
            .map(|i| self.with_count(i, &instances))
            .collect();
        Ok(masters)
    }

    async fn read_cluster_writeable_master(&self, cluster: &str) -> Result<Vec<Instance>> {
        let masters = self.read_cluster_master(cluster).await?;
        Ok(masters.into_iter().filter(|m| !m.read_only).collect())
    }

    async fn read_cluster_info(&self, cluster: &str) -> Result<ClusterInfo> {
        self.clusters
            .read()
            .get(cluster)
            .cloned()
            .ok_or_else(|| RecoveryError::ClusterNotFound(cluster.to_string()))
    }

    async fn read_cluster_candidate_instances(&self, cluster: &str) -> Result<Vec<Instance>> {
        let instances = self.instances.read();
        Ok(instances
            .values()
            .filter(|i| i.cluster_name == cluster && i.is_candidate)
            .map(|i| self.with_count(i, &instances))
            .collect())
    }

    async fn read_cluster_neutral_instances(&self, cluster: &str) -> Result<Vec<Instance>> {
        let instances = self.instances.read();
        Ok(instances
            .values()
            .filter(|i| {
                i.cluster_name == cluster
                    && !i.is_candidate
                    && i.promotion_rule == crate::types::PromotionRule::Neutral
            })
            .map(|i| self.with_count(i, &instances))
            .collect())
    }

    async fn replication_analysis(
        &self,
        cluster: Option<&str>,
        hints: AnalysisHints,
    ) -> Result<Vec<ReplicationAnalysis>> {
        let downtimes = self.downtimes.read();
        let entries = self
            .analyses
            .read()
            .iter()
            .filter(|a| cluster.map_or(true, |c| a.cluster.cluster_name == c))
            .filter(|a| {
                hints.include_no_problem || a.code != crate::types::AnalysisCode::NoProblem
            })
            .cloned()
            .map(|mut a| {
                a.is_downtimed = downtimes.contains_key(&a.analyzed_key);
                a.skippable_due_to_downtime = a.is_downtimed;
                a
            })
            .filter(|a| hints.include_downtimed || !a.skippable_due_to_downtime)
            .collect();
        Ok(entries)
    }

    async fn read_replication_credentials(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<ReplicationCredentials>> {
        Ok(self.credentials.read().get(key).cloned())
    }

    async fn begin_downtime(
        &self,
        key: &InstanceKey,
        owner: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<()> {
        self.downtimes.write().insert(
            key.clone(),
            Downtime {
                owner: owner.to_string(),
                reason: reason.to_string(),
                duration,
            },
        );
        if let Some(instance) = self.instances.write().get_mut(key) {
            instance.is_downtimed = true;
            instance.downtime_reason = reason.to_string();
        }
        Ok(())
    }

    async fn end_downtime(&self, key: &InstanceKey) -> Result<()> {
        self.downtimes.write().remove(key);
        if let Some(instance) = self.instances.write().get_mut(key) {
            instance.is_downtimed = false;
            instance.downtime_reason.clear();
        }
        Ok(())
    }

    async fn stop_replication(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("stop-replication {}", key));
        self.update(key, |i| {
            i.replication_io_running = false;
            i.replication_sql_running = false;
        })
    }

    async fn start_replication_until(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("start-replication-until {} {}", key, coordinates));
        let coordinates = coordinates.clone();
        self.update(key, move |i| {
            if i.exec_coordinates.smaller_than(&coordinates) {
                i.exec_coordinates = coordinates.clone();
            }
            if i.read_coordinates.smaller_than(&coordinates) {
                i.read_coordinates = coordinates;
            }
            i.replication_io_running = false;
            i.replication_sql_running = false;
        })
    }

    async fn restart_replication_io_thread(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("restart-io-thread {}", key));
        self.update(key, |i| {
            i.replication_io_running = i.master_key.is_some();
        })
    }

    async fn reset_replication(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("reset-replication {}", key));
        self.update(key, |i| {
            i.master_key = None;
            i.master_host_detached = false;
            i.replication_io_running = false;
            i.replication_sql_running = false;
            i.read_coordinates = BinlogCoordinates::default();
            i.exec_coordinates = BinlogCoordinates::default();
        })
    }

    async fn repoint(
        &self,
        key: &InstanceKey,
        new_master: &InstanceKey,
        _gtid_hint: GtidHint,
    ) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.snapshot(new_master)?;
        self.record(format!("repoint {} -> {}", key, new_master));
        let new_master = new_master.clone();
        self.update(key, move |i| {
            i.master_key = Some(new_master);
            i.master_host_detached = false;
            i.replication_io_running = true;
            i.replication_sql_running = true;
        })
    }

    async fn reparent(
        &self,
        key: &InstanceKey,
        new_master: &InstanceKey,
        mode: ResyncMode,
    ) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.ensure_reachable(new_master)?;
        let replica = self.snapshot(key)?;
        let master = self.snapshot(new_master)?;
        replica
            .can_replicate_from(&master)
            .map_err(RecoveryError::CannotReplicate)?;
        self.record(format!(
            "reparent({:?}) {} -> {}",
            mode, key, new_master
        ));
        let master_coordinates = master.self_coordinates.clone();
        let new_master = new_master.clone();
        self.update(key, move |i| {
            i.master_key = Some(new_master);
            i.master_host_detached = false;
            i.read_coordinates = master_coordinates.clone();
            i.exec_coordinates = master_coordinates;
            i.replication_io_running = true;
            i.replication_sql_running = true;
        })
    }

    async fn flush_binary_logs(&self, key: &InstanceKey, count: usize) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("flush-binary-logs {} +{}", key, count));
        self.update(key, move |i| {
            i.self_coordinates = BinlogCoordinates::new(
                Self::advance_log_file(&i.self_coordinates.log_file, count),
                4,
            );
        })
    }

    async fn flush_binary_logs_to(&self, key: &InstanceKey, log_file: &str) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("flush-binary-logs-to {} {}", key, log_file));
        let target_file = log_file.to_string();
        self.update(key, move |i| {
            let current = BinlogCoordinates::new(i.self_coordinates.log_file.clone(), 0);
            let target = BinlogCoordinates::new(target_file.clone(), 0);
            if current.smaller_than(&target) {
                i.self_coordinates = BinlogCoordinates::new(target_file, 4);
            }
        })
    }

    async fn purge_binary_logs_to_latest(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("purge-binary-logs-to-latest {}", key));
        self.snapshot(key)
    }

    async fn skip_to_next_binary_log(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("skip-to-next-binary-log {}", key));
        self.update(key, |i| {
            i.exec_coordinates = BinlogCoordinates::new(
                Self::advance_log_file(&i.exec_coordinates.log_file, 1),
                4,
            );
        })
    }

    async fn change_master_to(
        &self,
        key: &InstanceKey,
        new_master: &InstanceKey,
        coordinates: &BinlogCoordinates,
        skip_start: bool,
        gtid_hint: GtidHint,
    ) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!(
            "change-master-to {} -> {} at {}",
            key, new_master, coordinates
        ));
        let new_master = new_master.clone();
        let coordinates = coordinates.clone();
        self.update(key, move |i| {
            i.master_key = Some(new_master);
            i.master_host_detached = false;
            i.read_coordinates = coordinates.clone();
            i.exec_coordinates = coordinates;
            i.using_gtid = matches!(gtid_hint, GtidHint::Force);
            i.replication_io_running = !skip_start;
            i.replication_sql_running = !skip_start;
        })
    }

    async fn change_master_credentials(
        &self,
        key: &InstanceKey,
        credentials: &ReplicationCredentials,
    ) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("change-master-credentials {}", key));
        self.credentials
            .write()
            .insert(key.clone(), credentials.clone());
        self.update(key, |i| {
            i.has_replication_credentials = true;
        })
    }

    async fn enable_master_ssl(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("enable-master-ssl {}", key));
        self.snapshot(key)
    }

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("set-read-only {} {}", key, read_only));
        self.update(key, move |i| {
            i.read_only = read_only;
        })
    }

    async fn detach_replica_master_host(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("detach-replica-master-host {}", key));
        self.update(key, |i| {
            i.master_host_detached = true;
            i.replication_io_running = false;
            i.replication_sql_running = false;
        })
    }

    async fn take_master(
        &self,
        key: &InstanceKey,
        allow_taking_co_master: bool,
    ) -> Result<Instance> {
        self.ensure_reachable(key)?;
        let instance = self.snapshot(key)?;
        let master_key = instance.master_key.clone().ok_or_else(|| {
            RecoveryError::InvalidArgument(format!("{} has no master to take over", key))
        })?;
        let master = self.snapshot(&master_key)?;
        let master_is_co_master = master
            .master_key
            .as_ref()
            .map(|mk| {
                self.get(mk)
                    .map(|m| m.master_key.as_ref() == Some(&master.key))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if master_is_co_master && !allow_taking_co_master {
            return Err(RecoveryError::InvalidArgument(format!(
                "{} is a co-master; refusing take-master",
                master_key
            )));
        }
        self.record(format!("take-master {} over {}", key, master_key));

        let grandmaster = master.master_key.clone();
        let new_master_coordinates = instance.self_coordinates.clone();
        self.update(key, move |i| {
            i.master_key = grandmaster;
            if i.master_key.is_none() {
                i.replication_io_running = false;
                i.replication_sql_running = false;
            }
        })?;
        let key = key.clone();
        self.update(&master_key, move |m| {
            m.master_key = Some(key);
            m.read_coordinates = new_master_coordinates.clone();
            m.exec_coordinates = new_master_coordinates;
            m.replication_io_running = true;
            m.replication_sql_running = true;
        })?;
        self.snapshot(&instance.key)
    }

    async fn wait_for_sql_thread_up_to_date(&self, key: &InstanceKey) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("wait-for-sql-thread {}", key));
        self.update(key, |i| {
            i.exec_coordinates = i.read_coordinates.clone();
        })
    }

    async fn wait_for_exec_coordinates_to_reach(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        _timeout: Duration,
    ) -> Result<Instance> {
        self.ensure_reachable(key)?;
        self.record(format!("wait-for-exec-coordinates {} {}", key, coordinates));
        let coordinates = coordinates.clone();
        self.update(key, move |i| {
            if i.exec_coordinates.smaller_than(&coordinates) {
                i.exec_coordinates = coordinates.clone();
            }
            if i.read_coordinates.smaller_than(&coordinates) {
                i.read_coordinates = coordinates;
            }
        })
    }

    async fn set_cluster_alias(&self, master_code: &str, alias: &str) -> Result<()> {
        self.aliases
            .write()
            .insert(alias.to_string(), master_code.to_string());
        Ok(())
    }

    async fn replace_alias_cluster_name(&self, before: &str, after: &str) -> Result<()> {
        let mut aliases = self.aliases.write();
        for value in aliases.values_mut() {
            if value == before {
                *value = after.to_string();
            }
        }
        Ok(())
    }

    async fn set_general_attribute(&self, attribute: &str, value: &str) -> Result<()> {
        self.attributes
            .write()
            .insert(attribute.to_string(), value.to_string());
        Ok(())
    }

    async fn audit_operation(&self, operation: &str, key: &InstanceKey, message: &str) {
        self.audit_log.write().push((
            operation.to_string(),
            key.clone(),
            message.to_string(),
        ));
    }
}
