//! Recovery record store.
//!
//! Persists recovery attempts, their audit steps, failure detections and
//! acknowledgements, and enforces the two registration gates: no second
//! recovery while one is active on the same instance, and a cooldown
//! after a completed recovery.
//!
//! When a consensus log is attached, mutations are additionally published
//! as typed commands; follower nodes feed delivered commands into
//! [`RecoveryStore::apply_command`] to keep their local copies current.
//! The serialization guarantee does not depend on the backing store being
//! transactional: recoveries execute on the leader only, and the
//! registration test-and-set is atomic within this store.

use super::{
    BlockedRecovery, RecoveryAcknowledgement, TopologyRecovery, TopologyRecoveryStep,
};
use crate::config::RecoveryConfig;
use crate::consensus::ConsensusLog;
use crate::error::Result;
use crate::types::{AnalysisCode, InstanceKey, InstanceKeySet, ReplicationAnalysis};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The persisted row of one recovery attempt. Mirrors the mutable state
/// of [`TopologyRecovery`] minus the live postponed-function container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub id: i64,
    pub uid: String,
    pub failed_key: InstanceKey,
    pub cluster_name: String,
    pub analysis_code: AnalysisCode,
    pub is_active: bool,
    pub is_successful: bool,
    pub successor_key: Option<InstanceKey>,
    pub successor_alias: String,
    pub lost_replicas: InstanceKeySet,
    pub all_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub processing_node: String,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: String,
    pub acknowledged_comment: String,
}

impl RecoveryRecord {
    fn from_recovery(recovery: &TopologyRecovery) -> Self {
        Self {
            id: recovery.id,
            uid: recovery.uid.clone(),
            failed_key: recovery.analysis_entry.analyzed_key.clone(),
            cluster_name: recovery.analysis_entry.cluster.cluster_name.clone(),
            analysis_code: recovery.analysis_entry.code,
            is_active: recovery.is_active,
            is_successful: recovery.is_successful,
            successor_key: recovery.successor_key.clone(),
            successor_alias: recovery.successor_alias.clone(),
            lost_replicas: recovery.lost_replicas.clone(),
            all_errors: recovery.all_errors.clone(),
            started_at: recovery.started_at,
            ended_at: recovery.ended_at,
            processing_node: recovery.processing_node.clone(),
            acknowledged: recovery.acknowledged,
            acknowledged_at: recovery.acknowledged_at,
            acknowledged_by: recovery.acknowledged_by.clone(),
            acknowledged_comment: recovery.acknowledged_comment.clone(),
        }
    }
}

/// Which completed recoveries an acknowledgement applies to.
#[derive(Debug, Clone)]
pub enum AckFilter {
    ByUid(String),
    ById(i64),
    ByInstance(InstanceKey),
    ByCluster(String),
    All,
}

#[derive(Debug, Clone)]
struct DetectionEntry {
    id: i64,
    registered_at: DateTime<Utc>,
    acknowledged: bool,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, RecoveryRecord>,
    /// string code of failed instance -> uid of its active recovery.
    active: HashMap<String, String>,
    /// string code -> end time of the most recent completed recovery.
    recently_ended: HashMap<String, DateTime<Utc>>,
    steps: Vec<TopologyRecoveryStep>,
    blocked: HashMap<String, BlockedRecovery>,
    detections: HashMap<String, DetectionEntry>,
}

/// Store of recovery attempts and audit steps.
pub struct RecoveryStore {
    config: Arc<RecoveryConfig>,
    consensus: Arc<dyn ConsensusLog>,
    state: Mutex<StoreState>,
    next_id: AtomicI64,
    recovery_disabled: AtomicBool,
}

impl RecoveryStore {
    pub fn new(config: Arc<RecoveryConfig>, consensus: Arc<dyn ConsensusLog>) -> Self {
        Self {
            config,
            consensus,
            state: Mutex::new(StoreState::default()),
            next_id: AtomicI64::new(1),
            recovery_disabled: AtomicBool::new(false),
        }
    }

    async fn publish(&self, name: &str, payload: Value) {
        if !self.consensus.is_enabled() {
            return;
        }
        if let Err(e) = self.consensus.publish_command(name, payload).await {
            warn!(command = name, error = %e, "Consensus publication failed");
        }
    }

    /// Atomically register a recovery attempt for an analysis entry.
    ///
    /// Returns `None` (not an error) when registration is blocked by an
    /// active recovery (`fail_if_active`) or by the post-recovery cooldown
    /// (`fail_if_recent`).
    pub async fn register_attempt(
        &self,
        analysis: &ReplicationAnalysis,
        fail_if_active: bool,
        fail_if_recent: bool,
    ) -> Result<Option<TopologyRecovery>> {
        let code = analysis.analyzed_key.string_code();
        let recovery = {
            let mut state = self.state.lock();

            if fail_if_active {
                if let Some(active_uid) = state.active.get(&code).cloned() {
                    let blocking_id = state
                        .records
                        .get(&active_uid)
                        .map(|r| r.id)
                        .unwrap_or_default();
                    Self::note_blocked(&mut state, analysis, blocking_id);
                    debug!(instance = %code, "Registration blocked: recovery already active");
                    return Ok(None);
                }
            }
            if fail_if_recent {
                if let Some(ended_at) = state.recently_ended.get(&code) {
                    let cooldown =
                        ChronoDuration::seconds(self.config.recovery_period_block_seconds as i64);
                    if Utc::now() - *ended_at < cooldown {
                        Self::note_blocked(&mut state, analysis, 0);
                        debug!(instance = %code, "Registration blocked: recently recovered");
                        return Ok(None);
                    }
                }
            }

            let mut recovery =
                TopologyRecovery::new(analysis.clone(), self.config.hostname.clone());
            recovery.id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if let Some(detection) = state.detections.get(&code) {
                recovery.last_detection_id = detection.id;
            }

            state.active.insert(code.clone(), recovery.uid.clone());
            state
                .records
                .insert(recovery.uid.clone(), RecoveryRecord::from_recovery(&recovery));
            state.blocked.remove(&code);
            recovery
        };

        info!(instance = %code, uid = %recovery.uid, "Registered recovery attempt");
        self.publish("register-recovery", recovery.snapshot()).await;
        Ok(Some(recovery))
    }

    fn note_blocked(state: &mut StoreState, analysis: &ReplicationAnalysis, blocking_id: i64) {
        let code = analysis.analyzed_key.string_code();
        state.blocked.insert(
            code,
            BlockedRecovery {
                failed_key: analysis.analyzed_key.clone(),
                cluster_name: analysis.cluster.cluster_name.clone(),
                analysis_code: analysis.code,
                last_blocked_at: Utc::now(),
                blocking_recovery_id: blocking_id,
            },
        );
    }

    /// Resolve a recovery exactly once, recording the successor (if any)
    /// and freezing the record. Success is monotonic: a recovery that has
    /// been marked successful is never downgraded.
    pub async fn resolve(
        &self,
        recovery: &mut TopologyRecovery,
        successor: Option<&crate::types::Instance>,
    ) -> Result<()> {
        if let Some(successor) = successor {
            recovery.successor_key = Some(successor.key.clone());
            recovery.successor_alias = successor.alias.clone();
            recovery.is_successful = true;
            recovery.participating_keys.insert(successor.key.clone());
            recovery.lost_replicas.remove(&successor.key);
        }
        recovery.is_active = false;
        recovery.ended_at = Some(Utc::now());

        let code = recovery.analysis_entry.analyzed_key.string_code();
        {
            let mut state = self.state.lock();
            state.active.remove(&code);
            state
                .recently_ended
                .insert(code.clone(), recovery.ended_at.unwrap_or_else(Utc::now));
            state
                .records
                .insert(recovery.uid.clone(), RecoveryRecord::from_recovery(recovery));
        }
        info!(
            instance = %code,
            uid = %recovery.uid,
            successful = recovery.is_successful,
            "Resolved recovery"
        );
        self.publish("resolve-recovery", recovery.snapshot()).await;
        Ok(())
    }

    /// Append one audit step for a recovery UID.
    pub async fn write_step(&self, uid: &str, message: &str) -> Result<()> {
        let step = TopologyRecoveryStep::new(uid, message);
        self.state.lock().steps.push(step.clone());
        self.publish(
            "write-recovery-step",
            serde_json::to_value(&step).unwrap_or(Value::Null),
        )
        .await;
        Ok(())
    }

    /// Whether a recovery on this instance is currently blocked by an
    /// active or recent one.
    pub fn is_blocked(&self, key: &InstanceKey) -> bool {
        let code = key.string_code();
        let state = self.state.lock();
        if state.active.contains_key(&code) {
            return true;
        }
        if let Some(ended_at) = state.recently_ended.get(&code) {
            let cooldown =
                ChronoDuration::seconds(self.config.recovery_period_block_seconds as i64);
            return Utc::now() - *ended_at < cooldown;
        }
        false
    }

    /// Recoveries that could not start because another one blocks them.
    pub fn blocked_recoveries(&self) -> Vec<BlockedRecovery> {
        self.state.lock().blocked.values().cloned().collect()
    }

    /// Acknowledge completed recoveries matching the filter. Returns the
    /// number of records acknowledged.
    pub fn acknowledge(&self, filter: &AckFilter, ack: &RecoveryAcknowledgement) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for record in state.records.values_mut() {
            if record.acknowledged || record.is_active {
                continue;
            }
            let matches = match filter {
                AckFilter::ByUid(uid) => &record.uid == uid,
                AckFilter::ById(id) => record.id == *id,
                AckFilter::ByInstance(key) => &record.failed_key == key,
                AckFilter::ByCluster(cluster) => &record.cluster_name == cluster,
                AckFilter::All => true,
            };
            if matches {
                record.acknowledged = true;
                record.acknowledged_at = Some(ack.created_at);
                record.acknowledged_by = ack.owner.clone();
                record.acknowledged_comment = ack.comment.clone();
                count += 1;
            }
        }
        count
    }

    /// Register a failure detection for an instance. Idempotent: repeat
    /// registrations within the detection cooldown return `false`.
    pub fn register_failure_detection(&self, analysis: &ReplicationAnalysis) -> bool {
        let code = analysis.analyzed_key.string_code();
        let mut state = self.state.lock();
        let cooldown =
            ChronoDuration::seconds(self.config.failure_detection_period_block_seconds as i64);
        if let Some(detection) = state.detections.get(&code) {
            if Utc::now() - detection.registered_at < cooldown {
                return false;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        state.detections.insert(
            code,
            DetectionEntry {
                id,
                registered_at: Utc::now(),
                acknowledged: false,
            },
        );
        true
    }

    /// Mark the originating detection of an instance as handled by a
    /// recovery.
    pub fn acknowledge_failure_detection(&self, key: &InstanceKey) {
        if let Some(detection) = self
            .state
            .lock()
            .detections
            .get_mut(&key.string_code())
        {
            detection.acknowledged = true;
        }
    }

    /// Whether the latest detection for an instance has been handled.
    pub fn failure_detection_acknowledged(&self, key: &InstanceKey) -> bool {
        self.state
            .lock()
            .detections
            .get(&key.string_code())
            .map(|d| d.acknowledged)
            .unwrap_or(false)
    }

    /// Identifier of the latest registered detection for an instance.
    pub fn latest_detection_id(&self, key: &InstanceKey) -> i64 {
        self.state
            .lock()
            .detections
            .get(&key.string_code())
            .map(|d| d.id)
            .unwrap_or(0)
    }

    /// The global recovery-disabled gate. Honored by the dispatcher unless
    /// a recovery is forced.
    pub fn is_recovery_disabled(&self) -> bool {
        self.recovery_disabled.load(Ordering::SeqCst)
    }

    pub fn set_recovery_disabled(&self, disabled: bool) {
        self.recovery_disabled.store(disabled, Ordering::SeqCst);
        info!(disabled, "Global recovery gate changed");
    }

    /// Apply a command delivered from the consensus log (follower side).
    pub fn apply_command(&self, name: &str, payload: &Value) -> Result<()> {
        match name {
            "register-recovery" | "resolve-recovery" => {
                let recovery: TopologyRecovery = serde_json::from_value(payload.clone())?;
                let record = RecoveryRecord::from_recovery(&recovery);
                let code = record.failed_key.string_code();
                let mut state = self.state.lock();
                if record.is_active {
                    state.active.insert(code, record.uid.clone());
                } else {
                    state.active.remove(&code);
                    if let Some(ended_at) = record.ended_at {
                        state.recently_ended.insert(code, ended_at);
                    }
                }
                state.records.insert(record.uid.clone(), record);
            }
            "write-recovery-step" => {
                let step: TopologyRecoveryStep = serde_json::from_value(payload.clone())?;
                self.state.lock().steps.push(step);
            }
            "register-failure-detection" => {
                let analysis: ReplicationAnalysis = serde_json::from_value(payload.clone())?;
                self.register_failure_detection(&analysis);
            }
            _ => {
                debug!(command = name, "Ignoring unknown consensus command");
            }
        }
        Ok(())
    }

    // ---- read surface ----

    pub fn record_by_uid(&self, uid: &str) -> Option<RecoveryRecord> {
        self.state.lock().records.get(uid).cloned()
    }

    pub fn active_recovery(&self, key: &InstanceKey) -> Option<RecoveryRecord> {
        let state = self.state.lock();
        state
            .active
            .get(&key.string_code())
            .and_then(|uid| state.records.get(uid))
            .cloned()
    }

    pub fn steps_for(&self, uid: &str) -> Vec<TopologyRecoveryStep> {
        self.state
            .lock()
            .steps
            .iter()
            .filter(|s| s.recovery_uid == uid)
            .cloned()
            .collect()
    }

    pub fn all_records(&self) -> Vec<RecoveryRecord> {
        let mut records: Vec<RecoveryRecord> =
            self.state.lock().records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{LocalLog, RecordingLog};

    fn analysis(host: &str) -> ReplicationAnalysis {
        ReplicationAnalysis {
            analyzed_key: InstanceKey::new(host, 3306),
            code: AnalysisCode::DeadMaster,
            ..Default::default()
        }
    }

    fn store() -> RecoveryStore {
        RecoveryStore::new(Arc::new(RecoveryConfig::default()), Arc::new(LocalLog))
    }

    #[tokio::test]
    async fn test_register_blocks_second_active() {
        let store = store();
        let first = store
            .register_attempt(&analysis("db1"), true, true)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .register_attempt(&analysis("db1"), true, true)
            .await
            .unwrap();
        assert!(second.is_none());
        assert!(store.is_blocked(&InstanceKey::new("db1", 3306)));
        assert_eq!(store.blocked_recoveries().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_after_resolution_unless_forced() {
        let store = store();
        let mut recovery = store
            .register_attempt(&analysis("db1"), true, true)
            .await
            .unwrap()
            .unwrap();
        store.resolve(&mut recovery, None).await.unwrap();

        // Within cooldown: blocked.
        assert!(store
            .register_attempt(&analysis("db1"), true, true)
            .await
            .unwrap()
            .is_none());
        // Forced path skips the recency gate.
        assert!(store
            .register_attempt(&analysis("db1"), true, false)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_resolve_sets_successor_and_disjointness() {
        let store = store();
        let mut recovery = store
            .register_attempt(&analysis("db1"), true, true)
            .await
            .unwrap()
            .unwrap();
        let successor_key = InstanceKey::new("db2", 3306);
        recovery.lost_replicas.insert(successor_key.clone());

        let successor = crate::types::Instance {
            key: successor_key.clone(),
            alias: "db2-alias".into(),
            ..Default::default()
        };
        store.resolve(&mut recovery, Some(&successor)).await.unwrap();

        assert!(recovery.is_successful);
        assert!(!recovery.is_active);
        assert!(recovery.ended_at.is_some());
        // Successor never remains in the lost set.
        assert!(!recovery.lost_replicas.contains(&successor_key));
        assert!(recovery.participating_keys.contains(&successor_key));

        let record = store.record_by_uid(&recovery.uid).unwrap();
        assert!(record.is_successful);
        assert_eq!(record.successor_alias, "db2-alias");
    }

    #[tokio::test]
    async fn test_steps_and_acknowledgement() {
        let store = store();
        let mut recovery = store
            .register_attempt(&analysis("db1"), true, true)
            .await
            .unwrap()
            .unwrap();
        store.write_step(&recovery.uid, "will recover").await.unwrap();
        store.write_step(&recovery.uid, "promoted db2").await.unwrap();
        assert_eq!(store.steps_for(&recovery.uid).len(), 2);

        // Active recoveries are not acknowledgeable.
        let ack = RecoveryAcknowledgement::new("alice", "handled");
        assert_eq!(store.acknowledge(&AckFilter::All, &ack), 0);

        store.resolve(&mut recovery, None).await.unwrap();
        assert_eq!(
            store.acknowledge(&AckFilter::ByUid(recovery.uid.clone()), &ack),
            1
        );
        let record = store.record_by_uid(&recovery.uid).unwrap();
        assert!(record.acknowledged);
        assert_eq!(record.acknowledged_by, "alice");
    }

    #[tokio::test]
    async fn test_detection_idempotence() {
        let store = store();
        assert!(store.register_failure_detection(&analysis("db1")));
        assert!(!store.register_failure_detection(&analysis("db1")));
        assert!(store.register_failure_detection(&analysis("db2")));
        assert_ne!(
            store.latest_detection_id(&InstanceKey::new("db1", 3306)),
            0
        );
    }

    #[tokio::test]
    async fn test_consensus_publication_and_follower_apply() {
        let consensus = Arc::new(RecordingLog::default());
        let leader = RecoveryStore::new(
            Arc::new(RecoveryConfig::default()),
            Arc::clone(&consensus) as Arc<dyn ConsensusLog>,
        );

        let mut recovery = leader
            .register_attempt(&analysis("db1"), true, true)
            .await
            .unwrap()
            .unwrap();
        leader.write_step(&recovery.uid, "step one").await.unwrap();
        leader.resolve(&mut recovery, None).await.unwrap();

        let follower = RecoveryStore::new(Arc::new(RecoveryConfig::default()), Arc::new(LocalLog));
        for (name, payload) in consensus.published() {
            follower.apply_command(&name, &payload).unwrap();
        }

        let record = follower.record_by_uid(&recovery.uid).unwrap();
        assert!(!record.is_active);
        assert_eq!(follower.steps_for(&recovery.uid).len(), 1);
        // Replaying delivered commands is safe.
        for (name, payload) in consensus.published() {
            follower.apply_command(&name, &payload).unwrap();
        }
        assert_eq!(follower.steps_for(&recovery.uid).len(), 2);
    }
}
