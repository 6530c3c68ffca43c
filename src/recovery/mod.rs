//! Topology recovery: the engine that turns analyzer verdicts into
//! promotions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                             │
//! │   routing table │ grace window │ leader gate │ disabled gate  │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Executors: dead master │ intermediate master │ co-master    │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Candidate Selector │ Topology Rewirer │ Postponed Functions │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Recovery Record Store │ Emergency Probes │ Hooks │ KV       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A recovery record is created at registration, mutated only by the
//! executor that holds it, resolved exactly once, and thereafter read-only
//! except for acknowledgement.

pub mod co_master;
pub mod dead_master;
pub mod engine;
pub mod intermediate_master;
pub mod postpone;
pub mod probes;
pub mod rewire;
pub mod selection;
pub mod store;
pub mod takeover;

pub use engine::RecoveryEngine;
pub use postpone::{PostponedFn, PostponedFunctions};
pub use probes::EmergencyProbes;
pub use rewire::{RegroupOutcome, Rewirer};
pub use store::{AckFilter, RecoveryStore};

use crate::types::{
    keys_to_comma_delimited, InstanceKey, InstanceKeySet, ReplicationAnalysis,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which failure class an executor is handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Master,
    CoMaster,
    IntermediateMaster,
}

/// How the rewirer resynchronizes surviving replicas during a master-class
/// recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterRecoveryType {
    NotMasterRecovery,
    Gtid,
    PseudoGtid,
    BinlogServer,
}

/// The durable record of one recovery attempt.
#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyRecovery {
    pub id: i64,
    /// Opaque unique token; audit steps are keyed by it.
    pub uid: String,
    pub analysis_entry: ReplicationAnalysis,
    pub failure_class: Option<FailureClass>,
    pub recovery_type: MasterRecoveryType,
    pub successor_key: Option<InstanceKey>,
    pub successor_alias: String,
    pub is_active: bool,
    pub is_successful: bool,
    pub lost_replicas: InstanceKeySet,
    pub participating_keys: InstanceKeySet,
    /// Append-only while the recovery is alive; frozen at resolution.
    pub all_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub processing_node: String,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: String,
    pub acknowledged_comment: String,
    pub last_detection_id: i64,
    pub related_recovery_id: i64,
    #[serde(skip)]
    pub postponed: PostponedFunctions,
}

impl TopologyRecovery {
    /// Create a fresh, unregistered recovery for an analysis entry.
    pub fn new(analysis_entry: ReplicationAnalysis, processing_node: impl Into<String>) -> Self {
        Self {
            id: 0,
            uid: Uuid::new_v4().simple().to_string(),
            analysis_entry,
            failure_class: None,
            recovery_type: MasterRecoveryType::NotMasterRecovery,
            successor_key: None,
            successor_alias: String::new(),
            is_active: true,
            is_successful: false,
            lost_replicas: InstanceKeySet::new(),
            participating_keys: InstanceKeySet::new(),
            all_errors: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            processing_node: processing_node.into(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: String::new(),
            acknowledged_comment: String::new(),
            last_detection_id: 0,
            related_recovery_id: 0,
            postponed: PostponedFunctions::new(),
        }
    }

    /// Append an error to the record. Passes the error through so call
    /// sites can keep propagating it.
    pub fn add_error<E: std::fmt::Display>(&mut self, err: &E) {
        self.all_errors.push(err.to_string());
    }

    /// Append several errors.
    pub fn add_errors<E: std::fmt::Display>(&mut self, errs: &[E]) {
        for err in errs {
            self.add_error(err);
        }
    }

    pub fn failed_key(&self) -> &InstanceKey {
        &self.analysis_entry.analyzed_key
    }

    pub fn lost_replicas_comma_delimited(&self) -> String {
        keys_to_comma_delimited(&self.lost_replicas)
    }

    /// Serializable snapshot, used for consensus publication and store
    /// persistence. The postponed container is excluded by construction.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One audited step in a recovery process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyRecoveryStep {
    pub id: i64,
    pub recovery_uid: String,
    pub audited_at: DateTime<Utc>,
    pub message: String,
}

impl TopologyRecoveryStep {
    pub fn new(recovery_uid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            recovery_uid: recovery_uid.into(),
            audited_at: Utc::now(),
            message: message.into(),
        }
    }
}

/// Operator (or internal) acknowledgement of a recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAcknowledgement {
    pub created_at: DateTime<Utc>,
    pub owner: String,
    pub comment: String,
}

impl RecoveryAcknowledgement {
    pub fn new(owner: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            owner: owner.into(),
            comment: comment.into(),
        }
    }

    /// Acknowledgement issued by the engine itself, e.g. when a newer
    /// recovery supersedes the acknowledged one.
    pub fn internal() -> Self {
        Self::new("masterswitch", "internal")
    }
}

/// A recovery that could not start because another one blocks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedRecovery {
    pub failed_key: InstanceKey,
    pub cluster_name: String,
    pub analysis_code: crate::types::AnalysisCode,
    pub last_blocked_at: DateTime<Utc>,
    pub blocking_recovery_id: i64,
}
