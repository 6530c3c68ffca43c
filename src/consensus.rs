//! Consensus-log abstraction.
//!
//! The recovery engine functions identically with or without an attached
//! consensus log. When one is attached, the record store and the
//! dispatcher publish typed commands through it, followers apply those
//! commands to their local stores on delivery, and only the leader
//! executes recoveries. When none is attached, [`LocalLog`] reports
//! disabled and every node acts as its own leader, writing directly to
//! its local store.
//!
//! Command names used by the engine:
//!
//! - `register-recovery`: a new recovery attempt was registered
//! - `write-recovery-step`: one audit step of a recovery
//! - `resolve-recovery`: final resolution of a recovery
//! - `register-failure-detection`: a failure detection was recorded
//! - `put-key-value`: cluster-master advertisement
//! - `async-snapshot`: hint that followers should snapshot soon

use crate::error::{RecoveryError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// Observable contract of the consensus library.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Whether a consensus log is attached at all.
    fn is_enabled(&self) -> bool;

    /// Whether this node currently leads the consensus group. Meaningful
    /// only when enabled; disabled logs report `true` so single-node
    /// deployments always execute.
    fn is_leader(&self) -> bool;

    /// Publish a typed command to the log.
    async fn publish_command(&self, name: &str, payload: Value) -> Result<()>;
}

/// Local-only stand-in used when no consensus log is attached: commands
/// are not published anywhere, callers write directly to their stores.
#[derive(Debug, Default)]
pub struct LocalLog;

#[async_trait]
impl ConsensusLog for LocalLog {
    fn is_enabled(&self) -> bool {
        false
    }

    fn is_leader(&self) -> bool {
        true
    }

    async fn publish_command(&self, name: &str, _payload: Value) -> Result<()> {
        Err(RecoveryError::ConsensusPublish(format!(
            "no consensus log attached; refusing to publish {}",
            name
        )))
    }
}

/// In-memory consensus double for tests: records published commands and
/// lets the test flip leadership.
#[derive(Debug)]
pub struct RecordingLog {
    leader: Mutex<bool>,
    published: Mutex<Vec<(String, Value)>>,
}

impl RecordingLog {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: Mutex::new(leader),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        *self.leader.lock() = leader;
    }

    /// All commands published so far, in order.
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }

    /// Commands published under a given name.
    pub fn published_named(&self, name: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl Default for RecordingLog {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ConsensusLog for RecordingLog {
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_leader(&self) -> bool {
        *self.leader.lock()
    }

    async fn publish_command(&self, name: &str, payload: Value) -> Result<()> {
        self.published.lock().push((name.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_log_is_disabled_leader() {
        let log = LocalLog;
        assert!(!log.is_enabled());
        assert!(log.is_leader());
        assert!(log
            .publish_command("put-key-value", Value::Null)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recording_log_captures_commands() {
        let log = RecordingLog::default();
        log.publish_command("resolve-recovery", serde_json::json!({"uid": "x"}))
            .await
            .unwrap();

        let resolved = log.published_named("resolve-recovery");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0]["uid"], "x");

        log.set_leader(false);
        assert!(!log.is_leader());
    }
}
