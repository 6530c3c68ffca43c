//! External hook execution.
//!
//! Hooks are operator-supplied shell commands run at well-defined points
//! of a recovery. Before execution, `{placeholder}` tokens are substituted
//! from the recovery record, and the same data is exported as `ORC_`
//! prefixed environment variables. Placeholders with no value substitute
//! to the empty string.
//!
//! Supported placeholders: `{failureType}`, `{failureDescription}`,
//! `{command}`, `{failedHost}`, `{failedPort}`, `{failureCluster}`,
//! `{failureClusterAlias}`, `{failureClusterDomain}`, `{countReplicas}`,
//! `{isDowntimed}`, `{autoMasterRecovery}`,
//! `{autoIntermediateMasterRecovery}`, `{orchestratorHost}`,
//! `{recoveryUID}`, `{isSuccessful}`, `{successorHost}`, `{successorPort}`,
//! `{successorAlias}`, `{lostReplicas}`, `{countLostReplicas}`,
//! `{replicaHosts}`, plus the legacy spellings `{countSlaves}`,
//! `{lostSlaves}` and `{slaveHosts}`.

use crate::error::{RecoveryError, Result};
use crate::recovery::TopologyRecovery;
use crate::types::keys_to_comma_delimited;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// The substitution data of one recovery, flattened to strings.
fn substitutions(recovery: &TopologyRecovery, processing_node: &str) -> Vec<(&'static str, String)> {
    let analysis = &recovery.analysis_entry;
    let lost = recovery.lost_replicas_comma_delimited();
    let replicas = keys_to_comma_delimited(&analysis.replica_hosts);

    let mut pairs = vec![
        ("failureType", analysis.code.to_string()),
        ("failureDescription", analysis.description.clone()),
        ("command", analysis.command_hint.clone()),
        ("failedHost", analysis.analyzed_key.hostname.clone()),
        ("failedPort", analysis.analyzed_key.port.to_string()),
        ("failureCluster", analysis.cluster.cluster_name.clone()),
        ("failureClusterAlias", analysis.cluster.cluster_alias.clone()),
        ("failureClusterDomain", analysis.cluster.cluster_domain.clone()),
        ("countSlaves", analysis.count_replicas.to_string()),
        ("countReplicas", analysis.count_replicas.to_string()),
        ("isDowntimed", analysis.is_downtimed.to_string()),
        (
            "autoMasterRecovery",
            analysis.cluster.automated_master_recovery.to_string(),
        ),
        (
            "autoIntermediateMasterRecovery",
            analysis
                .cluster
                .automated_intermediate_master_recovery
                .to_string(),
        ),
        ("orchestratorHost", processing_node.to_string()),
        ("recoveryUID", recovery.uid.clone()),
        ("isSuccessful", recovery.successor_key.is_some().to_string()),
        ("lostSlaves", lost.clone()),
        ("lostReplicas", lost),
        ("countLostReplicas", recovery.lost_replicas.len().to_string()),
        ("slaveHosts", replicas.clone()),
        ("replicaHosts", replicas),
    ];

    match &recovery.successor_key {
        Some(successor) => {
            pairs.push(("successorHost", successor.hostname.clone()));
            pairs.push(("successorPort", successor.port.to_string()));
            pairs.push(("successorAlias", recovery.successor_alias.clone()));
        }
        None => {
            pairs.push(("successorHost", String::new()));
            pairs.push(("successorPort", String::new()));
            pairs.push(("successorAlias", String::new()));
        }
    }

    pairs
}

/// Replace agreed-upon placeholders in a hook command with recovery data.
pub fn apply_placeholders(
    command: &str,
    recovery: &TopologyRecovery,
    processing_node: &str,
) -> String {
    let mut command = command.to_string();
    for (name, value) in substitutions(recovery, processing_node) {
        command = command.replace(&format!("{{{}}}", name), &value);
    }
    command
}

/// Environment variables passed to every hook invocation, mirroring the
/// placeholder data in SCREAMING_SNAKE form with an `ORC_` prefix.
pub fn hook_environment(
    recovery: &TopologyRecovery,
    processing_node: &str,
) -> Vec<(String, String)> {
    substitutions(recovery, processing_node)
        .into_iter()
        .map(|(name, value)| {
            let mut env_name = String::from("ORC_");
            let mut prev_lowercase = false;
            for ch in name.chars() {
                if ch.is_uppercase() && prev_lowercase {
                    env_name.push('_');
                }
                prev_lowercase = ch.is_lowercase();
                env_name.push(ch.to_ascii_uppercase());
            }
            (env_name, value)
        })
        .collect()
}

/// Executes one fully-substituted hook command.
#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run(&self, command: &str, env: &[(String, String)]) -> Result<()>;
}

/// Runs hooks through `sh -c`, inheriting the engine's environment plus
/// the recovery variables. No built-in deadline: operators set timeouts
/// inside the hook scripts themselves.
#[derive(Debug, Default)]
pub struct ShellHookRunner;

#[async_trait]
impl HookRunner for ShellHookRunner {
    async fn run(&self, command: &str, env: &[(String, String)]) -> Result<()> {
        debug!(command, "Running hook");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (name, value) in env {
            cmd.env(name, value);
        }

        let status = cmd
            .status()
            .await
            .map_err(|e| RecoveryError::HookFailed(format!("{}: {}", command, e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(RecoveryError::HookFailed(format!(
                "{}: exited with {}",
                command, status
            )))
        }
    }
}

/// Test hook runner: records substituted commands, optionally failing
/// commands that contain a marker string.
#[derive(Debug, Default)]
pub struct RecordingHookRunner {
    commands: Mutex<Vec<String>>,
    fail_marker: Option<String>,
}

impl RecordingHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `marker` will fail.
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            fail_marker: Some(marker.into()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl HookRunner for RecordingHookRunner {
    async fn run(&self, command: &str, _env: &[(String, String)]) -> Result<()> {
        self.commands.lock().push(command.to_string());
        if let Some(marker) = &self.fail_marker {
            if command.contains(marker) {
                return Err(RecoveryError::HookFailed(format!("{}: forced", command)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisCode, InstanceKey, ReplicationAnalysis};

    fn recovery() -> TopologyRecovery {
        let analysis = ReplicationAnalysis {
            analyzed_key: InstanceKey::new("db1.example.com", 3306),
            code: AnalysisCode::DeadMaster,
            count_replicas: 2,
            ..Default::default()
        };
        TopologyRecovery::new(analysis, "orc1")
    }

    #[test]
    fn test_placeholder_substitution() {
        let mut recovery = recovery();
        recovery.successor_key = Some(InstanceKey::new("db2.example.com", 3306));
        recovery.successor_alias = "db2".to_string();

        let command = apply_placeholders(
            "notify {failureType} {failedHost}:{failedPort} -> {successorHost} ok={isSuccessful}",
            &recovery,
            "orc1",
        );
        assert_eq!(
            command,
            "notify DeadMaster db1.example.com:3306 -> db2.example.com ok=true"
        );
    }

    #[test]
    fn test_missing_successor_substitutes_empty() {
        let recovery = recovery();
        let command = apply_placeholders("s=[{successorHost}]", &recovery, "orc1");
        assert_eq!(command, "s=[]");
    }

    #[test]
    fn test_substitution_is_idempotent() {
        let recovery = recovery();
        let once = apply_placeholders("{failureType} {countReplicas}", &recovery, "orc1");
        let twice = apply_placeholders(&once, &recovery, "orc1");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_legacy_placeholders_match_modern() {
        let mut recovery = recovery();
        recovery
            .lost_replicas
            .insert(InstanceKey::new("db9", 3306));
        let modern = apply_placeholders("{lostReplicas}|{countReplicas}", &recovery, "orc1");
        let legacy = apply_placeholders("{lostSlaves}|{countSlaves}", &recovery, "orc1");
        assert_eq!(modern, legacy);
    }

    #[test]
    fn test_environment_names() {
        let recovery = recovery();
        let env = hook_environment(&recovery, "orc1");
        let names: Vec<&str> = env.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"ORC_FAILURE_TYPE"));
        assert!(names.contains(&"ORC_FAILED_HOST"));
        assert!(names.contains(&"ORC_RECOVERY_UID"));
        assert!(names.contains(&"ORC_AUTO_INTERMEDIATE_MASTER_RECOVERY"));
    }

    #[tokio::test]
    async fn test_shell_runner_exit_codes() {
        let runner = ShellHookRunner;
        assert!(runner.run("true", &[]).await.is_ok());
        assert!(runner.run("false", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_shell_runner_passes_environment() {
        let runner = ShellHookRunner;
        let env = vec![("ORC_FAILED_HOST".to_string(), "db1".to_string())];
        assert!(runner
            .run("test \"$ORC_FAILED_HOST\" = db1", &env)
            .await
            .is_ok());
    }
}
