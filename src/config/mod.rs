//! Configuration module for masterswitch.
//!
//! All operator knobs recognized by the recovery engine live here, with
//! serde support for JSON config files, validation, and a development
//! preset.

use crate::error::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the recovery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Identity of this processing node, reported on recovery records and
    /// exposed to hooks as `{orchestratorHost}`.
    pub hostname: String,

    /// Reject master promotions into a different data center than the
    /// failed master's.
    pub prevent_cross_data_center_master_failover: bool,
    /// Reject master promotions into a different region than the failed
    /// master's.
    pub prevent_cross_region_master_failover: bool,

    /// After a master failover, detach lost replicas from their former
    /// master so they do not silently rejoin. Runs postponed.
    pub detach_lost_replicas_after_master_failover: bool,
    /// After a master failover, detach the promoted master's own master
    /// host setting.
    pub master_failover_detach_replica_master_host: bool,
    /// Apply promotion side effects on the promoted server: reset
    /// replication, clear read-only, set read-only on the demoted master.
    pub apply_mysql_promotion_after_master_failover: bool,

    /// Abort a master promotion when the promoted replica's SQL thread has
    /// unapplied relay logs. Takes precedence over
    /// `delay_master_promotion_if_sql_thread_not_up_to_date` when both are
    /// set.
    pub fail_master_promotion_if_sql_thread_not_up_to_date: bool,
    /// Wait (unbounded) for the promoted replica's SQL thread to catch up
    /// before completing a master promotion. Ignored when the fail gate
    /// above is set.
    pub delay_master_promotion_if_sql_thread_not_up_to_date: bool,

    /// In co-master recovery, the surviving co-master must become the
    /// promotion target; anything else is a failure.
    pub co_master_recovery_must_promote_other_co_master: bool,

    /// Maximum tolerated replication lag for maintenance-type operations
    /// such as graceful takeover, in seconds.
    pub reasonable_maintenance_replication_lag_seconds: u64,
    /// Downtime duration applied to the failed instance and to replicas
    /// lost during recovery, in seconds.
    pub lost_in_recovery_downtime_seconds: u64,
    /// Cooldown after a completed recovery during which further recoveries
    /// on the same instance are blocked (unless forced), in seconds.
    pub recovery_period_block_seconds: u64,
    /// Cooldown during which repeated failure detections on the same
    /// instance register silently, in seconds.
    pub failure_detection_period_block_seconds: u64,

    /// Key prefix under which the active master of each cluster alias is
    /// advertised in the key-value store.
    pub kv_cluster_master_prefix: String,

    /// External hook batches.
    pub hooks: HookConfig,
    /// Emergency probe throttling.
    pub probes: ProbeConfig,
    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            prevent_cross_data_center_master_failover: false,
            prevent_cross_region_master_failover: false,
            detach_lost_replicas_after_master_failover: true,
            master_failover_detach_replica_master_host: false,
            apply_mysql_promotion_after_master_failover: true,
            fail_master_promotion_if_sql_thread_not_up_to_date: false,
            delay_master_promotion_if_sql_thread_not_up_to_date: false,
            co_master_recovery_must_promote_other_co_master: true,
            reasonable_maintenance_replication_lag_seconds: 20,
            lost_in_recovery_downtime_seconds: 1200,
            recovery_period_block_seconds: 3600,
            failure_detection_period_block_seconds: 60,
            kv_cluster_master_prefix: "mysql/master/".to_string(),
            hooks: HookConfig::default(),
            probes: ProbeConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl RecoveryConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RecoveryError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RecoveryError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(RecoveryError::InvalidConfig {
                field: "hostname".to_string(),
                reason: "Processing node hostname must not be empty".to_string(),
            });
        }
        if self.recovery_period_block_seconds == 0 {
            return Err(RecoveryError::InvalidConfig {
                field: "recovery_period_block_seconds".to_string(),
                reason: "Recovery cooldown must be non-zero".to_string(),
            });
        }
        if self.lost_in_recovery_downtime_seconds == 0 {
            return Err(RecoveryError::InvalidConfig {
                field: "lost_in_recovery_downtime_seconds".to_string(),
                reason: "Lost-in-recovery downtime must be non-zero".to_string(),
            });
        }
        if !self.kv_cluster_master_prefix.ends_with('/') {
            return Err(RecoveryError::InvalidConfig {
                field: "kv_cluster_master_prefix".to_string(),
                reason: "KV prefix must end with '/'".to_string(),
            });
        }
        Ok(())
    }

    /// Create a minimal development configuration with short cooldowns.
    pub fn development() -> Self {
        Self {
            hostname: "dev-node".to_string(),
            reasonable_maintenance_replication_lag_seconds: 5,
            lost_in_recovery_downtime_seconds: 60,
            recovery_period_block_seconds: 30,
            failure_detection_period_block_seconds: 5,
            ..Default::default()
        }
    }

    pub fn lost_in_recovery_downtime(&self) -> Duration {
        Duration::from_secs(self.lost_in_recovery_downtime_seconds)
    }

    pub fn recovery_period_block(&self) -> Duration {
        Duration::from_secs(self.recovery_period_block_seconds)
    }

    pub fn failure_detection_period_block(&self) -> Duration {
        Duration::from_secs(self.failure_detection_period_block_seconds)
    }

    pub fn reasonable_maintenance_replication_lag(&self) -> Duration {
        Duration::from_secs(self.reasonable_maintenance_replication_lag_seconds)
    }
}

/// Hook batches executed at well-defined points of a recovery. Each entry
/// is a shell command with `{placeholder}` substitution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Run before any rewiring; failure aborts the recovery.
    pub pre_failover_processes: Vec<String>,
    /// Run after any successful recovery.
    pub post_failover_processes: Vec<String>,
    /// Run after a recovery that promoted nothing.
    pub post_unsuccessful_failover_processes: Vec<String>,
    /// Run after a successful master failover.
    pub post_master_failover_processes: Vec<String>,
    /// Run after a successful intermediate-master failover.
    pub post_intermediate_master_failover_processes: Vec<String>,
    /// Run when a failure is first detected.
    pub on_failure_detection_processes: Vec<String>,
    /// Run before a graceful takeover freezes the master; failure aborts.
    pub pre_graceful_takeover_processes: Vec<String>,
    /// Run at the end of a graceful takeover.
    pub post_graceful_takeover_processes: Vec<String>,
}

/// Throttling windows for emergency probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Deduplication window for out-of-band instance re-reads, in
    /// milliseconds.
    pub emergent_read_ttl_ms: u64,
    /// Deduplication window for replication-restart nudges, in
    /// milliseconds.
    pub emergent_restart_ttl_ms: u64,
    /// Grace window after an emergent operation during which analysis
    /// codes on the instance are treated as non-actionable, in
    /// milliseconds.
    pub grace_period_ttl_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            emergent_read_ttl_ms: 1_000,
            emergent_restart_ttl_ms: 30_000,
            grace_period_ttl_ms: 5_000,
        }
    }
}

impl ProbeConfig {
    pub fn emergent_read_ttl(&self) -> Duration {
        Duration::from_millis(self.emergent_read_ttl_ms)
    }

    pub fn emergent_restart_ttl(&self) -> Duration {
        Duration::from_millis(self.emergent_restart_ttl_ms)
    }

    pub fn grace_period_ttl(&self) -> Duration {
        Duration::from_millis(self.grace_period_ttl_ms)
    }
}

/// Logging and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit logs as JSON lines.
    pub json_logs: bool,
    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics endpoint bind address.
    pub metrics_addr: SocketAddr,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_addr: "127.0.0.1:9125".parse().expect("valid socket address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(RecoveryConfig::default().validate().is_ok());
        assert!(RecoveryConfig::development().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_cooldown() {
        let config = RecoveryConfig {
            recovery_period_block_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_kv_prefix() {
        let config = RecoveryConfig {
            kv_cluster_master_prefix: "mysql/master".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::json!({
            "hostname": "orc1.example.com",
            "prevent_cross_data_center_master_failover": true,
            "hooks": {
                "pre_failover_processes": ["echo pre {failureCluster}"]
            }
        });
        write!(file, "{}", json).unwrap();

        let config = RecoveryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hostname, "orc1.example.com");
        assert!(config.prevent_cross_data_center_master_failover);
        assert_eq!(config.hooks.pre_failover_processes.len(), 1);
        // Unspecified fields fall back to defaults
        assert_eq!(config.recovery_period_block_seconds, 3600);
    }
}
