//! Candidate selection.
//!
//! Pure functions ranking surviving replicas against operator policy.
//! Everything here works on instance snapshots the caller already read;
//! nothing in this module touches the topology.

use crate::config::RecoveryConfig;
use crate::types::{Instance, InstanceKey, PromotionRule, ReplicationAnalysis};
use std::cmp::Ordering;

/// Whether an instance is banned from ever being promoted.
pub fn is_banned_from_promotion(instance: &Instance) -> bool {
    instance.promotion_rule.is_banned()
}

/// Basic sanity for any would-be master: binary logging, optionally
/// log-replica-updates, not a binlog server, not banned, and its last
/// poll succeeded.
pub fn is_generally_valid_as_would_be_master(
    replica: &Instance,
    require_log_replica_updates: bool,
) -> bool {
    if !replica.is_last_check_valid {
        // Something is wrong with this replica right now; don't place bets on it.
        return false;
    }
    if !replica.log_bin_enabled {
        return false;
    }
    if require_log_replica_updates && !replica.log_replica_updates_enabled {
        return false;
    }
    if replica.is_binlog_server {
        return false;
    }
    if is_banned_from_promotion(replica) {
        return false;
    }
    true
}

/// Basic server configuration and state checks for an intermediate-master
/// sibling.
fn is_generally_valid_as_candidate_sibling(sibling: &Instance) -> bool {
    sibling.log_bin_enabled
        && sibling.log_replica_updates_enabled
        && sibling.replica_running()
        && sibling.is_last_check_valid
}

/// Whether `sibling` is capable of taking over the replicas of a failed
/// intermediate master.
pub fn is_valid_sibling_of_intermediate_master(
    intermediate_master: &Instance,
    sibling: &Instance,
) -> bool {
    if sibling.key == intermediate_master.key {
        return false;
    }
    if !is_generally_valid_as_candidate_sibling(sibling) {
        return false;
    }
    if is_banned_from_promotion(sibling) {
        return false;
    }
    if sibling.has_replication_filters != intermediate_master.has_replication_filters {
        return false;
    }
    if sibling.is_binlog_server != intermediate_master.is_binlog_server {
        // When the failed node is a binlog server, repointing its replicas
        // up is simpler than adopting them into a sibling.
        return false;
    }
    if sibling
        .exec_coordinates
        .smaller_than(&intermediate_master.exec_coordinates)
    {
        return false;
    }
    true
}

/// Whether `want_to_take_over` can replace an already-promoted server as
/// master: it must be a valid master itself, currently replicate from the
/// promoted server, and the promoted server must be able to replicate
/// back from it.
pub fn can_take_over_promoted_server(
    want_to_take_over: &Instance,
    to_be_taken_over: &Instance,
) -> bool {
    if !is_generally_valid_as_would_be_master(want_to_take_over, true) {
        return false;
    }
    if want_to_take_over.master_key.as_ref() != Some(&to_be_taken_over.key) {
        return false;
    }
    to_be_taken_over
        .can_replicate_from(want_to_take_over)
        .is_ok()
}

/// Check the cross-DC / cross-region constraints for a suggested
/// promotion. Returns `Some(reason)` naming the violated constraint, or
/// `None` when the suggestion is geographically acceptable.
pub fn geographic_constraint_violation(
    config: &RecoveryConfig,
    analysis: &ReplicationAnalysis,
    suggested: &Instance,
) -> Option<String> {
    if config.prevent_cross_data_center_master_failover
        && suggested.data_center != analysis.data_center
    {
        return Some(format!(
            "PreventCrossDataCenterMasterFailover: will not promote server in {} when failed server in {}",
            suggested.data_center, analysis.data_center
        ));
    }
    if config.prevent_cross_region_master_failover && suggested.region != analysis.region {
        return Some(format!(
            "PreventCrossRegionMasterFailover: will not promote server in {} when failed server in {}",
            suggested.region, analysis.region
        ));
    }
    None
}

/// Sort instances by descending replica count; ties break toward the more
/// advanced exec coordinates.
pub fn sort_by_count_replicas_descending(instances: &mut [Instance]) {
    instances.sort_by(|a, b| {
        b.count_replicas
            .cmp(&a.count_replicas)
            .then_with(|| {
                if a.exec_coordinates.smaller_than(&b.exec_coordinates) {
                    Ordering::Greater
                } else if b.exec_coordinates.smaller_than(&a.exec_coordinates) {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
    });
}

/// Choose the best sibling of a dead intermediate master to adopt its
/// replicas. Tiers: marked candidate in the same DC and environment, any
/// marked candidate, any valid sibling in the same DC and environment,
/// any valid sibling.
pub fn choose_candidate_sibling(
    intermediate_master: &Instance,
    siblings: &[Instance],
) -> Option<Instance> {
    let mut siblings: Vec<Instance> = siblings.to_vec();
    sort_by_count_replicas_descending(&mut siblings);

    let valid = |s: &&Instance| is_valid_sibling_of_intermediate_master(intermediate_master, s);
    let same_locality = |s: &&Instance| {
        s.data_center == intermediate_master.data_center
            && s.physical_environment == intermediate_master.physical_environment
    };

    siblings
        .iter()
        .filter(valid)
        .find(|s| s.is_candidate && same_locality(s))
        .or_else(|| siblings.iter().filter(valid).find(|s| s.is_candidate))
        .or_else(|| siblings.iter().filter(valid).find(same_locality))
        .or_else(|| siblings.iter().find(valid))
        .cloned()
}

/// Outcome of the master-replacement search.
#[derive(Debug)]
pub struct ReplacementSuggestion {
    pub replacement: Instance,
    /// False when the replacement equals the current promotion: nothing
    /// further to do.
    pub action_required: bool,
    /// Human-readable search trail for the recovery audit.
    pub notes: Vec<String>,
}

/// Inputs for [`suggest_replacement_for_promoted_replica`]; all snapshots
/// are read by the caller.
pub struct ReplacementSearch<'a> {
    pub config: &'a RecoveryConfig,
    pub analysis: &'a ReplicationAnalysis,
    pub promoted: &'a Instance,
    /// The dead master's last-known snapshot, when readable.
    pub dead_instance: Option<&'a Instance>,
    /// Operator-supplied candidate, already resolved to a snapshot.
    pub supplied_candidate: Option<&'a Instance>,
    /// Cluster instances marked as candidates, dead instance excluded.
    pub candidate_replicas: &'a [Instance],
    /// Cluster instances with neutral promotion rules.
    pub neutral_replicas: &'a [Instance],
}

/// Given a just-promoted replica, decide whether a better candidate
/// should take over. Mirrors the tiered search of the promotion policy:
/// candidates in the dead master's locality first, then the promotion
/// itself if acceptable, then candidates near the promotion, then
/// geographically acceptable candidates; neutral replicas are considered
/// only when the promotion violates geography or carries a
/// prefer-not-promote rule. Within a tier, every matching candidate
/// overwrites the previous one, so the last match in list order wins.
pub fn suggest_replacement_for_promoted_replica(
    search: &ReplacementSearch<'_>,
) -> ReplacementSuggestion {
    let mut notes: Vec<String> = Vec::new();
    let promoted = search.promoted;
    let mut chosen: Option<&Instance> = search.supplied_candidate;

    let same_locality = |a: &Instance, b: &Instance| {
        a.data_center == b.data_center && a.physical_environment == b.physical_environment
    };

    if chosen.is_none() {
        // Did we already promote a marked candidate in the dead master's
        // locality? Then we're done.
        if let Some(dead) = search.dead_instance {
            let promoted_is_marked = search
                .candidate_replicas
                .iter()
                .any(|c| c.key == promoted.key);
            if promoted_is_marked && same_locality(promoted, dead) {
                notes.push(format!("promoted replica {} is the ideal candidate", promoted.key));
                return ReplacementSuggestion {
                    replacement: promoted.clone(),
                    action_required: false,
                    notes,
                };
            }
        }
    }

    if chosen.is_none() {
        // A candidate in the dead master's locality that can take over.
        // Later list entries overwrite earlier ones.
        if let Some(dead) = search.dead_instance {
            for candidate in search.candidate_replicas {
                if can_take_over_promoted_server(candidate, promoted)
                    && same_locality(candidate, dead)
                {
                    notes.push(format!(
                        "picking {} as replacement, based on being in same DC and environment as failed instance",
                        candidate.key
                    ));
                    chosen = Some(candidate);
                }
            }
        }
    }

    if chosen.is_none() {
        // The promotion is a marked candidate somewhere else; acceptable
        // as long as geography allows.
        if search
            .candidate_replicas
            .iter()
            .any(|c| c.key == promoted.key)
        {
            match geographic_constraint_violation(search.config, search.analysis, promoted) {
                None => {
                    notes.push(format!("promoted replica {} is a good candidate", promoted.key));
                    return ReplacementSuggestion {
                        replacement: promoted.clone(),
                        action_required: false,
                        notes,
                    };
                }
                Some(reason) => notes.push(format!("skipping {}; {}", promoted.key, reason)),
            }
        }
    }

    if chosen.is_none() {
        // A candidate in the promoted server's locality.
        for candidate in search.candidate_replicas {
            if can_take_over_promoted_server(candidate, promoted)
                && same_locality(candidate, promoted)
            {
                notes.push(format!(
                    "picking {} as replacement, based on being in same DC and environment as promoted instance",
                    candidate.key
                ));
                chosen = Some(candidate);
            }
        }
    }

    if chosen.is_none() {
        // Any geographically acceptable candidate.
        for candidate in search.candidate_replicas {
            if !can_take_over_promoted_server(candidate, promoted) {
                continue;
            }
            match geographic_constraint_violation(search.config, search.analysis, candidate) {
                None => {
                    notes.push(format!("picking {} as candidate replacement", candidate.key));
                    chosen = Some(candidate);
                }
                Some(reason) => notes.push(format!("skipping {}; {}", candidate.key, reason)),
            }
        }
    }

    // Neutral servers only enter the picture when sticking with the
    // promotion would be actively bad.
    let keep_searching =
        match geographic_constraint_violation(search.config, search.analysis, promoted) {
            Some(reason) => {
                notes.push(format!("will keep searching; {}", reason));
                true
            }
            None if promoted.promotion_rule == PromotionRule::PreferNotPromote => {
                notes.push(format!(
                    "will keep searching; promoted server {} has prefer_not rule",
                    promoted.key
                ));
                true
            }
            None => false,
        };

    if keep_searching {
        if chosen.is_none() {
            if let Some(dead) = search.dead_instance {
                for neutral in search.neutral_replicas {
                    if can_take_over_promoted_server(neutral, promoted)
                        && same_locality(neutral, dead)
                    {
                        notes.push(format!(
                            "picking neutral {} in same DC and environment as dead master",
                            neutral.key
                        ));
                        chosen = Some(neutral);
                    }
                }
            }
        }
        if chosen.is_none() {
            for neutral in search.neutral_replicas {
                if can_take_over_promoted_server(neutral, promoted)
                    && same_locality(neutral, promoted)
                {
                    notes.push(format!(
                        "picking neutral {} in same DC and environment as promoted instance",
                        neutral.key
                    ));
                    chosen = Some(neutral);
                }
            }
        }
        if chosen.is_none() {
            for neutral in search.neutral_replicas {
                if !can_take_over_promoted_server(neutral, promoted) {
                    continue;
                }
                match geographic_constraint_violation(search.config, search.analysis, neutral) {
                    None => {
                        notes.push(format!("picking neutral {} as replacement", neutral.key));
                        chosen = Some(neutral);
                    }
                    Some(reason) => notes.push(format!("skipping {}; {}", neutral.key, reason)),
                }
            }
        }
    }

    match chosen {
        None => {
            notes.push("found no server to promote on top of promoted replica".to_string());
            ReplacementSuggestion {
                replacement: promoted.clone(),
                action_required: false,
                notes,
            }
        }
        Some(candidate) if candidate.key == promoted.key => {
            notes.push("sanity check: the promoted server is the candidate itself".to_string());
            ReplacementSuggestion {
                replacement: promoted.clone(),
                action_required: false,
                notes,
            }
        }
        Some(candidate) => ReplacementSuggestion {
            replacement: candidate.clone(),
            action_required: true,
            notes,
        },
    }
}

/// Remove one key from an instance list.
pub fn remove_instance(instances: Vec<Instance>, key: &InstanceKey) -> Vec<Instance> {
    instances.into_iter().filter(|i| &i.key != key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BinlogCoordinates;

    fn key(host: &str) -> InstanceKey {
        InstanceKey::new(host, 3306)
    }

    fn healthy_replica(host: &str, master: &str) -> Instance {
        Instance {
            key: key(host),
            master_key: Some(key(master)),
            version: "8.0.32".into(),
            data_center: "dc1".into(),
            region: "eu".into(),
            physical_environment: "env1".into(),
            log_bin_enabled: true,
            log_replica_updates_enabled: true,
            is_last_check_valid: true,
            replication_io_running: true,
            replication_sql_running: true,
            exec_coordinates: BinlogCoordinates::new("bin.000010", 100),
            ..Default::default()
        }
    }

    #[test]
    fn test_generally_valid_as_would_be_master() {
        let replica = healthy_replica("r1", "m");
        assert!(is_generally_valid_as_would_be_master(&replica, true));

        let mut binlog_server = replica.clone();
        binlog_server.is_binlog_server = true;
        assert!(!is_generally_valid_as_would_be_master(&binlog_server, true));

        let mut banned = replica.clone();
        banned.promotion_rule = PromotionRule::MustNotPromote;
        assert!(!is_generally_valid_as_would_be_master(&banned, true));

        let mut no_lru = replica.clone();
        no_lru.log_replica_updates_enabled = false;
        assert!(!is_generally_valid_as_would_be_master(&no_lru, true));
        assert!(is_generally_valid_as_would_be_master(&no_lru, false));
    }

    #[test]
    fn test_sibling_validity_requires_matching_filters_and_coordinates() {
        let mut failed = healthy_replica("im", "m");
        failed.exec_coordinates = BinlogCoordinates::new("bin.000010", 500);
        let mut sibling = healthy_replica("s1", "m");
        sibling.exec_coordinates = BinlogCoordinates::new("bin.000010", 600);

        assert!(is_valid_sibling_of_intermediate_master(&failed, &sibling));
        // A sibling behind the failed node's exec coordinates is out.
        sibling.exec_coordinates = BinlogCoordinates::new("bin.000010", 400);
        assert!(!is_valid_sibling_of_intermediate_master(&failed, &sibling));
        // Filter mismatch is out.
        sibling.exec_coordinates = BinlogCoordinates::new("bin.000010", 600);
        sibling.has_replication_filters = true;
        assert!(!is_valid_sibling_of_intermediate_master(&failed, &sibling));
        // Never itself.
        assert!(!is_valid_sibling_of_intermediate_master(&failed, &failed.clone()));
    }

    #[test]
    fn test_geographic_constraint() {
        let mut config = RecoveryConfig::default();
        let analysis = ReplicationAnalysis {
            data_center: "dc1".into(),
            region: "eu".into(),
            ..Default::default()
        };
        let mut suggested = healthy_replica("r1", "m");
        suggested.data_center = "dc2".into();

        assert!(geographic_constraint_violation(&config, &analysis, &suggested).is_none());

        config.prevent_cross_data_center_master_failover = true;
        let reason = geographic_constraint_violation(&config, &analysis, &suggested).unwrap();
        assert!(reason.contains("PreventCrossDataCenterMasterFailover"));

        suggested.data_center = "dc1".into();
        suggested.region = "us".into();
        config.prevent_cross_region_master_failover = true;
        let reason = geographic_constraint_violation(&config, &analysis, &suggested).unwrap();
        assert!(reason.contains("PreventCrossRegionMasterFailover"));
    }

    #[test]
    fn test_sibling_ordering() {
        let mut a = healthy_replica("a", "m");
        a.count_replicas = 1;
        let mut b = healthy_replica("b", "m");
        b.count_replicas = 3;
        let mut c = healthy_replica("c", "m");
        c.count_replicas = 3;
        c.exec_coordinates = BinlogCoordinates::new("bin.000010", 999);

        let mut instances = vec![a, b, c];
        sort_by_count_replicas_descending(&mut instances);
        // c wins its tie with b on more advanced coordinates.
        assert_eq!(instances[0].key, key("c"));
        assert_eq!(instances[1].key, key("b"));
        assert_eq!(instances[2].key, key("a"));
    }

    #[test]
    fn test_choose_candidate_sibling_prefers_marked_same_locality() {
        let failed = healthy_replica("im", "m");
        let mut marked_far = healthy_replica("s1", "m");
        marked_far.is_candidate = true;
        marked_far.data_center = "dc2".into();
        let mut marked_near = healthy_replica("s2", "m");
        marked_near.is_candidate = true;
        let plain_near = healthy_replica("s3", "m");

        let siblings = vec![marked_far.clone(), marked_near.clone(), plain_near];
        let chosen = choose_candidate_sibling(&failed, &siblings).unwrap();
        assert_eq!(chosen.key, key("s2"));

        // Without the near marked candidate, the far one wins over the
        // plain same-locality sibling.
        let siblings = vec![marked_far, healthy_replica("s3", "m")];
        let chosen = choose_candidate_sibling(&failed, &siblings).unwrap();
        assert_eq!(chosen.key, key("s1"));
    }

    #[test]
    fn test_replacement_keeps_ideal_promotion() {
        let config = RecoveryConfig::default();
        let analysis = ReplicationAnalysis {
            data_center: "dc1".into(),
            ..Default::default()
        };
        let dead = healthy_replica("m", "nowhere");
        let promoted = healthy_replica("r1", "m");

        let suggestion = suggest_replacement_for_promoted_replica(&ReplacementSearch {
            config: &config,
            analysis: &analysis,
            promoted: &promoted,
            dead_instance: Some(&dead),
            supplied_candidate: None,
            candidate_replicas: &[promoted.clone()],
            neutral_replicas: &[],
        });
        assert!(!suggestion.action_required);
        assert_eq!(suggestion.replacement.key, promoted.key);
    }

    #[test]
    fn test_replacement_prefers_candidate_in_dead_locality() {
        let config = RecoveryConfig::default();
        let analysis = ReplicationAnalysis {
            data_center: "dc1".into(),
            ..Default::default()
        };
        let mut dead = healthy_replica("m", "nowhere");
        dead.data_center = "dc1".into();
        let mut promoted = healthy_replica("r1", "m");
        promoted.data_center = "dc2".into();
        // A marked candidate replicating from the promoted server, in the
        // dead master's DC.
        let mut candidate = healthy_replica("r2", "r1");
        candidate.is_candidate = true;

        let suggestion = suggest_replacement_for_promoted_replica(&ReplacementSearch {
            config: &config,
            analysis: &analysis,
            promoted: &promoted,
            dead_instance: Some(&dead),
            supplied_candidate: None,
            candidate_replicas: &[candidate.clone()],
            neutral_replicas: &[],
        });
        assert!(suggestion.action_required);
        assert_eq!(suggestion.replacement.key, key("r2"));
    }

    #[test]
    fn test_replacement_last_matching_candidate_wins() {
        let config = RecoveryConfig::default();
        let analysis = ReplicationAnalysis {
            data_center: "dc1".into(),
            ..Default::default()
        };
        let mut dead = healthy_replica("m", "nowhere");
        dead.data_center = "dc1".into();
        let mut promoted = healthy_replica("r1", "m");
        promoted.data_center = "dc2".into();
        // Two marked candidates in the dead master's locality, both able
        // to take over the promoted server.
        let mut first = healthy_replica("r2", "r1");
        first.is_candidate = true;
        let mut second = healthy_replica("r3", "r1");
        second.is_candidate = true;

        let suggestion = suggest_replacement_for_promoted_replica(&ReplacementSearch {
            config: &config,
            analysis: &analysis,
            promoted: &promoted,
            dead_instance: Some(&dead),
            supplied_candidate: None,
            candidate_replicas: &[first, second],
            neutral_replicas: &[],
        });
        assert!(suggestion.action_required);
        assert_eq!(suggestion.replacement.key, key("r3"));
    }

    #[test]
    fn test_replacement_scans_neutrals_for_prefer_not() {
        let config = RecoveryConfig::default();
        let analysis = ReplicationAnalysis::default();
        let mut promoted = healthy_replica("r1", "m");
        promoted.promotion_rule = PromotionRule::PreferNotPromote;
        let neutral = healthy_replica("r2", "r1");

        let suggestion = suggest_replacement_for_promoted_replica(&ReplacementSearch {
            config: &config,
            analysis: &analysis,
            promoted: &promoted,
            dead_instance: None,
            supplied_candidate: None,
            candidate_replicas: &[],
            neutral_replicas: &[neutral],
        });
        assert!(suggestion.action_required);
        assert_eq!(suggestion.replacement.key, key("r2"));
    }

    #[test]
    fn test_replacement_defaults_to_promotion() {
        let config = RecoveryConfig::default();
        let analysis = ReplicationAnalysis::default();
        let promoted = healthy_replica("r1", "m");

        let suggestion = suggest_replacement_for_promoted_replica(&ReplacementSearch {
            config: &config,
            analysis: &analysis,
            promoted: &promoted,
            dead_instance: None,
            supplied_candidate: None,
            candidate_replicas: &[],
            neutral_replicas: &[],
        });
        assert!(!suggestion.action_required);
        assert_eq!(suggestion.replacement.key, promoted.key);
    }
}
