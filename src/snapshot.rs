use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::evaluation::{Flag, Rollout, Segment, ROLLOUT_TOTAL};

/// Immutable, versioned bundle of all flag and segment definitions for one
/// project + environment. Replaced wholesale on refresh; never patched.
/// `version` is monotonically non-decreasing per environment, and consumers
/// detect change only via version inequality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    pub meta: SnapshotMeta,
    pub flags: HashMap<String, Flag>,
    pub segments: HashMap<String, Segment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub project_id: String,
    pub organization_id: String,
    pub environment_id: String,
    pub environment_slug: String,
}

impl Snapshot {
    /// Canonical KV key for this snapshot's environment.
    pub fn storage_key(&self) -> String {
        snapshot_key(
            &self.meta.organization_id,
            &self.meta.project_id,
            &self.meta.environment_slug,
        )
    }
}

pub fn snapshot_key(org_id: &str, project_id: &str, environment_slug: &str) -> String {
    format!("snapshot:{}:{}:{}", org_id, project_id, environment_slug)
}

pub fn api_key_key(api_key: &str) -> String {
    format!("apiKey:{}", api_key)
}

// Validating the flag key, applied when a snapshot document is published.
pub fn validate_flag_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Flag key cannot be empty".to_string());
    }

    if key.len() > 64 {
        return Err("Flag key is too long (Max: 64 characters)".to_string());
    }

    let first = key.chars().next().unwrap_or(' ');
    if !first.is_ascii_alphabetic() {
        return Err("Flag key must start with a letter".to_string());
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(
            "Flag key can only contain lowercase letters, numbers, underscores and hyphens"
                .to_string(),
        );
    }

    Ok(())
}

/// Reject malformed snapshot documents before they reach the KV store:
/// every flag key must be well-formed and every off/default variation
/// reference must resolve.
pub fn validate_snapshot(snapshot: &Snapshot) -> Result<(), String> {
    for (key, flag) in &snapshot.flags {
        validate_flag_key(key)?;
        if !flag.variations.contains_key(&flag.off_variation_key) {
            return Err(format!(
                "Flag '{}' references unknown off variation '{}'",
                key, flag.off_variation_key
            ));
        }
        if let Some(default_key) = &flag.default_variation_key {
            if !flag.variations.contains_key(default_key) {
                return Err(format!(
                    "Flag '{}' references unknown default variation '{}'",
                    key, default_key
                ));
            }
        }
        if let Some(rollout) = &flag.default_rollout {
            validate_rollout(key, flag, rollout)?;
        }
        for target in &flag.targets {
            if let Some(rollout) = &target.rollout {
                validate_rollout(key, flag, rollout)?;
            }
        }
    }
    Ok(())
}

fn validate_rollout(key: &str, flag: &Flag, rollout: &Rollout) -> Result<(), String> {
    if rollout.variations.is_empty() {
        return Err(format!("Flag '{}' has a rollout with no variations", key));
    }
    if rollout.total_weight() > u64::from(ROLLOUT_TOTAL) {
        return Err(format!(
            "Flag '{}' has a rollout whose weights exceed {}",
            key, ROLLOUT_TOTAL
        ));
    }
    for weighted in &rollout.variations {
        if !flag.variations.contains_key(&weighted.variation_key) {
            return Err(format!(
                "Flag '{}' rollout references unknown variation '{}'",
                key, weighted.variation_key
            ));
        }
    }
    Ok(())
}
