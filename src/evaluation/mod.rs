use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Rollout weights are fixed-point: one unit is 0.001%, so a full
/// distribution sums to 100_000.
pub const ROLLOUT_TOTAL: u32 = 100_000;

// Evaluation context: attributes grouped by context kind,
// e.g. {"user": {"plan": "pro"}, "device": {"os": "ios"}}
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext(pub HashMap<String, HashMap<String, Value>>);

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute insertion under a context kind.
    pub fn with(mut self, kind: &str, key: &str, value: Value) -> Self {
        self.0
            .entry(kind.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self
    }

    pub fn attribute(&self, kind: &str, key: &str) -> Option<&Value> {
        self.0.get(kind).and_then(|attrs| attrs.get(key))
    }

    /// Resolve an attribute that names no context kind: the "user" kind is
    /// consulted first, then the remaining kinds in lexicographic order.
    pub fn resolve(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.attribute("user", key) {
            return Some(value);
        }
        let mut kinds: Vec<&String> = self.0.keys().filter(|k| k.as_str() != "user").collect();
        kinds.sort();
        for kind in kinds {
            if let Some(value) = self.0.get(kind).and_then(|attrs| attrs.get(key)) {
                return Some(value);
            }
        }
        None
    }

    /// Shallow merge keyed by context kind; overlay wins per attribute.
    pub fn merge(&self, overlay: &EvaluationContext) -> EvaluationContext {
        let mut merged = self.0.clone();
        for (kind, attrs) in &overlay.0 {
            let entry = merged.entry(kind.clone()).or_default();
            for (key, value) in attrs {
                entry.insert(key.clone(), value.clone());
            }
        }
        EvaluationContext(merged)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.0.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Attribute key names only, never values. Telemetry depends on this.
    pub fn attribute_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .0
            .values()
            .flat_map(|attrs| attrs.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.values().all(|attrs| attrs.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Boolean,
    String,
    Number,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub enabled: bool,
    pub variations: HashMap<String, Variation>,
    pub off_variation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_variation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rollout: Option<Rollout>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// One targeting rule. The match predicate is the tagged `kind`; the
/// outcome is either a fixed `variation_key` or a weighted `rollout`.
/// Lower `sort_order` is evaluated first and the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(flatten)]
    pub kind: TargetKind,
    pub sort_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetKind {
    #[serde(rename_all = "camelCase")]
    Individual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_kind: Option<String>,
        attribute_key: String,
        attribute_value: Value,
    },
    Rule {
        conditions: Vec<Condition>,
    },
    #[serde(rename_all = "camelCase")]
    Segment { segment_key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub attribute_key: String,
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    In,
    NotIn,
    Exists,
    NotExists,
    /// Operators this build does not know about fail closed.
    #[serde(other)]
    Unknown,
}

impl Operator {
    /// Evaluate one condition operand pair. `actual` is the context-side
    /// value (`None` when the attribute is missing); `expected` comes from
    /// the flag definition. Positive operators fail closed on a missing or
    /// type-mismatched operand, negated operators fail open.
    pub fn evaluate(&self, actual: Option<&Value>, expected: &Value) -> bool {
        // Both a missing key and an explicit null count as absent.
        let present = matches!(actual, Some(v) if !v.is_null());
        match self {
            Operator::Exists => present,
            Operator::NotExists => !present,
            Operator::Equals => actual.is_some_and(|a| a == expected),
            Operator::NotEquals => actual.map_or(true, |a| a != expected),
            Operator::Contains => actual.is_some_and(|a| value_contains(a, expected)),
            Operator::NotContains => actual.map_or(true, |a| !value_contains(a, expected)),
            Operator::StartsWith => {
                string_pair(actual, expected).is_some_and(|(a, e)| a.starts_with(e))
            }
            Operator::EndsWith => {
                string_pair(actual, expected).is_some_and(|(a, e)| a.ends_with(e))
            }
            Operator::GreaterThan => numeric_pair(actual, expected).is_some_and(|(a, e)| a > e),
            Operator::LessThan => numeric_pair(actual, expected).is_some_and(|(a, e)| a < e),
            Operator::GreaterThanOrEqual => {
                numeric_pair(actual, expected).is_some_and(|(a, e)| a >= e)
            }
            Operator::LessThanOrEqual => {
                numeric_pair(actual, expected).is_some_and(|(a, e)| a <= e)
            }
            Operator::In => expected
                .as_array()
                .is_some_and(|list| actual.is_some_and(|a| list.contains(a))),
            Operator::NotIn => expected
                .as_array()
                .map_or(true, |list| actual.map_or(true, |a| !list.contains(a))),
            Operator::Unknown => false,
        }
    }
}

fn value_contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => expected
            .as_str()
            .is_some_and(|needle| haystack.contains(needle)),
        Value::Array(list) => list.contains(expected),
        _ => false,
    }
}

fn string_pair<'a>(actual: Option<&'a Value>, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((actual?.as_str()?, expected.as_str()?))
}

fn numeric_pair(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((actual?.as_f64()?, expected.as_f64()?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub key: String,
    pub conditions: Vec<Condition>,
}

/// Weighted variation distribution. Selection hashes the bucketing
/// attribute's value with the seed, so identical inputs bucket identically
/// on every runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<String>,
    pub bucket_attribute_key: String,
    pub seed: String,
    pub variations: Vec<WeightedVariation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation_key: String,
    pub weight: u32,
}

impl Rollout {
    /// Pick a variation key for the given context. Deterministic: sha256 of
    /// `seed:value`, first 8 bytes reduced modulo [`ROLLOUT_TOTAL`]. A
    /// missing bucket attribute hashes the empty string so anonymous
    /// contexts still bucket consistently.
    pub fn pick(&self, context: &EvaluationContext) -> Option<&str> {
        let kind = self.context_kind.as_deref().unwrap_or("user");
        let raw = context.attribute(kind, &self.bucket_attribute_key);
        let value = match raw {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let point = bucket(&self.seed, &value);

        let mut cumulative: u64 = 0;
        for weighted in &self.variations {
            cumulative += u64::from(weighted.weight);
            if u64::from(point) < cumulative {
                return Some(&weighted.variation_key);
            }
        }
        // Under-weighted distributions spill into the last variation so the
        // rollout stays total.
        self.variations.last().map(|w| w.variation_key.as_str())
    }

    pub fn total_weight(&self) -> u64 {
        self.variations.iter().map(|w| u64::from(w.weight)).sum()
    }
}

fn bucket(seed: &str, value: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(ROLLOUT_TOTAL)) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    FlagDisabled,
    TargetMatch,
    DefaultVariation,
    FlagNotFound,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_key: Option<String>,
    pub reason: Reason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_target_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Evaluate one flag against a context and segment table.
///
/// Pure and deterministic: identical `(flag, context, segments)` always
/// produce identical output, on any runtime. This is the contract the
/// snapshot distribution layer exists to preserve.
pub fn evaluate(
    flag: &Flag,
    context: &EvaluationContext,
    segments: &HashMap<String, Segment>,
) -> EvaluationDetail {
    // Step 1: disabled flags bypass targeting entirely.
    if !flag.enabled {
        return variation_detail(flag, &flag.off_variation_key, Reason::FlagDisabled, None);
    }

    // Step 2: walk targets by ascending sort order, first match wins.
    let mut targets: Vec<&Target> = flag.targets.iter().collect();
    targets.sort_by_key(|t| t.sort_order);

    for target in targets {
        if !target_matches(target, context, segments) {
            continue;
        }
        let name = target.name.clone();
        if let Some(rollout) = &target.rollout {
            return rollout_detail(flag, rollout, context, Reason::TargetMatch, name);
        }
        if let Some(key) = &target.variation_key {
            return variation_detail(flag, key, Reason::TargetMatch, name);
        }
        return EvaluationDetail {
            value: Value::Null,
            variation_key: None,
            reason: Reason::Error,
            matched_target_name: name,
            error_detail: Some("target carries neither a variation key nor a rollout".to_string()),
        };
    }

    // Step 3: nothing matched, fall back to the default variation.
    if let Some(key) = &flag.default_variation_key {
        return variation_detail(flag, key, Reason::DefaultVariation, None);
    }
    if let Some(rollout) = &flag.default_rollout {
        return rollout_detail(flag, rollout, context, Reason::DefaultVariation, None);
    }
    EvaluationDetail {
        value: Value::Null,
        variation_key: None,
        reason: Reason::DefaultVariation,
        matched_target_name: None,
        error_detail: Some("flag defines no default variation".to_string()),
    }
}

/// Value-only convenience wrapper around [`evaluate`].
pub fn evaluate_value(
    flag: &Flag,
    context: &EvaluationContext,
    segments: &HashMap<String, Segment>,
) -> Value {
    evaluate(flag, context, segments).value
}

fn target_matches(
    target: &Target,
    context: &EvaluationContext,
    segments: &HashMap<String, Segment>,
) -> bool {
    match &target.kind {
        TargetKind::Individual {
            context_kind,
            attribute_key,
            attribute_value,
        } => {
            let kind = context_kind.as_deref().unwrap_or("user");
            context
                .attribute(kind, attribute_key)
                .is_some_and(|v| v == attribute_value)
        }
        // An empty condition list matches vacuously; intentional catch-all.
        TargetKind::Rule { conditions } => conditions_match(conditions, context),
        // A reference to a segment that is not in the table never matches;
        // evaluation falls through to the next target.
        TargetKind::Segment { segment_key } => segments
            .get(segment_key)
            .is_some_and(|segment| conditions_match(&segment.conditions, context)),
    }
}

fn conditions_match(conditions: &[Condition], context: &EvaluationContext) -> bool {
    conditions
        .iter()
        .all(|c| c.operator.evaluate(context.resolve(&c.attribute_key), &c.value))
}

fn variation_detail(
    flag: &Flag,
    variation_key: &str,
    reason: Reason,
    matched_target_name: Option<String>,
) -> EvaluationDetail {
    match flag.variations.get(variation_key) {
        Some(variation) => EvaluationDetail {
            value: variation.value.clone(),
            variation_key: Some(variation_key.to_string()),
            reason,
            matched_target_name,
            error_detail: None,
        },
        // Dangling variation reference: undefined result, never a panic.
        None => EvaluationDetail {
            value: Value::Null,
            variation_key: Some(variation_key.to_string()),
            reason,
            matched_target_name,
            error_detail: Some(format!("variation '{}' is not defined", variation_key)),
        },
    }
}

fn rollout_detail(
    flag: &Flag,
    rollout: &Rollout,
    context: &EvaluationContext,
    reason: Reason,
    matched_target_name: Option<String>,
) -> EvaluationDetail {
    match rollout.pick(context) {
        Some(key) => {
            let key = key.to_string();
            variation_detail(flag, &key, reason, matched_target_name)
        }
        None => EvaluationDetail {
            value: Value::Null,
            variation_key: None,
            reason,
            matched_target_name,
            error_detail: Some("rollout defines no variations".to_string()),
        },
    }
}
