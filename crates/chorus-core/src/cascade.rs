//! Layered configuration cascade.
//!
//! Effective generation parameters for a (user, personality, channel) triple
//! are merged from sparse override layers, most general first:
//!
//! `system` → `personality` → `user` → `channel` → `user_personality`
//!
//! Each field of a layer is an [`Override`]: a key that is absent inherits,
//! an explicit `null` clears the inherited value, anything else sets it.
//! Layers are re-sorted by tier before merging, so the argument order never
//! matters.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::error::CoreError;

// ── Tiers ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    System,
    Personality,
    User,
    Channel,
    UserPersonality,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::System => write!(f, "system"),
            Tier::Personality => write!(f, "personality"),
            Tier::User => write!(f, "user"),
            Tier::Channel => write!(f, "channel"),
            Tier::UserPersonality => write!(f, "user_personality"),
        }
    }
}

// ── Tri-state field ──

/// One field of a sparse config layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Override<T> {
    /// Key not present; the less specific tier's value stands.
    #[default]
    Inherit,
    /// Explicit `null`; reset to the built-in default.
    Clear,
    Set(T),
}

impl<T> Override<T> {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Override::Inherit)
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Override::Set(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: Serialize> Serialize for Override<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Skipped by `skip_serializing_if`; null if serialized directly.
            Override::Inherit | Override::Clear => serializer.serialize_none(),
            Override::Set(v) => serializer.serialize_some(v),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Override<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Only called when the key is present; absence is handled by `default`.
        Ok(match Option::<T>::deserialize(deserializer)? {
            None => Override::Clear,
            Some(v) => Override::Set(v),
        })
    }
}

// ── Layers ──

/// Sparse config object for one tier. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub model: Override<String>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub vision_model: Override<String>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub temperature: Override<f32>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub top_p: Override<f32>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub max_tokens: Override<u32>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub max_messages: Override<u32>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub max_age_secs: Override<u64>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub max_images: Override<u32>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub memory_limit: Override<u32>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub memory_score_threshold: Override<f32>,
    /// on / off; `null` means auto.
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub extended_context: Override<bool>,
    #[serde(skip_serializing_if = "Override::is_inherit")]
    pub show_thinking: Override<bool>,
}

impl PartialConfig {
    /// Reject values no tier may carry.
    fn validate(&self) -> Result<(), String> {
        if let Some(m) = self.model.as_set() {
            if m.trim().is_empty() {
                return Err("model must not be empty".into());
            }
        }
        if let Some(t) = self.temperature.as_set() {
            if !(0.0..=2.0).contains(t) {
                return Err(format!("temperature {} outside 0..=2", t));
            }
        }
        if let Some(p) = self.top_p.as_set() {
            if !(*p > 0.0 && *p <= 1.0) {
                return Err(format!("top_p {} outside (0, 1]", p));
            }
        }
        if self.max_tokens.as_set() == Some(&0) {
            return Err("max_tokens must be positive".into());
        }
        if self.max_messages.as_set() == Some(&0) {
            return Err("max_messages must be positive".into());
        }
        if let Some(s) = self.memory_score_threshold.as_set() {
            if !(0.0..=1.0).contains(s) {
                return Err(format!("memory_score_threshold {} outside 0..=1", s));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayer {
    pub tier: Tier,
    #[serde(default)]
    pub values: PartialConfig,
}

impl ConfigLayer {
    pub fn new(tier: Tier, values: PartialConfig) -> Self {
        Self { tier, values }
    }

    /// Parse a layer's values from a JSON object, as stored in a config row.
    pub fn from_json(tier: Tier, values: serde_json::Value) -> Result<Self, CoreError> {
        let values = serde_json::from_value(values).map_err(|e| CoreError::ConfigConflict {
            tier,
            reason: e.to_string(),
        })?;
        Ok(Self { tier, values })
    }
}

// ── Effective config ──

const DEFAULT_MAX_MESSAGES: u32 = 50;
const DEFAULT_MAX_IMAGES: u32 = 10;
const DEFAULT_MEMORY_LIMIT: u32 = 10;
const DEFAULT_MEMORY_SCORE_THRESHOLD: f32 = 0.75;

/// Materialized config for one (user, personality, channel) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    /// None falls back to the node's default model.
    pub model: Option<String>,
    pub vision_model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_messages: u32,
    /// None means no age limit on history.
    pub max_age_secs: Option<u64>,
    pub max_images: u32,
    pub memory_limit: u32,
    pub memory_score_threshold: f32,
    /// None means auto.
    pub extended_context: Option<bool>,
    pub show_thinking: bool,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            model: None,
            vision_model: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_age_secs: None,
            max_images: DEFAULT_MAX_IMAGES,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            memory_score_threshold: DEFAULT_MEMORY_SCORE_THRESHOLD,
            extended_context: None,
            show_thinking: false,
        }
    }
}

fn merge_optional<T: Clone>(slot: &mut Option<T>, field: &Override<T>) {
    match field {
        Override::Inherit => {}
        Override::Clear => *slot = None,
        Override::Set(v) => *slot = Some(v.clone()),
    }
}

fn merge_required<T: Clone>(slot: &mut T, field: &Override<T>, default: T) {
    match field {
        Override::Inherit => {}
        Override::Clear => *slot = default,
        Override::Set(v) => *slot = v.clone(),
    }
}

impl EffectiveConfig {
    fn apply(&mut self, layer: &PartialConfig) {
        merge_optional(&mut self.model, &layer.model);
        merge_optional(&mut self.vision_model, &layer.vision_model);
        merge_optional(&mut self.temperature, &layer.temperature);
        merge_optional(&mut self.top_p, &layer.top_p);
        merge_optional(&mut self.max_tokens, &layer.max_tokens);
        merge_required(&mut self.max_messages, &layer.max_messages, DEFAULT_MAX_MESSAGES);
        merge_optional(&mut self.max_age_secs, &layer.max_age_secs);
        merge_required(&mut self.max_images, &layer.max_images, DEFAULT_MAX_IMAGES);
        merge_required(&mut self.memory_limit, &layer.memory_limit, DEFAULT_MEMORY_LIMIT);
        merge_required(
            &mut self.memory_score_threshold,
            &layer.memory_score_threshold,
            DEFAULT_MEMORY_SCORE_THRESHOLD,
        );
        merge_optional(&mut self.extended_context, &layer.extended_context);
        merge_required(&mut self.show_thinking, &layer.show_thinking, false);
    }
}

// ── Resolver ──

/// Output of [`resolve`]: the merged config plus any layers that were
/// skipped as conflicting.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub config: EffectiveConfig,
    pub rejected: Vec<CoreError>,
}

/// Merge `layers` into one effective config.
///
/// Invalid layers, and tiers supplied more than once with differing content,
/// are skipped; resolution continues with the remaining, less specific tiers.
pub fn resolve(layers: &[ConfigLayer]) -> Resolution {
    let mut by_tier: BTreeMap<Tier, Vec<&PartialConfig>> = BTreeMap::new();
    for layer in layers {
        by_tier.entry(layer.tier).or_default().push(&layer.values);
    }

    let mut config = EffectiveConfig::default();
    let mut rejected = Vec::new();

    for (tier, candidates) in by_tier {
        let first = candidates[0];
        if candidates.iter().any(|c| *c != first) {
            warn!(%tier, count = candidates.len(), "conflicting layers for tier, skipping");
            rejected.push(CoreError::ConfigConflict {
                tier,
                reason: format!("{} differing layers supplied", candidates.len()),
            });
            continue;
        }
        if let Err(reason) = first.validate() {
            warn!(%tier, %reason, "invalid config layer, skipping");
            rejected.push(CoreError::ConfigConflict { tier, reason });
            continue;
        }
        config.apply(first);
    }

    Resolution { config, rejected }
}
