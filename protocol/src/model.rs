//! Validated payload schemas for the three object scopes.
//!
//! Each type plays the role the spec calls an "opaque normalizer":
//! `validate(raw) -> normalized or error`. We model that here as
//! [`Schema::normalize`], which deserializes a loose [`serde_json::Value`],
//! checks numeric ranges a plain `#[derive(Deserialize)]` can't express, and
//! re-serializes the result so defaults are filled in and unknown fields are
//! dropped (forward compatibility, per spec.md §9).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A validation failure for one object's normalized payload.
///
/// `missing_fields` is populated only when required fields were absent from
/// the input (the case the broadcast engine treats specially for patches
/// with no baseline); `message` is a human-readable description for logs.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub missing_fields: Vec<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

fn missing_required(raw: &Value, required: &[&str]) -> Vec<String> {
    let obj = raw.as_object();
    required
        .iter()
        .filter(|field| !obj.is_some_and(|o| o.contains_key(**field)))
        .map(|field| field.to_string())
        .collect()
}

/// A schema for one of the three object scopes (player, entity, waypoint).
pub trait Schema: Sized + Serialize + for<'de> Deserialize<'de> {
    /// Field names that must be present before attempting to deserialize.
    const REQUIRED_FIELDS: &'static [&'static str];

    /// Range/shape checks a derive can't express (e.g. `width > 0`).
    fn validate_ranges(&self) -> Result<(), String>;

    /// Validate a raw JSON object, returning the normalized form (defaults
    /// filled, unknown fields dropped) or a [`ValidationError`].
    fn normalize(raw: &Value) -> Result<Value, ValidationError> {
        let missing = missing_required(raw, Self::REQUIRED_FIELDS);
        if !missing.is_empty() {
            return Err(ValidationError {
                missing_fields: missing,
                message: "missing required fields".to_string(),
            });
        }

        let parsed: Self = serde_json::from_value(raw.clone()).map_err(|e| ValidationError {
            missing_fields: Vec::new(),
            message: e.to_string(),
        })?;
        parsed.validate_ranges().map_err(|message| ValidationError {
            missing_fields: Vec::new(),
            message,
        })?;
        Ok(serde_json::to_value(&parsed).expect("schema types always serialize"))
    }

    /// Merge a patch object on top of an existing normalized object (or
    /// nothing, if this is the first report for that source) and validate
    /// the result. Used by the `*_patch` ingest handlers.
    fn merge_and_normalize(
        existing: Option<&Value>,
        patch: &Value,
    ) -> Result<Value, ValidationError> {
        let mut merged: serde_json::Map<String, Value> = existing
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(patch_obj) = patch.as_object() {
            for (key, value) in patch_obj {
                merged.insert(key.clone(), value.clone());
            }
        }
        Self::normalize(&Value::Object(merged))
    }
}

fn default_zero() -> f64 {
    0.0
}

fn default_max_health() -> f64 {
    20.0
}

fn default_width() -> f64 {
    0.6
}

fn default_height() -> f64 {
    1.8
}

fn default_waypoint_symbol() -> Option<String> {
    Some("W".to_string())
}

fn default_waypoint_color() -> i64 {
    5_635_925
}

/// A player's position, velocity and display/combat metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerData {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default = "default_zero")]
    pub vx: f64,
    #[serde(default = "default_zero")]
    pub vy: f64,
    #[serde(default = "default_zero")]
    pub vz: f64,
    pub dimension: String,
    #[serde(rename = "playerName", default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    #[serde(rename = "playerUUID", default, skip_serializing_if = "Option::is_none")]
    pub player_uuid: Option<String>,
    #[serde(default = "default_zero")]
    pub health: f64,
    #[serde(rename = "maxHealth", default = "default_max_health")]
    pub max_health: f64,
    #[serde(default = "default_zero")]
    pub armor: f64,
    #[serde(default = "default_width")]
    pub width: f64,
    #[serde(default = "default_height")]
    pub height: f64,
}

impl Schema for PlayerData {
    const REQUIRED_FIELDS: &'static [&'static str] = &["x", "y", "z", "dimension"];

    fn validate_ranges(&self) -> Result<(), String> {
        if self.health < 0.0 {
            return Err("health must be >= 0".to_string());
        }
        if self.max_health < 0.0 {
            return Err("maxHealth must be >= 0".to_string());
        }
        if self.armor < 0.0 {
            return Err("armor must be >= 0".to_string());
        }
        if self.width <= 0.0 {
            return Err("width must be > 0".to_string());
        }
        if self.height <= 0.0 {
            return Err("height must be > 0".to_string());
        }
        Ok(())
    }
}

/// A non-player entity's position, velocity and display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default = "default_zero")]
    pub vx: f64,
    #[serde(default = "default_zero")]
    pub vy: f64,
    #[serde(default = "default_zero")]
    pub vz: f64,
    pub dimension: String,
    #[serde(rename = "entityType", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(rename = "entityName", default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    #[serde(default = "default_width")]
    pub width: f64,
    #[serde(default = "default_height")]
    pub height: f64,
}

impl Schema for EntityData {
    const REQUIRED_FIELDS: &'static [&'static str] = &["x", "y", "z", "dimension"];

    fn validate_ranges(&self) -> Result<(), String> {
        if self.width < 0.0 {
            return Err("width must be >= 0".to_string());
        }
        if self.height < 0.0 {
            return Err("height must be >= 0".to_string());
        }
        Ok(())
    }
}

/// A user-defined waypoint, possibly tied to a tracked entity or with a TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointData {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub dimension: String,
    pub name: String,
    #[serde(default = "default_waypoint_symbol")]
    pub symbol: Option<String>,
    #[serde(default = "default_waypoint_color")]
    pub color: i64,
    #[serde(rename = "ownerId", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(rename = "ownerName", default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(rename = "ttlSeconds", default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    #[serde(rename = "waypointKind", default, skip_serializing_if = "Option::is_none")]
    pub waypoint_kind: Option<String>,
    #[serde(rename = "replaceOldQuick", default, skip_serializing_if = "Option::is_none")]
    pub replace_old_quick: Option<bool>,
    #[serde(rename = "maxQuickMarks", default, skip_serializing_if = "Option::is_none")]
    pub max_quick_marks: Option<i64>,
    #[serde(rename = "targetType", default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(rename = "targetEntityId", default, skip_serializing_if = "Option::is_none")]
    pub target_entity_id: Option<String>,
    #[serde(rename = "targetEntityType", default, skip_serializing_if = "Option::is_none")]
    pub target_entity_type: Option<String>,
    #[serde(rename = "targetEntityName", default, skip_serializing_if = "Option::is_none")]
    pub target_entity_name: Option<String>,
}

impl Schema for WaypointData {
    const REQUIRED_FIELDS: &'static [&'static str] = &["x", "y", "z", "dimension", "name"];

    fn validate_ranges(&self) -> Result<(), String> {
        if let Some(ttl) = self.ttl_seconds {
            if !(5..=86400).contains(&ttl) {
                return Err("ttlSeconds must be within [5, 86400]".to_string());
            }
        }
        if let Some(cap) = self.max_quick_marks {
            if !(1..=100).contains(&cap) {
                return Err("maxQuickMarks must be within [1, 100]".to_string());
            }
        }
        Ok(())
    }
}

/// The admin overlay assigned to a player id: team, color, optional label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMark {
    pub team: Team,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

/// Team affiliation an admin can paint onto a player id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Friendly,
    Enemy,
    Neutral,
}

impl Team {
    /// Normalizes a loosely-typed team name the way the admin channel accepts
    /// synonyms (`"ally"`, `"hostile"`, `"gray"`, ...).
    pub fn normalize(raw: Option<&str>) -> Team {
        match raw.unwrap_or("").trim().to_ascii_lowercase().as_str() {
            "friendly" | "friend" | "ally" | "blue" => Team::Friendly,
            "enemy" | "hostile" | "red" => Team::Enemy,
            _ => Team::Neutral,
        }
    }

    /// The default color used when the admin didn't supply (or supplied an
    /// invalid) `color` value.
    pub fn default_color(self) -> &'static str {
        match self {
            Team::Friendly => "#3b82f6",
            Team::Enemy => "#ef4444",
            Team::Neutral => "#94a3b8",
        }
    }
}

/// Normalizes an admin-supplied `"#rrggbb"` (or `"rrggbb"`) color string.
/// Returns `None` if the text is not six valid hex digits.
pub fn normalize_mark_color(raw: Option<&str>) -> Option<String> {
    let text = raw?.trim();
    let text = text.strip_prefix('#').unwrap_or(text);
    if text.len() != 6 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("#{}", text.to_ascii_lowercase()))
}

/// One source's reported set of player identities, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabPlayerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "prefixedName", default, skip_serializing_if = "Option::is_none")]
    pub prefixed_name: Option<String>,
}

/// Normalizes one reported identity into the canonical keys used for
/// same-server grouping: `"uuid:<lower>"` and/or `"name:<lower>"`, capped to
/// a sane length so a hostile client can't blow up memory with huge strings.
pub fn identity_keys(entry: &TabPlayerEntry) -> Vec<String> {
    const MAX_LEN: usize = 64;
    let mut keys = Vec::new();
    if let Some(uuid) = entry.uuid.as_deref() {
        let trimmed = uuid.trim().to_ascii_lowercase();
        if !trimmed.is_empty() {
            keys.push(format!("uuid:{}", truncate(&trimmed, MAX_LEN)));
        }
    }
    let name = entry
        .display_name
        .as_deref()
        .or(entry.prefixed_name.as_deref())
        .or(entry.name.as_deref());
    if let Some(name) = name {
        let trimmed = name.trim().to_ascii_lowercase();
        if !trimmed.is_empty() {
            keys.push(format!("name:{}", truncate(&trimmed, MAX_LEN)));
        }
    }
    keys
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// A compact `id -> data` map, the shape used by `snapshot_full`/`patch`.
pub type CompactMap = HashMap<String, Value>;
