//! Tunable knobs for the hub, read once from the environment at startup.
//!
//! Per spec.md §6: "Values out of range are clamped, not rejected." Each
//! `*_from_env` helper reads a variable, falls back to its default on a
//! missing/unparseable value, and clamps into range rather than failing
//! startup — a misconfigured deployment should run with sane behavior, not
//! refuse to boot.

use std::env;

fn env_f64(key: &str, default: f64, min: f64, max: f64) -> f64 {
    let raw = env::var(key).ok().and_then(|v| v.parse::<f64>().ok());
    raw.unwrap_or(default).clamp(min, max)
}

fn env_u64(key: &str, default: u64, min: u64, max: u64) -> u64 {
    let raw = env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
    raw.unwrap_or(default).clamp(min, max)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Clamps a waypoint's effective timeout the way the Timeout & Refresh
/// Manager does: a present `ttlSeconds` overrides the scope default, itself
/// clamped to `[5, 86400]`.
pub fn clamp_waypoint_ttl(ttl_seconds: i64) -> u64 {
    ttl_seconds.clamp(5, 86_400) as u64
}

/// Clamps a `maxQuickMarks`/`replaceOldQuick` request into `[1, 100]`.
pub fn clamp_quick_mark_cap(cap: i64) -> u64 {
    cap.clamp(1, 100) as u64
}

/// All env-configurable behavior of the hub, loaded once at startup.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub player_timeout_sec: f64,
    pub entity_timeout_sec: f64,
    pub waypoint_timeout_sec: f64,
    pub source_switch_threshold_sec: f64,
    pub digest_interval_sec: u64,
    pub refresh_req_cooldown_sec: f64,
    pub refresh_req_lead_sec: f64,
    pub tab_report_timeout_sec: f64,
    pub enable_same_server_filter: bool,
    pub max_items_per_scope: usize,
}

impl HubConfig {
    pub fn from_env() -> Self {
        HubConfig {
            player_timeout_sec: env_f64("PLAYER_TIMEOUT_SEC", 5.0, 5.0, 30.0),
            entity_timeout_sec: env_f64("ENTITY_TIMEOUT_SEC", 5.0, 5.0, 30.0),
            waypoint_timeout_sec: env_f64("WAYPOINT_TIMEOUT_SEC", 120.0, 60.0, 120.0),
            source_switch_threshold_sec: env_f64("SOURCE_SWITCH_THRESHOLD_SEC", 0.35, 0.0, 10.0),
            digest_interval_sec: env_u64("DIGEST_INTERVAL_SEC", 10, 1, 3600),
            refresh_req_cooldown_sec: env_f64("REFRESH_REQ_COOLDOWN_SEC", 1.5, 0.0, 60.0),
            refresh_req_lead_sec: env_f64("REFRESH_REQ_LEAD_SEC", 1.2, 0.0, 60.0),
            tab_report_timeout_sec: env_f64("TAB_REPORT_TIMEOUT_SEC", 45.0, 1.0, 600.0),
            enable_same_server_filter: env_bool("ENABLE_SAME_SERVER_FILTER", false),
            max_items_per_scope: 64,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            player_timeout_sec: 5.0,
            entity_timeout_sec: 5.0,
            waypoint_timeout_sec: 120.0,
            source_switch_threshold_sec: 0.35,
            digest_interval_sec: 10,
            refresh_req_cooldown_sec: 1.5,
            refresh_req_lead_sec: 1.2,
            tab_report_timeout_sec: 45.0,
            enable_same_server_filter: false,
            max_items_per_scope: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waypoint_ttl_clamps_to_range() {
        assert_eq!(clamp_waypoint_ttl(1), 5);
        assert_eq!(clamp_waypoint_ttl(999_999), 86_400);
        assert_eq!(clamp_waypoint_ttl(60), 60);
    }

    #[test]
    fn quick_mark_cap_clamps_to_range() {
        assert_eq!(clamp_quick_mark_cap(0), 1);
        assert_eq!(clamp_quick_mark_cap(500), 100);
        assert_eq!(clamp_quick_mark_cap(2), 2);
    }
}
