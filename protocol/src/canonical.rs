//! Canonical JSON rendering and the digest built on top of it.
//!
//! Ported field-for-field from the original service's `canonical_value` /
//! `state_digest` (see SPEC_FULL.md §4): numbers are rounded to 6 decimals
//! with trailing zeros stripped, `-0` collapses to `0`, non-finite numbers
//! become `null`, object keys sort by their string form, arrays keep order.
//! Two JSON-equal payloads with differently-ordered keys canonicalize to the
//! same bytes, which is the whole point — clients compare digests, not JSON.

use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

fn canonical_number(value: f64) -> String {
    if !value.is_finite() {
        return "null".to_string();
    }
    let rounded = (value * 1_000_000.0).round() / 1_000_000.0;
    let text = format!("{:.6}", rounded);
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Renders a JSON value the same way regardless of the original key order.
pub fn canonical_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                canonical_number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => serde_json::to_string(s).expect("strings always serialize"),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_value).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    let key_json = serde_json::to_string(key).expect("strings always serialize");
                    format!("{}:{}", key_json, canonical_value(&map[key]))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

/// Computes the digest for one scope's visible resolved view: for each
/// object id in sorted order, a line `"<id_json>:<canonical(data)>"`,
/// joined with `\n` and SHA-1 hashed, truncated to 16 hex characters.
pub fn state_digest(scope: &HashMap<String, Value>) -> String {
    let mut ids: Vec<&String> = scope.keys().collect();
    ids.sort();

    let mut lines = Vec::with_capacity(ids.len());
    for id in ids {
        let id_json = serde_json::to_string(id).expect("strings always serialize");
        lines.push(format!("{}:{}", id_json, canonical_value(&scope[id])));
    }
    let raw = lines.join("\n");

    let mut hasher = Sha1::new();
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    let hex = hex_encode(&digest);
    hex[..16].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
