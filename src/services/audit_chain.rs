//! 审计链哈希
//!
//! hash = hex(SHA-256(canonical_json(content) || previous_hash))
//!
//! content 为条目除 hash / previous_hash 之外的全部字段；None 字段省略，
//! 对象键按字典序递归排序，时间戳固定为 RFC 3339 毫秒精度 UTC。

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::audit::AuditLogEntry;

/// 链首条目的 previous_hash
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Timestamp form used inside the hashed content
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Drop sub-millisecond precision so a stored timestamp re-hashes identically.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

fn content(entry: &AuditLogEntry) -> Value {
    let mut map = Map::new();

    map.insert("id".into(), Value::String(entry.id.to_string()));
    map.insert("tenant_id".into(), Value::String(entry.tenant_id.clone()));
    map.insert("sequence".into(), Value::from(entry.sequence));
    map.insert("event_type".into(), Value::String(entry.event_type.clone()));
    map.insert("category".into(), Value::String(entry.category.clone()));
    map.insert("action".into(), Value::String(entry.action.clone()));
    map.insert(
        "timestamp".into(),
        Value::String(canonical_timestamp(entry.timestamp)),
    );

    let optional = [
        ("user_id", entry.user_id.map(|id| id.to_string())),
        ("user_name", entry.user_name.clone()),
        ("resource_type", entry.resource_type.clone()),
        ("resource_id", entry.resource_id.clone()),
        ("ip", entry.ip.clone()),
        ("user_agent", entry.user_agent.clone()),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            map.insert(key.into(), Value::String(value));
        }
    }

    if let Some(details) = &entry.details {
        map.insert("details".into(), details.clone());
    }

    Value::Object(map)
}

/// Serialize with recursively sorted object keys and no whitespace.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical content string of an entry
pub fn canonical_content(entry: &AuditLogEntry) -> String {
    canonicalize(&content(entry))
}

/// Recompute an entry's hash from its content and the given previous hash.
pub fn compute_hash(entry: &AuditLogEntry, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_content(entry).as_bytes());
    hasher.update(previous_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Link a draft entry onto the chain tail: assign sequence and previous hash,
/// clamp a backwards timestamp, then hash.
pub fn link_entry(draft: &AuditLogEntry, tail: Option<&AuditLogEntry>) -> AuditLogEntry {
    let mut entry = draft.clone();
    match tail {
        Some(prev) => {
            entry.sequence = prev.sequence + 1;
            entry.previous_hash = prev.hash.clone();
            // 时钟回拨时保持时间戳与链顺序一致
            if prev.timestamp > entry.timestamp {
                entry.timestamp = prev.timestamp;
            }
        }
        None => {
            entry.sequence = 1;
            entry.previous_hash = GENESIS_HASH.to_string();
        }
    }
    entry.hash = compute_hash(&entry, &entry.previous_hash);
    entry
}
