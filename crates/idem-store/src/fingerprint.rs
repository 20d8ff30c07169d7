//! Request fingerprints: SHA-256 over canonical JSON.
//!
//! Object keys are sorted recursively and insignificant whitespace is dropped,
//! so `{"b":1,"a":2}` and `{ "a": 2, "b": 1 }` fingerprint identically. Bodies
//! that are not JSON are hashed byte-for-byte under a separate domain tag.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix for rendered fingerprints.
pub const FINGERPRINT_PREFIX: &str = "sha256:";

const JSON_DOMAIN: &[u8] = b"json\0";
const RAW_DOMAIN: &[u8] = b"raw\0";

/// Fingerprint a raw request payload.
pub fn fingerprint(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    match parse_json(payload) {
        Some(value) => {
            let mut canonical = String::with_capacity(payload.len());
            write_canonical(&value, &mut canonical);
            hasher.update(JSON_DOMAIN);
            hasher.update(canonical.as_bytes());
        }
        None => {
            hasher.update(RAW_DOMAIN);
            hasher.update(payload);
        }
    }
    format!("{FINGERPRINT_PREFIX}{}", hex::encode(hasher.finalize()))
}

fn parse_json(payload: &[u8]) -> Option<Value> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Some(Value::Null);
    }
    serde_json::from_slice(payload).ok()
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
