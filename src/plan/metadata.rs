//! Service metadata and its content hash
//!
//! The hash is taken over a canonical JSON rendering: object keys sorted,
//! no whitespace, `,` and `:` separators. Two records holding the same
//! values hash identically no matter how their maps were built.

use crate::engine::{ServiceDescriptor, VolumeSource};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Configuration facts that decide whether a service changed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceMetadata {
    pub options: Value,
    pub image_id: String,
    pub links: Vec<(String, String)>,
    pub net: String,
    pub networks: BTreeMap<String, Value>,
    /// `(peer service, mode)`; container sources are left out
    pub volumes_from: Vec<(String, String)>,
}

impl ServiceMetadata {
    pub fn describe<S: ServiceDescriptor + ?Sized>(service: &S, image_id: &str) -> Self {
        let volumes_from = service
            .volumes_from()
            .into_iter()
            .filter_map(|v| match v.source {
                VolumeSource::Service(name) => Some((name, v.mode)),
                VolumeSource::Container(_) => None,
            })
            .collect();

        Self {
            options: service.options(),
            image_id: image_id.to_string(),
            links: service.link_names(),
            net: service.network_mode_id(),
            networks: service.networks(),
            volumes_from,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn content_hash(&self) -> String {
        json_hash(&self.to_value())
    }
}

/// SHA-256 hex digest of the canonical JSON form of `value`
pub fn json_hash(value: &Value) -> String {
    format!("{:x}", Sha256::digest(canonical_json(value).as_bytes()))
}

/// Render `value` with sorted keys and compact separators
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(val, out);
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
        Value::String(s) => write_string(s, out),
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

/// Quote `s` with every non-ASCII character escaped as `\uXXXX`
///
/// Characters outside the basic plane become a UTF-16 surrogate pair, so the
/// output stays plain ASCII and hashes the same on every client.
fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04x}", unit);
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_form() {
        let value = json!({"b": [1, {"z": null, "a": true}], "a": "x"});
        assert_eq!(canonical_json(&value), r#"{"a":"x","b":[1,{"a":true,"z":null}]}"#);
    }

    #[test]
    fn test_non_ascii_is_escaped() {
        assert_eq!(canonical_json(&json!("café 🚀")), r#""caf\u00e9 \ud83d\ude80""#);
        assert_eq!(
            canonical_json(&json!({"ü": "naïve"})),
            r#"{"\u00fc":"na\u00efve"}"#
        );
    }

    #[test]
    fn test_control_characters_are_escaped() {
        let value = json!("a\"b\\c\nd\re\tf\u{8}g\u{c}h\u{1}i\u{7f}j/");
        assert_eq!(
            canonical_json(&value),
            r#""a\"b\\c\nd\re\tf\bg\fh\u0001i\u007fj/""#
        );
    }

    #[test]
    fn test_non_ascii_digest() {
        // sha256 of the bytes {"name":"caf\u00e9"}
        assert_eq!(
            json_hash(&json!({"name": "café"})),
            "9db11f5f5dc2b3898bb358a2e545b3c96e9052c61e2b4f4de41acded22ef5128"
        );
    }

    #[test]
    fn test_known_digest() {
        // sha256 of the bytes {"a":1}
        assert_eq!(
            json_hash(&json!({"a": 1})),
            "015abd7f5cc57a2dd94b7590f04ad8084273905ee33ec5cebeae62276a97f862"
        );
    }

    #[test]
    fn test_hash_ignores_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("image".into(), json!("nginx"));
        first.insert("ports".into(), json!(["80:80"]));
        first.insert("environment".into(), json!({"B": "2", "A": "1"}));

        let mut second = serde_json::Map::new();
        second.insert("environment".into(), json!({"A": "1", "B": "2"}));
        second.insert("ports".into(), json!(["80:80"]));
        second.insert("image".into(), json!("nginx"));

        let meta = |options: serde_json::Map<String, Value>| ServiceMetadata {
            options: Value::Object(options),
            image_id: "sha256:abc".into(),
            links: vec![("db".into(), "database".into())],
            net: "shop_default".into(),
            networks: BTreeMap::from([("shop_default".to_string(), Value::Null)]),
            volumes_from: vec![],
        };

        assert_eq!(meta(first).content_hash(), meta(second).content_hash());
    }

    #[test]
    fn test_hash_tracks_values() {
        let base = ServiceMetadata {
            options: json!({"image": "nginx"}),
            image_id: "sha256:abc".into(),
            links: vec![],
            net: "p_default".into(),
            networks: BTreeMap::new(),
            volumes_from: vec![],
        };
        let mut changed = base.clone();
        changed.image_id = "sha256:def".into();

        assert_ne!(base.content_hash(), changed.content_hash());
        assert_eq!(base.content_hash().len(), 64);
    }
}
