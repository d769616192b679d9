//! Canonical serialization and signature hashing for tasks.
//!
//! The signature is a SHA-256 hex digest over a canonical text form of
//! `(action, parameters, resource_keys)`. Canonicalization is independent of
//! the order in which parameters or resource keys were built up: maps are
//! always walked in key order, lists in builder order, and resource keys in
//! their natural sort order.

use sha2::{Digest, Sha256};

use crate::params::{ParamMap, ParamValue};
use crate::resource::ResourceKey;

fn push_escaped_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn push_canonical_value(out: &mut String, value: &ParamValue) {
    match value {
        ParamValue::String(s) => push_escaped_string(out, s),
        ParamValue::Int(i) => out.push_str(&i.to_string()),
        ParamValue::Decimal(d) => out.push_str(&d.normalize().to_string()),
        ParamValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        ParamValue::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_canonical_value(out, item);
            }
            out.push(']');
        }
        ParamValue::Map(map) => push_canonical_map(out, map),
    }
}

fn push_canonical_map(out: &mut String, map: &ParamMap) {
    out.push('{');
    // `ParamMap` is a `BTreeMap`, so this iteration is already key-sorted.
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_escaped_string(out, key);
        out.push(':');
        push_canonical_value(out, value);
    }
    out.push('}');
}

/// Render `params` as the canonical JSON document used for signature hashing.
pub fn canonical_params(params: &ParamMap) -> String {
    let mut out = String::new();
    push_canonical_map(&mut out, params);
    out
}

/// Compute a task's stable signature.
///
/// `resource_keys` does not need to be pre-sorted; this function sorts a copy
/// before hashing so that signature equality does not depend on the order
/// resources were attached to the task.
pub fn signature(action: &str, params: &ParamMap, resource_keys: &[ResourceKey]) -> String {
    let mut sorted_keys: Vec<&ResourceKey> = resource_keys.iter().collect();
    sorted_keys.sort();

    let mut text = String::new();
    text.push_str(action);
    text.push('\x1f');
    text.push_str(&canonical_params(params));
    text.push('\x1f');
    for key in sorted_keys {
        text.push_str(&key.to_string());
        text.push('\x1e');
    }

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamsBuilder;

    #[test]
    fn signature_is_deterministic_regardless_of_parameter_insertion_order() {
        let a = ParamsBuilder::new()
            .set("entityId", 100_i64)
            .unwrap()
            .set("dataSource", "CUSTOMERS")
            .unwrap()
            .build();
        let b = ParamsBuilder::new()
            .set("dataSource", "CUSTOMERS")
            .unwrap()
            .set("entityId", 100_i64)
            .unwrap()
            .build();

        let keys = [ResourceKey::single("ENTITY", "100")];
        assert_eq!(
            signature("APPLY", &a, &keys),
            signature("APPLY", &b, &keys)
        );
    }

    #[test]
    fn signature_is_independent_of_resource_key_construction_order() {
        let params = ParamsBuilder::new().build();
        let forward = [
            ResourceKey::single("ENTITY", "1"),
            ResourceKey::single("ENTITY", "2"),
        ];
        let backward = [
            ResourceKey::single("ENTITY", "2"),
            ResourceKey::single("ENTITY", "1"),
        ];

        assert_eq!(
            signature("APPLY", &params, &forward),
            signature("APPLY", &params, &backward)
        );
    }

    #[test]
    fn differing_action_changes_signature() {
        let params = ParamsBuilder::new().build();
        let keys = [];
        assert_ne!(
            signature("APPLY", &params, &keys),
            signature("RETIRE", &params, &keys)
        );
    }

    #[test]
    fn decimal_canonicalization_strips_trailing_zeros() {
        use rust_decimal::Decimal;
        use std::str::FromStr;

        let a = ParamsBuilder::new()
            .set("score", Decimal::from_str("1.50").unwrap())
            .unwrap()
            .build();
        let b = ParamsBuilder::new()
            .set("score", Decimal::from_str("1.5").unwrap())
            .unwrap()
            .build();

        assert_eq!(canonical_params(&a), canonical_params(&b));
    }
}
