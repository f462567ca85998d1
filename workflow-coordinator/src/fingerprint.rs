//! Cache key canonicalisation: two logically identical requests must hash to
//! the same fingerprint regardless of map key ordering or the caller's JSON
//! formatting.

use sha2::{Digest, Sha256};

use crate::types::{ParamValue, Parameters};

/// Deterministically render a parameter tree so that equal requests always
/// produce byte-identical strings before hashing. `BTreeMap` already sorts
/// keys; this just needs a stable textual form for each variant.
fn canonicalise(value: &ParamValue, out: &mut String) {
    match value {
        ParamValue::Null => out.push_str("null"),
        ParamValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        ParamValue::Number(n) => out.push_str(&format!("{n}")),
        ParamValue::String(s) => {
            out.push('"');
            out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
            out.push('"');
        }
        ParamValue::List(items) => {
            // Array-valued parameters are order-insensitive per §4.3: sort
            // each item's own canonical form before joining so two requests
            // differing only in array order still fingerprint identically.
            let mut rendered: Vec<String> = items
                .iter()
                .map(|item| {
                    let mut s = String::new();
                    canonicalise(item, &mut s);
                    s
                })
                .collect();
            rendered.sort();
            out.push('[');
            for (i, item) in rendered.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(item);
            }
            out.push(']');
        }
        ParamValue::Map(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(&k.replace('\\', "\\\\").replace('"', "\\\""));
                out.push_str("\":");
                canonicalise(v, out);
            }
            out.push('}');
        }
    }
}

/// Fingerprint a task type plus its parameters, ignoring everything else
/// (priority, user id, subscription tier) because those don't change the
/// output of the underlying computation.
pub fn fingerprint(task_type: &str, parameters: &Parameters) -> String {
    let mut canonical = String::new();
    canonical.push_str(task_type);
    canonical.push(':');
    let map_value = ParamValue::Map(parameters.clone());
    canonicalise(&map_value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

pub fn cache_key(task_type: &str, parameters: &Parameters) -> String {
    format!("cache:workflow:{}", fingerprint(task_type, parameters))
}

pub fn reservation_key(task_type: &str, parameters: &Parameters) -> String {
    format!("cache:reservation:{}", fingerprint(task_type, parameters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn params(pairs: &[(&str, ParamValue)]) -> Parameters {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn identical_parameters_fingerprint_identically() {
        let a = params(&[("model", ParamValue::String("resnet".into())), ("steps", ParamValue::Number(10.0))]);
        let b = params(&[("steps", ParamValue::Number(10.0)), ("model", ParamValue::String("resnet".into()))]);
        assert_eq!(fingerprint("inference", &a), fingerprint("inference", &b));
    }

    #[test]
    fn different_task_type_changes_fingerprint() {
        let a = params(&[("model", ParamValue::String("resnet".into()))]);
        assert_ne!(fingerprint("inference", &a), fingerprint("training", &a));
    }

    #[test]
    fn different_values_change_fingerprint() {
        let a = params(&[("steps", ParamValue::Number(10.0))]);
        let b = params(&[("steps", ParamValue::Number(11.0))]);
        assert_ne!(fingerprint("inference", &a), fingerprint("inference", &b));
    }

    #[test]
    fn reordered_array_values_fingerprint_identically() {
        let a = params(&[(
            "tags",
            ParamValue::List(vec![ParamValue::String("b".into()), ParamValue::String("a".into())]),
        )]);
        let b = params(&[(
            "tags",
            ParamValue::List(vec![ParamValue::String("a".into()), ParamValue::String("b".into())]),
        )]);
        assert_eq!(fingerprint("inference", &a), fingerprint("inference", &b));
    }
}
