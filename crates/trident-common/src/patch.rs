//! Merge patches between live objects and desired manifests
//!
//! The installer never replaces an object it finds in the cluster. It
//! computes an RFC 7386 merge patch that carries only what the desired
//! manifest changes, so fields set by other controllers survive. Fields the
//! API server defaults inside lists (container `terminationMessagePath`,
//! `fieldRef.apiVersion` and the like) do not count as changes. A patch that
//! changes nothing serializes to `{}` and is skipped by callers.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::Error;

/// Compute a merge patch turning `current` into `current` merged with the
/// desired manifest.
///
/// The manifest may be YAML or JSON and must describe an object. Keys the
/// manifest leaves out are untouched and `null` removes a key. Nested
/// objects are diffed recursively. An array is replaced as a whole unless
/// the live array already holds, element by element, every field the
/// manifest sets.
pub fn merge_patch<T: Serialize + ?Sized>(
    current: &T,
    desired_manifest: &str,
) -> Result<Vec<u8>, Error> {
    let current = serde_json::to_value(current)
        .map_err(|e| Error::serialization(format!("failed to serialize current object: {e}")))?;
    let desired: Value = serde_yaml::from_str(desired_manifest)
        .map_err(|e| Error::serialization(format!("failed to parse desired manifest: {e}")))?;
    if !desired.is_object() {
        return Err(Error::serialization(
            "desired manifest must be a mapping at the top level",
        ));
    }

    let patch = merge_patch_values(&current, &desired);
    serde_json::to_vec(&patch)
        .map_err(|e| Error::serialization(format!("failed to serialize patch: {e}")))
}

/// Same as [`merge_patch`] over already-parsed JSON values
pub fn merge_patch_values(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(cur), Value::Object(des)) => Value::Object(diff_objects(cur, des)),
        (_, des) => strip_nulls(des),
    }
}

/// Check whether a serialized patch changes nothing
pub fn is_empty_patch(patch: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<Value>(patch),
        Ok(Value::Object(map)) if map.is_empty()
    )
}

fn diff_objects(current: &Map<String, Value>, desired: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();
    for (key, want) in desired {
        match (current.get(key), want) {
            (None, Value::Null) => {}
            (Some(_), Value::Null) => {
                patch.insert(key.clone(), Value::Null);
            }
            (Some(Value::Object(have)), Value::Object(want)) => {
                let nested = diff_objects(have, want);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            (Some(have), want) if have == want => {}
            (Some(Value::Array(have)), Value::Array(want)) if array_covers(have, want) => {}
            (_, want) => {
                patch.insert(key.clone(), strip_nulls(want));
            }
        }
    }
    patch
}

/// Whether `have` already carries every field `want` sets.
///
/// Elements are matched by position. Keys present only in `have` are
/// ignored and a `null` in `want` requires the key to be absent.
fn covers(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(key, w)| match w {
            Value::Null => have.get(key).map_or(true, Value::is_null),
            w => have.get(key).is_some_and(|h| covers(h, w)),
        }),
        (Value::Array(have), Value::Array(want)) => array_covers(have, want),
        (have, want) => have == want,
    }
}

fn array_covers(have: &[Value], want: &[Value]) -> bool {
    have.len() == want.len() && have.iter().zip(want).all(|(h, w)| covers(h, w))
}

// Nulls inside a value that is added wholesale would be read as deletions
// by the server, so they are dropped the way a merge would drop them.
fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn applied(current: &Value, patch: &Value) -> Value {
        let mut doc = current.clone();
        json_patch::merge(&mut doc, patch);
        doc
    }

    fn merged(current: &Value, desired: &Value) -> Value {
        let mut doc = current.clone();
        json_patch::merge(&mut doc, desired);
        doc
    }

    #[test]
    fn identical_content_yields_empty_patch() {
        let current = json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": "trident-operator", "namespace": "trident"}
        });
        let manifest = "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: trident-operator\n  namespace: trident\n";

        let patch = merge_patch(&current, manifest).unwrap();
        assert_eq!(patch, b"{}");
        assert!(is_empty_patch(&patch));
    }

    #[test]
    fn fields_absent_from_desired_are_left_alone() {
        let current = json!({
            "metadata": {
                "name": "trident-operator",
                "resourceVersion": "42",
                "labels": {"app": "operator.trident.netapp.io", "team": "storage"}
            },
            "spec": {"replicas": 1}
        });
        let desired = json!({
            "metadata": {"labels": {"app": "operator.trident.netapp.io"}},
            "spec": {"replicas": 2}
        });

        let patch = merge_patch_values(&current, &desired);
        assert_eq!(patch, json!({"spec": {"replicas": 2}}));

        let result = applied(&current, &patch);
        assert_eq!(result["metadata"]["resourceVersion"], "42");
        assert_eq!(result["metadata"]["labels"]["team"], "storage");
        assert_eq!(result["spec"]["replicas"], 2);
    }

    #[test]
    fn null_deletes_present_keys_only() {
        let current = json!({"spec": {"debug": true, "wipeout": ["crds"]}});
        let desired = json!({"spec": {"wipeout": null, "uninstall": null}});

        let patch = merge_patch_values(&current, &desired);
        assert_eq!(patch, json!({"spec": {"wipeout": null}}));
    }

    #[test]
    fn arrays_are_replaced_wholesale() {
        let current = json!({"spec": {"imagePullSecrets": ["a", "b"]}});
        let desired = json!({"spec": {"imagePullSecrets": ["trident-imagepullsecrets"]}});

        let patch = merge_patch_values(&current, &desired);
        assert_eq!(
            patch,
            json!({"spec": {"imagePullSecrets": ["trident-imagepullsecrets"]}})
        );
    }

    #[test]
    fn server_defaults_inside_arrays_are_not_changes() {
        let current = json!({"spec": {"template": {"spec": {"containers": [{
            "name": "trident-operator",
            "image": "registry/trident-operator:24.01.0",
            "imagePullPolicy": "IfNotPresent",
            "terminationMessagePath": "/dev/termination-log",
            "env": [{"name": "POD_NAME", "valueFrom": {"fieldRef": {
                "apiVersion": "v1",
                "fieldPath": "metadata.name"
            }}}]
        }]}}}});
        let desired = json!({"spec": {"template": {"spec": {"containers": [{
            "name": "trident-operator",
            "image": "registry/trident-operator:24.01.0",
            "env": [{"name": "POD_NAME", "valueFrom": {"fieldRef": {"fieldPath": "metadata.name"}}}]
        }]}}}});
        assert_eq!(merge_patch_values(&current, &desired), json!({}));

        let mut upgraded = desired.clone();
        upgraded["spec"]["template"]["spec"]["containers"][0]["image"] =
            json!("registry/trident-operator:24.02.0");
        let patch = merge_patch_values(&current, &upgraded);
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"][0]["image"],
            "registry/trident-operator:24.02.0"
        );
    }

    #[test]
    fn arrays_of_different_length_are_replaced() {
        let current = json!({"rules": [{"verbs": ["get"]}, {"verbs": ["list"]}]});
        let desired = json!({"rules": [{"verbs": ["get"]}]});

        let patch = merge_patch_values(&current, &desired);
        assert_eq!(patch, json!({"rules": [{"verbs": ["get"]}]}));
    }

    #[test]
    fn new_subtrees_do_not_carry_nulls() {
        let current = json!({"metadata": {"name": "x"}});
        let desired = json!({"data": {"a": "1", "b": null}});

        let patch = merge_patch_values(&current, &desired);
        assert_eq!(patch, json!({"data": {"a": "1"}}));
    }

    #[test]
    fn applying_patch_matches_merging_desired() {
        let cases = [
            (
                json!({"a": 1, "b": {"c": [1, 2], "d": "x"}, "e": null}),
                json!({"b": {"c": [3], "d": null, "f": {"g": 1}}, "h": true}),
            ),
            (
                json!({"spec": {"template": {"spec": {"containers": [{"name": "op"}]}}}}),
                json!({"spec": {"template": {"spec": {"containers": [{"name": "op", "image": "i"}]}}}}),
            ),
            (json!({"a": {"b": 1}}), json!({"a": "scalar"})),
            (json!({"a": "scalar"}), json!({"a": {"b": 1, "c": null}})),
            (json!({}), json!({})),
        ];

        for (current, desired) in cases {
            let patch = merge_patch_values(&current, &desired);
            assert_eq!(
                applied(&current, &patch),
                merged(&current, &desired),
                "current={current} desired={desired} patch={patch}"
            );
        }
    }

    #[test]
    fn accepts_json_manifests() {
        let current = json!({"spec": {"replicas": 1}});
        let patch = merge_patch(&current, r#"{"spec": {"replicas": 3}}"#).unwrap();
        let patch: Value = serde_json::from_slice(&patch).unwrap();
        assert_eq!(patch, json!({"spec": {"replicas": 3}}));
    }

    #[test]
    fn malformed_manifests_are_serialization_errors() {
        let current = json!({});
        for manifest in ["metadata: [unclosed", "- just\n- a list\n", "plain scalar"] {
            let err = merge_patch(&current, manifest).unwrap_err();
            assert!(
                matches!(err, Error::Serialization { .. }),
                "{manifest:?} gave {err:?}"
            );
        }
    }
}
