//! Recursive configuration-layer merge.
//!
//! One fixed rule everywhere a layer overrides another: objects merge
//! key-wise (recursively), while arrays, strings, numbers, booleans, and
//! null replace the base value wholesale. The same rule applies whether the
//! layers come from defaults, the config store, or repository files.
//!
//! Key order is preserved: keys keep the position of their first
//! appearance, and overlay-only keys append in overlay order. Branch rules
//! rely on this (regex rules match in declaration order).

use serde_json::Value;

/// Merges `overlay` over `base` and returns the result.
pub fn merged(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    // take() swaps in Null without disturbing key order
                    Some(existing) => {
                        let combined = merged(existing.take(), value);
                        *existing = combined;
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Folds a sequence of layers, lowest precedence first.
pub fn merged_layers(layers: impl IntoIterator<Item = Value>) -> Value {
    layers
        .into_iter()
        .fold(Value::Object(serde_json::Map::new()), merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn objects_merge_key_wise() {
        let base = json!({"a": 1, "b": {"x": 1, "y": 2}});
        let overlay = json!({"b": {"y": 3, "z": 4}, "c": 5});
        assert_eq!(
            merged(base, overlay),
            json!({"a": 1, "b": {"x": 1, "y": 3, "z": 4}, "c": 5})
        );
    }

    #[test]
    fn arrays_replace_wholesale() {
        let base = json!({"keys": ["cmd", "env"]});
        let overlay = json!({"keys": ["cmd"]});
        assert_eq!(merged(base, overlay), json!({"keys": ["cmd"]}));
    }

    #[test]
    fn scalar_replaces_object() {
        let base = json!({"branches": {"master": true}});
        let overlay = json!({"branches": false});
        assert_eq!(merged(base, overlay), json!({"branches": false}));
    }

    #[test]
    fn object_replaces_scalar() {
        let base = json!({"pullRequests": true});
        let overlay = json!({"pullRequests": {"fromForkPublicRepo": false}});
        assert_eq!(
            merged(base, overlay),
            json!({"pullRequests": {"fromForkPublicRepo": false}})
        );
    }

    #[test]
    fn null_is_a_value_and_replaces() {
        let base = json!({"cmd": "make test"});
        let overlay = json!({"cmd": null});
        assert_eq!(merged(base, overlay), json!({"cmd": null}));
    }

    #[test]
    fn key_order_survives_merging() {
        let base = json!({"/release-.*/": true, "!/wip-.*/": true});
        let overlay = json!({"!/wip-.*/": false, "master": true});
        let result = merged(base, overlay);
        let keys: Vec<&String> = result.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["/release-.*/", "!/wip-.*/", "master"]);
    }

    #[test]
    fn layer_fold_applies_in_precedence_order() {
        let layers = vec![
            json!({"build": false, "cmd": "a"}),
            json!({"build": true}),
            json!({"cmd": "c"}),
        ];
        assert_eq!(merged_layers(layers), json!({"build": true, "cmd": "c"}));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(value in arb_json()) {
            let twice = merged(value.clone(), value.clone());
            prop_assert_eq!(twice, value);
        }

        #[test]
        fn empty_object_overlay_changes_nothing(value in arb_json()) {
            prop_assume!(value.is_object());
            let result = merged(value.clone(), Value::Object(serde_json::Map::new()));
            prop_assert_eq!(result, value);
        }

        #[test]
        fn non_object_overlay_always_wins(base in arb_json(), overlay in arb_json()) {
            prop_assume!(!overlay.is_object());
            let result = merged(base, overlay.clone());
            prop_assert_eq!(result, overlay);
        }
    }
}
