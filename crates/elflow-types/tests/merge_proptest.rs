use proptest::prelude::*;
use serde_json::{Map, Value};

use elflow_types::state::{merge_state, StateMap, StateRecord};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,6}".prop_map(Value::String),
        prop::collection::vec(any::<i32>().prop_map(Value::from), 0..3).prop_map(Value::Array),
    ]
}

fn json_value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop::collection::btree_map("[a-d]", inner, 0..4)
            .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>()))
    })
}

fn state_map() -> impl Strategy<Value = StateMap> {
    prop::collection::btree_map("[a-d]", json_value(), 0..4)
        .prop_map(|m| m.into_iter().collect())
}

/// Every leaf path of `overlay` must read back from `merged` unchanged.
fn overlay_wins(merged: &StateMap, overlay: &StateMap) -> bool {
    overlay.iter().all(|(key, value)| match (merged.get(key), value) {
        (Some(Value::Object(m)), Value::Object(o)) => overlay_wins(m, o),
        (Some(m), o) => m == o,
        (None, _) => false,
    })
}

proptest! {
    #[test]
    fn merge_is_idempotent(base in state_map(), overlay in state_map()) {
        let once = merge_state(&base, &overlay);
        let twice = merge_state(&once, &overlay);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn overlay_leaves_always_win(base in state_map(), overlay in state_map()) {
        let merged = merge_state(&base, &overlay);
        prop_assert!(overlay_wins(&merged, &overlay));
    }

    #[test]
    fn base_keys_absent_from_overlay_survive(base in state_map(), overlay in state_map()) {
        let merged = merge_state(&base, &overlay);
        for (key, value) in &base {
            if !overlay.contains_key(key) {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }
    }

    #[test]
    fn merged_record_prefers_partial(completed in state_map(), partial in state_map()) {
        let record = StateRecord {
            partial_state: partial.clone(),
            completed_state: completed.clone(),
            ..StateRecord::empty("prop")
        };
        prop_assert_eq!(record.merged(), merge_state(&completed, &partial));
    }
}
