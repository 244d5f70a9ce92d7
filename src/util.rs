use std::{rc::Rc, time::Duration};

use serde_json::Value;

use crate::instant::Instant;

/// Time remaining until data fetched at `updated_at` becomes stale.
///
/// Returns `Duration::ZERO` when the data is already stale.
pub(crate) fn time_until_stale(updated_at: Instant, stale_time: Duration) -> Duration {
    let expires_at = updated_at.0 + stale_time;
    let now = Instant::now().0;
    expires_at.saturating_sub(now)
}

/// Merge `next` into `prev`, keeping the previous allocation wherever the
/// contents are equal.
///
/// When the new value is structurally identical to the old one the previous
/// `Rc` is returned untouched, so observers comparing by `Rc::ptr_eq` (or by
/// `PartialEq` on results) see no change. Unequal containers are rebuilt
/// top-down, recursing so that unchanged subtrees still share with `prev`.
pub(crate) fn replace_equal_deep(prev: &Rc<Value>, next: Value) -> Rc<Value> {
    if **prev == next {
        return prev.clone();
    }
    Rc::new(merge_value(prev, next))
}

fn merge_value(prev: &Value, next: Value) -> Value {
    match (prev, next) {
        (Value::Array(prev_items), Value::Array(next_items)) => Value::Array(
            next_items
                .into_iter()
                .enumerate()
                .map(|(index, item)| match prev_items.get(index) {
                    Some(prev_item) if *prev_item == item => prev_item.clone(),
                    Some(prev_item) => merge_value(prev_item, item),
                    None => item,
                })
                .collect(),
        ),
        (Value::Object(prev_map), Value::Object(next_map)) => Value::Object(
            next_map
                .into_iter()
                .map(|(key, item)| match prev_map.get(&key) {
                    Some(prev_item) if *prev_item == item => (key, prev_item.clone()),
                    Some(prev_item) => {
                        let merged = merge_value(prev_item, item);
                        (key, merged)
                    }
                    None => (key, item),
                })
                .collect(),
        ),
        (_, next) => next,
    }
}

/// Spawn a task on the current thread's `LocalSet`, if a runtime is running.
///
/// Timer-driven housekeeping (garbage collection, retry backoff) is skipped
/// when called outside a runtime, e.g. while seeding a client before startup.
pub(crate) fn try_spawn_local<F>(future: F) -> Option<tokio::task::JoinHandle<F::Output>>
where
    F: std::future::Future + 'static,
    F::Output: 'static,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return None;
    }
    Some(tokio::task::spawn_local(future))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_value_keeps_previous_rc() {
        let prev = Rc::new(json!({ "a": [1, 2], "b": "x" }));
        let next = replace_equal_deep(&prev, json!({ "a": [1, 2], "b": "x" }));
        assert!(Rc::ptr_eq(&prev, &next));
    }

    #[test]
    fn changed_value_produces_new_rc() {
        let prev = Rc::new(json!({ "a": 1 }));
        let next = replace_equal_deep(&prev, json!({ "a": 2 }));
        assert!(!Rc::ptr_eq(&prev, &next));
        assert_eq!(*next, json!({ "a": 2 }));
    }

    #[test]
    fn unchanged_subtrees_survive_a_partial_change() {
        let prev = Rc::new(json!({ "todos": [{ "id": 1 }, { "id": 2 }], "meta": { "page": 1 } }));
        let next = replace_equal_deep(
            &prev,
            json!({ "todos": [{ "id": 1 }, { "id": 3 }], "meta": { "page": 1 } }),
        );
        assert!(!Rc::ptr_eq(&prev, &next));
        assert_eq!(next["meta"], prev["meta"]);
        assert_eq!(next["todos"][0], prev["todos"][0]);
        assert_eq!(next["todos"][1], json!({ "id": 3 }));
    }

    #[test]
    fn time_until_stale_is_zero_once_elapsed() {
        use std::time::Duration;
        let updated_at = crate::instant::Instant::from_millis(0);
        assert_eq!(time_until_stale(updated_at, Duration::ZERO), Duration::ZERO);
    }
}
