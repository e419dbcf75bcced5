//! Persistence ports and the in-process store.

pub mod memory;
pub mod port;
pub mod types;

/// Shallow-merge `patch` into `base` when both are JSON objects; otherwise replace.
pub fn merge_metadata(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(b), Some(p)) => {
            for (k, v) in p {
                b.insert(k.clone(), v.clone());
            }
        }
        _ if !patch.is_null() => *base = patch.clone(),
        _ => {}
    }
}
