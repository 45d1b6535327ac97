use serde_json::Value;

/// Recursively merge `overlay` into `base`.
///
/// Keys present in both whose values are objects on both sides are merged
/// key by key; for any other collision the overlay value replaces the base
/// value. Keys only present in `base` are kept.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
