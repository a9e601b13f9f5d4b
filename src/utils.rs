use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use time::OffsetDateTime;

use crate::{Error, Result};

// Characters kubernetes uses for random name suffixes.
const INSTANCE_ID_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

pub const INSTANCE_ID_LEN: usize = 5;

pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn random_instance_id() -> String {
    let mut rng = rand::thread_rng();
    (0..INSTANCE_ID_LEN)
        .map(|_| INSTANCE_ID_ALPHABET[rng.gen_range(0..INSTANCE_ID_ALPHABET.len())] as char)
        .collect()
}

pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name)) if !name.is_empty() && !name.contains('/') => {
            Ok((namespace, name))
        }
        None if !key.is_empty() => Ok(("", key)),
        _ => Err(Error::InvalidKey(key.to_owned())),
    }
}

/// Keep the shorter of two optional requeue delays.
pub fn min_delay(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// Convert a possibly negative time::Duration into a std one, saturating at zero.
pub fn positive_duration(d: time::Duration) -> Option<Duration> {
    if d.is_positive() {
        Duration::try_from(d).ok()
    } else {
        None
    }
}

/// Apply a JSON merge patch (RFC 7386) to `target`.
///
/// Objects carrying `"$patch": "replace"` replace the target object wholesale instead of being
/// merged into it, which is how revision patches pin the complete pod template.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if patch_map.get("$patch").and_then(Value::as_str) == Some("replace") {
        let mut replacement = patch_map.clone();
        replacement.remove("$patch");
        *target = Value::Object(replacement);
        return;
    }

    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}
