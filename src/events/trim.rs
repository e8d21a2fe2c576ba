//! Webhook payload slimming.
//!
//! Provider payloads are dominated by hypermedia links. Before an event is
//! logged or forwarded, every nested object is stripped of url-shaped keys
//! (`url`, `_links`, `*_url`), which bounds message size and keeps ephemeral
//! signed URLs out of logs and storage. `clone_url` and `avatar_url` carry
//! real information and survive.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static URL_KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(url|_links)$|_url$").unwrap());

const KEEP_KEYS: [&str; 2] = ["clone_url", "avatar_url"];

/// Recursively removes url-shaped keys from a payload in place.
pub fn trim_url_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| {
                KEEP_KEYS.contains(&key.as_str()) || !URL_KEY_RE.is_match(key)
            });
            for nested in map.values_mut() {
                trim_url_keys(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                trim_url_keys(item);
            }
        }
        _ => {}
    }
}
