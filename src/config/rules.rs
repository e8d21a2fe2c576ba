//! Branch and pull-request build gating.
//!
//! A config's `branches` and `pullRequests` keys decide whether a given
//! descriptor builds at all, and may override other config keys per rule.
//!
//! Push rules: a bare boolean applies to every branch; otherwise the branch
//! name is looked up exactly, and only if no exact entry exists are
//! regex-form keys (`/pattern/`, negated `!/pattern/`) tried, in declaration
//! order, first match wins.
//!
//! Pull-request rules: a bare boolean applies to every PR; otherwise one of
//! four categories is selected by fork-ness and repo privacy. A matched rule
//! that is a boolean is shorthand for `{"build": <bool>}`; object rules merge
//! over the config wholesale, which is how fork PRs get their secrets and
//! override policy clamped.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

use crate::config::merge::merged;
use crate::types::BuildDescriptor;

static RULE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(!)?/(.+)/$").unwrap());

/// Applies the matching branch or PR rule to a merged config.
///
/// Returns the config unchanged when no rule matches; `build` then keeps
/// whatever the plain layers said (false by default).
pub fn apply_branch_rules(config: Value, descriptor: &BuildDescriptor) -> Value {
    let rule = if descriptor.event_type.is_pull_request() {
        select_pr_rule(
            config.get("pullRequests"),
            descriptor.is_fork(),
            descriptor.is_private,
        )
    } else {
        select_push_rule(config.get("branches"), &descriptor.branch)
    };

    let Some(rule) = rule else {
        return config;
    };
    let rule = match rule {
        Value::Bool(enabled) => json!({ "build": enabled }),
        other => other,
    };
    merged(config, rule)
}

fn select_push_rule(branches: Option<&Value>, branch: &str) -> Option<Value> {
    match branches? {
        Value::Bool(enabled) => Some(Value::Bool(*enabled)),
        Value::Object(rules) => {
            if let Some(exact) = rules.get(branch) {
                return Some(exact.clone());
            }
            rules
                .iter()
                .find(|(key, _)| rule_key_matches(key, branch))
                .map(|(_, rule)| rule.clone())
        }
        _ => None,
    }
}

fn rule_key_matches(key: &str, branch: &str) -> bool {
    let Some(captures) = RULE_KEY_RE.captures(key) else {
        return false;
    };
    let negated = captures.get(1).is_some();
    let pattern = &captures[2];
    match Regex::new(pattern) {
        Ok(re) => negated != re.is_match(branch),
        Err(error) => {
            tracing::warn!(key, %error, "skipping unparseable branch rule");
            false
        }
    }
}

fn select_pr_rule(pull_requests: Option<&Value>, is_fork: bool, is_private: bool) -> Option<Value> {
    match pull_requests? {
        Value::Bool(enabled) => Some(Value::Bool(*enabled)),
        Value::Object(rules) => {
            let key = match (is_fork, is_private) {
                (false, false) => "fromSelfPublicRepo",
                (false, true) => "fromSelfPrivateRepo",
                (true, false) => "fromForkPublicRepo",
                (true, true) => "fromForkPrivateRepo",
            };
            rules.get(key).cloned()
        }
        _ => None,
    }
}
