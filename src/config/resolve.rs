//! Config layering and environment resolution.
//!
//! Resolution happens in two passes. Before clone: defaults, stored global,
//! stored project, then branch/PR gating. After clone: repository file
//! overrides (capability-gated), a re-gate (files may declare new rules),
//! and the injected build environment.

use serde_json::{json, Map, Value};
use std::path::Path;

use crate::config::file::{filter_overrides, loader_for, read_package_config};
use crate::config::merge::{merged, merged_layers};
use crate::config::rules::apply_branch_rules;
use crate::config::{default_config, ConfigError, EffectiveConfig};
use crate::types::BuildDescriptor;

/// Pre-clone resolution: defaults, stored layers (lowest precedence first,
/// holes skipped), then gating.
pub fn init_config(stored: &[Option<Value>], descriptor: &BuildDescriptor) -> Value {
    let mut layers = vec![default_config()];
    layers.extend(stored.iter().flatten().cloned());
    apply_branch_rules(merged_layers(layers), descriptor)
}

/// Post-clone resolution: file overrides, re-gate, and environment
/// injection.
pub async fn prepare_build_config(
    config: Value,
    descriptor: &BuildDescriptor,
    clone_dir: &Path,
) -> Result<Value, ConfigError> {
    let config = resolve_file_configs(config, descriptor, clone_dir).await?;
    Ok(merged(config, injected_env(descriptor)))
}

/// Merges repository-supplied overrides into the config, then applies the
/// branch/PR rules again since the files may have declared new ones.
pub async fn resolve_file_configs(
    config: Value,
    descriptor: &BuildDescriptor,
    clone_dir: &Path,
) -> Result<Value, ConfigError> {
    let view = EffectiveConfig::from_value(&config)?;
    if !view.allow_config_overrides.allows_any() {
        return Ok(config);
    }

    let package_config = read_package_config(clone_dir)
        .await
        .unwrap_or_else(|| json!({}));
    let dot_config = loader_for(view.inherit_secrets)
        .load(clone_dir)
        .await
        .unwrap_or_else(|| json!({}));

    let file_config = merged(package_config, dot_config);
    let file_config = filter_overrides(file_config, &view.allow_config_overrides);

    Ok(apply_branch_rules(merged(config, file_config), descriptor))
}

/// The environment a build actually runs with: configured `env`, plus
/// `secretEnv` only when this build inherits secrets.
pub fn resolve_env(config: &EffectiveConfig) -> Map<String, Value> {
    let base = Value::Object(config.env.clone());
    let resolved = if config.inherit_secrets {
        merged(base, Value::Object(config.secret_env.clone()))
    } else {
        base
    };
    match resolved {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Stringifies an environment map for handing to a process or container.
///
/// Null becomes the empty string; other non-string scalars take their JSON
/// rendering.
pub fn env_pairs(env: &Map<String, Value>) -> Vec<(String, String)> {
    env.iter()
        .map(|(name, value)| {
            let value = match value {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect()
}

fn injected_env(descriptor: &BuildDescriptor) -> Value {
    let pull_request = descriptor
        .pr_num
        .map(|n| n.to_string())
        .unwrap_or_default();
    json!({
        "env": {
            "CI": true,
            "BOXCAR": true,
            "BOXCAR_REPOSITORY": descriptor.repo.as_str(),
            "BOXCAR_BRANCH": descriptor.branch,
            "BOXCAR_CLONE_REPOSITORY": descriptor.clone_repo.as_str(),
            "BOXCAR_CHECKOUT_BRANCH": descriptor.checkout_branch,
            "BOXCAR_COMMIT": descriptor.commit.as_str(),
            "BOXCAR_PULL_REQUEST": pull_request,
            "BOXCAR_REQUEST_ID": descriptor.request_id.as_str(),
        },
    })
}
