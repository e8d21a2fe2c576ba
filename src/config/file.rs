//! Repository-supplied config overrides.
//!
//! After clone, a repo may adjust its own build config from two places: a
//! `boxcar` key in `package.json`, and a dedicated override file. Which
//! dedicated file is read depends on whether the build inherits secrets:
//! `.boxcar.sh` is executed and must print a JSON object on stdout, so it
//! only runs when the build is already trusted with secrets; otherwise only
//! the static `.boxcar.json` is parsed. Every failure here (missing file,
//! parse error, non-zero exit) reads as "no override".

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::config::OverridePolicy;

/// Loads the dedicated override file from a cloned repository.
#[async_trait]
pub trait FileConfigLoader: Send + Sync {
    /// The file this loader reads, relative to the clone directory.
    fn file_name(&self) -> &'static str;

    /// Returns the override object, or `None` when there is none to apply.
    async fn load(&self, clone_dir: &Path) -> Option<Value>;
}

/// Picks the loader a build's secret policy permits.
pub fn loader_for(inherit_secrets: bool) -> Box<dyn FileConfigLoader> {
    if inherit_secrets {
        Box::new(ExecutableLoader)
    } else {
        Box::new(StaticDataLoader)
    }
}

/// Runs `.boxcar.sh` and parses its stdout as JSON.
pub struct ExecutableLoader;

#[async_trait]
impl FileConfigLoader for ExecutableLoader {
    fn file_name(&self) -> &'static str {
        ".boxcar.sh"
    }

    async fn load(&self, clone_dir: &Path) -> Option<Value> {
        let path = clone_dir.join(self.file_name());
        if !path.exists() {
            return None;
        }
        let output = Command::new("/bin/bash")
            .arg(&path)
            .current_dir(clone_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        let output = match output {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(%error, "could not run .boxcar.sh, ignoring it");
                return None;
            }
        };
        if !output.status.success() {
            tracing::warn!(status = ?output.status.code(), "ignoring failed .boxcar.sh");
            return None;
        }
        parse_object(&output.stdout, self.file_name())
    }
}

/// Parses `.boxcar.json` as a plain JSON object.
pub struct StaticDataLoader;

#[async_trait]
impl FileConfigLoader for StaticDataLoader {
    fn file_name(&self) -> &'static str {
        ".boxcar.json"
    }

    async fn load(&self, clone_dir: &Path) -> Option<Value> {
        let bytes = tokio::fs::read(clone_dir.join(self.file_name())).await.ok()?;
        parse_object(&bytes, self.file_name())
    }
}

/// Reads the `boxcar` key out of the repository's `package.json`.
pub async fn read_package_config(clone_dir: &Path) -> Option<Value> {
    let bytes = tokio::fs::read(clone_dir.join("package.json")).await.ok()?;
    let package: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "ignoring unparseable package.json");
            return None;
        }
    };
    match package.get("boxcar") {
        Some(Value::Object(config)) => Some(Value::Object(config.clone())),
        Some(_) => {
            tracing::warn!("ignoring non-object boxcar key in package.json");
            None
        }
        None => None,
    }
}

/// Applies the override-key allow-list to a file config.
///
/// Only allowed keys that the file actually sets survive; an allowed key the
/// file omits must not erase the resolved value.
pub fn filter_overrides(file_config: Value, policy: &OverridePolicy) -> Value {
    let Some(allowed) = policy.allowed_keys() else {
        return file_config;
    };
    let Value::Object(file_config) = file_config else {
        return Value::Object(Map::new());
    };
    let mut filtered = Map::new();
    for key in allowed {
        if let Some(value) = file_config.get(key) {
            filtered.insert(key.clone(), value.clone());
        }
    }
    Value::Object(filtered)
}

fn parse_object(bytes: &[u8], file_name: &str) -> Option<Value> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => {
            tracing::warn!(file_name, "ignoring non-object config file");
            None
        }
        Err(error) => {
            tracing::warn!(file_name, %error, "ignoring unparseable config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn repo_with(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn static_loader_reads_json_file() {
        let repo = repo_with(&[(".boxcar.json", r#"{"cmd": "make check"}"#)]);
        let config = StaticDataLoader.load(repo.path()).await.unwrap();
        assert_eq!(config, json!({"cmd": "make check"}));
    }

    #[tokio::test]
    async fn static_loader_swallows_missing_and_malformed_files() {
        let empty = repo_with(&[]);
        assert!(StaticDataLoader.load(empty.path()).await.is_none());

        let broken = repo_with(&[(".boxcar.json", "{nope")]);
        assert!(StaticDataLoader.load(broken.path()).await.is_none());

        let non_object = repo_with(&[(".boxcar.json", "[1, 2]")]);
        assert!(StaticDataLoader.load(non_object.path()).await.is_none());
    }

    #[tokio::test]
    async fn executable_loader_runs_script_for_its_stdout() {
        let repo = repo_with(&[(".boxcar.sh", "echo '{\"env\": {\"DEBUG\": \"1\"}}'")]);
        let config = ExecutableLoader.load(repo.path()).await.unwrap();
        assert_eq!(config, json!({"env": {"DEBUG": "1"}}));
    }

    #[tokio::test]
    async fn executable_loader_ignores_failing_script() {
        let repo = repo_with(&[(".boxcar.sh", "echo '{\"cmd\": \"x\"}'; exit 3")]);
        assert!(ExecutableLoader.load(repo.path()).await.is_none());
    }

    #[tokio::test]
    async fn executable_loader_ignores_missing_script() {
        let repo = repo_with(&[]);
        assert!(ExecutableLoader.load(repo.path()).await.is_none());
    }

    #[tokio::test]
    async fn package_config_comes_from_boxcar_key() {
        let repo = repo_with(&[(
            "package.json",
            r#"{"name": "demo", "boxcar": {"cmd": "npm run ci"}}"#,
        )]);
        let config = read_package_config(repo.path()).await.unwrap();
        assert_eq!(config, json!({"cmd": "npm run ci"}));
    }

    #[tokio::test]
    async fn package_without_boxcar_key_has_no_config() {
        let repo = repo_with(&[("package.json", r#"{"name": "demo"}"#)]);
        assert!(read_package_config(repo.path()).await.is_none());
    }

    #[test]
    fn loader_choice_follows_secret_policy() {
        assert_eq!(loader_for(true).file_name(), ".boxcar.sh");
        assert_eq!(loader_for(false).file_name(), ".boxcar.json");
    }

    #[test]
    fn filter_keeps_only_allowed_present_keys() {
        let policy = OverridePolicy::Keys(vec!["cmd".to_string(), "env".to_string()]);
        let file_config = json!({"cmd": "make", "build": false});
        assert_eq!(
            filter_overrides(file_config, &policy),
            json!({"cmd": "make"})
        );
    }

    #[test]
    fn filter_passes_everything_when_unrestricted() {
        let policy = OverridePolicy::Enabled(true);
        let file_config = json!({"cmd": "make", "build": false});
        assert_eq!(filter_overrides(file_config.clone(), &policy), file_config);
    }
}
