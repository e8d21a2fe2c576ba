//! In-memory store implementation.
//!
//! Backs single-process deployments and the test suite. All state lives
//! under one mutex; operations never hold it across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::config::merged;
use crate::types::{BuildNumber, BuildRecord, BuildStatus, ProjectId, RequestId};

use super::{BuildStore, Fragment, FragmentStore, StoreResult};

const GLOBAL_CONFIG_KEY: &str = "global";

#[derive(Default)]
struct Inner {
    counters: HashMap<ProjectId, u64>,
    builds: HashMap<(ProjectId, BuildNumber), BuildRecord>,
    request_index: HashMap<(ProjectId, RequestId), BuildNumber>,
    configs: HashMap<String, Value>,
    fragments: HashMap<String, BTreeMap<u32, Fragment>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panic in another accessor;
        // the state is plain data, so continue with it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn next_build_number(&self, project: &ProjectId) -> StoreResult<BuildNumber> {
        let mut inner = self.lock();
        let counter = inner.counters.entry(project.clone()).or_insert(0);
        *counter += 1;
        Ok(BuildNumber(*counter))
    }

    async fn find_by_request_id(
        &self,
        project: &ProjectId,
        request_id: &RequestId,
    ) -> StoreResult<Option<BuildRecord>> {
        let inner = self.lock();
        let build_num = inner
            .request_index
            .get(&(project.clone(), request_id.clone()));
        Ok(build_num.and_then(|n| inner.builds.get(&(project.clone(), *n)).cloned()))
    }

    async fn get_build(
        &self,
        project: &ProjectId,
        build_num: BuildNumber,
    ) -> StoreResult<Option<BuildRecord>> {
        Ok(self.lock().builds.get(&(project.clone(), build_num)).cloned())
    }

    async fn put_build(&self, record: &BuildRecord) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.request_index.insert(
            (record.project.clone(), record.request_id.clone()),
            record.build_num,
        );
        inner
            .builds
            .insert((record.project.clone(), record.build_num), record.clone());
        Ok(())
    }

    async fn update_terminal(
        &self,
        project: &ProjectId,
        build_num: BuildNumber,
        status: BuildStatus,
        ended_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(record) = inner.builds.get_mut(&(project.clone(), build_num)) {
            record.status = status;
            record.ended_at = Some(ended_at);
        }
        Ok(())
    }

    async fn get_configs(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        let inner = self.lock();
        Ok(keys.iter().map(|key| inner.configs.get(key).cloned()).collect())
    }

    async fn get_global_config_value(&self, key: &str) -> StoreResult<Option<Value>> {
        let inner = self.lock();
        Ok(inner
            .configs
            .get(GLOBAL_CONFIG_KEY)
            .and_then(|config| config.get(key))
            .cloned())
    }

    async fn upsert_global_config(&self, partial: &Value) -> StoreResult<()> {
        let mut inner = self.lock();
        let existing = inner
            .configs
            .remove(GLOBAL_CONFIG_KEY)
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        inner
            .configs
            .insert(GLOBAL_CONFIG_KEY.to_string(), merged(existing, partial.clone()));
        Ok(())
    }
}

impl MemoryStore {
    /// Seeds a stored config layer; tests and bootstrap use this for
    /// project configs, which have no write path through the core.
    pub fn put_config(&self, key: impl Into<String>, config: Value) {
        self.lock().configs.insert(key.into(), config);
    }
}

#[async_trait]
impl FragmentStore for MemoryStore {
    async fn put_fragment(&self, fragment: &Fragment) -> StoreResult<u64> {
        let mut inner = self.lock();
        let pages = inner.fragments.entry(fragment.checksum.clone()).or_default();
        pages.entry(fragment.page_number).or_insert_with(|| fragment.clone());
        Ok(pages.len() as u64)
    }

    async fn count_fragments(&self, checksum: &str) -> StoreResult<u64> {
        let inner = self.lock();
        Ok(inner.fragments.get(checksum).map_or(0, |pages| pages.len() as u64))
    }

    async fn get_fragments(&self, checksum: &str) -> StoreResult<Vec<Fragment>> {
        let inner = self.lock();
        Ok(inner
            .fragments
            .get(checksum)
            .map(|pages| pages.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_fragments(&self, checksum: &str) -> StoreResult<()> {
        self.lock().fragments.remove(checksum);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RepoName, Sha};
    use serde_json::json;

    fn project() -> ProjectId {
        ProjectId::new("gh/octocat/hello")
    }

    fn record(build_num: u64, request_id: &str) -> BuildRecord {
        BuildRecord {
            project: project(),
            build_num: BuildNumber(build_num),
            request_id: RequestId::new(request_id),
            trigger: "push/master".to_string(),
            status: BuildStatus::Pending,
            branch: "master".to_string(),
            commit: Sha::parse("abc123").unwrap(),
            clone_repo: RepoName::parse("octocat/hello").unwrap(),
            checkout_branch: "master".to_string(),
            is_private: false,
            base_commit: None,
            comment: String::new(),
            user: "octocat".to_string(),
            committers: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn fragment(checksum: &str, page: u32, total: u32) -> Fragment {
        Fragment {
            checksum: checksum.to_string(),
            page_number: page,
            page_total: total,
            payload: vec![page as u8],
        }
    }

    #[tokio::test]
    async fn build_numbers_count_up_from_one() {
        let store = MemoryStore::new();
        assert_eq!(store.next_build_number(&project()).await.unwrap(), BuildNumber(1));
        assert_eq!(store.next_build_number(&project()).await.unwrap(), BuildNumber(2));
        // Separate projects have separate counters
        let other = ProjectId::new("gh/octocat/world");
        assert_eq!(store.next_build_number(&other).await.unwrap(), BuildNumber(1));
    }

    #[tokio::test]
    async fn request_id_finds_the_stored_build() {
        let store = MemoryStore::new();
        store.put_build(&record(1, "req-a")).await.unwrap();
        store.put_build(&record(2, "req-b")).await.unwrap();

        let found = store
            .find_by_request_id(&project(), &RequestId::new("req-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.build_num, BuildNumber(1));
        assert!(store
            .find_by_request_id(&project(), &RequestId::new("req-c"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn terminal_update_sets_status_and_end_time() {
        let store = MemoryStore::new();
        store.put_build(&record(1, "req-a")).await.unwrap();
        store
            .update_terminal(&project(), BuildNumber(1), BuildStatus::Failure, Utc::now())
            .await
            .unwrap();

        let stored = store.get_build(&project(), BuildNumber(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Failure);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn config_batch_preserves_order_with_holes() {
        let store = MemoryStore::new();
        store.put_config("gh/octocat/hello", json!({"cmd": "make"}));

        let configs = store
            .get_configs(&[
                "global".to_string(),
                "gh/octocat/hello".to_string(),
                "gh/missing/repo".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(configs.len(), 3);
        assert!(configs[0].is_none());
        assert_eq!(configs[1], Some(json!({"cmd": "make"})));
        assert!(configs[2].is_none());
    }

    #[tokio::test]
    async fn global_upsert_merges_recursively() {
        let store = MemoryStore::new();
        store
            .upsert_global_config(&json!({"secretEnv": {"GITHUB_TOKEN": "t1"}, "build": true}))
            .await
            .unwrap();
        store
            .upsert_global_config(&json!({"secretEnv": {"SLACK_TOKEN": "t2"}}))
            .await
            .unwrap();

        let configs = store.get_configs(&["global".to_string()]).await.unwrap();
        assert_eq!(
            configs[0],
            Some(json!({
                "secretEnv": {"GITHUB_TOKEN": "t1", "SLACK_TOKEN": "t2"},
                "build": true,
            }))
        );
        assert_eq!(
            store.get_global_config_value("build").await.unwrap(),
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn duplicate_fragments_do_not_double_count() {
        let store = MemoryStore::new();
        assert_eq!(store.put_fragment(&fragment("abc", 1, 3)).await.unwrap(), 1);
        assert_eq!(store.put_fragment(&fragment("abc", 2, 3)).await.unwrap(), 2);
        // Redelivery of page 2
        assert_eq!(store.put_fragment(&fragment("abc", 2, 3)).await.unwrap(), 2);
        assert_eq!(store.count_fragments("abc").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fragments_come_back_in_page_order() {
        let store = MemoryStore::new();
        store.put_fragment(&fragment("abc", 3, 3)).await.unwrap();
        store.put_fragment(&fragment("abc", 1, 3)).await.unwrap();
        store.put_fragment(&fragment("abc", 2, 3)).await.unwrap();

        let pages: Vec<u32> = store
            .get_fragments("abc")
            .await
            .unwrap()
            .iter()
            .map(|f| f.page_number)
            .collect();
        assert_eq!(pages, [1, 2, 3]);

        store.delete_fragments("abc").await.unwrap();
        assert_eq!(store.count_fragments("abc").await.unwrap(), 0);
    }
}
