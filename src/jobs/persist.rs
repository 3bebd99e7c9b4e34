use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::record::{JobRecord, LogEvent};

/// Durable storage consumed by the runner. Backed by an embedded store in
/// the embedding process; this crate only depends on the contract.
///
/// `save_job` is an idempotent upsert by id. `list_jobs` is the
/// crash-recovery source. Store failures never affect job execution; the
/// runner logs and swallows them.
#[async_trait]
pub trait Persist: Send + Sync {
    async fn save_job(&self, rec: &JobRecord) -> Result<()>;
    async fn append_log(&self, job: Uuid, event: &LogEvent) -> Result<()>;
    async fn list_jobs(&self) -> Result<Vec<JobRecord>>;
    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>>;
}

/// In-memory `Persist` implementation. Used by tests and by embedders that
/// opt out of durable history.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    logs: RwLock<HashMap<Uuid, Vec<LogEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log history for one job, in append order. Subscribers that attach
    /// late replay from here rather than from the live fan-out.
    pub async fn logs(&self, job: Uuid) -> Vec<LogEvent> {
        self.logs.read().await.get(&job).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Persist for MemoryStore {
    async fn save_job(&self, rec: &JobRecord) -> Result<()> {
        self.jobs.write().await.insert(rec.id, rec.clone());
        Ok(())
    }

    async fn append_log(&self, job: Uuid, event: &LogEvent) -> Result<()> {
        self.logs
            .write()
            .await
            .entry(job)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = MemoryStore::new();
        let mut rec = JobRecord::new("sync", json!({}));
        store.save_job(&rec).await.unwrap();

        rec.progress = 0.5;
        store.save_job(&rec).await.unwrap();

        let listed = store.list_jobs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].progress, 0.5);
    }

    #[tokio::test]
    async fn get_reproduces_saved_fields() {
        let store = MemoryStore::new();
        let rec = JobRecord::new("sync", json!({"a": 1}));
        store.save_job(&rec).await.unwrap();

        let loaded = store.get_job(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.kind, rec.kind);
        assert_eq!(loaded.status, rec.status);
        assert_eq!(loaded.progress, rec.progress);
        assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logs_append_in_order() {
        let store = MemoryStore::new();
        let job = Uuid::new_v4();
        for i in 0..3 {
            store
                .append_log(job, &LogEvent::new(job, format!("m{i}")))
                .await
                .unwrap();
        }
        let logs = store.logs(job).await;
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].msg, "m0");
        assert_eq!(logs[2].msg, "m2");
    }
}
