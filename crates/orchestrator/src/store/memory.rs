//! In-process [`JobStore`] used by tests and single-process tooling.
//!
//! Each operation runs under one lock acquisition, so every call is atomic
//! just like the single-statement Postgres operations it stands in for.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use jokbo_core::error::CoreError;
use jokbo_core::job::Job;
use jokbo_core::progress::{ProgressRecord, ProgressUpdate};
use jokbo_core::types::{JobId, Timestamp};
use serde_json::Value;
use tokio::sync::Mutex;

use super::JobStore;

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    user_jobs: HashMap<String, Vec<(Timestamp, JobId)>>,
    progress: HashMap<JobId, ProgressRecord>,
    cancelled: HashSet<JobId>,
    balances: HashMap<String, i64>,
    partials: HashMap<JobId, BTreeMap<u32, Value>>,
    finals: HashMap<JobId, Value>,
    failing: HashSet<&'static str>,
}

impl State {
    fn check(&self, op: &'static str) -> Result<(), CoreError> {
        if self.failing.contains(op) {
            return Err(CoreError::StorageUnavailable(format!(
                "injected failure in {op}"
            )));
        }
        Ok(())
    }
}

/// Memory-backed job store.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to the named trait method fail with
    /// `StorageUnavailable` until [`Self::restore`] is called.
    pub async fn fail_operation(&self, op: &'static str) {
        self.state.lock().await.failing.insert(op);
    }

    pub async fn restore(&self, op: &'static str) {
        self.state.lock().await.failing.remove(op);
    }

    /// Write a progress record verbatim, bypassing validation.
    pub async fn put_progress(&self, record: ProgressRecord) {
        self.state
            .lock()
            .await
            .progress
            .insert(record.job_id.clone(), record);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), CoreError> {
        let mut s = self.state.lock().await;
        s.check("create_job")?;
        if s.jobs.contains_key(&job.job_id) {
            return Err(CoreError::Conflict(format!(
                "Job {} already exists",
                job.job_id
            )));
        }
        s.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, CoreError> {
        let s = self.state.lock().await;
        s.check("get_job")?;
        Ok(s.jobs.get(job_id).cloned())
    }

    async fn put_job(&self, job: &Job) -> Result<(), CoreError> {
        let mut s = self.state.lock().await;
        s.check("put_job")?;
        match s.jobs.get_mut(&job.job_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = job.clone();
                existing.created_at = created_at;
                Ok(())
            }
            None => Err(CoreError::not_found("Job", &job.job_id)),
        }
    }

    async fn bind_task(&self, job_id: &JobId, task_id: &str) -> Result<(), CoreError> {
        let mut s = self.state.lock().await;
        s.check("bind_task")?;
        let job = s
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::not_found("Job", job_id))?;
        job.bound_task_id = Some(task_id.to_string());
        Ok(())
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<bool, CoreError> {
        let mut s = self.state.lock().await;
        s.check("delete_job")?;
        Ok(s.jobs.remove(job_id).is_some())
    }

    async fn jobs_created_before(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<JobId>, CoreError> {
        let s = self.state.lock().await;
        s.check("jobs_created_before")?;
        let mut old: Vec<(Timestamp, JobId)> = s
            .jobs
            .values()
            .filter(|j| j.created_at < cutoff)
            .map(|j| (j.created_at, j.job_id.clone()))
            .collect();
        old.sort();
        Ok(old.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn add_user_job(
        &self,
        user_id: &str,
        job_id: &JobId,
        at: Timestamp,
    ) -> Result<(), CoreError> {
        let mut s = self.state.lock().await;
        s.check("add_user_job")?;
        let entries = s.user_jobs.entry(user_id.to_string()).or_default();
        if !entries.iter().any(|(_, id)| id == job_id) {
            entries.push((at, job_id.clone()));
        }
        Ok(())
    }

    async fn user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<JobId>, CoreError> {
        let s = self.state.lock().await;
        s.check("user_jobs")?;
        let mut entries = s.user_jobs.get(user_id).cloned().unwrap_or_default();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn is_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError> {
        let s = self.state.lock().await;
        s.check("is_user_job")?;
        Ok(s
            .user_jobs
            .get(user_id)
            .is_some_and(|entries| entries.iter().any(|(_, id)| id == job_id)))
    }

    async fn remove_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError> {
        let mut s = self.state.lock().await;
        s.check("remove_user_job")?;
        let Some(entries) = s.user_jobs.get_mut(user_id) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|(_, id)| id != job_id);
        Ok(entries.len() < before)
    }

    async fn unindex_job(&self, job_id: &JobId) -> Result<u64, CoreError> {
        let mut s = self.state.lock().await;
        s.check("unindex_job")?;
        let mut removed = 0;
        for entries in s.user_jobs.values_mut() {
            let before = entries.len();
            entries.retain(|(_, id)| id != job_id);
            removed += (before - entries.len()) as u64;
        }
        Ok(removed)
    }

    async fn prune_user_jobs_before(&self, cutoff: Timestamp) -> Result<u64, CoreError> {
        let mut s = self.state.lock().await;
        s.check("prune_user_jobs_before")?;
        let mut removed = 0;
        for entries in s.user_jobs.values_mut() {
            let before = entries.len();
            entries.retain(|(at, _)| *at >= cutoff);
            removed += (before - entries.len()) as u64;
        }
        Ok(removed)
    }

    async fn init_progress(&self, record: &ProgressRecord) -> Result<(), CoreError> {
        let mut s = self.state.lock().await;
        s.check("init_progress")?;
        if s.progress.contains_key(&record.job_id) {
            return Err(CoreError::Conflict(format!(
                "Progress for job {} is already initialized",
                record.job_id
            )));
        }
        s.progress.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn apply_progress(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
        message: Option<&str>,
        now: Timestamp,
    ) -> Result<Option<ProgressRecord>, CoreError> {
        let mut s = self.state.lock().await;
        s.check("apply_progress")?;
        Ok(s.progress.get_mut(job_id).map(|record| {
            record.apply(update, message, now);
            record.clone()
        }))
    }

    async fn get_progress(&self, job_id: &JobId) -> Result<Option<ProgressRecord>, CoreError> {
        let s = self.state.lock().await;
        s.check("get_progress")?;
        Ok(s.progress.get(job_id).cloned())
    }

    async fn list_unfinished_progress(&self) -> Result<Vec<ProgressRecord>, CoreError> {
        let s = self.state.lock().await;
        s.check("list_unfinished_progress")?;
        let mut records: Vec<ProgressRecord> = s
            .progress
            .values()
            .filter(|r| r.completed_units < r.total_units || !r.is_well_formed())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn delete_progress(&self, job_id: &JobId) -> Result<bool, CoreError> {
        let mut s = self.state.lock().await;
        s.check("delete_progress")?;
        Ok(s.progress.remove(job_id).is_some())
    }

    async fn set_cancelled(&self, job_id: &JobId) -> Result<(), CoreError> {
        let mut s = self.state.lock().await;
        s.check("set_cancelled")?;
        s.cancelled.insert(job_id.clone());
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &JobId) -> Result<bool, CoreError> {
        let s = self.state.lock().await;
        s.check("is_cancelled")?;
        Ok(s.cancelled.contains(job_id))
    }

    async fn clear_cancelled(&self, job_id: &JobId) -> Result<bool, CoreError> {
        let mut s = self.state.lock().await;
        s.check("clear_cancelled")?;
        Ok(s.cancelled.remove(job_id))
    }

    async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CoreError> {
        let s = self.state.lock().await;
        s.check("get_balance")?;
        Ok(s.balances.get(user_id).copied())
    }

    async fn set_balance(&self, user_id: &str, balance: i64) -> Result<(), CoreError> {
        let mut s = self.state.lock().await;
        s.check("set_balance")?;
        s.balances.insert(user_id.to_string(), balance);
        Ok(())
    }

    async fn add_balance(&self, user_id: &str, delta: i64) -> Result<i64, CoreError> {
        let mut s = self.state.lock().await;
        s.check("add_balance")?;
        let balance = s.balances.entry(user_id.to_string()).or_insert(0);
        *balance = balance.saturating_add(delta);
        Ok(*balance)
    }

    async fn record_partial(
        &self,
        job_id: &JobId,
        unit_index: u32,
        value: &Value,
    ) -> Result<bool, CoreError> {
        let mut s = self.state.lock().await;
        s.check("record_partial")?;
        let units = s.partials.entry(job_id.clone()).or_default();
        if units.contains_key(&unit_index) {
            return Ok(false);
        }
        units.insert(unit_index, value.clone());
        Ok(true)
    }

    async fn get_partial(&self, job_id: &JobId, unit_index: u32) -> Result<Option<Value>, CoreError> {
        let s = self.state.lock().await;
        s.check("get_partial")?;
        Ok(s.partials
            .get(job_id)
            .and_then(|units| units.get(&unit_index))
            .cloned())
    }

    async fn record_final(&self, job_id: &JobId, value: &Value) -> Result<bool, CoreError> {
        let mut s = self.state.lock().await;
        s.check("record_final")?;
        if s.finals.contains_key(job_id) {
            return Ok(false);
        }
        s.finals.insert(job_id.clone(), value.clone());
        Ok(true)
    }

    async fn get_final(&self, job_id: &JobId) -> Result<Option<Value>, CoreError> {
        let s = self.state.lock().await;
        s.check("get_final")?;
        Ok(s.finals.get(job_id).cloned())
    }

    async fn delete_results(&self, job_id: &JobId) -> Result<u64, CoreError> {
        let mut s = self.state.lock().await;
        s.check("delete_results")?;
        let partial = s.partials.remove(job_id).map_or(0, |units| units.len() as u64);
        let final_ = u64::from(s.finals.remove(job_id).is_some());
        Ok(partial + final_)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn add_balance_starts_from_zero() {
        let store = MemoryJobStore::new();
        assert_eq!(store.add_balance("u", -3).await.unwrap(), -3);
        assert_eq!(store.add_balance("u", 5).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_storage_unavailable() {
        let store = MemoryJobStore::new();
        store.fail_operation("get_progress").await;
        assert_matches!(
            store.get_progress(&JobId::from("j")).await,
            Err(CoreError::StorageUnavailable(_))
        );
        store.restore("get_progress").await;
        assert!(store.get_progress(&JobId::from("j")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_index_is_most_recent_first() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store
            .add_user_job("u", &JobId::from("old"), now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        store.add_user_job("u", &JobId::from("new"), now).await.unwrap();
        let ids = store.user_jobs("u", 10).await.unwrap();
        assert_eq!(ids, vec![JobId::from("new"), JobId::from("old")]);
        assert_eq!(store.user_jobs("u", 1).await.unwrap().len(), 1);
    }
}
