//! In-memory job store for tests and ephemeral runs.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Error, Result,
    store::JobStore,
    types::{Job, JobFilter, JobState, RetentionPolicy},
};

/// In-memory store backed by `HashMap`. Nothing survives a restart.
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&job.id) {
            return Err(Error::message(format!("duplicate job id: {}", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            },
            None => Err(Error::job_not_found(&job.id)),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(id).cloned())
    }

    async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        out.truncate(limit);
        Ok(out)
    }

    async fn claim_due(&self, now_ms: u64, lease_until_ms: u64) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let next = jobs
            .values_mut()
            .filter(|j| j.state.is_waiting() && j.run_at_ms <= now_ms)
            .min_by_key(|j| (j.run_at_ms, j.created_at_ms));
        Ok(next.map(|job| {
            job.state = JobState::InFlight;
            job.lease_until_ms = Some(lease_until_ms);
            job.updated_at_ms = now_ms;
            job.clone()
        }))
    }

    async fn next_due_at(&self) -> Result<Option<u64>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs
            .values()
            .filter(|j| j.state.is_waiting())
            .map(|j| j.run_at_ms)
            .min())
    }

    async fn recover_stalled(&self, now_ms: u64) -> Result<usize> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut recovered = 0;
        for job in jobs.values_mut() {
            if job.state == JobState::InFlight && job.lease_until_ms.is_some_and(|t| t < now_ms) {
                job.state = JobState::Queued;
                job.lease_until_ms = None;
                job.run_at_ms = now_ms;
                job.updated_at_ms = now_ms;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn purge(&self, retention: &RetentionPolicy, now_ms: u64) -> Result<usize> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        let completed_cutoff = now_ms.saturating_sub(retention.completed_max_age_ms);
        let failed_cutoff = now_ms.saturating_sub(retention.failed_max_age_ms);

        jobs.retain(|_, j| {
            let finished = j.finished_at_ms.unwrap_or(j.updated_at_ms);
            match j.state {
                JobState::Completed => finished >= completed_cutoff,
                JobState::Failed => finished >= failed_cutoff,
                _ => true,
            }
        });

        let mut completed: Vec<(u64, String)> = jobs
            .values()
            .filter(|j| j.state == JobState::Completed)
            .map(|j| (j.finished_at_ms.unwrap_or(j.updated_at_ms), j.id.clone()))
            .collect();
        if completed.len() > retention.completed_max_count {
            completed.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, id) in completed.drain(retention.completed_max_count..) {
                jobs.remove(&id);
            }
        }

        Ok(before - jobs.len())
    }
}
