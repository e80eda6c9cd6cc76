//! Persistence trait for dispatch jobs.

use async_trait::async_trait;

use crate::{
    Result,
    types::{Job, JobFilter, RetentionPolicy},
};

/// Durable queue backend.
///
/// State transitions (`Job::requeue`, `Job::complete`, ...) happen on the job
/// value held by the claiming worker and are persisted with [`JobStore::update`].
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;
    async fn update(&self, job: &Job) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Job>>;
    /// Newest first.
    async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>>;

    /// Atomically move the earliest due waiting job to `in_flight`.
    async fn claim_due(&self, now_ms: u64, lease_until_ms: u64) -> Result<Option<Job>>;
    /// Earliest `run_at_ms` among waiting jobs.
    async fn next_due_at(&self) -> Result<Option<u64>>;
    /// Return in-flight jobs whose lease ran out to the queue.
    async fn recover_stalled(&self, now_ms: u64) -> Result<usize>;
    /// Evict finished jobs past their retention.
    async fn purge(&self, retention: &RetentionPolicy, now_ms: u64) -> Result<usize>;
}
