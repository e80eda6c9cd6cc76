//! SQLite-backed job store using sqlx.

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
};

use crate::{
    Error, Result,
    error::Context,
    store::JobStore,
    types::{Job, JobFilter, JobState, RetentionPolicy},
};

/// SQLite-backed persistence for dispatch jobs.
///
/// The full job lives in the JSON `data` column; `state`, `run_at_ms`,
/// `lease_until_ms` and `finished_at_ms` are mirrored into columns so claims
/// and sweeps run as single statements. Processes sharing the database file
/// never claim the same job twice.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a new store with its own connection pool and run migrations.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = connect(database_url, max_connections).await?;
        crate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open a pool, creating the database file when missing.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = database_url
        .parse::<sqlx::sqlite::SqliteConnectOptions>()?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn decode(row: &SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let data: String = row.get("data");
    serde_json::from_str(&data).with_context(|| format!("corrupt job data for {id}"))
}

fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Job>> {
    rows.iter().map(decode).collect()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job)?;
        sqlx::query(
            "INSERT INTO dispatch_jobs
                 (id, account_id, recipient_id, state, run_at_ms, lease_until_ms, finished_at_ms, created_at_ms, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.account_id)
        .bind(&job.recipient_id)
        .bind(job.state.as_str())
        .bind(job.run_at_ms as i64)
        .bind(job.lease_until_ms.map(|v| v as i64))
        .bind(job.finished_at_ms.map(|v| v as i64))
        .bind(job.created_at_ms as i64)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job)?;
        let result = sqlx::query(
            "UPDATE dispatch_jobs
             SET state = ?, run_at_ms = ?, lease_until_ms = ?, finished_at_ms = ?, data = ?
             WHERE id = ?",
        )
        .bind(job.state.as_str())
        .bind(job.run_at_ms as i64)
        .bind(job.lease_until_ms.map(|v| v as i64))
        .bind(job.finished_at_ms.map(|v| v as i64))
        .bind(&data)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::job_not_found(&job.id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT id, data FROM dispatch_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, data FROM dispatch_jobs
             WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR account_id = ?2)
             ORDER BY created_at_ms DESC
             LIMIT ?3",
        )
        .bind(filter.state.map(JobState::as_str))
        .bind(filter.account_id.as_deref())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(rows)
    }

    async fn claim_due(&self, now_ms: u64, lease_until_ms: u64) -> Result<Option<Job>> {
        let row = sqlx::query(
            "UPDATE dispatch_jobs
             SET state = 'in_flight',
                 lease_until_ms = ?1,
                 data = json_set(data, '$.state', 'in_flight', '$.leaseUntilMs', ?1, '$.updatedAtMs', ?2)
             WHERE id = (
                 SELECT id FROM dispatch_jobs
                 WHERE state IN ('queued', 'requeued') AND run_at_ms <= ?2
                 ORDER BY run_at_ms, created_at_ms
                 LIMIT 1
             )
             RETURNING id, data",
        )
        .bind(lease_until_ms as i64)
        .bind(now_ms as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn next_due_at(&self) -> Result<Option<u64>> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(run_at_ms) FROM dispatch_jobs WHERE state IN ('queued', 'requeued')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next.map(|v| v as u64))
    }

    async fn recover_stalled(&self, now_ms: u64) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE dispatch_jobs
             SET state = 'queued',
                 lease_until_ms = NULL,
                 run_at_ms = ?1,
                 data = json_remove(
                     json_set(data, '$.state', 'queued', '$.runAtMs', ?1, '$.updatedAtMs', ?1),
                     '$.leaseUntilMs'
                 )
             WHERE state = 'in_flight' AND lease_until_ms < ?1",
        )
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge(&self, retention: &RetentionPolicy, now_ms: u64) -> Result<usize> {
        let completed_cutoff = now_ms.saturating_sub(retention.completed_max_age_ms) as i64;
        let failed_cutoff = now_ms.saturating_sub(retention.failed_max_age_ms) as i64;

        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        removed += sqlx::query(
            "DELETE FROM dispatch_jobs WHERE state = 'completed' AND finished_at_ms < ?",
        )
        .bind(completed_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        removed += sqlx::query(
            "DELETE FROM dispatch_jobs WHERE state = 'failed' AND finished_at_ms < ?",
        )
        .bind(failed_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        removed += sqlx::query(
            "DELETE FROM dispatch_jobs
             WHERE state = 'completed' AND id NOT IN (
                 SELECT id FROM dispatch_jobs
                 WHERE state = 'completed'
                 ORDER BY finished_at_ms DESC
                 LIMIT ?
             )",
        )
        .bind(retention.completed_max_count as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(removed as usize)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{JobPayload, JobResult},
        chatrelay_common::types::OutboundMessage,
    };

    async fn make_store() -> SqliteJobStore {
        SqliteJobStore::new("sqlite::memory:", 1).await.unwrap()
    }

    fn make_job(now_ms: u64) -> Job {
        Job::new(
            "A",
            "123@c.us",
            JobPayload::Message(OutboundMessage::text("hola")),
            now_ms,
        )
    }

    #[tokio::test]
    async fn corrupt_rows_name_the_job() {
        let store = make_store().await;
        sqlx::query(
            "INSERT INTO dispatch_jobs
                 (id, account_id, recipient_id, state, run_at_ms, created_at_ms, data)
             VALUES ('broken', 'A', '1', 'queued', 0, 0, '{\"not\": \"a job\"}')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get("broken").await.unwrap_err();
        assert!(err.to_string().starts_with("corrupt job data for broken: "), "{err}");
        assert!(store.list(&JobFilter::default(), 10).await.is_err());
    }

    #[tokio::test]
    async fn insert_get_roundtrip() {
        let store = make_store().await;
        let job = make_job(10);
        store.insert(&job).await.unwrap();
        assert_eq!(store.get(&job.id).await.unwrap(), Some(job));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_updates_columns_and_json() {
        let store = make_store().await;
        let job = make_job(10);
        store.insert(&job).await.unwrap();

        assert!(store.claim_due(5, 100).await.unwrap().is_none());
        let claimed = store.claim_due(10, 100).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::InFlight);
        assert_eq!(claimed.lease_until_ms, Some(100));
        assert!(store.claim_due(10, 100).await.unwrap().is_none());

        let listed = store
            .list(&JobFilter::state(JobState::InFlight), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn update_persists_transitions() {
        let store = make_store().await;
        let mut job = make_job(0);
        store.insert(&job).await.unwrap();

        job.requeue(2_000, 1);
        store.update(&job).await.unwrap();
        assert_eq!(store.next_due_at().await.unwrap(), Some(2_000));

        job.complete(
            JobResult {
                delivered_ids: vec!["m1".into()],
            },
            3_000,
        );
        store.update(&job).await.unwrap();
        assert_eq!(store.next_due_at().await.unwrap(), None);
        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.result.unwrap().delivered_ids, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let store = make_store().await;
        let err = store.update(&make_job(0)).await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn recover_stalled_requeues_expired_leases() {
        let store = make_store().await;
        let job = make_job(0);
        store.insert(&job).await.unwrap();
        store.claim_due(0, 50).await.unwrap().unwrap();

        assert_eq!(store.recover_stalled(50).await.unwrap(), 0);
        assert_eq!(store.recover_stalled(51).await.unwrap(), 1);
        let back = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(back.state, JobState::Queued);
        assert!(back.lease_until_ms.is_none());
        assert_eq!(back.run_at_ms, 51);
    }

    #[tokio::test]
    async fn purge_keeps_newest_completed() {
        let store = make_store().await;
        for finished in [1_000u64, 2_000, 3_000] {
            let mut job = make_job(0);
            job.complete(JobResult::default(), finished);
            store.insert(&job).await.unwrap();
        }
        let retention = RetentionPolicy {
            completed_max_age_ms: 60_000,
            completed_max_count: 1,
            failed_max_age_ms: 60_000,
        };
        assert_eq!(store.purge(&retention, 4_000).await.unwrap(), 2);
        let left = store.list(&JobFilter::default(), 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].finished_at_ms, Some(3_000));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let job = make_job(0);
        {
            let store = SqliteJobStore::new(&url, 2).await.unwrap();
            store.insert(&job).await.unwrap();
        }
        let store = SqliteJobStore::new(&url, 2).await.unwrap();
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().id, job.id);
    }
}
