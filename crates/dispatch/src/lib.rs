//! Durable outbound dispatch for the chat relay.
//!
//! Producers enqueue jobs through [`DispatchQueue`]; a [`Dispatcher`] pool
//! claims them, waits for a per-account concurrency slot, takes the per-chat
//! lock and hands the messages to a [`chatrelay_transport::MessageTransport`].
//! Failed attempts are retried with exponential backoff and end up as dead
//! letters once the attempt budget is spent.
//!
//! Jobs, locks and slots can live in process memory or in SQLite; the SQLite
//! variants let several relay processes share one queue.

pub(crate) mod batch;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod pacing;
pub mod queue;
pub mod retry;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod throttle;
pub mod types;

pub use {
    clock::Clock,
    dispatcher::{Dispatcher, DispatcherOptions, SweepReport},
    error::{Error, Result},
    lock::{InMemoryLockManager, LockManager, SqliteLockManager},
    queue::DispatchQueue,
    retry::{RetryDecision, RetryPolicy},
    store::JobStore,
    store_memory::InMemoryJobStore,
    store_sqlite::SqliteJobStore,
    throttle::{ConcurrencyThrottle, InMemoryThrottle, SqliteThrottle},
    types::{
        DispatchEvent, EventFn, Job, JobFailure, JobFilter, JobPayload, JobResult, JobState,
        RequeueReason, RetentionPolicy,
    },
};

/// Run database migrations for the dispatch tables.
///
/// Creates the jobs, locks and slots tables. Call once at startup before
/// building any SQLite-backed component.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
