//! Per-chat exclusive locks with TTL expiry.
//!
//! At most one holder per `(account, recipient)`. A lock that is never
//! released (crashed worker) disappears once its TTL runs out, so the TTL has
//! to outlive the slowest send.

use std::time::Duration;

use {
    async_trait::async_trait,
    dashmap::{DashMap, mapref::entry::Entry},
    sqlx::SqlitePool,
    tokio::time::Instant,
    tracing::debug,
};

use crate::{Result, clock::Clock};

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Create the lock if absent (or expired). `false` when someone else holds it.
    async fn acquire(
        &self,
        account_id: &str,
        recipient_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Push out the expiry of a lock `holder` still owns. `false` if it was lost.
    async fn refresh(
        &self,
        account_id: &str,
        recipient_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Remove the lock if `holder` owns it. Releasing an absent lock is a no-op.
    async fn release(&self, account_id: &str, recipient_id: &str, holder: &str) -> Result<()>;
}

struct Held {
    holder: String,
    expires_at: Instant,
}

/// Process-local lock table.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: DashMap<(String, String), Held>,
}

impl InMemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live lock exists for the chat.
    #[must_use]
    pub fn is_locked(&self, account_id: &str, recipient_id: &str) -> bool {
        self.locks
            .get(&(account_id.to_string(), recipient_id.to_string()))
            .is_some_and(|held| held.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        account_id: &str,
        recipient_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let fresh = Held {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };
        match self
            .locks
            .entry((account_id.to_string(), recipient_id.to_string()))
        {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at <= now {
                    debug!(account_id, recipient_id, stale = %entry.get().holder, "taking over expired lock");
                    entry.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(true)
            },
        }
    }

    async fn refresh(
        &self,
        account_id: &str,
        recipient_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        match self
            .locks
            .get_mut(&(account_id.to_string(), recipient_id.to_string()))
        {
            Some(mut held) if held.holder == holder && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release(&self, account_id: &str, recipient_id: &str, holder: &str) -> Result<()> {
        self.locks
            .remove_if(&(account_id.to_string(), recipient_id.to_string()), |_, held| {
                held.holder == holder
            });
        Ok(())
    }
}

/// Locks stored in the job database so several dispatcher processes agree.
pub struct SqliteLockManager {
    pool: SqlitePool,
    clock: Clock,
}

impl SqliteLockManager {
    /// Migrations must already be run on `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Clock::system(),
        }
    }

    /// Time source for expiries; every process sharing the pool should agree on it.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl LockManager for SqliteLockManager {
    async fn acquire(
        &self,
        account_id: &str,
        recipient_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now_ms() as i64;
        let expires_at = now + ttl.as_millis() as i64;
        // The upsert only overwrites an expired row, so a live lock blocks it.
        let result = sqlx::query(
            "INSERT INTO dispatch_locks (account_id, recipient_id, holder, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (account_id, recipient_id) DO UPDATE
                 SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms
                 WHERE dispatch_locks.expires_at_ms <= ?5",
        )
        .bind(account_id)
        .bind(recipient_id)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refresh(
        &self,
        account_id: &str,
        recipient_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now_ms() as i64;
        let result = sqlx::query(
            "UPDATE dispatch_locks SET expires_at_ms = ?
             WHERE account_id = ? AND recipient_id = ? AND holder = ? AND expires_at_ms > ?",
        )
        .bind(now + ttl.as_millis() as i64)
        .bind(account_id)
        .bind(recipient_id)
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, account_id: &str, recipient_id: &str, holder: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM dispatch_locks WHERE account_id = ? AND recipient_id = ? AND holder = ?",
        )
        .bind(account_id)
        .bind(recipient_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
