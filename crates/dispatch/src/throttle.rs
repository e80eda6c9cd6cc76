//! Per-account concurrency ceiling.
//!
//! Slots are keyed by holder so a release is counted at most once. Every
//! slot has a lease, so a crashed or aborted job cannot keep an account
//! saturated forever.

use std::{collections::HashMap, time::Duration};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    sqlx::SqlitePool,
    tokio::time::Instant,
};

use crate::{Result, clock::Clock};

#[async_trait]
pub trait ConcurrencyThrottle: Send + Sync {
    /// Maximum simultaneous jobs per account.
    fn ceiling(&self) -> u32;

    async fn in_flight(&self, account_id: &str) -> Result<u32>;

    /// Whether a slot is free right now. Never takes one.
    async fn try_admit(&self, account_id: &str) -> Result<bool> {
        Ok(self.in_flight(account_id).await? < self.ceiling())
    }

    /// Take a slot if one is still free. The check and the increment are atomic.
    async fn try_acquire(&self, account_id: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Extend the lease of a slot `holder` owns.
    async fn refresh(&self, account_id: &str, holder: &str, lease: Duration) -> Result<()>;

    /// Give the slot back. Unknown holders are ignored, so the count never goes negative.
    async fn release(&self, account_id: &str, holder: &str) -> Result<()>;
}

/// Process-local throttle.
///
/// Slots carry the same lease as the SQLite ones, so a job aborted at
/// shutdown cannot keep the account saturated for the next dispatcher.
pub struct InMemoryThrottle {
    ceiling: u32,
    slots: DashMap<String, HashMap<String, Instant>>,
}

impl InMemoryThrottle {
    #[must_use]
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            slots: DashMap::new(),
        }
    }
}

#[async_trait]
impl ConcurrencyThrottle for InMemoryThrottle {
    fn ceiling(&self) -> u32 {
        self.ceiling
    }

    async fn in_flight(&self, account_id: &str) -> Result<u32> {
        let now = Instant::now();
        Ok(self.slots.get(account_id).map_or(0, |held| {
            held.values().filter(|expires| **expires > now).count() as u32
        }))
    }

    async fn try_acquire(&self, account_id: &str, holder: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut held = self.slots.entry(account_id.to_string()).or_default();
        held.retain(|_, expires| *expires > now);
        if let Some(expires) = held.get_mut(holder) {
            *expires = now + lease;
            return Ok(true);
        }
        if (held.len() as u32) < self.ceiling {
            held.insert(holder.to_string(), now + lease);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn refresh(&self, account_id: &str, holder: &str, lease: Duration) -> Result<()> {
        if let Some(mut held) = self.slots.get_mut(account_id)
            && let Some(expires) = held.get_mut(holder)
        {
            *expires = Instant::now() + lease;
        }
        Ok(())
    }

    async fn release(&self, account_id: &str, holder: &str) -> Result<()> {
        if let Some(mut held) = self.slots.get_mut(account_id) {
            held.remove(holder);
        }
        self.slots.remove_if(account_id, |_, held| held.is_empty());
        Ok(())
    }
}

/// Slot rows in the job database, shared by every dispatcher process.
pub struct SqliteThrottle {
    pool: SqlitePool,
    ceiling: u32,
    clock: Clock,
}

impl SqliteThrottle {
    /// Migrations must already be run on `pool`.
    pub fn new(pool: SqlitePool, ceiling: u32) -> Self {
        Self {
            pool,
            ceiling,
            clock: Clock::system(),
        }
    }

    /// Time source for slot leases; every process sharing the pool should agree on it.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl ConcurrencyThrottle for SqliteThrottle {
    fn ceiling(&self) -> u32 {
        self.ceiling
    }

    async fn in_flight(&self, account_id: &str) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dispatch_slots WHERE account_id = ? AND expires_at_ms > ?",
        )
        .bind(account_id)
        .bind(self.clock.now_ms() as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn try_acquire(&self, account_id: &str, holder: &str, lease: Duration) -> Result<bool> {
        let now = self.clock.now_ms() as i64;
        sqlx::query("DELETE FROM dispatch_slots WHERE account_id = ? AND expires_at_ms <= ?")
            .bind(account_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        // Count and insert in one statement so two processes cannot both take the last slot.
        let result = sqlx::query(
            "INSERT INTO dispatch_slots (account_id, holder, expires_at_ms)
             SELECT ?1, ?2, ?3
             WHERE (SELECT COUNT(*) FROM dispatch_slots WHERE account_id = ?1) < ?4
             ON CONFLICT (account_id, holder) DO NOTHING",
        )
        .bind(account_id)
        .bind(holder)
        .bind(now + lease.as_millis() as i64)
        .bind(i64::from(self.ceiling))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refresh(&self, account_id: &str, holder: &str, lease: Duration) -> Result<()> {
        sqlx::query("UPDATE dispatch_slots SET expires_at_ms = ? WHERE account_id = ? AND holder = ?")
            .bind(self.clock.now_ms() as i64 + lease.as_millis() as i64)
            .bind(account_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, account_id: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM dispatch_slots WHERE account_id = ? AND holder = ?")
            .bind(account_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// How long to wait for the next admission check.
pub(crate) fn next_poll(poll: Duration, deadline: Instant, now: Instant) -> Option<Duration> {
    if now >= deadline {
        None
    } else {
        Some(poll.min(deadline - now))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    const LEASE: Duration = Duration::from_secs(120);

    async fn sqlite_throttle(ceiling: u32) -> SqliteThrottle {
        let pool = crate::store_sqlite::connect("sqlite::memory:", 1).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        SqliteThrottle::new(pool, ceiling)
    }

    async fn exercise_ceiling(throttle: &dyn ConcurrencyThrottle) {
        assert!(throttle.try_admit("A").await.unwrap());
        assert!(throttle.try_acquire("A", "j1", LEASE).await.unwrap());
        assert!(throttle.try_acquire("A", "j2", LEASE).await.unwrap());
        assert_eq!(throttle.in_flight("A").await.unwrap(), 2);

        // Peeking never takes a slot.
        assert!(!throttle.try_admit("A").await.unwrap());
        assert!(!throttle.try_admit("A").await.unwrap());
        assert!(!throttle.try_acquire("A", "j3", LEASE).await.unwrap());
        assert!(throttle.try_admit("B").await.unwrap());

        throttle.release("A", "j1").await.unwrap();
        throttle.release("A", "j1").await.unwrap();
        throttle.release("A", "never-held").await.unwrap();
        assert_eq!(throttle.in_flight("A").await.unwrap(), 1);
        assert!(throttle.try_acquire("A", "j3", LEASE).await.unwrap());

        throttle.release("A", "j2").await.unwrap();
        throttle.release("A", "j3").await.unwrap();
        assert_eq!(throttle.in_flight("A").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_throttle_enforces_ceiling() {
        exercise_ceiling(&InMemoryThrottle::new(2)).await;
    }

    #[tokio::test]
    async fn sqlite_throttle_enforces_ceiling() {
        exercise_ceiling(&sqlite_throttle(2).await).await;
    }

    #[tokio::test(start_paused = true)]
    async fn memory_slots_expire_with_their_lease() {
        let throttle = InMemoryThrottle::new(1);
        assert!(throttle.try_acquire("A", "aborted", LEASE).await.unwrap());
        assert!(!throttle.try_acquire("A", "next", LEASE).await.unwrap());

        tokio::time::advance(Duration::from_secs(60)).await;
        throttle.refresh("A", "aborted", LEASE).await.unwrap();
        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(throttle.in_flight("A").await.unwrap(), 1);
        assert!(!throttle.try_acquire("A", "next", LEASE).await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(throttle.in_flight("A").await.unwrap(), 0);
        assert!(throttle.try_acquire("A", "next", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_slots_expire_with_their_lease() {
        let throttle = sqlite_throttle(1).await;
        assert!(throttle.try_acquire("A", "crashed", Duration::ZERO).await.unwrap());
        assert_eq!(throttle.in_flight("A").await.unwrap(), 0);
        assert!(throttle.try_acquire("A", "next", LEASE).await.unwrap());
        assert!(!throttle.try_acquire("A", "other", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquire_never_exceeds_ceiling() {
        let throttle = Arc::new(InMemoryThrottle::new(2));
        let mut handles = Vec::new();
        for i in 0..20 {
            let throttle = Arc::clone(&throttle);
            handles.push(tokio::spawn(async move {
                throttle
                    .try_acquire("A", &format!("j{i}"), LEASE)
                    .await
                    .unwrap()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(throttle.in_flight("A").await.unwrap(), 2);
    }

    #[test]
    fn next_poll_is_capped_by_deadline() {
        let now = Instant::now();
        let poll = Duration::from_millis(5_000);
        assert_eq!(
            next_poll(poll, now + Duration::from_millis(1_200), now),
            Some(Duration::from_millis(1_200))
        );
        assert_eq!(next_poll(poll, now + Duration::from_secs(60), now), Some(poll));
        assert_eq!(next_poll(poll, now, now), None);
    }
}
