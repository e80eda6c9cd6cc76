use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Epoch-millisecond time source for persisted timestamps, lock expiries and
/// slot leases.
///
/// Production code reads wall time on every call, so processes sharing one
/// database agree on expiries even after a suspend or an NTP step. Tests
/// running on paused tokio time use [`Clock::tokio`] instead.
#[derive(Debug, Clone, Copy, Default)]
pub enum Clock {
    #[default]
    System,
    /// Anchored to wall time once, then driven by `tokio::time::Instant`.
    Tokio { base_ms: u64, base: Instant },
}

impl Clock {
    #[must_use]
    pub fn system() -> Self {
        Self::System
    }

    /// Follows the tokio clock, including `tokio::time::pause` and `advance`.
    #[must_use]
    pub fn tokio() -> Self {
        Self::Tokio {
            base_ms: wall_ms(),
            base: Instant::now(),
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        match self {
            Self::System => wall_ms(),
            Self::Tokio { base_ms, base } => base_ms + base.elapsed().as_millis() as u64,
        }
    }
}

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = Clock::tokio();
        let start = clock.now_ms();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now_ms() - start, 90_000);
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_reads_wall_time() {
        let clock = Clock::system();
        let before = wall_ms();
        tokio::time::advance(Duration::from_secs(3_600)).await;
        let now = clock.now_ms();
        // Paused tokio time does not move the wall clock.
        assert!(now >= before);
        assert!(now < before + 3_600_000);
    }
}
