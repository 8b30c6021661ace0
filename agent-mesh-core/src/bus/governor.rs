//! Bounded permit pool for blocking receive operations

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::warn;

use crate::config::GovernorConfig;

/// Limits how many `receive` calls may be suspended at once across the bus
///
/// This bounds simultaneously blocked consumers, not throughput; mailbox
/// capacity and consumer count are the real throughput limiters.
pub(crate) struct ConcurrencyGovernor {
    semaphore: Semaphore,
    ceiling: usize,
    wait_warn: Duration,
    ledger: Mutex<Ledger>,
}

#[derive(Debug, Default)]
struct Ledger {
    acquired: u64,
    released: u64,
    total_wait: Duration,
    max_wait: Duration,
    pressure_events: u64,
}

/// Point-in-time view of the concurrency ledger
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencySnapshot {
    pub ceiling: usize,
    pub acquired: u64,
    pub released: u64,
    /// `acquired - released`
    pub in_use: u64,
    pub total_wait_ms: f64,
    pub average_wait_ms: f64,
    pub max_wait_ms: f64,
    /// Acquisitions that waited longer than the pressure threshold
    pub pressure_events: u64,
    /// `in_use / ceiling` as a percentage
    pub utilization_pct: f64,
}

/// A held receive slot; the slot is returned when this guard drops
pub(crate) struct GovernorPermit<'a> {
    _permit: SemaphorePermit<'a>,
    governor: &'a ConcurrencyGovernor,
}

impl Drop for GovernorPermit<'_> {
    fn drop(&mut self) {
        // Counted before the semaphore permit itself is returned.
        self.governor.ledger.lock().released += 1;
    }
}

impl ConcurrencyGovernor {
    pub(crate) fn new(config: &GovernorConfig) -> Self {
        let ceiling = config
            .max_concurrent_receives
            .clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Semaphore::new(ceiling),
            ceiling,
            wait_warn: Duration::from_millis(config.wait_warn_ms),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Wait for a free slot
    pub(crate) async fn acquire(&self) -> crate::Result<GovernorPermit<'_>> {
        let started = Instant::now();
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| crate::Error::Internal("concurrency governor closed".to_string()))?;
        let waited = started.elapsed();

        let pressure = waited > self.wait_warn;
        {
            let mut ledger = self.ledger.lock();
            ledger.acquired += 1;
            ledger.total_wait += waited;
            ledger.max_wait = ledger.max_wait.max(waited);
            if pressure {
                ledger.pressure_events += 1;
            }
        }
        if pressure {
            warn!(
                waited_ms = waited.as_millis() as u64,
                ceiling = self.ceiling,
                "Concurrency pressure: receive waited for a governor permit"
            );
        }

        Ok(GovernorPermit {
            _permit: permit,
            governor: self,
        })
    }

    /// Fraction of permits currently held, in [0, 1]
    pub(crate) fn utilization(&self) -> f64 {
        let ledger = self.ledger.lock();
        (ledger.acquired - ledger.released) as f64 / self.ceiling as f64
    }

    pub(crate) fn snapshot(&self) -> ConcurrencySnapshot {
        let ledger = self.ledger.lock();
        let in_use = ledger.acquired - ledger.released;
        let average_wait_ms = if ledger.acquired == 0 {
            0.0
        } else {
            duration_ms(ledger.total_wait) / ledger.acquired as f64
        };
        ConcurrencySnapshot {
            ceiling: self.ceiling,
            acquired: ledger.acquired,
            released: ledger.released,
            in_use,
            total_wait_ms: duration_ms(ledger.total_wait),
            average_wait_ms,
            max_wait_ms: duration_ms(ledger.max_wait),
            pressure_events: ledger.pressure_events,
            utilization_pct: in_use as f64 / self.ceiling as f64 * 100.0,
        }
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(ceiling: usize, wait_warn_ms: u64) -> ConcurrencyGovernor {
        ConcurrencyGovernor::new(&GovernorConfig {
            max_concurrent_receives: ceiling,
            wait_warn_ms,
        })
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let governor = governor(2, 100);
        {
            let _a = governor.acquire().await.unwrap();
            let _b = governor.acquire().await.unwrap();
            let snapshot = governor.snapshot();
            assert_eq!(snapshot.in_use, 2);
            assert!((snapshot.utilization_pct - 100.0).abs() < f64::EPSILON);
        }
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.acquired, 2);
        assert_eq!(snapshot.released, 2);
        assert_eq!(snapshot.in_use, 0);
    }

    #[tokio::test]
    async fn test_ceiling_blocks_extra_acquire() {
        let governor = governor(1, 100);
        let held = governor.acquire().await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(30), governor.acquire()).await;
        assert!(blocked.is_err());

        drop(held);
        let _again = governor.acquire().await.unwrap();
        assert_eq!(governor.snapshot().in_use, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ledger_stays_within_ceiling_under_contention() {
        let governor = Arc::new(governor(3, 1000));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let governor = Arc::clone(&governor);
            tasks.push(tokio::spawn(async move {
                let _permit = governor.acquire().await.unwrap();
                let in_use = governor.snapshot().in_use;
                assert!(in_use <= 3, "in_use {} exceeded ceiling", in_use);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.acquired, 32);
        assert_eq!(snapshot.released, 32);
    }

    #[tokio::test]
    async fn test_slow_acquire_counts_as_pressure() {
        let governor = Arc::new(governor(1, 10));
        let held = governor.acquire().await.unwrap();

        let waiter = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move {
                let _permit = governor.acquire().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(held);
        waiter.await.unwrap();

        let snapshot = governor.snapshot();
        assert_eq!(snapshot.pressure_events, 1);
        assert!(snapshot.max_wait_ms >= 10.0);
    }
}
