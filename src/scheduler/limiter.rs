//! Concurrency limiter for external call attempts.
//!
//! Caps the number of call attempts in flight across all workers. A permit is
//! acquired right before an attempt and released when the attempt resolves,
//! whether it succeeded, failed or timed out. Permits are never held across a
//! retry backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::metrics::MetricsCollector;

/// Errors that can occur while acquiring a permit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// The underlying semaphore was closed.
    #[error("Concurrency limiter closed")]
    Closed,
}

#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Caps simultaneously executing external calls.
///
/// No ordering is guaranteed among waiting acquirers.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// Creates a limiter granting at most `limit` concurrent permits.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(InFlight::default()),
            limit,
        }
    }

    /// Waits until fewer than `limit` permits are outstanding, then grants one.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError::Closed` if the limiter was closed.
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;

        let current = self.in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.peak.fetch_max(current, Ordering::SeqCst);
        MetricsCollector::new().set_calls_in_flight(current);

        Ok(LimiterPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Closes the limiter; pending and future acquisitions fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Configured maximum number of concurrent permits.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current.load(Ordering::SeqCst)
    }

    /// Highest number of permits ever held at once.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }
}

/// Ownership token for one in-flight call attempt.
///
/// The permit is returned to the limiter when dropped.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<InFlight>,
}

impl LimiterPermit {
    /// Returns the permit to the limiter.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let current = self.in_flight.current.fetch_sub(1, Ordering::SeqCst) - 1;
        MetricsCollector::new().set_calls_in_flight(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        a.release();
        assert_eq!(limiter.in_flight(), 1);
        drop(b);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_at_limit() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(30), limiter.acquire()).await;
        assert!(waiting.is_err());

        held.release();
        let granted = tokio::time::timeout(Duration::from_millis(30), limiter.acquire()).await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_limit() {
        let limiter = ConcurrencyLimiter::new(3);
        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                assert!(limiter.in_flight() <= 3);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.peak_in_flight() <= 3);
        assert_eq!(limiter.limit(), 3);
    }

    #[tokio::test]
    async fn test_closed_limiter_fails() {
        let limiter = ConcurrencyLimiter::new(1);
        limiter.close();
        assert_eq!(limiter.acquire().await.unwrap_err(), LimiterError::Closed);
    }
}
