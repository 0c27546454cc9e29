use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Serializes calls into the generation API.
///
/// Waiters are served first come, first served (tokio's semaphore is fair) and
/// suspend instead of failing.
#[derive(Debug, Clone)]
pub struct SingleFlight {
    inner: Arc<FlightInner>,
}

#[derive(Debug)]
struct FlightInner {
    permit: Arc<Semaphore>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Held while a call is in flight; dropping it admits the next waiter.
#[derive(Debug)]
pub struct FlightGuard {
    inner: Arc<FlightInner>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlightStatus {
    pub in_flight: bool,
    pub queued: usize,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FlightInner {
                permit: Arc::new(Semaphore::new(1)),
                queued: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for the lock. Fails only if the semaphore was closed, which
    /// nothing in this crate does.
    pub async fn acquire(&self) -> Result<FlightGuard, AcquireError> {
        let waiting = Waiting::enter(&self.inner.queued);
        let permit = self.inner.permit.clone().acquire_owned().await?;
        drop(waiting);
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(FlightGuard {
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    pub fn status(&self) -> FlightStatus {
        FlightStatus {
            in_flight: self.inner.in_flight.load(Ordering::SeqCst) > 0,
            queued: self.inner.queued.load(Ordering::SeqCst),
        }
    }
}

/// Counts a caller as queued until it is admitted or gives up.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::SingleFlight;

    #[tokio::test]
    async fn waiters_are_admitted_in_arrival_order() -> anyhow::Result<()> {
        let flight = SingleFlight::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = flight.acquire().await?;

        let mut handles = Vec::new();
        for idx in 0..4 {
            let flight = flight.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                if let Ok(_guard) = flight.acquire().await {
                    order.lock().await.push(idx);
                }
            }));
            // Let each waiter enqueue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = flight.status();
        assert!(status.in_flight);
        assert_eq!(status.queued, 4);

        drop(first);
        for handle in handles {
            handle.await?;
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
        assert!(!flight.status().in_flight);
        assert_eq!(flight.status().queued, 0);
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_waiters_leave_the_queue() -> anyhow::Result<()> {
        let flight = SingleFlight::new();
        let _held = flight.acquire().await?;
        let waiter = tokio::time::timeout(Duration::from_millis(20), flight.acquire()).await;
        assert!(waiter.is_err());
        assert_eq!(flight.status().queued, 0);
        Ok(())
    }
}
