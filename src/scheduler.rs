//! Bounded task scheduler.
//!
//! Runs a batch of independent async tasks with at most `concurrency` in
//! flight. Excess tasks wait in submission order. One task failing never
//! affects another; every task's outcome comes back, in submission order.

use std::future::Future;

use futures::stream::{self, StreamExt};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("concurrency must be >= 1 (got {0})")]
    InvalidConcurrency(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct BoundedScheduler {
    concurrency: usize,
}

impl BoundedScheduler {
    pub fn new(concurrency: usize) -> Result<Self, SchedulerError> {
        if concurrency == 0 {
            return Err(SchedulerError::InvalidConcurrency(concurrency));
        }
        Ok(Self { concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every factory and return its outcome at the factory's index.
    ///
    /// Factories are invoked lazily, in order, as slots free up, so the
    /// n-th task never starts before the (n-1)-th.
    pub async fn run<I, F, Fut, T, E>(&self, factories: I) -> Vec<Result<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut indexed: Vec<(usize, Result<T, E>)> = stream::iter(factories.into_iter().enumerate())
            .map(|(idx, factory)| async move { (idx, factory().await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn zero_concurrency_is_rejected() {
        assert_eq!(
            BoundedScheduler::new(0).unwrap_err(),
            SchedulerError::InvalidConcurrency(0)
        );
    }

    #[tokio::test]
    async fn failure_is_isolated_to_its_task() {
        let scheduler = BoundedScheduler::new(2).unwrap();
        let factories = (1..=5).map(|n| move || async move {
            tokio::time::sleep(Duration::from_millis(5 * (6 - n) as u64)).await;
            if n == 3 {
                Err(format!("task {n} failed"))
            } else {
                Ok(n)
            }
        });

        let outcomes = scheduler.run(factories).await;
        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes[0], Ok(1));
        assert_eq!(outcomes[1], Ok(2));
        assert_eq!(outcomes[2], Err("task 3 failed".to_string()));
        assert_eq!(outcomes[3], Ok(4));
        assert_eq!(outcomes[4], Ok(5));
    }

    #[tokio::test]
    async fn never_exceeds_ceiling() {
        let scheduler = BoundedScheduler::new(3).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let factories = (0..12).map(|_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            move || async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ()>(())
            }
        });

        let outcomes = scheduler.run(factories).await;
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn starts_in_submission_order() {
        let scheduler = BoundedScheduler::new(1).unwrap();
        let started = Arc::new(Mutex::new(Vec::new()));

        let factories = (0..4).map(|n| {
            let started = started.clone();
            move || async move {
                started.lock().unwrap().push(n);
                Ok::<_, ()>(n)
            }
        });

        scheduler.run(factories).await;
        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_batch_returns_nothing() {
        let scheduler = BoundedScheduler::new(4).unwrap();
        let factories: Vec<fn() -> std::future::Ready<Result<(), ()>>> = Vec::new();
        assert!(scheduler.run(factories).await.is_empty());
    }
}
