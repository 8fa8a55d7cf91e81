use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use socialfeed_common::Result;
use tokio::sync::OnceCell;

/// Deduplicates concurrent work per key. The first caller runs the future,
/// everyone arriving while it runs awaits the same result (errors included).
/// The slot is cleared once the work completes, so later calls start fresh.
pub struct SingleFlight<T> {
    in_flight: DashMap<String, Arc<OnceCell<Result<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell.get_or_init(work).await.clone();

        // A newer flight may already own the slot.
        self.in_flight.remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
        result
    }

    /// Number of keys with work in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use socialfeed_common::FeedError;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("page", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_and_not_remembered() {
        let flight = SingleFlight::<u32>::new();

        let err = flight
            .run("k", || async { Err(FeedError::Transient("down".into())) })
            .await;
        assert!(matches!(err, Err(FeedError::Transient(_))));

        let ok = flight.run("k", || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
    }
}
