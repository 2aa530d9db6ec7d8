//! Bounded fan-out execution
//!
//! Runs a processor over a finite list of items with at most `concurrency`
//! items in flight. Every item runs to completion: one failure never cancels
//! or blocks its siblings, and all failures are joined into one error.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{Result, ThresholdError};

/// A unit of fan-out work
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Items to process
    fn items(&self) -> Vec<Self::Item>;

    /// Process one item
    async fn process(&self, item: Self::Item) -> Result<()>;
}

/// Process every item of `processor`, bounded by `concurrency`.
///
/// Waits for all items and returns the joined failures, if any.
pub async fn process_in_parallel<P: Processor>(processor: Arc<P>, concurrency: usize) -> Result<()> {
    let items = processor.items();
    if items.is_empty() {
        return Ok(());
    }

    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for item in items {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            unreachable!("fan-out semaphore is never closed");
        };
        let processor = processor.clone();
        tasks.spawn(async move {
            let result = processor.process(item).await;
            drop(permit);
            result
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(ThresholdError::TaskFailed(e.to_string())),
        }
    }

    debug!(items = total, failed = errors.len(), "Fan-out complete");
    ThresholdError::join(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording {
        items: Vec<usize>,
        failing: Vec<usize>,
        calls: Mutex<HashMap<usize, usize>>,
        side_effects: Mutex<Vec<usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Recording {
        fn new(items: Vec<usize>, failing: Vec<usize>) -> Self {
            Self {
                items,
                failing,
                calls: Mutex::new(HashMap::new()),
                side_effects: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Processor for Recording {
        type Item = usize;

        fn items(&self) -> Vec<usize> {
            self.items.clone()
        }

        async fn process(&self, item: usize) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            *self.calls.lock().unwrap().entry(item).or_insert(0) += 1;

            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&item) {
                return Err(ThresholdError::Search(format!("item {} failed", item)));
            }
            self.side_effects.lock().unwrap().push(item);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_fail_fast() {
        let p = Arc::new(Recording::new(vec![0, 1, 2, 3, 4], vec![1, 3]));

        let err = process_in_parallel(p.clone(), 3).await.unwrap_err();

        let calls = p.calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert!(calls.values().all(|&n| n == 1));

        match &err {
            ThresholdError::Aggregate(inner) => assert_eq!(inner.errors().len(), 2),
            other => panic!("expected aggregate error, got {:?}", other),
        }
        let msg = err.to_string();
        assert!(msg.contains("item 1 failed"));
        assert!(msg.contains("item 3 failed"));

        let mut done = p.side_effects.lock().unwrap().clone();
        done.sort();
        assert_eq!(done, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let p = Arc::new(Recording::new((0..20).collect(), vec![]));

        process_in_parallel(p.clone(), 4).await.unwrap();

        assert!(p.max_in_flight.load(Ordering::SeqCst) <= 4);
        assert_eq!(p.side_effects.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_empty_items_is_ok() {
        let p = Arc::new(Recording::new(vec![], vec![]));
        assert!(process_in_parallel(p, 3).await.is_ok());
    }
}
