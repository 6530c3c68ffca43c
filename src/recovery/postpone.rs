//! Postponed-function container.
//!
//! Executors enqueue non-essential rewiring work (detaching lost replicas,
//! reparenting binlog-server descendants, relocating subtrees under a
//! better candidate) here instead of running it in the critical promotion
//! window. The dispatcher drains the container sequentially after
//! resolution, so the cluster regains a writable master as quickly as
//! possible while every enqueued function still runs exactly once before
//! the dispatch returns.

use crate::error::RecoveryError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, warn};

/// A deferred unit of rewiring work.
pub type PostponedFn = BoxFuture<'static, crate::error::Result<()>>;

struct PostponedEntry {
    description: String,
    func: PostponedFn,
}

/// Thread-safe append-only list of deferred functions with descriptions.
#[derive(Default)]
pub struct PostponedFunctions {
    entries: Mutex<Vec<PostponedEntry>>,
    /// Descriptions survive draining, for the audit trail.
    executed: Mutex<Vec<String>>,
}

impl PostponedFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a function. Never blocks on execution.
    pub fn add(&self, description: impl Into<String>, func: PostponedFn) {
        let description = description.into();
        debug!(description = %description, "Postponing function");
        self.entries.lock().push(PostponedEntry { description, func });
    }

    /// Number of functions still pending.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Descriptions of functions executed so far.
    pub fn executed_descriptions(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Run all pending functions sequentially, in insertion order.
    /// Failures are logged and collected; they never abort the drain.
    /// Functions added while draining are picked up as well.
    pub async fn drain(&self) -> Vec<(String, RecoveryError)> {
        let mut failures = Vec::new();
        loop {
            let batch: Vec<PostponedEntry> = std::mem::take(&mut *self.entries.lock());
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                debug!(description = %entry.description, "Executing postponed function");
                if let Err(e) = entry.func.await {
                    warn!(description = %entry.description, error = %e, "Postponed function failed");
                    failures.push((entry.description.clone(), e));
                }
                self.executed.lock().push(entry.description);
            }
        }
        failures
    }
}

impl fmt::Debug for PostponedFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostponedFunctions")
            .field("pending", &self.len())
            .field("executed", &self.executed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drain_runs_each_exactly_once() {
        let container = PostponedFunctions::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let counter = Arc::clone(&counter);
            container.add(format!("bump {}", i), Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        assert_eq!(container.len(), 3);
        let failures = container.drain().await;
        assert!(failures.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(container.len(), 0);
        assert_eq!(container.executed_descriptions().len(), 3);

        // Second drain is a no-op
        container.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drain_collects_failures_without_aborting() {
        let container = PostponedFunctions::new();
        let ran_after_failure = Arc::new(AtomicUsize::new(0));

        container.add("failing", Box::pin(async {
            Err(RecoveryError::Internal("boom".into()))
        }));
        let flag = Arc::clone(&ran_after_failure);
        container.add("following", Box::pin(async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let failures = container.drain().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "failing");
        assert_eq!(ran_after_failure.load(Ordering::SeqCst), 1);
    }
}
