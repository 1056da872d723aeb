//! Batch bookkeeping and the bounded worker pool used for independent
//! engine calls.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::warn;

use crate::config::CancelToken;
use crate::error::Error;
use crate::types::Step;

/// An engine call that did not succeed. The node kept its previous status
/// and the same step can be retried.
#[derive(Debug)]
pub struct Failure {
    pub node: String,
    pub step: Step,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Successful steps in the order they were applied.
    pub completed: Vec<(String, Step)>,
    pub failures: Vec<Failure>,
    /// Set when the batch stopped early on a cancellation request.
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn completed_steps(&self, step: Step) -> Vec<&str> {
        self.completed
            .iter()
            .filter(|(_, s)| *s == step)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn failed(&self, node: &str) -> bool {
        self.failures.iter().any(|f| f.node == node)
    }

    pub(crate) fn record_success(&mut self, node: impl Into<String>, step: Step) {
        self.completed.push((node.into(), step));
    }

    pub(crate) fn record_failure(&mut self, node: impl Into<String>, step: Step, error: Error) {
        let node = node.into();
        warn!(node = %node, step = %step, error = %error, "Step failed");
        self.failures.push(Failure { node, step, error });
    }

    pub(crate) fn merge(&mut self, other: BatchReport) {
        self.completed.extend(other.completed);
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }
}

/// Runs `f` over `jobs` with at most `workers` threads and returns every
/// dispatched job with its result, in job order. Jobs not yet dispatched when
/// `cancel` fires are dropped from the output.
pub(crate) fn run_pool<T, R, F>(
    jobs: Vec<T>,
    workers: usize,
    cancel: &CancelToken,
    f: F,
) -> Vec<(T, R)>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if workers <= 1 || jobs.len() <= 1 {
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }
            let result = f(&job);
            out.push((job, result));
        }
        return out;
    }

    let cursor = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::with_capacity(jobs.len()));

    thread::scope(|scope| {
        for _ in 0..workers.min(jobs.len()) {
            scope.spawn(|| loop {
                if cancel.is_cancelled() {
                    break;
                }
                let i = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(job) = jobs.get(i) else { break };
                let result = f(job);
                results.lock().push((i, result));
            });
        }
    });

    let mut results = results.into_inner();
    results.sort_by_key(|(i, _)| *i);

    let mut slots: Vec<Option<T>> = jobs.into_iter().map(Some).collect();
    results
        .into_iter()
        .filter_map(|(i, r)| slots[i].take().map(|job| (job, r)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_preserves_job_order() {
        let jobs: Vec<u32> = (0..50).collect();
        let out = run_pool(jobs, 4, &CancelToken::new(), |n| n * 2);
        assert_eq!(out.len(), 50);
        assert!(out.iter().enumerate().all(|(i, (j, r))| *j == i as u32 && *r == j * 2));
    }

    #[test]
    fn test_pool_stops_on_cancel() {
        let cancel = CancelToken::new();
        let out = run_pool(vec![1, 2, 3], 1, &cancel, |n| {
            if *n == 2 {
                cancel.cancel();
            }
            *n
        });
        assert_eq!(out, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn test_pool_cancelled_up_front() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = run_pool(vec![1, 2, 3], 3, &cancel, |n| *n);
        assert!(out.is_empty());
    }
}
