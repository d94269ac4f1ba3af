use futures::future::join_all;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs work items in batches of at most `n_requests` concurrent operations,
/// sleeping `cooldown` between batches.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitedDispatcher {
    n_requests: usize,
    cooldown: Duration,
}

/// Per-item outcomes plus the size of every batch that was dispatched.
#[derive(Debug)]
pub struct DispatchReport<T, E> {
    pub batches: Vec<usize>,
    pub outcomes: Vec<Result<T, E>>,
    /// Items never dispatched because the run was halted.
    pub skipped: usize,
}

impl<T, E> Default for DispatchReport<T, E> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            outcomes: Vec::new(),
            skipped: 0,
        }
    }
}

impl<T, E> DispatchReport<T, E> {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &E> {
        self.outcomes.iter().filter_map(|o| o.as_ref().err())
    }
}

impl RateLimitedDispatcher {
    /// `n_requests` below 1 is treated as 1.
    pub fn new(n_requests: usize, cooldown: Duration) -> Self {
        Self {
            n_requests: n_requests.max(1),
            cooldown,
        }
    }

    pub fn n_requests(&self) -> usize {
        self.n_requests
    }

    /// Dispatch every item through `op`. A failing item is logged and
    /// recorded; it never cancels its siblings or later batches. Batch K+1
    /// starts only after every operation of batch K has resolved.
    pub async fn run<I, F, Fut, T, E>(&self, items: I, op: F) -> DispatchReport<T, E>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_until(items, op, |_| false).await
    }

    /// Like [`run`](Self::run), but once a batch yields an error for which
    /// `halt` holds, no further batch is started. The halting batch itself
    /// always completes.
    pub async fn run_until<I, F, Fut, T, E, H>(
        &self,
        items: I,
        op: F,
        halt: H,
    ) -> DispatchReport<T, E>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        H: Fn(&E) -> bool,
    {
        let mut pending: VecDeque<I::Item> = items.into_iter().collect();
        let mut report = DispatchReport::default();

        while !pending.is_empty() {
            let take = self.n_requests.min(pending.len());
            let batch: Vec<I::Item> = pending.drain(..take).collect();
            report.batches.push(batch.len());
            debug!(
                batch = report.batches.len(),
                size = batch.len(),
                remaining = pending.len(),
                "dispatching batch"
            );

            let results = join_all(batch.into_iter().map(&op)).await;
            let mut halted = false;
            for result in &results {
                if let Err(err) = result {
                    warn!(%err, batch = report.batches.len(), "work item failed");
                    halted |= halt(err);
                }
            }
            report.outcomes.extend(results);

            if halted {
                report.skipped = pending.len();
                warn!(skipped = report.skipped, "dispatch halted");
                break;
            }
            if !pending.is_empty() {
                debug!(cooldown_ms = self.cooldown.as_millis() as u64, "cooling down");
                tokio::time::sleep(self.cooldown).await;
            }
        }

        report
    }
}
