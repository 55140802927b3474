use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::result::TransactionResult;
use crate::share::Share;
use crate::step::Step;

/// Ordered, immutable chain of steps executed once per iteration.
pub(crate) struct Transaction {
    steps: Vec<Step>,
}

impl Transaction {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub(crate) fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Runs every step in order with a fresh [`Share`].
    ///
    /// Think-time is slept after each step, added to `think_total` (in
    /// nanoseconds) and left out of the returned duration.
    pub(crate) async fn run(
        &self,
        worker: usize,
        iteration: usize,
        think_total: &AtomicU64,
    ) -> TransactionResult {
        let mut share = Share::with_capacity(self.steps.len());
        let mut details = Vec::with_capacity(self.steps.len());
        let mut thought = Duration::ZERO;
        let start = Instant::now();

        for step in &self.steps {
            details.push(step.execute(&mut share, worker, iteration).await);

            let think = step.think_time();
            if !think.is_zero() {
                tokio::time::sleep(think).await;
                thought += think;
                think_total.fetch_add(think.as_nanos() as u64, Ordering::Relaxed);
            }
        }

        TransactionResult {
            details,
            duration: start.elapsed().saturating_sub(thought),
        }
    }
}
