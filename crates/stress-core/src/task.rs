use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{self, StepConfig, TaskConfig};
use crate::error::{ConfigError, StressError};
use crate::hooks::ReportHandler;
use crate::report::Report;
use crate::result::TransactionResult;
use crate::step::Step;
use crate::transaction::Transaction;

/// Cooperative stop flag shared by a task, its workers and the interrupt handler.
///
/// Workers check it before starting each iteration, so iterations already in
/// flight always complete. A stopped task stays stopped.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub results: Vec<TransactionResult>,
    /// Wall time net of the per-worker share of think-time
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn report(&self, percentiles: bool) -> Report {
        Report::build(&self.results, self.elapsed, percentiles)
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    /// Iterations per worker
    Iterations(u64),
    Duration(Duration),
}

/// State shared by the workers of one run.
struct Run {
    transaction: Transaction,
    bound: Bound,
    start: Instant,
    stop: StopHandle,
    think_nanos: AtomicU64,
    results: Mutex<Vec<TransactionResult>>,
}

/// A load test: run bounds, defaults, and where the report goes.
pub struct Task {
    config: TaskConfig,
    handler: Option<Arc<dyn ReportHandler>>,
    output: Mutex<Box<dyn Write + Send>>,
    stop: StopHandle,
}

impl Task {
    pub fn new(config: TaskConfig) -> Self {
        Self {
            config,
            handler: None,
            output: Mutex::new(Box::new(std::io::stdout())),
            stop: StopHandle::default(),
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Hands the raw results to `handler` instead of rendering the built-in report.
    pub fn with_report_handler(mut self, handler: impl ReportHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Replaces stdout as the destination of the text report.
    pub fn with_output(mut self, sink: impl Write + Send + 'static) -> Self {
        self.output = Mutex::new(Box::new(sink));
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs a single endpoint on a fresh multi-threaded runtime.
    ///
    /// Must not be called from inside a tokio runtime; use [`Task::run_async`] there.
    pub fn run(&self, step: StepConfig) -> Result<RunOutcome, StressError> {
        self.run_transaction(vec![step])
    }

    /// Runs the ordered `steps` as one transaction per iteration.
    pub fn run_transaction(&self, steps: Vec<StepConfig>) -> Result<RunOutcome, StressError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(StressError::Runtime)?;
        runtime.block_on(self.run_transaction_async(steps))
    }

    pub async fn run_async(&self, step: StepConfig) -> Result<RunOutcome, StressError> {
        self.run_transaction_async(vec![step]).await
    }

    pub async fn run_transaction_async(
        &self,
        steps: Vec<StepConfig>,
    ) -> Result<RunOutcome, StressError> {
        let resolved = config::resolve(&self.config, &steps)?;
        if let Some(dir) = &self.config.output {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }

        let concurrency = self.config.concurrency;
        let bound = match self.config.duration() {
            Some(duration) => Bound::Duration(duration),
            None => Bound::Iterations(self.config.number / concurrency),
        };
        let expected = match bound {
            Bound::Iterations(_) => self.config.number as usize,
            Bound::Duration(_) => 0,
        };
        let transaction = Transaction::new(
            resolved
                .into_iter()
                .enumerate()
                .map(|(index, step)| Step::new(index, step))
                .collect(),
        );

        info!(
            "Starting run: {} workers, {} steps, {:?}",
            concurrency,
            transaction.steps().len(),
            bound
        );
        for (index, step) in transaction.steps().iter().enumerate() {
            debug!(step = index, url = %step.url(), "step ready");
        }

        let run = Arc::new(Run {
            transaction,
            bound,
            start: Instant::now(),
            stop: self.stop.clone(),
            think_nanos: AtomicU64::new(0),
            results: Mutex::new(Vec::with_capacity(expected)),
        });

        let interrupt = self.config.handle_interrupt.then(|| {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight iterations");
                    stop.stop();
                }
            })
        });

        let workers: Vec<_> = (0..concurrency as usize)
            .map(|worker| tokio::spawn(run_worker(worker, run.clone())))
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker task failed: {}", e);
            }
        }
        if let Some(interrupt) = interrupt {
            interrupt.abort();
        }

        let think_total = Duration::from_nanos(run.think_nanos.load(Ordering::Relaxed));
        let think = think_total / concurrency as u32;
        let elapsed = run.start.elapsed().saturating_sub(think);
        let results = std::mem::take(&mut *run.results.lock());
        info!(
            "Run finished: {} iterations in {:.3}s",
            results.len(),
            elapsed.as_secs_f64()
        );

        self.finish(&results, elapsed);

        if self.stop.is_stopped() {
            return Err(StressError::Interrupted {
                completed: results.len(),
            });
        }
        Ok(RunOutcome { results, elapsed })
    }

    /// Reports exactly once: through the custom handler, or the built-in
    /// text report plus output files.
    fn finish(&self, results: &[TransactionResult], elapsed: Duration) {
        if let Some(handler) = &self.handler {
            handler.handle(results, elapsed);
            return;
        }

        let report = Report::build(results, elapsed, self.config.percentiles);
        let text = report.render();
        {
            let mut sink = self.output.lock();
            let written = sink.write_all(text.as_bytes());
            if let Err(e) = written.and_then(|()| sink.flush()) {
                warn!("Failed to write report: {}", e);
            }
        }
        if let Some(dir) = &self.config.output {
            let files = report.write_files(dir, &text);
            info!("Report files written to {:?}: {}", dir, files.len());
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("config", &self.config)
            .field("report_handler", &self.handler.is_some())
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}

async fn run_worker(worker: usize, run: Arc<Run>) {
    let mut iteration = 0usize;
    loop {
        if run.stop.is_stopped() {
            break;
        }
        let more = match run.bound {
            Bound::Iterations(n) => (iteration as u64) < n,
            Bound::Duration(d) => run.start.elapsed() < d,
        };
        if !more {
            break;
        }

        let result = run
            .transaction
            .run(worker, iteration, &run.think_nanos)
            .await;
        run.results.lock().push(result);
        iteration += 1;
    }
    debug!(worker, iterations = iteration, "worker finished");
}
