// SPDX-License-Identifier: MIT
//! Run coordination.
//!
//! A run starts `workers` tasks that each repeat the same iteration until told to
//! stop:
//!
//! 1. wait for a token from the worker's own [`RateLimiter`]
//! 2. build the iteration's records ([`SignalWorker::generate`])
//! 3. export them and wait for the result
//! 4. bump the shared counter and notify the progress reporter
//!
//! Workers stop when their count limit is reached, when the run's duration
//! elapses, when the run is interrupted, or on their first error. The
//! coordinator waits for all of them before shutting the exporter down, exactly
//! once, and reporting the final count.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attributes::AttributeProcessor;
use crate::config::{AttributeMap, Config, ConfigError};
use crate::exporter::{ExportError, Exporter, Resource, Signal};
use crate::limiter::{LimiterError, RateLimiter};
use crate::logging::ConsoleOutput;
use crate::logs::SeverityError;
use crate::mock::{MockEngine, MockError};

const PROGRESS_BUFFER: usize = 64;

/// Produces the records of one iteration.
pub trait SignalWorker: Send + 'static {
    type Record: Send + 'static;

    /// Builds the records of the next iteration. Called once per limiter token.
    fn generate(&mut self) -> Result<Vec<Self::Record>, WorkerError>;

    /// When true, each record of an iteration is exported on its own.
    fn export_individually(&self) -> bool {
        false
    }
}

/// Stops a single worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Interrupted(#[from] LimiterError),
    #[error("failed to process attributes: {0}")]
    Attributes(#[from] MockError),
    #[error(transparent)]
    Severity(#[from] SeverityError),
    #[error("failed to export: {0}")]
    Export(#[from] ExportError),
}

/// Prevents a run from starting.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to process resource attributes: {0}")]
    Attributes(#[from] MockError),
    #[error("failed to create exporter: {0}")]
    Exporter(#[from] ExportError),
}

/// Process-level collaborators of a run.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Cancelled on Ctrl-C; stops every worker and the duration timer.
    pub interrupt: CancellationToken,
    pub console: ConsoleOutput,
    /// Shared template engine. When `None` and mock data is enabled, the run
    /// creates one from the configured seed.
    pub mock: Option<Arc<MockEngine>>,
}

impl RunOptions {
    /// The mock engine for `config`, or `None` when mock data is disabled.
    pub fn mock_engine(&self, config: &Config) -> Option<Arc<MockEngine>> {
        config
            .mock_data
            .then(|| self.mock.clone().unwrap_or_else(|| Arc::new(MockEngine::new(config.mock_seed))))
    }
}

/// Outcome of a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations completed by all workers.
    pub generated: u64,
    /// Workers that stopped on an error.
    pub failed_workers: usize,
}

/// State shared by the workers of one run.
#[derive(Debug)]
pub struct RunState {
    running: AtomicBool,
    generated: AtomicU64,
}

impl RunState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            generated: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.generated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a signal needs before its workers start.
pub(crate) struct Setup {
    pub config: Config,
    pub processor: AttributeProcessor,
    pub resource: Resource,
    pub attributes: Arc<AttributeMap>,
}

impl Setup {
    /// Tags sensitive attributes and builds the resource.
    pub fn new(common: &Config, options: &RunOptions) -> Result<Self, GenerationError> {
        let mut config = common.clone();
        config.init_attributes();
        let processor = AttributeProcessor::new(options.mock_engine(&config));
        let resource = Resource::new(processor.build_resource(&config.otlp_attributes, &config.service)?);
        let attributes = Arc::new(config.telemetry_attributes.clone());
        Ok(Self {
            config,
            processor,
            resource,
            attributes,
        })
    }
}

/// Shuts `exporter` down for a run that never started and hands back `err`.
pub(crate) async fn abort<R: Send + 'static>(exporter: &dyn Exporter<R>, err: GenerationError) -> GenerationError {
    if let Err(e) = exporter.shutdown().await {
        error!(error = %e, "failed to shut down the exporter");
    }
    err
}

struct WorkerContext<R: Send + 'static> {
    id: usize,
    signal: Signal,
    limit: u64,
    limiter: RateLimiter,
    state: Arc<RunState>,
    exporter: Arc<dyn Exporter<R>>,
    resource: Arc<Resource>,
    progress: mpsc::Sender<()>,
    interrupt: CancellationToken,
    console: ConsoleOutput,
}

/// Runs a pool of workers for `signal` until they are all done.
///
/// `count` is the per-worker iteration limit; it is ignored when the run has a
/// duration.
pub(crate) async fn execute<W, F>(
    signal: Signal,
    config: &Config,
    count: u64,
    resource: Resource,
    exporter: Arc<dyn Exporter<W::Record>>,
    options: &RunOptions,
    mut make_worker: F,
) -> RunSummary
where
    W: SignalWorker,
    F: FnMut(usize) -> W,
{
    let timed = !config.duration.is_zero();
    let limit = if timed { 0 } else { count };
    let rate = config.rate;
    if rate > 0.0 {
        info!(signal = %signal, per_second = rate, "generation is rate limited per worker");
    } else {
        info!(signal = %signal, "generation is not throttled");
    }
    if timed {
        info!(signal = %signal, duration = ?config.duration, "generation will stop after the duration elapses");
    }

    let state = Arc::new(RunState::new());
    let resource = Arc::new(resource);
    let (progress, reports) = mpsc::channel(PROGRESS_BUFFER);
    let reporter = tokio::spawn(report_progress(signal, reports, config.interval, options.console));

    let mut workers = JoinSet::new();
    for index in 0..config.workers {
        let ctx = WorkerContext {
            id: index + 1,
            signal,
            limit,
            limiter: RateLimiter::new(rate),
            state: Arc::clone(&state),
            exporter: Arc::clone(&exporter),
            resource: Arc::clone(&resource),
            progress: progress.clone(),
            interrupt: options.interrupt.clone(),
            console: options.console,
        };
        workers.spawn(drive(make_worker(index), ctx));
    }
    drop(progress);

    if timed {
        tokio::select! {
            _ = tokio::time::sleep(config.duration) => {}
            _ = options.interrupt.cancelled() => warn!(signal = %signal, "run interrupted"),
        }
        state.stop();
    }

    let mut failed_workers = 0;
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                None => break,
                Some(Ok(true)) => {}
                Some(Ok(false)) => failed_workers += 1,
                Some(Err(e)) => {
                    error!(signal = %signal, error = %e, "worker task panicked");
                    failed_workers += 1;
                }
            },
            _ = options.interrupt.cancelled(), if state.is_running() => {
                warn!(signal = %signal, "run interrupted");
                state.stop();
            }
        }
    }

    if let Err(e) = reporter.await {
        error!(signal = %signal, error = %e, "progress reporter failed");
    }
    if let Err(e) = exporter.shutdown().await {
        error!(signal = %signal, error = %e, "failed to shut down the exporter");
    }

    let generated = state.generated();
    info!(signal = %signal, generated, failed_workers, "final count");
    RunSummary {
        generated,
        failed_workers,
    }
}

/// Returns false when the worker stopped on an error. Interrupts are not errors.
async fn drive<W: SignalWorker>(mut worker: W, mut ctx: WorkerContext<W::Record>) -> bool {
    let mut generated = 0;
    let result = iterate(&mut worker, &mut ctx, &mut generated).await;
    match result {
        Ok(()) => info!(worker = ctx.id, signal = %ctx.signal, generated, "worker finished"),
        Err(WorkerError::Interrupted(_)) => info!(worker = ctx.id, signal = %ctx.signal, generated, "worker interrupted"),
        Err(e) => {
            error!(worker = ctx.id, signal = %ctx.signal, generated, error = %e, "worker stopped");
            ctx.console.errorln(format_args!("worker {} stopped: {e}", ctx.id));
            return false;
        }
    }
    true
}

async fn iterate<W: SignalWorker>(
    worker: &mut W,
    ctx: &mut WorkerContext<W::Record>,
    generated: &mut u64,
) -> Result<(), WorkerError> {
    while ctx.state.is_running() && (ctx.limit == 0 || *generated < ctx.limit) {
        ctx.limiter.wait(&ctx.interrupt).await?;
        let records = worker.generate()?;
        if worker.export_individually() {
            for record in records {
                ctx.exporter.export(&ctx.resource, vec![record]).await?;
            }
        } else {
            ctx.exporter.export(&ctx.resource, records).await?;
        }
        *generated += 1;
        ctx.state.record();
        if ctx.progress.send(()).await.is_err() {
            debug!(worker = ctx.id, signal = %ctx.signal, "progress reporter is gone");
        }
    }
    Ok(())
}

/// Counts progress notifications, printing the running total every `interval`.
async fn report_progress(
    signal: Signal,
    mut reports: mpsc::Receiver<()>,
    interval: Duration,
    console: ConsoleOutput,
) -> u64 {
    let mut ticker = (!interval.is_zero()).then(|| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut count = 0;
    let mut reported = 0;
    loop {
        tokio::select! {
            received = reports.recv() => match received {
                Some(()) => count += 1,
                None => break,
            },
            _ = tick(&mut ticker) => {
                if count != reported {
                    debug!(signal = %signal, generated = count, "progress");
                    console.println(format_args!("{} generated: {count}", signal.title()));
                    reported = count;
                }
            }
        }
    }
    console.println(format_args!("{} generated (final count): {count}", signal.title()));
    count
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
