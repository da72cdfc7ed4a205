use super::{
    aggregator::{aggregate, RunPlan, Signal},
    errors::EngineError,
    executor::TaskExecutor,
    handle::Subscription,
    model::{Counters, DeliveryMode, EngineMetrics, RunId},
    partition::partition,
    pool::{ChunkJob, Config, WorkerPool},
};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::Ordering,
        Arc,
    },
};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};


#[derive(Default)]
struct RunState {
    last: u64,
    current: Option<CancellationToken>,
}

/// Splits task lists across a persistent worker pool and streams the results back.
///
/// Each [`run`](Engine::run) supersedes the previous one. Dropping the engine
/// disposes it.
pub struct Engine<E: TaskExecutor> {
    config: Config,
    executor: Arc<E>,
    pool: Mutex<WorkerPool<E>>,
    runs: Mutex<RunState>,
    signals: mpsc::UnboundedSender<Signal<E::Handle>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    root: CancellationToken,
    counters: Arc<Counters>,
}

impl<E: TaskExecutor> Engine<E> {
    /// Must be called from within a tokio runtime.
    pub fn new(executor: E, config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let executor = Arc::new(executor);
        let root = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let (signals, receiver) = mpsc::unbounded_channel::<Signal<E::Handle>>();
        let aggregator = tokio::spawn(aggregate(receiver, counters.clone()));
        let pool = WorkerPool::provision(
            executor.clone(),
            config.pool_size(),
            root.child_token(),
            counters.clone(),
        );

        Ok(Self {
            config,
            executor,
            pool: Mutex::new(pool),
            runs: Mutex::new(RunState::default()),
            signals,
            aggregator: Mutex::new(Some(aggregator)),
            root,
            counters,
        })
    }

    pub fn with_defaults(executor: E) -> Result<Self, EngineError> {
        Self::new(executor, Config::default())
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.pool.lock().size().get()
    }

    /// Runs `tasks` with the configured delivery mode.
    pub fn submit<I>(&self, tasks: I) -> Result<Subscription<E::Handle>, EngineError>
    where
        I: IntoIterator<Item = E::Task>,
    {
        self.run(tasks, self.config.delivery_mode)
    }

    /// Partitions `tasks` across the pool and returns immediately.
    ///
    /// Any run still in flight is superseded: its subscription ends and its
    /// late chunk reports are discarded.
    pub fn run<I>(
        &self,
        tasks: I,
        mode: DeliveryMode,
    ) -> Result<Subscription<E::Handle>, EngineError>
    where
        I: IntoIterator<Item = E::Task>,
    {
        let mut runs = self.runs.lock();
        if self.root.is_cancelled() {
            return Err(EngineError::Disposed);
        }

        let tasks: Arc<[E::Task]> = tasks.into_iter().collect();
        runs.last += 1;
        let run = RunId(runs.last);
        let token = self.root.child_token();
        if let Some(previous) = runs.current.replace(token.clone()) {
            previous.cancel();
            debug!(%run, "superseding previous run");
        }

        let pool = self.pool.lock();
        let chunks = partition(tasks.len(), pool.size());
        let work = token.child_token();
        let (publisher, receiver) = mpsc::unbounded_channel();

        let plan = RunPlan {
            run,
            mode,
            len: tasks.len(),
            chunks: chunks.clone(),
            publisher,
            work: work.clone(),
            deadline: Instant::now() + self.config.completion_timeout,
        };
        self.signals
            .send(Signal::Begin(plan))
            .map_err(|_| EngineError::Disposed)?;

        for chunk in chunks.into_iter().filter(|chunk| !chunk.is_empty()) {
            pool.dispatch(ChunkJob {
                run,
                chunk,
                tasks: tasks.clone(),
                cancel: work.clone(),
                reply: self.signals.clone(),
            });
        }

        self.counters.runs_started.fetch_add(1, Ordering::Relaxed);
        info!(%run, tasks = tasks.len(), workers = pool.size().get(), ?mode, "run dispatched");

        Ok(Subscription::new(run, token, receiver))
    }

    /// Re-provisions the pool with `workers` slots. The in-flight run, if any,
    /// is superseded. No-op when the size is unchanged.
    pub fn resize(&self, workers: NonZeroUsize) -> Result<(), EngineError> {
        let mut runs = self.runs.lock();
        if self.root.is_cancelled() {
            return Err(EngineError::Disposed);
        }

        let mut pool = self.pool.lock();
        if pool.size() == workers {
            return Ok(());
        }

        if let Some(current) = runs.current.take() {
            current.cancel();
        }
        pool.teardown();
        *pool = WorkerPool::provision(
            self.executor.clone(),
            workers,
            self.root.child_token(),
            self.counters.clone(),
        );
        Ok(())
    }

    /// Cancels in-flight work and releases every worker slot. Idempotent.
    pub fn dispose(&self) {
        self.root.cancel();
        self.runs.lock().current = None;
        self.pool.lock().teardown();

        if let Some(aggregator) = self.aggregator.lock().take() {
            aggregator.abort();
            info!("engine disposed");
        }
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.root.is_cancelled()
    }

    #[inline]
    pub fn metrics(&self) -> EngineMetrics {
        self.counters.metrics()
    }

    /// Calls `callback` with fresh metrics every `interval` until the returned
    /// token (or the engine) is cancelled.
    pub fn start_monitoring<F>(&self, interval: Duration, callback: F) -> CancellationToken
    where
        F: Fn(EngineMetrics) + Send + 'static,
    {
        let counters = Arc::clone(&self.counters);
        let token = self.root.child_token();
        let token_clone = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => callback(counters.metrics()),
                    _ = token_clone.cancelled() => break,
                }
            }
        });

        token
    }
}

impl<E: TaskExecutor> Drop for Engine<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}
