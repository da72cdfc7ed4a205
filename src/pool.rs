use super::{
    errors::EngineError,
    executor::{execute_guarded, TaskExecutor},
    model::{ChunkReport, Counters, DeliveryMode, RunId},
    aggregator::Signal,
    partition::Chunk,
};
use std::{
    num::NonZeroUsize,
    panic::AssertUnwindSafe,
    sync::{
        atomic::Ordering,
        Arc,
    },
};
use crossbeam::queue::SegQueue;
use futures::FutureExt;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};


pub const DEFAULT_POOL_SIZE_FLOOR: usize = 2;
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub delivery_mode: DeliveryMode,
    /// Lower bound on the pool size when it is derived from the concurrency hint.
    pub pool_size_floor: usize,
    /// Fixed pool size; takes precedence over the hint and the floor.
    pub pool_size_override: Option<usize>,
    /// Host logical concurrency. `None` or zero falls back to the floor.
    pub concurrency_hint: Option<usize>,
    /// How long a run may wait for its chunk reports before the missing ones
    /// are marked failed. Always bounded.
    pub completion_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Batch,
            pool_size_floor: DEFAULT_POOL_SIZE_FLOOR,
            pool_size_override: None,
            concurrency_hint: Some(num_cpus::get()),
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }
}

impl Config {
    pub fn incremental() -> Self {
        Self {
            delivery_mode: DeliveryMode::Incremental,
            ..Default::default()
        }
    }

    /// Fixed-size pool, independent of the host.
    pub fn fixed(workers: usize) -> Self {
        Self {
            pool_size_override: Some(workers),
            ..Default::default()
        }
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_pool_size_floor(mut self, floor: usize) -> Self {
        self.pool_size_floor = floor;
        self
    }

    pub fn with_pool_size_override(mut self, workers: Option<usize>) -> Self {
        self.pool_size_override = workers;
        self
    }

    pub fn with_concurrency_hint(mut self, hint: Option<usize>) -> Self {
        self.concurrency_hint = hint;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pool_size_floor == 0 {
            return Err(EngineError::InvalidConfig(
                "pool_size_floor must be at least 1".into(),
            ));
        }
        if self.pool_size_override == Some(0) {
            return Err(EngineError::InvalidConfig(
                "pool_size_override must be at least 1".into(),
            ));
        }
        if self.completion_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "completion_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Override if set, otherwise `max(hint, floor)`. Never zero.
    pub fn pool_size(&self) -> NonZeroUsize {
        let hinted = self
            .concurrency_hint
            .unwrap_or(0)
            .max(self.pool_size_floor);
        let size = self
            .pool_size_override
            .filter(|n| *n > 0)
            .unwrap_or(hinted);
        NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
    }
}


/// One chunk of one run, queued on a worker slot.
pub(crate) struct ChunkJob<E: TaskExecutor> {
    pub run: RunId,
    pub chunk: Chunk,
    pub tasks: Arc<[E::Task]>,
    pub cancel: CancellationToken,
    pub reply: mpsc::UnboundedSender<Signal<E::Handle>>,
}

struct Slot<E: TaskExecutor> {
    queue: SegQueue<ChunkJob<E>>,
    notify: Notify,
}

/// Fixed set of long-lived worker slots sharing one executor.
pub(crate) struct WorkerPool<E: TaskExecutor> {
    slots: Vec<Arc<Slot<E>>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl<E: TaskExecutor> WorkerPool<E> {
    /// Spawns `size` worker slots on the current tokio runtime.
    pub fn provision(
        executor: Arc<E>,
        size: NonZeroUsize,
        shutdown: CancellationToken,
        counters: Arc<Counters>,
    ) -> Self {
        let mut slots = Vec::with_capacity(size.get());
        let mut workers = Vec::with_capacity(size.get());

        for index in 0..size.get() {
            let slot = Arc::new(Slot {
                queue: SegQueue::new(),
                notify: Notify::new(),
            });
            slots.push(slot.clone());

            let executor = executor.clone();
            let shutdown = shutdown.clone();
            let counters = counters.clone();
            workers.push(tokio::spawn(async move {
                slot_loop(index, slot, executor, shutdown, counters).await;
            }));
        }

        counters.workers.store(size.get(), Ordering::Relaxed);
        info!(workers = size.get(), "worker pool provisioned");

        Self {
            slots,
            workers,
            shutdown,
            counters,
        }
    }

    #[inline]
    pub fn size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.slots.len()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Queues `job` on the slot named by its chunk. Never blocks.
    pub fn dispatch(&self, job: ChunkJob<E>) {
        let slot = &self.slots[job.chunk.slot % self.slots.len()];
        trace!(run = %job.run, slot = job.chunk.slot, tasks = job.chunk.len(), "chunk dispatched");
        self.counters.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
        slot.queue.push(job);
        slot.notify.notify_one();
    }

    /// Stops every slot, aborting in-flight chunks. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.shutdown.cancel();
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        for slot in &self.slots {
            while slot.queue.pop().is_some() {}
        }

        self.counters.workers.store(0, Ordering::Relaxed);
        info!(workers = self.slots.len(), "worker pool torn down");
    }
}

impl<E: TaskExecutor> Drop for WorkerPool<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}


struct BusyGuard<'a>(&'a Counters);

impl<'a> BusyGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.busy_workers.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn slot_loop<E: TaskExecutor>(
    index: usize,
    slot: Arc<Slot<E>>,
    executor: Arc<E>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        if let Some(job) = slot.queue.pop() {
            let _busy = BusyGuard::enter(&counters);
            let run = job.run;
            let chunk = AssertUnwindSafe(run_chunk(index, job, executor.as_ref(), &counters));
            if chunk.catch_unwind().await.is_err() {
                warn!(%run, slot = index, "chunk panicked, slot kept alive");
            }
            continue;
        }

        tokio::select! {
            _ = slot.notify.notified() => {}
            _ = shutdown.cancelled() => break,
        }
    }
    debug!(slot = index, "worker slot released");
}

async fn run_chunk<E: TaskExecutor>(
    index: usize,
    job: ChunkJob<E>,
    executor: &E,
    counters: &Counters,
) {
    let ChunkJob { run, chunk, tasks, cancel, reply } = job;
    if cancel.is_cancelled() {
        trace!(%run, slot = index, "skipping chunk of cancelled run");
        return;
    }

    let range = chunk.range.clone();
    let tasks = &tasks;
    let work = async move {
        let mut outcomes = Vec::with_capacity(range.len());
        for position in range {
            outcomes.push(execute_guarded(executor, &tasks[position]).await);
        }
        outcomes
    };

    let outcomes = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(%run, slot = index, "chunk abandoned");
            return;
        }
        outcomes = work => outcomes,
    };

    counters.record_outcomes(&outcomes);
    debug!(%run, slot = index, tasks = outcomes.len(), "chunk finished");
    let _ = reply.send(Signal::Chunk(ChunkReport { run, chunk, outcomes }));
}
