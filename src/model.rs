use super::{
    partition::Chunk,
    result::Outcome,
};
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};


/// Monotonically increasing identifier of one engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub(crate) u64);

impl RunId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}


/// How snapshots reach the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One fully resolved snapshot once every chunk has reported.
    #[default]
    Batch,
    /// A fresh snapshot after each chunk report, in arrival order.
    Incremental,
}


/// Message a worker slot emits once per chunk.
#[derive(Debug, Clone)]
pub struct ChunkReport<H> {
    pub run: RunId,
    pub chunk: Chunk,
    /// Outcomes in chunk order; position `i` belongs to task `chunk.range.start + i`.
    pub outcomes: Vec<Outcome<H>>,
}


#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub workers: usize,
    pub busy_workers: usize,
    pub runs_started: usize,
    pub chunks_dispatched: usize,
    pub chunks_completed: usize,
    pub stale_reports: usize,
    pub expired_chunks: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub snapshots_published: usize,
}

impl EngineMetrics {
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        self.busy_workers as f64 / self.workers as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_succeeded + self.tasks_failed;
        if total == 0 {
            return 1.0;
        }
        self.tasks_succeeded as f64 / total as f64
    }
}


#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub workers: AtomicUsize,
    pub busy_workers: AtomicUsize,
    pub runs_started: AtomicUsize,
    pub chunks_dispatched: AtomicUsize,
    pub chunks_completed: AtomicUsize,
    pub stale_reports: AtomicUsize,
    pub expired_chunks: AtomicUsize,
    pub tasks_succeeded: AtomicUsize,
    pub tasks_failed: AtomicUsize,
    pub snapshots_published: AtomicUsize,
}

impl Counters {
    pub fn record_outcomes<H>(&self, outcomes: &[Outcome<H>]) {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        self.tasks_succeeded.fetch_add(succeeded, Ordering::Relaxed);
        self.tasks_failed.fetch_add(outcomes.len() - succeeded, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            workers: self.workers.load(Ordering::Relaxed),
            busy_workers: self.busy_workers.load(Ordering::Relaxed),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            stale_reports: self.stale_reports.load(Ordering::Relaxed),
            expired_chunks: self.expired_chunks.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
        }
    }
}
