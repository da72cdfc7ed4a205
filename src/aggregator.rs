//! Reassembles chunk reports into index-ordered snapshots.
//!
//! Every run owns one [`Collector`]. All signals (run starts and chunk reports)
//! flow through a single channel into [`aggregate`], so snapshot publication
//! is serialized and reports from superseded runs are dropped by run id.

use super::{
    model::{ChunkReport, Counters, DeliveryMode, RunId},
    partition::Chunk,
    result::{Outcome, ResultSnapshot},
};
use std::sync::{
    atomic::Ordering,
    Arc,
};
use tokio::{
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};


pub(crate) enum Signal<H> {
    Begin(RunPlan<H>),
    Chunk(ChunkReport<H>),
}

pub(crate) struct RunPlan<H> {
    pub run: RunId,
    pub mode: DeliveryMode,
    pub len: usize,
    pub chunks: Vec<Chunk>,
    pub publisher: mpsc::UnboundedSender<ResultSnapshot<H>>,
    /// Cancelled when the run is superseded, its subscription goes away, or it
    /// expires. A cancelled run publishes nothing more.
    pub work: CancellationToken,
    pub deadline: Instant,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectState {
    Collecting,
    Complete,
}

/// What a collector decided about one chunk report.
#[derive(Debug)]
pub enum Verdict<H> {
    /// Publish this snapshot to the subscriber.
    Publish(ResultSnapshot<H>),
    /// Accepted; batch mode keeps it until every chunk is in.
    Held,
    /// Report belongs to a different run.
    Stale,
    /// Duplicate, unknown chunk, or arrived after completion.
    Ignored,
}

/// Delivery-mode state machine for a single run.
#[derive(Debug)]
pub struct Collector<H> {
    run: RunId,
    mode: DeliveryMode,
    outcomes: Vec<Outcome<H>>,
    chunks: Vec<Chunk>,
    arrived: Vec<bool>,
    remaining: usize,
    state: CollectState,
}

impl<H: Clone> Collector<H> {
    /// Empty chunks count as already reported.
    pub fn new(run: RunId, mode: DeliveryMode, len: usize, chunks: Vec<Chunk>) -> Self {
        let arrived: Vec<bool> = chunks.iter().map(Chunk::is_empty).collect();
        let remaining = arrived.iter().filter(|done| !**done).count();
        let state = if remaining == 0 {
            CollectState::Complete
        } else {
            CollectState::Collecting
        };

        Self {
            run,
            mode,
            outcomes: vec![Outcome::Pending; len],
            chunks,
            arrived,
            remaining,
            state,
        }
    }

    #[inline]
    pub fn run(&self) -> RunId {
        self.run
    }

    #[inline]
    pub fn state(&self) -> CollectState {
        self.state
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state == CollectState::Complete
    }

    /// Chunks still waiting for a report.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.remaining
    }

    /// The snapshot of a run that completes on creation (no tasks at all).
    pub fn initial(&self) -> Option<ResultSnapshot<H>> {
        self.is_complete().then(|| self.snapshot())
    }

    pub fn accept(&mut self, report: ChunkReport<H>) -> Verdict<H> {
        if report.run != self.run {
            return Verdict::Stale;
        }
        if self.is_complete() {
            return Verdict::Ignored;
        }

        let slot = report.chunk.slot;
        match self.chunks.get(slot) {
            Some(expected) if expected.range == report.chunk.range && !self.arrived[slot] => {}
            _ => return Verdict::Ignored,
        }

        let mut outcomes = report.outcomes.into_iter();
        for position in report.chunk.range {
            // A reported chunk is final: anything missing or still pending failed.
            self.outcomes[position] = match outcomes.next() {
                Some(Outcome::Pending) | None => Outcome::Failed,
                Some(outcome) => outcome,
            };
        }

        self.arrived[slot] = true;
        self.remaining -= 1;
        if self.remaining == 0 {
            self.state = CollectState::Complete;
        }

        match self.mode {
            DeliveryMode::Incremental => Verdict::Publish(self.snapshot()),
            DeliveryMode::Batch if self.is_complete() => Verdict::Publish(self.snapshot()),
            DeliveryMode::Batch => Verdict::Held,
        }
    }

    /// Finalizes the run, failing every task of a chunk that never reported.
    pub fn expire(&mut self) -> Option<ResultSnapshot<H>> {
        if self.is_complete() {
            return None;
        }

        for (chunk, arrived) in self.chunks.iter().zip(self.arrived.iter_mut()) {
            if *arrived {
                continue;
            }
            for outcome in &mut self.outcomes[chunk.range.clone()] {
                *outcome = Outcome::Failed;
            }
            *arrived = true;
        }

        self.remaining = 0;
        self.state = CollectState::Complete;
        Some(self.snapshot())
    }

    fn snapshot(&self) -> ResultSnapshot<H> {
        ResultSnapshot::new(
            self.run,
            self.outcomes.iter().cloned().collect(),
            self.is_complete(),
        )
    }
}


struct ActiveRun<H> {
    collector: Collector<H>,
    publisher: mpsc::UnboundedSender<ResultSnapshot<H>>,
    work: CancellationToken,
    deadline: Instant,
}

impl<H: Clone> ActiveRun<H> {
    fn new(plan: RunPlan<H>) -> Self {
        Self {
            collector: Collector::new(plan.run, plan.mode, plan.len, plan.chunks),
            publisher: plan.publisher,
            work: plan.work,
            deadline: plan.deadline,
        }
    }

    fn publish(&self, snapshot: ResultSnapshot<H>, counters: &Counters) {
        if self.work.is_cancelled() {
            trace!(run = %self.collector.run(), "run cancelled, snapshot dropped");
            return;
        }
        if self.publisher.send(snapshot).is_ok() {
            counters.snapshots_published.fetch_add(1, Ordering::Relaxed);
        } else {
            trace!(run = %self.collector.run(), "subscriber gone, snapshot dropped");
        }
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn retired(work: Option<CancellationToken>) {
    match work {
        Some(work) => work.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Single aggregation point. Runs until every signal sender is gone.
pub(crate) async fn aggregate<H>(
    mut signals: mpsc::UnboundedReceiver<Signal<H>>,
    counters: Arc<Counters>,
) where
    H: Clone + Send + Sync + 'static,
{
    let mut active: Option<ActiveRun<H>> = None;

    loop {
        let deadline = active.as_ref().map(|current| current.deadline);
        let work = active.as_ref().map(|current| current.work.clone());

        let signal = tokio::select! {
            biased;
            _ = retired(work) => {
                if let Some(current) = active.take() {
                    debug!(
                        run = %current.collector.run(),
                        outstanding = current.collector.outstanding(),
                        "run cancelled, retired without publishing"
                    );
                }
                continue;
            }
            _ = expiry(deadline) => {
                if let Some(mut current) = active.take() {
                    let expired = current.collector.outstanding();
                    counters.expired_chunks.fetch_add(expired, Ordering::Relaxed);
                    warn!(
                        run = %current.collector.run(),
                        chunks = expired,
                        "completion timeout, outstanding chunks marked failed"
                    );
                    if let Some(snapshot) = current.collector.expire() {
                        current.publish(snapshot, &counters);
                    }
                    current.work.cancel();
                }
                continue;
            }
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        match signal {
            Signal::Begin(plan) => {
                if let Some(previous) = active.take() {
                    debug!(
                        run = %previous.collector.run(),
                        outstanding = previous.collector.outstanding(),
                        "run superseded before completion"
                    );
                }

                let current = ActiveRun::new(plan);
                match current.collector.initial() {
                    Some(snapshot) => {
                        debug!(run = %current.collector.run(), "run has no tasks, completed immediately");
                        current.publish(snapshot, &counters);
                    }
                    None => active = Some(current),
                }
            }
            Signal::Chunk(report) => {
                let Some(current) = active.as_mut() else {
                    counters.stale_reports.fetch_add(1, Ordering::Relaxed);
                    debug!(run = %report.run, "discarding report, no run in progress");
                    continue;
                };

                let run = report.run;
                let slot = report.chunk.slot;
                let done = match current.collector.accept(report) {
                    Verdict::Publish(snapshot) => {
                        counters.chunks_completed.fetch_add(1, Ordering::Relaxed);
                        let done = snapshot.is_complete();
                        if done {
                            info!(
                                %run,
                                tasks = snapshot.len(),
                                succeeded = snapshot.succeeded(),
                                failed = snapshot.failed(),
                                "run complete"
                            );
                        }
                        current.publish(snapshot, &counters);
                        done
                    }
                    Verdict::Held => {
                        counters.chunks_completed.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                    Verdict::Stale => {
                        counters.stale_reports.fetch_add(1, Ordering::Relaxed);
                        debug!(%run, current = %current.collector.run(), slot, "discarding stale report");
                        false
                    }
                    Verdict::Ignored => {
                        debug!(%run, slot, "ignoring duplicate or unknown chunk report");
                        false
                    }
                };

                if done {
                    active = None;
                }
            }
        }
    }

    trace!("aggregator stopped");
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition;
    use std::num::NonZeroUsize;
    use tokio::time::Duration;

    fn workers(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn report(run: u64, chunk: Chunk, base: u32) -> ChunkReport<u32> {
        let outcomes = chunk
            .range
            .clone()
            .map(|i| Outcome::Success(base + i as u32))
            .collect();
        ChunkReport { run: RunId(run), chunk, outcomes }
    }

    fn plan(
        run: u64,
        mode: DeliveryMode,
        len: usize,
        w: usize,
        publisher: mpsc::UnboundedSender<ResultSnapshot<u32>>,
    ) -> RunPlan<u32> {
        RunPlan {
            run: RunId(run),
            mode,
            len,
            chunks: partition(len, workers(w)),
            publisher,
            work: CancellationToken::new(),
            deadline: Instant::now() + Duration::from_secs(3600),
        }
    }

    #[test]
    fn batch_publishes_once_when_all_chunks_arrive() {
        let chunks = partition(10, workers(3));
        let mut collector = Collector::new(RunId(1), DeliveryMode::Batch, 10, chunks.clone());

        assert!(matches!(collector.accept(report(1, chunks[2].clone(), 0)), Verdict::Held));
        assert!(matches!(collector.accept(report(1, chunks[0].clone(), 0)), Verdict::Held));

        let Verdict::Publish(snapshot) = collector.accept(report(1, chunks[1].clone(), 0)) else {
            panic!("last chunk should publish");
        };
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.pending(), 0);
        let values: Vec<u32> = snapshot.handles().map(|(_, h)| *h).collect();
        assert_eq!(values, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn incremental_publishes_every_chunk_in_arrival_order() {
        let chunks = partition(10, workers(3));
        let mut collector = Collector::new(RunId(1), DeliveryMode::Incremental, 10, chunks.clone());

        let Verdict::Publish(first) = collector.accept(report(1, chunks[2].clone(), 0)) else {
            panic!("incremental mode publishes every chunk");
        };
        assert!(!first.is_complete());
        assert!(first.outcomes()[..8].iter().all(Outcome::is_pending));
        assert_eq!(first.get(8), Some(&Outcome::Success(8)));
        assert_eq!(first.get(9), Some(&Outcome::Success(9)));

        let Verdict::Publish(second) = collector.accept(report(1, chunks[0].clone(), 0)) else {
            panic!("incremental mode publishes every chunk");
        };
        assert_eq!(second.pending(), 4);
        for (before, after) in first.outcomes().iter().zip(second.outcomes()) {
            if before.is_resolved() {
                assert_eq!(before, after);
            }
        }

        let Verdict::Publish(last) = collector.accept(report(1, chunks[1].clone(), 0)) else {
            panic!("incremental mode publishes every chunk");
        };
        assert!(last.is_complete());
        assert_eq!(last.succeeded(), 10);
    }

    #[test]
    fn foreign_and_duplicate_reports_are_not_applied() {
        let chunks = partition(4, workers(2));
        let mut collector = Collector::new(RunId(2), DeliveryMode::Incremental, 4, chunks.clone());

        assert!(matches!(collector.accept(report(1, chunks[0].clone(), 50)), Verdict::Stale));
        assert!(matches!(collector.accept(report(2, chunks[0].clone(), 0)), Verdict::Publish(_)));
        assert!(matches!(collector.accept(report(2, chunks[0].clone(), 0)), Verdict::Ignored));

        let bogus = Chunk { slot: 1, range: 0..2 };
        assert!(matches!(collector.accept(report(2, bogus, 0)), Verdict::Ignored));
        assert_eq!(collector.outstanding(), 1);
    }

    #[test]
    fn short_report_fails_missing_positions() {
        let chunks = partition(4, workers(1));
        let mut collector = Collector::new(RunId(1), DeliveryMode::Batch, 4, chunks.clone());
        let short = ChunkReport {
            run: RunId(1),
            chunk: chunks[0].clone(),
            outcomes: vec![Outcome::Success(1), Outcome::Pending],
        };

        let Verdict::Publish(snapshot) = collector.accept(short) else {
            panic!("single chunk completes the run");
        };
        assert_eq!(
            snapshot.outcomes(),
            &[Outcome::Success(1), Outcome::Failed, Outcome::Failed, Outcome::Failed]
        );
    }

    #[test]
    fn empty_run_is_complete_on_creation() {
        let collector: Collector<u32> =
            Collector::new(RunId(1), DeliveryMode::Incremental, 0, partition(0, workers(4)));
        assert_eq!(collector.state(), CollectState::Complete);

        let snapshot = collector.initial().expect("empty run publishes immediately");
        assert!(snapshot.is_empty());
        assert!(snapshot.is_complete());
    }

    #[test]
    fn expire_fails_only_unreported_chunks() {
        let chunks = partition(6, workers(3));
        let mut collector = Collector::new(RunId(1), DeliveryMode::Batch, 6, chunks.clone());
        collector.accept(report(1, chunks[1].clone(), 0));

        let snapshot = collector.expire().expect("collecting run expires");
        assert_eq!(
            snapshot.outcomes(),
            &[
                Outcome::Failed,
                Outcome::Failed,
                Outcome::Success(2),
                Outcome::Success(3),
                Outcome::Failed,
                Outcome::Failed,
            ]
        );
        assert!(collector.expire().is_none());
    }

    #[tokio::test]
    async fn stale_report_after_newer_run_completes_has_no_effect() {
        let counters = Arc::new(Counters::default());
        let (signals, receiver) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate::<u32>(receiver, counters.clone()));

        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        signals.send(Signal::Begin(plan(1, DeliveryMode::Batch, 4, 2, first_tx))).unwrap();
        signals.send(Signal::Begin(plan(2, DeliveryMode::Batch, 2, 2, second_tx))).unwrap();

        for chunk in partition(2, workers(2)) {
            signals.send(Signal::Chunk(report(2, chunk, 100))).unwrap();
        }
        // late completions of the superseded run
        for chunk in partition(4, workers(2)) {
            signals.send(Signal::Chunk(report(1, chunk, 0))).unwrap();
        }

        let snapshot = second_rx.recv().await.expect("second run publishes");
        assert_eq!(snapshot.run(), RunId(2));
        assert_eq!(snapshot.outcomes(), &[Outcome::Success(100), Outcome::Success(101)]);
        assert!(second_rx.recv().await.is_none());
        assert!(first_rx.recv().await.is_none());

        drop(signals);
        aggregator.await.unwrap();
        assert_eq!(counters.metrics().stale_reports, 2);
        assert_eq!(counters.metrics().snapshots_published, 1);
    }

    #[tokio::test]
    async fn deadline_finalizes_hung_run() {
        let counters = Arc::new(Counters::default());
        let (signals, receiver) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate::<u32>(receiver, counters.clone()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut run = plan(1, DeliveryMode::Batch, 4, 2, tx);
        run.deadline = Instant::now() + Duration::from_millis(50);
        let work = run.work.clone();
        signals.send(Signal::Begin(run)).unwrap();
        signals
            .send(Signal::Chunk(report(1, partition(4, workers(2))[0].clone(), 0)))
            .unwrap();

        let snapshot = rx.recv().await.expect("expired run still publishes");
        assert!(snapshot.is_complete());
        assert_eq!(
            snapshot.outcomes(),
            &[Outcome::Success(0), Outcome::Success(1), Outcome::Failed, Outcome::Failed]
        );
        assert!(work.is_cancelled());
        assert_eq!(counters.metrics().expired_chunks, 1);

        drop(signals);
        aggregator.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_run_publishes_nothing() {
        let counters = Arc::new(Counters::default());
        let (signals, receiver) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate::<u32>(receiver, counters.clone()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = plan(1, DeliveryMode::Incremental, 2, 1, tx);
        let work = run.work.clone();
        signals.send(Signal::Begin(run)).unwrap();
        work.cancel();
        // the worker finished just as the run was cancelled
        signals
            .send(Signal::Chunk(report(1, partition(2, workers(1))[0].clone(), 0)))
            .unwrap();

        assert!(rx.recv().await.is_none(), "cancelled run must not publish");

        drop(signals);
        aggregator.await.unwrap();
        assert_eq!(counters.metrics().snapshots_published, 0);
    }

    #[tokio::test]
    async fn cancelled_run_is_retired_before_its_deadline() {
        let counters = Arc::new(Counters::default());
        let (signals, receiver) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate::<u32>(receiver, counters.clone()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut run = plan(1, DeliveryMode::Batch, 4, 2, tx);
        run.deadline = Instant::now() + Duration::from_millis(50);
        let work = run.work.clone();
        signals.send(Signal::Begin(run)).unwrap();
        work.cancel();

        assert!(rx.recv().await.is_none(), "retired run drops its publisher");
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(signals);
        aggregator.await.unwrap();
        let metrics = counters.metrics();
        assert_eq!(metrics.expired_chunks, 0);
        assert_eq!(metrics.snapshots_published, 0);
    }
}
