use super::model::RunId;
use std::sync::Arc;


/// Per-task state inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<H> {
    Pending,
    Success(H),
    Failed,
}

impl<H> Default for Outcome<H> {
    fn default() -> Self {
        Outcome::Pending
    }
}

impl<H> Outcome<H> {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed)
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        !self.is_pending()
    }

    pub fn handle(&self) -> Option<&H> {
        match self {
            Outcome::Success(handle) => Some(handle),
            _ => None,
        }
    }
}

impl<H, E> From<Result<H, E>> for Outcome<H> {
    fn from(result: Result<H, E>) -> Self {
        match result {
            Ok(handle) => Outcome::Success(handle),
            Err(_) => Outcome::Failed,
        }
    }
}


/// Index-ordered, read-only view of every outcome of one run.
#[derive(Debug, Clone)]
pub struct ResultSnapshot<H> {
    run: RunId,
    outcomes: Arc<[Outcome<H>]>,
    complete: bool,
}

impl<H> ResultSnapshot<H> {
    pub(crate) fn new(run: RunId, outcomes: Arc<[Outcome<H>]>, complete: bool) -> Self {
        Self { run, outcomes, complete }
    }

    #[inline]
    pub fn run(&self) -> RunId {
        self.run
    }

    /// `true` for the last snapshot a run will ever publish.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[inline]
    pub fn outcomes(&self) -> &[Outcome<H>] {
        &self.outcomes
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Outcome<H>> {
        self.outcomes.get(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_pending()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    /// Render-ready handles with their absolute task index.
    pub fn handles(&self) -> impl Iterator<Item = (usize, &H)> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.handle().map(|h| (index, h)))
    }
}
