use super::{
    errors::EngineError,
    model::RunId,
    result::ResultSnapshot,
};
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use futures::{Stream, StreamExt};
use tokio::{
    sync::mpsc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;


/// Live feed of snapshots for one run, with cancellation.
///
/// The stream ends after the run's complete snapshot, or as soon as the run is
/// cancelled, superseded by a newer run, or the engine is disposed. Nothing
/// buffered for a cancelled run is yielded. Dropping the subscription cancels
/// its run.
pub struct Subscription<H> {
    run: RunId,
    cancel_token: CancellationToken,
    receiver: mpsc::UnboundedReceiver<ResultSnapshot<H>>,
}

impl<H> Subscription<H> {
    pub(crate) fn new(
        run: RunId,
        cancel_token: CancellationToken,
        receiver: mpsc::UnboundedReceiver<ResultSnapshot<H>>,
    ) -> Self {
        Self {
            run,
            cancel_token,
            receiver,
        }
    }

    #[inline]
    pub fn run(&self) -> RunId {
        self.run
    }

    /// Abandons the run: workers stop on it and no further snapshot is yielded.
    #[inline]
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ResultSnapshot<H>>, EngineError> {
        tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| EngineError::Timeout)
    }

    /// Drains the stream and returns the most recent snapshot.
    pub async fn last(mut self) -> Option<ResultSnapshot<H>> {
        let mut last = None;
        while let Some(snapshot) = self.next().await {
            last = Some(snapshot);
        }
        last
    }
}

impl<H> Stream for Subscription<H> {
    type Item = ResultSnapshot<H>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel_token.is_cancelled() {
            this.receiver.close();
            return Poll::Ready(None);
        }
        match this.receiver.poll_recv(cx) {
            // cancelled while the snapshot was in flight
            Poll::Ready(Some(_)) if this.cancel_token.is_cancelled() => {
                this.receiver.close();
                Poll::Ready(None)
            }
            poll => poll,
        }
    }
}

impl<H> Drop for Subscription<H> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
