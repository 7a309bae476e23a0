use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{DecisionError, DecisionStore};

/// Default wait between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Where the wait for reviews stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Reviews are still outstanding.
    Waiting { pending: usize },
    /// No pending pair is left.
    Drained,
    /// The wait was cancelled; nothing is lost, pending rows stay queued.
    Cancelled,
}

/// Waits for reviewers on a fixed interval until the queue drains.
///
/// The poller never pushes and never times out a pending pair: the only
/// ways out are an empty queue, cancellation, or a store error.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self::with_cancel(interval, CancellationToken::new())
    }

    pub fn with_cancel(interval: Duration, cancel: CancellationToken) -> Self {
        Self { interval, cancel }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Token that stops [`Poller::run`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// One poll against `store`.
    pub fn step(&self, store: &DecisionStore) -> Result<PollState, DecisionError> {
        if self.cancel.is_cancelled() {
            return Ok(PollState::Cancelled);
        }
        Ok(match store.pending_count()? {
            0 => PollState::Drained,
            pending => PollState::Waiting { pending },
        })
    }

    /// Polls `store` until it drains or the poller is cancelled.
    pub async fn run(&self, store: &DecisionStore) -> Result<PollState, DecisionError> {
        self.run_with(|| store.pending_count()).await
    }

    /// Polls with a caller-supplied pending count, for callers that reopen
    /// the store on every tick.
    ///
    /// A tick that finds the store held by another process is logged and
    /// retried on the next tick; any other error ends the wait.
    pub async fn run_with<F>(&self, mut pending: F) -> Result<PollState, DecisionError>
    where
        F: FnMut() -> Result<usize, DecisionError>,
    {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(PollState::Cancelled),
                _ = ticker.tick() => {}
            }
            match pending() {
                Ok(0) => return Ok(PollState::Drained),
                Ok(n) => debug!(pending = n, "decision: waiting for reviews"),
                Err(DecisionError::StoreUnavailable(msg)) => {
                    warn!(%msg, "decision: store busy, retrying next tick");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}
