//! Blocking wait for reviewers.

use clap::Args;
use tracing::info;

use herdid_decision::{DecisionError, DecisionStore, PollState, Poller};

use super::{get_config, print_info, print_success};
use crate::Cli;

/// Wait until no conflict is pending.
///
/// The store is opened on every tick and closed in between, so review
/// clients can write to it while this waits. Ctrl-C stops the wait without
/// touching the queue.
#[derive(Args)]
pub struct AwaitCommand {
    /// Seconds between polls (default: review.poll_interval_secs)
    #[arg(long)]
    interval: Option<u64>,
}

impl AwaitCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut cfg = get_config(cli)?;
        if let Some(secs) = self.interval {
            cfg.review.poll_interval_secs = secs.max(1);
        }

        let poller = Poller::new(cfg.review.poll_interval());
        let token = poller.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });

        info!(run = %cfg.run, interval = ?poller.interval(), "waiting for reviews");
        let timeout = cfg.review.claim_timeout();
        let state = poller
            .run_with(|| -> Result<usize, DecisionError> {
                let store = DecisionStore::new(cfg.open_store()?, cfg.run.clone());
                store.reset_expired_claims(timeout)?;
                store.pending_count()
            })
            .await?;

        match state {
            PollState::Drained => print_success("all conflicts reviewed"),
            PollState::Cancelled => print_info("wait cancelled; pending conflicts stay queued"),
            PollState::Waiting { pending } => print_info(&format!("{pending} conflicts pending")),
        }
        Ok(())
    }
}
