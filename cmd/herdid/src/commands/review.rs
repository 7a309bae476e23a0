//! Review queue commands. These only touch the store, never the inputs.

use clap::Args;
use serde::Serialize;

use herdid_decision::{AuditEntry, ClusterPair, Decision, Outcome};

use super::{get_config, open_decisions, output_result, print_info, print_success};
use crate::Cli;

/// List pending conflicts in pair-id order.
#[derive(Args)]
pub struct PendingCommand {
    /// Show at most this many
    #[arg(long)]
    limit: Option<usize>,

    /// Start after this pair id
    #[arg(long)]
    after: Option<String>,
}

impl PendingCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let decisions = open_decisions(&cfg)?;
        let iter = match &self.after {
            Some(cursor) => decisions.list_pending_after(cursor),
            None => decisions.list_pending(),
        };
        let pending = iter
            .take(self.limit.unwrap_or(usize::MAX))
            .collect::<Result<Vec<ClusterPair>, _>>()?;
        if pending.is_empty() {
            print_info("no pending conflicts");
        }
        output_result(&pending, cli.output.as_deref(), cli.json)
    }
}

/// Reserve the next unclaimed pending conflict.
#[derive(Args)]
pub struct ClaimCommand {
    /// Reviewer name
    #[arg(long)]
    reviewer: String,
}

impl ClaimCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let decisions = open_decisions(&cfg)?;
        match decisions.claim_next(&self.reviewer)? {
            Some(pair) => {
                print_success(&format!("{} claimed by {}", pair.pair_id, self.reviewer));
                output_result(&pair, cli.output.as_deref(), cli.json)
            }
            None => {
                print_info("nothing left to claim");
                Ok(())
            }
        }
    }
}

/// Renew a claim so it does not expire while the reviewer is still on it.
#[derive(Args)]
pub struct HeartbeatCommand {
    /// Pair id, e.g. p3-7
    pair_id: String,

    /// Reviewer name
    #[arg(long)]
    reviewer: String,
}

impl HeartbeatCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let decisions = open_decisions(&cfg)?;
        decisions.heartbeat(&self.pair_id, &self.reviewer)?;
        print_success(&format!("{} still claimed by {}", self.pair_id, self.reviewer));
        Ok(())
    }
}

/// Record a decision for a pending conflict.
#[derive(Args)]
pub struct ResolveCommand {
    /// Pair id, e.g. p3-7
    pair_id: String,

    /// merge, split or defer
    outcome: Outcome,

    /// Reviewer name
    #[arg(long)]
    reviewer: String,
}

impl ResolveCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let decisions = open_decisions(&cfg)?;
        let decision = Decision::new(&self.pair_id, self.outcome, &self.reviewer);
        let row = decisions.resolve(&self.pair_id, decision)?;
        print_success(&format!("{} resolved as {}", row.pair_id, self.outcome));
        Ok(())
    }
}

/// Release one claim, or every claim a reviewer holds.
#[derive(Args)]
pub struct ReleaseCommand {
    /// Pair id; all of the reviewer's claims when omitted
    pair_id: Option<String>,

    /// Reviewer name
    #[arg(long)]
    reviewer: String,
}

impl ReleaseCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let decisions = open_decisions(&cfg)?;
        let released = match &self.pair_id {
            Some(pair_id) => usize::from(decisions.release(pair_id, &self.reviewer)?),
            None => decisions.release_all(&self.reviewer)?,
        };
        print_success(&format!("{released} claims released"));
        Ok(())
    }
}

/// Queue summary per status and reviewer.
#[derive(Args)]
pub struct StatsCommand {
    /// Release claims whose heartbeat is older than the configured timeout first
    #[arg(long)]
    reset_expired: bool,
}

impl StatsCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let decisions = open_decisions(&cfg)?;
        if self.reset_expired {
            let n = decisions.reset_expired_claims(cfg.review.claim_timeout())?;
            if n > 0 {
                print_info(&format!("{n} expired claims released"));
            }
        }
        output_result(&decisions.stats()?, cli.output.as_deref(), cli.json)
    }
}

/// Status transitions and replaced versions of one pair.
#[derive(Args)]
pub struct HistoryCommand {
    /// Pair id, e.g. p3-7
    pair_id: String,
}

#[derive(Serialize)]
struct History {
    current: Option<ClusterPair>,
    transitions: Vec<AuditEntry>,
    archived: Vec<ClusterPair>,
}

impl HistoryCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let decisions = open_decisions(&cfg)?;
        let history = History {
            current: decisions.get(&self.pair_id)?,
            transitions: decisions.audit_log_for(&self.pair_id)?,
            archived: decisions.archived(&self.pair_id)?,
        };
        output_result(&history, cli.output.as_deref(), cli.json)
    }
}
