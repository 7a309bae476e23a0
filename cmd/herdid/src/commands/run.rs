//! Commands that open a full session: clustering and finalization.

use clap::Args;
use serde::Serialize;

use herdid_finalize::{ApplySummary, ClusterSummary, Session};

use super::{get_config, output_result, print_info, print_success, print_warning};
use crate::Cli;

/// Apply resolved reviews, then run the clustering engine.
///
/// Reviews are applied first so the engine sees merged clusters and
/// separations before it proposes anything.
#[derive(Args)]
pub struct ClusterCommand {}

#[derive(Serialize)]
struct ClusterOutput {
    applied: ApplySummary,
    clustered: ClusterSummary,
}

impl ClusterCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = get_config(cli)?;
        let annotations = cfg.load_annotations()?;
        let model = cfg.load_model()?;
        let kv = cfg.open_store()?;

        let mut session = Session::open(cfg.session_config(), kv, &annotations, model.as_ref())?;
        let applied = session.apply_resolved()?;
        let clustered = session.cluster()?;

        if clustered.rejected > 0 {
            print_warning(&format!(
                "{} conflicts clash with existing rows and were not queued",
                clustered.rejected
            ));
        }
        print_success(&format!(
            "{} clusters, {} merges, {} new conflicts",
            clustered.live_clusters,
            clustered.merges,
            clustered.queued + clustered.requeued
        ));
        output_result(
            &ClusterOutput { applied, clustered },
            cli.output.as_deref(),
            cli.json,
        )
    }
}

/// Apply every resolved review and assign identities.
///
/// Exits with status 2 when a track spans more than one identity.
#[derive(Args)]
pub struct FinalizeCommand {}

impl FinalizeCommand {
    /// Returns whether the report is free of structural conflicts.
    pub fn run(&self, cli: &Cli) -> anyhow::Result<bool> {
        let cfg = get_config(cli)?;
        let annotations = cfg.load_annotations()?;
        let model = cfg.load_model()?;
        let kv = cfg.open_store()?;

        let mut session = Session::open(cfg.session_config(), kv, &annotations, model.as_ref())?;
        let report = session.finalize()?;

        match cli.output.as_deref() {
            Some(path) => {
                report.write_json(path)?;
                print_success(&format!("report written to {}", path.display()));
            }
            None => output_result(&report, None, true)?,
        }

        if report.blocked_clusters > 0 {
            print_info(&format!(
                "{} clusters wait on open reviews and have no identity yet",
                report.blocked_clusters
            ));
        }
        for conflict in &report.structural_conflicts {
            print_warning(&conflict.to_string());
        }
        print_success(&format!(
            "{} identities, {} of {} annotations assigned",
            report.identities.len(),
            report.assigned(),
            report.assignments.len()
        ));
        Ok(report.is_clean())
    }
}
