//! CLI commands module.

mod review;
mod run;
#[cfg(test)]
mod testing;
mod util;
mod wait;

pub use review::{
    ClaimCommand, HeartbeatCommand, HistoryCommand, PendingCommand, ReleaseCommand, ResolveCommand,
    StatsCommand,
};
pub use run::{ClusterCommand, FinalizeCommand};
pub use wait::AwaitCommand;

pub(crate) use util::*;
