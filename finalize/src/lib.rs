//! Applies reviewed decisions and assigns stable identities.
//!
//! A [`Session`] ties one run together: it rebuilds the cluster state from
//! the annotations and the persisted partition journal, runs the clustering
//! engine, queues what it cannot decide, applies what reviewers resolved,
//! and finally hands out identities.
//!
//! ```ignore
//! let mut session = Session::open(config, kv, &annotations, &model)?;
//! session.apply_resolved()?;
//! session.cluster()?;
//! // ... reviewers work through session.decisions() ...
//! let report = session.finalize()?;
//! report.write_json("report.json")?;
//! ```
//!
//! Identities go only to clusters that no open pair is waiting on, and once
//! handed out they stick: a later merge keeps the oldest identity of the
//! merged lineage and retires the others. Excluded annotations pick up the
//! identity of their track when the track is unambiguous; a track spanning
//! two identities is reported as a [`StructuralIdentityConflict`].

mod error;
mod identity;
pub mod keys;
mod report;
mod session;

#[cfg(test)]
mod tests;

pub use error::FinalizeError;
pub use identity::Identity;
pub use report::{
    Assignment, AssignmentSource, FinalReport, IdentitySummary, RetiredIdentity,
    StructuralIdentityConflict, TrackMember,
};
pub use session::{ApplySummary, ClusterSummary, Session, SessionConfig, load_journal};
