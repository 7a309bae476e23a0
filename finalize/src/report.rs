use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herdid_annotation::Viewpoint;
use herdid_decision::AuditEntry;
use herdid_lca::ClusterId;

use crate::FinalizeError;

/// How an annotation got its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    /// Member of a cluster that carries an identity.
    Cluster,
    /// Excluded annotation attached through its track.
    Track,
    /// Blocked by an open conflict, or excluded with nothing to attach to.
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub annotation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<ClusterId>,

    pub source: AssignmentSource,
}

/// One identity as it stands after this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub cluster_id: ClusterId,
    pub members: Vec<String>,
    pub viewpoints: Vec<Viewpoint>,
    pub representative: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredIdentity {
    pub identity_id: String,
    pub merged_into: String,
}

/// A member of a conflicting track and the identity it ended up with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMember {
    pub annotation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
}

/// A track whose annotations ended up under two or more identities.
///
/// Reported only. Either the tracker or the clustering is wrong, and
/// deciding which needs a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralIdentityConflict {
    pub track_id: String,
    pub identities: Vec<String>,
    pub annotations: Vec<TrackMember>,
}

impl fmt::Display for StructuralIdentityConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "track {} spans identities {}",
            self.track_id,
            self.identities.join(", ")
        )
    }
}

/// Everything the finalizer knows at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub run: String,
    pub generated_at: DateTime<Utc>,

    /// One entry per annotation, excluded ones included, in id order.
    pub assignments: Vec<Assignment>,

    pub identities: Vec<IdentitySummary>,
    pub retired: Vec<RetiredIdentity>,

    /// Status transitions into `applied`.
    pub audit: Vec<AuditEntry>,

    pub structural_conflicts: Vec<StructuralIdentityConflict>,

    /// Live clusters still waiting on an open conflict.
    pub blocked_clusters: usize,
}

impl FinalReport {
    /// No structural conflict was found.
    pub fn is_clean(&self) -> bool {
        self.structural_conflicts.is_empty()
    }

    pub fn identity_of(&self, annotation_id: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|a| a.annotation_id == annotation_id)
            .and_then(|a| a.identity_id.as_deref())
    }

    pub fn assigned(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| a.identity_id.is_some())
            .count()
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), FinalizeError> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| FinalizeError::Serialization(e.to_string()))?;
        fs::write(path, data)?;
        Ok(())
    }
}
