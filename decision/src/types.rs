use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herdid_graph::NodeId;

use crate::DecisionError;

/// Deterministic id of the pair `{a, b}`: `p{lo}-{hi}`.
pub fn pair_id(a: NodeId, b: NodeId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("p{}-{}", lo.0, hi.0)
}

/// Lifecycle of a pair row. `Applied` and `Stale` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Pending,
    Resolved,
    Applied,
    Stale,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::Pending => "pending",
            PairStatus::Resolved => "resolved",
            PairStatus::Applied => "applied",
            PairStatus::Stale => "stale",
        }
    }

    /// Pending or resolved: the pair still blocks identity assignment.
    pub fn is_open(&self) -> bool {
        matches!(self, PairStatus::Pending | PairStatus::Resolved)
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a reviewer decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Same individual.
    Merge,
    /// Different individuals; never propose the pair again.
    Split,
    /// Undecided; leave the clusters apart for now.
    Defer,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Merge => "merge",
            Outcome::Split => "split",
            Outcome::Defer => "defer",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = DecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Outcome::Merge),
            "split" => Ok(Outcome::Split),
            "defer" => Ok(Outcome::Defer),
            _ => Err(DecisionError::InvalidOutcome(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub pair_id: String,
    pub outcome: Outcome,
    pub decided_at: DateTime<Utc>,
    pub decided_by: String,
}

impl Decision {
    pub fn new(pair_id: impl Into<String>, outcome: Outcome, decided_by: impl Into<String>) -> Self {
        Self {
            pair_id: pair_id.into(),
            outcome,
            decided_at: Utc::now(),
            decided_by: decided_by.into(),
        }
    }
}

/// One scored partition hypothesis, as shown to the reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub label: String,
    pub groups: Vec<Vec<NodeId>>,
    pub score: f32,
}

/// A reviewer's reservation of a pending pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub by: String,
    pub claimed_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
}

/// A conflict row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPair {
    pub pair_id: String,
    pub cluster_a: NodeId,
    pub cluster_b: NodeId,

    /// Competing hypotheses, best first.
    pub alternatives: Vec<Alternative>,

    /// The clusters of the neighborhood that stay untouched until the pair
    /// is decided, both ends included, ascending.
    #[serde(default)]
    pub frozen: Vec<NodeId>,

    pub status: PairStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
}

impl ClusterPair {
    /// A fresh pending row. The cluster ids are stored in ascending order.
    pub fn new(a: NodeId, b: NodeId, alternatives: Vec<Alternative>) -> Self {
        let (cluster_a, cluster_b) = if a <= b { (a, b) } else { (b, a) };
        let now = Utc::now();
        Self {
            pair_id: pair_id(a, b),
            cluster_a,
            cluster_b,
            alternatives,
            frozen: vec![cluster_a, cluster_b],
            status: PairStatus::Pending,
            decision: None,
            created_at: now,
            updated_at: now,
            claim: None,
        }
    }

    /// Adds the rest of the neighborhood to the frozen clusters.
    pub fn with_frozen(mut self, frozen: impl IntoIterator<Item = NodeId>) -> Self {
        let mut held = self.held();
        held.extend(frozen);
        self.frozen = held.into_iter().collect();
        self
    }

    /// Both ends plus every frozen cluster.
    pub fn held(&self) -> BTreeSet<NodeId> {
        let mut held: BTreeSet<NodeId> = self.frozen.iter().copied().collect();
        held.insert(self.cluster_a);
        held.insert(self.cluster_b);
        held
    }

    pub fn touches(&self, id: NodeId) -> bool {
        self.held().contains(&id)
    }

    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        self.decision.as_ref().map(|d| d.decided_at)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.decision.as_ref().map(|d| d.outcome)
    }

    /// Whether two rows describe the same question.
    pub(crate) fn same_request(&self, other: &ClusterPair) -> bool {
        self.cluster_a == other.cluster_a
            && self.cluster_b == other.cluster_b
            && self.alternatives == other.alternatives
            && self.held() == other.held()
    }
}

/// Result of [`crate::DecisionStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// Identical row already present.
    Unchanged,
    /// A stale or deferred row was archived and replaced.
    Requeued,
}

/// One status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub pair_id: String,
    pub seq: u64,
    pub from: Option<PairStatus>,
    pub to: PairStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    pub at: DateTime<Utc>,
}

/// Queue summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub pending: usize,
    pub resolved: usize,
    pub applied: usize,
    pub stale: usize,

    /// Pending pairs currently claimed.
    pub claimed: usize,

    /// Claimed pairs per reviewer.
    pub reviewers: BTreeMap<String, usize>,
}

impl Stats {
    pub fn total(&self) -> usize {
        self.pending + self.resolved + self.applied + self.stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_id_is_order_independent() {
        assert_eq!(pair_id(NodeId(7), NodeId(3)), "p3-7");
        assert_eq!(pair_id(NodeId(3), NodeId(7)), "p3-7");
        let pair = ClusterPair::new(NodeId(9), NodeId(2), Vec::new());
        assert_eq!((pair.cluster_a, pair.cluster_b), (NodeId(2), NodeId(9)));
        assert_eq!(pair.pair_id, "p2-9");
    }

    #[test]
    fn frozen_neighborhood() {
        let pair = ClusterPair::new(NodeId(3), NodeId(1), Vec::new());
        assert_eq!(pair.frozen, vec![NodeId(1), NodeId(3)]);

        let pair = pair.with_frozen([NodeId(2), NodeId(3)]);
        assert_eq!(pair.frozen, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert!(pair.touches(NodeId(2)));
        assert!(!pair.touches(NodeId(4)));

        // Rows written without the field still hold both ends.
        let mut json = serde_json::to_value(&pair).unwrap();
        json.as_object_mut().unwrap().remove("frozen");
        let old: ClusterPair = serde_json::from_value(json).unwrap();
        assert!(old.frozen.is_empty());
        assert_eq!(old.held(), [NodeId(1), NodeId(3)].into_iter().collect());
    }

    #[test]
    fn outcome_parse() {
        assert_eq!("Merge".parse::<Outcome>().unwrap(), Outcome::Merge);
        assert_eq!(" split ".parse::<Outcome>().unwrap(), Outcome::Split);
        assert!(matches!(
            "maybe".parse::<Outcome>(),
            Err(DecisionError::InvalidOutcome(_))
        ));
    }

    #[test]
    fn row_json_shape() {
        let mut pair = ClusterPair::new(
            NodeId(1),
            NodeId(2),
            vec![Alternative {
                label: "merge c1+c2".into(),
                groups: vec![vec![NodeId(1), NodeId(2)]],
                score: 0.55,
            }],
        );
        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["cluster_a"], 1);
        assert_eq!(json["alternatives"][0]["groups"][0][1], 2);
        assert!(json.get("decision").is_none());

        pair.decision = Some(Decision::new("p1-2", Outcome::Split, "alice"));
        let text = serde_json::to_string(&pair).unwrap();
        let back: ClusterPair = serde_json::from_str(&text).unwrap();
        assert_eq!(back, pair);
    }
}
