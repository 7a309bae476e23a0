use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use herdid_graph::Edge;

use crate::ClusterId;

/// Slack for float noise when comparing a gap against the margin.
const GAP_EPSILON: f64 = 1e-6;

/// One candidate partition of a neighborhood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Human-readable summary, e.g. `merge c1+c4`.
    pub label: String,

    /// Every local cluster appears in exactly one group. Groups are sorted
    /// internally and ordered by their first member.
    pub groups: Vec<Vec<ClusterId>>,

    /// Aggregate affinity in [0, 1].
    pub score: f32,
}

impl Hypothesis {
    pub(crate) fn new(mut groups: Vec<Vec<ClusterId>>) -> Self {
        for g in &mut groups {
            g.sort();
        }
        groups.retain(|g| !g.is_empty());
        groups.sort();

        let merged: Vec<String> = groups
            .iter()
            .filter(|g| g.len() > 1)
            .map(|g| g.iter().map(ToString::to_string).collect::<Vec<_>>().join("+"))
            .collect();
        let label = if merged.is_empty() {
            "keep separate".to_string()
        } else {
            format!("merge {}", merged.join(", "))
        };

        Self {
            label,
            groups,
            score: 0.0,
        }
    }

    /// The group that merges clusters, if any.
    pub fn merge_group(&self) -> Option<&[ClusterId]> {
        self.groups.iter().find(|g| g.len() > 1).map(Vec::as_slice)
    }

    pub fn is_keep_separate(&self) -> bool {
        self.merge_group().is_none()
    }

    fn group_of(&self, id: ClusterId) -> Option<usize> {
        self.groups.iter().position(|g| g.contains(&id))
    }

    /// Whether both clusters sit in the same group.
    pub fn together(&self, a: ClusterId, b: ClusterId) -> bool {
        match (self.group_of(a), self.group_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Replaces cluster ids in place and renormalizes.
    pub(crate) fn remap(&mut self, map: impl Fn(ClusterId) -> ClusterId) {
        let groups: Vec<Vec<ClusterId>> = self
            .groups
            .iter()
            .map(|g| g.iter().map(|id| map(*id)).collect())
            .collect();
        let score = self.score;
        *self = Hypothesis::new(groups);
        self.score = score;
    }
}

/// Outcome of comparing the two best hypotheses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// The best hypothesis leads by at least the margin.
    Commit { gap: f32 },
    /// Too close to call.
    Ambiguous { gap: f32 },
    /// Nothing to choose from.
    Empty,
}

/// Applies the margin rule to hypotheses ranked best first.
///
/// A single hypothesis commits trivially. The gap is computed in f64 with a
/// small epsilon, so a lead that equals the margin up to float rounding
/// still commits.
pub fn decide(ranked: &[Hypothesis], margin: f32) -> Verdict {
    match ranked {
        [] => Verdict::Empty,
        [only] => Verdict::Commit { gap: only.score },
        [best, second, ..] => {
            let gap = best.score as f64 - second.score as f64;
            if gap + GAP_EPSILON >= margin as f64 {
                Verdict::Commit { gap: gap as f32 }
            } else {
                Verdict::Ambiguous { gap: gap as f32 }
            }
        }
    }
}

/// Alternatives for a seed and its best-first neighbors: keep everything
/// separate, merge the seed with its best neighbor, for each further
/// neighbor merge it in as well, and merge the whole neighborhood.
pub(crate) fn enumerate(seed: ClusterId, neighbors: &[ClusterId]) -> Vec<Hypothesis> {
    let Some((&best, rest)) = neighbors.split_first() else {
        return Vec::new();
    };
    let singles = |except: &[ClusterId]| -> Vec<Vec<ClusterId>> {
        neighbors
            .iter()
            .filter(|n| !except.contains(n))
            .map(|n| vec![*n])
            .collect()
    };

    let mut out = Vec::with_capacity(neighbors.len() + 2);

    let mut keep = singles(&[]);
    keep.push(vec![seed]);
    out.push(Hypothesis::new(keep));

    let mut pair = singles(&[best]);
    pair.push(vec![seed, best]);
    out.push(Hypothesis::new(pair));

    for &c in rest {
        let mut triple = singles(&[best, c]);
        triple.push(vec![seed, best, c]);
        out.push(Hypothesis::new(triple));
    }

    // With three or more neighbors the triples cannot express a clique.
    if rest.len() > 1 {
        let mut all = vec![seed];
        all.extend_from_slice(neighbors);
        out.push(Hypothesis::new(vec![all]));
    }
    out
}

/// Scores a hypothesis against the local edges: the confidence-weighted
/// mean of `score` for endpoints grouped together and `1 - score` for
/// endpoints kept apart.
pub(crate) fn agreement(h: &Hypothesis, edges: &[(ClusterId, ClusterId, Edge)]) -> f32 {
    if edges.is_empty() {
        return 0.0;
    }
    let mut weighted = 0.0f64;
    let mut plain = 0.0f64;
    let mut weights = 0.0f64;
    for (a, b, e) in edges {
        let s = e.score as f64;
        let v = if h.together(*a, *b) { s } else { 1.0 - s };
        weighted += v * e.confidence as f64;
        plain += v;
        weights += e.confidence as f64;
    }
    let mean = if weights > 0.0 {
        weighted / weights
    } else {
        plain / edges.len() as f64
    };
    mean.clamp(0.0, 1.0) as f32
}

/// Stable sort, best first. Equal scores keep enumeration order, so
/// `keep separate` wins ties.
pub(crate) fn rank(mut hs: Vec<Hypothesis>) -> Vec<Hypothesis> {
    hs.sort_by(|x, y| y.score.partial_cmp(&x.score).unwrap_or(Ordering::Equal));
    hs
}

/// Clusters whose grouping differs between two hypotheses.
pub(crate) fn differing(x: &Hypothesis, y: &Hypothesis, local: &[ClusterId]) -> Vec<ClusterId> {
    let mut out: Vec<ClusterId> = local
        .iter()
        .copied()
        .filter(|&id| {
            local
                .iter()
                .any(|&other| other != id && x.together(id, other) != y.together(id, other))
        })
        .collect();
    out.sort();
    out
}
