use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use herdid_affinity::Affinity;
use herdid_graph::ClusterGraph;

use crate::engine::{ClusterState, Engine};
use crate::partition::Partition;
use crate::{ClusterId, LcaError};

impl Engine<'_> {
    /// Builds the initial singleton partition and its graph.
    ///
    /// Every candidate pair of `identifiable` annotations is scored; for
    /// each annotation only its `max_candidates` best partners at or above
    /// the similarity floor become edges. Annotations are not weighted by
    /// track: tracks matter only after identities are final.
    pub fn build(&self, identifiable: &[String]) -> Result<ClusterState, LcaError> {
        self.config().validate()?;
        let partition = Partition::singletons(self.annotations(), identifiable)?;

        let mut graph = ClusterGraph::new();
        for id in partition.live_ids() {
            graph.insert_node(id)?;
        }

        let scored = self.score_candidates(&partition)?;
        let candidates = scored.len();
        let kept = top_k(scored, self.config().max_candidates);
        for (a, b, aff) in &kept {
            graph.upsert_edge(*a, *b, aff.score, aff.confidence)?;
        }
        debug!(
            nodes = graph.node_count(),
            candidates,
            edges = graph.edge_count(),
            "lca: graph built"
        );
        Ok(ClusterState::new(graph, partition))
    }

    /// Scores candidate pairs and drops those below the floor. Output is in
    /// (a, b) order with a < b.
    fn score_candidates(&self, partition: &Partition) -> Result<Vec<(ClusterId, ClusterId, Affinity)>, LcaError> {
        let pairs: BTreeSet<(ClusterId, ClusterId)> = match self.model().candidate_pairs() {
            Some(listed) => listed
                .iter()
                .filter_map(|(x, y)| {
                    let a = partition.cluster_of(x)?;
                    let b = partition.cluster_of(y)?;
                    match a.cmp(&b) {
                        std::cmp::Ordering::Less => Some((a, b)),
                        std::cmp::Ordering::Greater => Some((b, a)),
                        std::cmp::Ordering::Equal => None,
                    }
                })
                .collect(),
            None => {
                let ids = partition.live_ids();
                let mut all = BTreeSet::new();
                for (i, &a) in ids.iter().enumerate() {
                    for &b in &ids[i + 1..] {
                        all.insert((a, b));
                    }
                }
                all
            }
        };

        let floor = self.config().similarity_floor;
        let mut out = Vec::new();
        for (a, b) in pairs {
            let aff = self.rescore(partition, a, b)?;
            if aff.score >= floor {
                out.push((a, b, aff));
            }
        }
        Ok(out)
    }
}

/// Keeps an edge if it is among the best `k` of either endpoint. `k == 0`
/// keeps everything.
fn top_k(
    scored: Vec<(ClusterId, ClusterId, Affinity)>,
    k: usize,
) -> Vec<(ClusterId, ClusterId, Affinity)> {
    if k == 0 {
        return scored;
    }
    let mut per_node: HashMap<ClusterId, Vec<(f32, ClusterId, usize)>> = HashMap::new();
    for (i, (a, b, aff)) in scored.iter().enumerate() {
        per_node.entry(*a).or_default().push((aff.score, *b, i));
        per_node.entry(*b).or_default().push((aff.score, *a, i));
    }
    let mut keep: BTreeSet<usize> = BTreeSet::new();
    for list in per_node.values_mut() {
        list.sort_by(|x, y| y.0.total_cmp(&x.0).then(x.1.cmp(&y.1)));
        keep.extend(list.iter().take(k).map(|(_, _, i)| *i));
    }
    scored
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, e)| e)
        .collect()
}
