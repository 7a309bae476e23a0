use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GraphError;

/// Stable identifier of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Current affinity between two nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub score: f32,
    pub confidence: f32,

    /// Set when an endpoint's membership changed since the score was
    /// computed.
    pub stale: bool,
}

impl Edge {
    /// Picks the edge to keep when contraction produces two edges to the
    /// same neighbor: higher confidence wins, then higher score.
    fn combine(self, other: Edge) -> Edge {
        let keep_other = other.confidence > self.confidence
            || (other.confidence == self.confidence && other.score > self.score);
        if keep_other { other } else { self }
    }
}

/// What a contraction did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contraction {
    pub merged: NodeId,

    /// The edge between the two contracted nodes, if there was one.
    pub joined_by: Option<Edge>,

    /// Number of distinct neighbors now attached to the merged node.
    pub rewired: usize,
}

/// Undirected graph with at most one edge per unordered node pair.
///
/// Adjacency is stored in both directions in ordered maps, so every
/// traversal is a deterministic function of node ids. Contraction touches
/// only the two endpoints and their neighbors.
#[derive(Debug, Clone, Default)]
pub struct ClusterGraph {
    adj: BTreeMap<NodeId, BTreeMap<NodeId, Edge>>,
    edges: usize,
}

fn check_unit(a: NodeId, b: NodeId, score: f32, confidence: f32) -> Result<(), GraphError> {
    if !(0.0..=1.0).contains(&score) || !(0.0..=1.0).contains(&confidence) {
        return Err(GraphError::InvalidScore {
            a,
            b,
            score,
            confidence,
        });
    }
    Ok(())
}

impl ClusterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an isolated node.
    pub fn insert_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        if self.adj.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        self.adj.insert(id, BTreeMap::new());
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.adj.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.adj.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges
    }

    /// Nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.adj.keys().copied()
    }

    pub fn degree(&self, id: NodeId) -> usize {
        self.adj.get(&id).map_or(0, BTreeMap::len)
    }

    /// Inserts or overwrites the edge between `a` and `b` with a fresh
    /// score. Values outside [0, 1] are rejected.
    pub fn upsert_edge(
        &mut self,
        a: NodeId,
        b: NodeId,
        score: f32,
        confidence: f32,
    ) -> Result<(), GraphError> {
        check_unit(a, b, score, confidence)?;
        if a == b {
            return Err(GraphError::SelfLoop(a));
        }
        if !self.adj.contains_key(&b) {
            return Err(GraphError::NodeNotFound(b));
        }
        let edge = Edge {
            score,
            confidence,
            stale: false,
        };
        let fwd = self.adj.get_mut(&a).ok_or(GraphError::NodeNotFound(a))?;
        if fwd.insert(b, edge).is_none() {
            self.edges += 1;
        }
        if let Some(rev) = self.adj.get_mut(&b) {
            rev.insert(a, edge);
        }
        Ok(())
    }

    pub fn edge(&self, a: NodeId, b: NodeId) -> Option<Edge> {
        self.adj.get(&a).and_then(|m| m.get(&b)).copied()
    }

    /// Neighbors with edge score at or above `min_score`, best first; equal
    /// scores are ordered by node id.
    pub fn neighbors(&self, node: NodeId, min_score: f32) -> Result<Vec<(NodeId, Edge)>, GraphError> {
        let adj = self.adj.get(&node).ok_or(GraphError::NodeNotFound(node))?;
        let mut out: Vec<(NodeId, Edge)> = adj
            .iter()
            .filter(|(_, e)| e.score >= min_score)
            .map(|(n, e)| (*n, *e))
            .collect();
        out.sort_by(|x, y| y.1.score.total_cmp(&x.1.score).then(x.0.cmp(&y.0)));
        Ok(out)
    }

    /// Neighbors whose edge to `node` needs rescoring, in id order.
    pub fn stale_neighbors(&self, node: NodeId) -> Vec<NodeId> {
        self.adj.get(&node).map_or_else(Vec::new, |adj| {
            adj.iter()
                .filter(|(_, e)| e.stale)
                .map(|(n, _)| *n)
                .collect()
        })
    }

    /// Marks every edge of `node` stale.
    pub fn mark_stale(&mut self, node: NodeId) {
        let Some(adj) = self.adj.get_mut(&node) else {
            return;
        };
        let neighbors: Vec<NodeId> = adj.keys().copied().collect();
        for e in adj.values_mut() {
            e.stale = true;
        }
        for n in neighbors {
            if let Some(e) = self.adj.get_mut(&n).and_then(|m| m.get_mut(&node)) {
                e.stale = true;
            }
        }
    }

    /// Contracts `a` and `b` into the new node `merged`.
    ///
    /// Every edge of `a` and `b` is rewired onto `merged`; when both had an
    /// edge to the same neighbor the higher-confidence one is kept. Rewired
    /// edges are stale. Contracting two nodes without an edge between them
    /// is allowed but logged, since it means the merge came from outside the
    /// graph.
    pub fn contract(&mut self, a: NodeId, b: NodeId, merged: NodeId) -> Result<Contraction, GraphError> {
        if a == b {
            return Err(GraphError::SelfLoop(a));
        }
        if self.adj.contains_key(&merged) {
            return Err(GraphError::DuplicateNode(merged));
        }
        if !self.adj.contains_key(&b) {
            return Err(GraphError::NodeNotFound(b));
        }
        let adj_a = self.adj.remove(&a).ok_or(GraphError::NodeNotFound(a))?;
        let adj_b = self.adj.remove(&b).unwrap_or_default();

        let joined_by = adj_a.get(&b).copied();
        if joined_by.is_none() {
            warn!(%a, %b, %merged, "graph: contracting nodes without an edge, treating score as 0");
        }

        let mut combined: BTreeMap<NodeId, Edge> = BTreeMap::new();
        for (n, e) in adj_a.into_iter().chain(adj_b) {
            if n == a || n == b {
                continue;
            }
            combined
                .entry(n)
                .and_modify(|cur| *cur = cur.combine(e))
                .or_insert(e);
        }

        // Edges removed: all of a's and b's; edges added: one per neighbor.
        let removed: usize = combined
            .keys()
            .map(|n| {
                let m = &self.adj[n];
                usize::from(m.contains_key(&a)) + usize::from(m.contains_key(&b))
            })
            .sum::<usize>()
            + usize::from(joined_by.is_some());
        self.edges = self.edges - removed + combined.len();

        for (n, e) in combined.iter_mut() {
            e.stale = true;
            if let Some(m) = self.adj.get_mut(n) {
                m.remove(&a);
                m.remove(&b);
                m.insert(merged, *e);
            }
        }
        let rewired = combined.len();
        self.adj.insert(merged, combined);

        Ok(Contraction {
            merged,
            joined_by,
            rewired,
        })
    }

    /// Connected components, each sorted, ordered by their smallest node.
    pub fn components(&self) -> Vec<Vec<NodeId>> {
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        let mut out = Vec::new();
        for &start in self.adj.keys() {
            if !seen.insert(start) {
                continue;
            }
            let mut comp = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(n) = queue.pop_front() {
                for &m in self.adj[&n].keys() {
                    if seen.insert(m) {
                        comp.push(m);
                        queue.push_back(m);
                    }
                }
            }
            comp.sort();
            out.push(comp);
        }
        out
    }

    /// Copy of the graph restricted to `nodes` and the edges among them.
    pub fn subgraph(&self, nodes: &[NodeId]) -> ClusterGraph {
        let keep: BTreeSet<NodeId> = nodes.iter().copied().collect();
        let mut sub = ClusterGraph::new();
        for n in &keep {
            let Some(adj) = self.adj.get(n) else {
                continue;
            };
            let inner: BTreeMap<NodeId, Edge> = adj
                .iter()
                .filter(|(m, _)| keep.contains(m))
                .map(|(m, e)| (*m, *e))
                .collect();
            sub.edges += inner.keys().filter(|m| *m > n).count();
            sub.adj.insert(*n, inner);
        }
        sub
    }
}
