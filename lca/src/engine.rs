use std::collections::{BTreeSet, HashMap};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use herdid_affinity::{Affinity, AffinityModel};
use herdid_annotation::{Annotation, AnnotationStore};
use herdid_graph::{ClusterGraph, Edge};

use crate::hypothesis::{self, Hypothesis, Verdict, decide};
use crate::partition::{MergeOrigin, Partition, PartitionOp};
use crate::{ClusterId, LcaConfig, LcaError};

/// The partition together with its graph. Live clusters and graph nodes are
/// always the same set.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub graph: ClusterGraph,
    pub partition: Partition,
}

impl ClusterState {
    pub fn new(graph: ClusterGraph, partition: Partition) -> Self {
        Self { graph, partition }
    }

    /// Merges two live clusters in the partition and contracts their nodes.
    pub fn merge(&mut self, a: ClusterId, b: ClusterId, origin: MergeOrigin) -> Result<ClusterId, LcaError> {
        self.partition.members(a)?;
        self.partition.members(b)?;
        for id in [a, b] {
            if !self.graph.contains(id) {
                return Err(LcaError::PartitionViolation(format!(
                    "live cluster {id} has no graph node"
                )));
            }
        }
        let merged = self.partition.merge(a, b, origin)?;
        self.graph.contract(a, b, merged)?;
        Ok(merged)
    }

    pub fn separate(&mut self, a: ClusterId, b: ClusterId) -> Result<(), LcaError> {
        self.partition.separate(a, b)
    }

    /// Applies a journaled op to both partition and graph.
    pub fn replay(&mut self, op: &PartitionOp) -> Result<(), LcaError> {
        match op {
            PartitionOp::Merge {
                a,
                b,
                merged,
                origin,
            } => {
                let expected = self.partition.next_id();
                if *merged != expected {
                    return Err(LcaError::ReplayMismatch {
                        expected,
                        got: *merged,
                    });
                }
                self.merge(*a, *b, origin.clone()).map(|_| ())
            }
            PartitionOp::Separate { a, b } => self.separate(*a, *b),
        }
    }

    pub fn journal(&self) -> &[PartitionOp] {
        self.partition.journal()
    }

    /// Partition invariant plus graph/partition agreement.
    pub fn check(&self, universe: &[String]) -> Result<(), LcaError> {
        self.partition.check(universe)?;
        let nodes: Vec<ClusterId> = self.graph.nodes().collect();
        if nodes != self.partition.live_ids() {
            return Err(LcaError::PartitionViolation(
                "graph nodes do not match live clusters".into(),
            ));
        }
        Ok(())
    }
}

/// A merge the engine committed on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub a: ClusterId,
    pub b: ClusterId,
    pub merged: ClusterId,
    pub score: f32,
    pub gap: f32,
}

/// A neighborhood the engine would not decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// The ambiguous pair, `cluster_a < cluster_b`.
    pub cluster_a: ClusterId,
    pub cluster_b: ClusterId,

    /// Every scored hypothesis, best first.
    pub alternatives: Vec<Hypothesis>,

    pub gap: f32,

    /// Clusters left untouched until the pair is decided.
    pub frozen: Vec<ClusterId>,
}

/// Summary of one engine run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub merges: Vec<MergeRecord>,
    pub conflicts: Vec<Conflict>,

    /// Components that had at least one edge.
    pub components: usize,

    /// Neighborhoods evaluated, over all components.
    pub evaluations: usize,

    /// Most sweeps any component needed.
    pub passes: usize,

    /// Components that hit `max_passes` before the worklist emptied.
    pub exhausted: usize,
}

/// Runs local clustering with alternatives over a [`ClusterState`].
pub struct Engine<'a> {
    config: &'a LcaConfig,
    model: &'a dyn AffinityModel,
    annotations: &'a AnnotationStore,
}

/// A component handed to a worker.
struct Component {
    state: ClusterState,
    frozen: BTreeSet<ClusterId>,
}

/// What a worker did to its component, in provisional ids.
#[derive(Default)]
struct ComponentOutcome {
    graph: ClusterGraph,
    ops: Vec<PartitionOp>,
    merges: Vec<MergeRecord>,
    conflicts: Vec<Conflict>,
    evaluations: usize,
    passes: usize,
    exhausted: bool,
}

enum Step {
    Nothing,
    Merged {
        merged: ClusterId,
        records: Vec<MergeRecord>,
    },
    Conflict(Conflict),
}

fn ordered(a: ClusterId, b: ClusterId) -> (ClusterId, ClusterId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a LcaConfig,
        model: &'a dyn AffinityModel,
        annotations: &'a AnnotationStore,
    ) -> Self {
        Self {
            config,
            model,
            annotations,
        }
    }

    pub(crate) fn config(&self) -> &LcaConfig {
        self.config
    }

    pub(crate) fn model(&self) -> &dyn AffinityModel {
        self.model
    }

    pub(crate) fn annotations(&self) -> &AnnotationStore {
        self.annotations
    }

    /// Runs every component to a fixed point and applies the result to
    /// `state`.
    ///
    /// Clusters in `frozen` are neither seeds nor neighbors. The outcome
    /// depends only on the state and the affinity scores: components are
    /// applied in order of their smallest cluster id whether or not they ran
    /// in parallel.
    pub fn run(&self, state: &mut ClusterState, frozen: &BTreeSet<ClusterId>) -> Result<RunReport, LcaError> {
        self.config.validate()?;

        let jobs: Vec<Component> = state
            .graph
            .components()
            .into_iter()
            .filter(|nodes| nodes.len() > 1)
            .map(|nodes| Component {
                state: ClusterState::new(state.graph.subgraph(&nodes), state.partition.extract(&nodes)),
                frozen: nodes.iter().filter(|n| frozen.contains(n)).copied().collect(),
            })
            .collect();

        let mut report = RunReport {
            components: jobs.len(),
            ..Default::default()
        };

        let outcomes = if self.config.parallel_components && jobs.len() > 1 {
            self.run_parallel(jobs)
        } else {
            jobs.into_iter().map(|job| self.run_component(job)).collect()
        };

        for outcome in outcomes {
            self.absorb(state, outcome?, &mut report)?;
        }

        info!(
            components = report.components,
            merges = report.merges.len(),
            conflicts = report.conflicts.len(),
            evaluations = report.evaluations,
            live = state.partition.live_count(),
            "lca: run complete"
        );
        Ok(report)
    }

    fn run_parallel(&self, jobs: Vec<Component>) -> Vec<Result<ComponentOutcome, LcaError>> {
        let total = jobs.len();
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(total);

        let mut buckets: Vec<Vec<(usize, Component)>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, job) in jobs.into_iter().enumerate() {
            buckets[i % workers].push((i, job));
        }

        let mut results: Vec<Option<Result<ComponentOutcome, LcaError>>> = (0..total).map(|_| None).collect();
        thread::scope(|s| {
            let handles: Vec<_> = buckets
                .into_iter()
                .map(|bucket| {
                    s.spawn(move || {
                        bucket
                            .into_iter()
                            .map(|(i, job)| (i, self.run_component(job)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                if let Ok(done) = handle.join() {
                    for (i, outcome) in done {
                        results[i] = Some(outcome);
                    }
                }
            }
        });

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(LcaError::WorkerPanicked)))
            .collect()
    }

    /// Sweeps a component's worklist until nothing changes or the pass
    /// budget runs out.
    fn run_component(&self, job: Component) -> Result<ComponentOutcome, LcaError> {
        let Component { mut state, mut frozen } = job;
        let mut out = ComponentOutcome::default();

        let mut worklist: BTreeSet<ClusterId> = state.graph.nodes().filter(|n| !frozen.contains(n)).collect();
        while !worklist.is_empty() {
            if out.passes == self.config.max_passes {
                warn!(
                    passes = out.passes,
                    remaining = worklist.len(),
                    "lca: pass budget exhausted, partition kept as is"
                );
                out.exhausted = true;
                break;
            }
            out.passes += 1;

            let mut dirty = BTreeSet::new();
            while let Some(seed) = worklist.pop_first() {
                if !state.partition.is_live(seed) || frozen.contains(&seed) {
                    continue;
                }
                out.evaluations += 1;
                match self.evaluate(&mut state, seed, &frozen)? {
                    Step::Nothing => {}
                    Step::Merged { merged, records } => {
                        dirty.insert(merged);
                        for (n, _) in state.graph.neighbors(merged, 0.0)? {
                            if !frozen.contains(&n) {
                                dirty.insert(n);
                            }
                        }
                        out.merges.extend(records);
                    }
                    Step::Conflict(conflict) => {
                        frozen.extend(conflict.frozen.iter().copied());
                        out.conflicts.push(conflict);
                    }
                }
            }
            worklist = dirty;
        }

        out.ops = state.partition.journal().to_vec();
        out.graph = state.graph;
        Ok(out)
    }

    /// Evaluates the neighborhood around `seed`.
    fn evaluate(
        &self,
        state: &mut ClusterState,
        seed: ClusterId,
        frozen: &BTreeSet<ClusterId>,
    ) -> Result<Step, LcaError> {
        for n in state.graph.stale_neighbors(seed) {
            self.refresh(state, seed, n)?;
        }

        let neighbors: Vec<(ClusterId, Edge)> = state
            .graph
            .neighbors(seed, self.config.similarity_floor)?
            .into_iter()
            .filter(|(n, _)| !frozen.contains(n) && !state.partition.is_separated(seed, *n))
            .take(self.config.max_neighbors)
            .collect();
        if neighbors.is_empty() {
            return Ok(Step::Nothing);
        }
        let cands: Vec<ClusterId> = neighbors.iter().map(|(n, _)| *n).collect();

        let mut local = vec![seed];
        local.extend(&cands);
        let mut edges = Vec::new();
        for (i, &x) in local.iter().enumerate() {
            for &y in &local[i + 1..] {
                if state.graph.edge(x, y).is_some_and(|e| e.stale) {
                    self.refresh(state, x, y)?;
                }
                if let Some(e) = state.graph.edge(x, y) {
                    edges.push((x, y, e));
                }
            }
        }

        let mut hyps = hypothesis::enumerate(seed, &cands);
        for h in &mut hyps {
            h.score = hypothesis::agreement(h, &edges);
        }
        let ranked = hypothesis::rank(hyps);

        match decide(&ranked, self.config.margin) {
            Verdict::Empty => Ok(Step::Nothing),
            Verdict::Commit { gap } => {
                let best = &ranked[0];
                let Some(group) = best.merge_group() else {
                    return Ok(Step::Nothing);
                };
                let mut records = Vec::with_capacity(group.len() - 1);
                let mut cur = group[0];
                for &next in &group[1..] {
                    let merged = state.merge(cur, next, MergeOrigin::Auto)?;
                    debug!(a = %cur, b = %next, %merged, score = best.score, gap, "lca: merge committed");
                    records.push(MergeRecord {
                        a: cur,
                        b: next,
                        merged,
                        score: best.score,
                        gap,
                    });
                    cur = merged;
                }
                Ok(Step::Merged {
                    merged: cur,
                    records,
                })
            }
            Verdict::Ambiguous { gap } => {
                let (top, second) = (&ranked[0], &ranked[1]);
                let partner = cands
                    .iter()
                    .copied()
                    .find(|&n| top.together(seed, n) != second.together(seed, n))
                    .unwrap_or(cands[0]);
                let (cluster_a, cluster_b) = ordered(seed, partner);

                let mut held: BTreeSet<ClusterId> = hypothesis::differing(top, second, &local).into_iter().collect();
                held.insert(cluster_a);
                held.insert(cluster_b);

                debug!(%cluster_a, %cluster_b, gap, best = %top.label, "lca: conflict deferred to review");
                Ok(Step::Conflict(Conflict {
                    cluster_a,
                    cluster_b,
                    alternatives: ranked,
                    gap,
                    frozen: held.into_iter().collect(),
                }))
            }
        }
    }

    fn refresh(&self, state: &mut ClusterState, a: ClusterId, b: ClusterId) -> Result<(), LcaError> {
        let aff = self.rescore(&state.partition, a, b)?;
        state.graph.upsert_edge(a, b, aff.score, aff.confidence)?;
        Ok(())
    }

    /// Scores two live clusters with the model's linkage. Values outside
    /// [0, 1] are fatal.
    pub(crate) fn rescore(&self, partition: &Partition, a: ClusterId, b: ClusterId) -> Result<Affinity, LcaError> {
        let ma = self.member_records(partition, a)?;
        let mb = self.member_records(partition, b)?;
        let fail = |err| LcaError::from_affinity(describe(partition, a), describe(partition, b), err);
        let aff = self.model.score_clusters(&ma, &mb).map_err(fail)?;
        // Models can build an Affinity literal; never let one bypass range checks.
        Affinity::new(aff.score, aff.confidence).map_err(fail)
    }

    fn member_records(&self, partition: &Partition, id: ClusterId) -> Result<Vec<&'a Annotation>, LcaError> {
        partition
            .members(id)?
            .iter()
            .map(|m| {
                self.annotations
                    .get(m)
                    .ok_or_else(|| LcaError::UnknownAnnotation(m.clone()))
            })
            .collect()
    }

    /// Replays a worker's ops on the shared state, translating provisional
    /// ids, and carries its refreshed edge scores over.
    fn absorb(&self, state: &mut ClusterState, outcome: ComponentOutcome, report: &mut RunReport) -> Result<(), LcaError> {
        let mut remap: HashMap<ClusterId, ClusterId> = HashMap::new();
        for op in &outcome.ops {
            let map = |id: ClusterId| remap.get(&id).copied().unwrap_or(id);
            match op {
                PartitionOp::Merge {
                    a,
                    b,
                    merged,
                    origin,
                } => {
                    let real = state.merge(map(*a), map(*b), origin.clone())?;
                    remap.insert(*merged, real);
                }
                PartitionOp::Separate { a, b } => state.separate(map(*a), map(*b))?,
            }
        }
        let map = |id: ClusterId| remap.get(&id).copied().unwrap_or(id);

        for node in outcome.graph.nodes() {
            for (n, e) in outcome.graph.neighbors(node, 0.0)? {
                if node < n && !e.stale {
                    state.graph.upsert_edge(map(node), map(n), e.score, e.confidence)?;
                }
            }
        }

        report.merges.extend(outcome.merges.into_iter().map(|mut m| {
            m.a = map(m.a);
            m.b = map(m.b);
            m.merged = map(m.merged);
            m
        }));
        report.conflicts.extend(outcome.conflicts.into_iter().map(|mut c| {
            (c.cluster_a, c.cluster_b) = ordered(map(c.cluster_a), map(c.cluster_b));
            for h in &mut c.alternatives {
                h.remap(map);
            }
            c.frozen = c.frozen.iter().map(|id| map(*id)).collect::<BTreeSet<_>>().into_iter().collect();
            c
        }));
        report.evaluations += outcome.evaluations;
        report.passes = report.passes.max(outcome.passes);
        report.exhausted += usize::from(outcome.exhausted);
        Ok(())
    }
}

/// Singleton clusters are named by their annotation, larger ones by id.
fn describe(partition: &Partition, id: ClusterId) -> String {
    match partition.get(id) {
        Some(c) if c.len() == 1 => c.representative.clone(),
        _ => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use herdid_affinity::{AffinityError, Linkage, PairScore, TableAffinity};
    use herdid_annotation::Viewpoint;

    use super::*;

    fn annotations(ids: &[&str]) -> AnnotationStore {
        AnnotationStore::from_records(ids.iter().map(|id| Annotation {
            id: id.to_string(),
            track_id: None,
            viewpoint: Viewpoint::Left,
            timestamp: Utc::now(),
            location: None,
            embedding_ref: id.to_string(),
            quality_score: 0.9,
        }))
        .unwrap()
    }

    fn table(pairs: &[(&str, &str, f32)]) -> TableAffinity {
        TableAffinity::from_pairs(
            pairs.iter().map(|(a, b, s)| PairScore {
                a: a.to_string(),
                b: b.to_string(),
                score: *s,
                confidence: 1.0,
            }),
            Linkage::Average,
        )
        .unwrap()
    }

    fn ids(store: &AnnotationStore) -> Vec<String> {
        store.ids().map(String::from).collect()
    }

    fn run(
        store: &AnnotationStore,
        model: &dyn AffinityModel,
        config: &LcaConfig,
    ) -> (ClusterState, RunReport) {
        let engine = Engine::new(config, model, store);
        let mut state = engine.build(&ids(store)).unwrap();
        let report = engine.run(&mut state, &BTreeSet::new()).unwrap();
        state.check(&ids(store)).unwrap();
        (state, report)
    }

    fn c(i: u64) -> ClusterId {
        ClusterId(i)
    }

    #[test]
    fn clear_pair_auto_merges() {
        let store = annotations(&["a", "b"]);
        let model = table(&[("a", "b", 0.9)]);
        let (state, report) = run(&store, &model, &LcaConfig::default());

        // merge scores 0.9, keep separate 0.1.
        assert_eq!(report.merges.len(), 1);
        assert!(report.conflicts.is_empty());
        assert_eq!(state.partition.live_count(), 1);
        assert_eq!(state.partition.cluster_of("a"), state.partition.cluster_of("b"));
    }

    #[test]
    fn close_pair_becomes_conflict() {
        let store = annotations(&["a", "b"]);
        let model = table(&[("a", "b", 0.55)]);
        let (state, report) = run(&store, &model, &LcaConfig::default());

        assert!(report.merges.is_empty());
        assert_eq!(report.conflicts.len(), 1);
        let conflict = &report.conflicts[0];
        assert_eq!((conflict.cluster_a, conflict.cluster_b), (c(1), c(2)));
        assert_eq!(conflict.alternatives.len(), 2);
        assert_eq!(conflict.alternatives[0].label, "merge c1+c2");
        assert_eq!(conflict.frozen, vec![c(1), c(2)]);
        assert_eq!(state.partition.live_count(), 2, "partition untouched");
    }

    #[test]
    fn no_edges_above_floor_leaves_singletons() {
        let store = annotations(&["a", "b", "c"]);
        let model = table(&[("a", "b", 0.1)]);
        let (state, report) = run(&store, &model, &LcaConfig::default());
        assert_eq!(report.components, 0);
        assert_eq!(state.partition.live_count(), 3);
    }

    #[test]
    fn triangle_merges_in_one_step() {
        let store = annotations(&["a", "b", "c"]);
        let model = table(&[("a", "b", 0.95), ("a", "c", 0.9), ("b", "c", 0.9)]);
        let (state, report) = run(&store, &model, &LcaConfig::default());

        assert_eq!(report.merges.len(), 2);
        assert_eq!(report.merges[1].merged, c(5));
        assert_eq!(state.partition.live_ids(), vec![c(5)]);
    }

    #[test]
    fn chain_reaches_fixed_point_over_sweeps() {
        let store = annotations(&["a", "b", "c", "d"]);
        let model = table(&[("a", "b", 0.95), ("b", "c", 0.95), ("c", "d", 0.95)]);
        let config = LcaConfig {
            max_neighbors: 1,
            ..Default::default()
        };
        let (state, report) = run(&store, &model, &config);

        // Average linkage dilutes merged clusters, but every step still wins
        // clearly over keeping apart.
        assert!(report.passes >= 1);
        assert!(report.conflicts.is_empty());
        assert!(state.partition.live_count() < 4);
        assert_eq!(report.exhausted, 0);
    }

    #[test]
    fn frozen_clusters_are_not_proposed() {
        let store = annotations(&["a", "b"]);
        let model = table(&[("a", "b", 0.95)]);
        let config = LcaConfig::default();
        let engine = Engine::new(&config, &model, &store);
        let mut state = engine.build(&ids(&store)).unwrap();
        let report = engine.run(&mut state, &BTreeSet::from([c(2)])).unwrap();
        assert!(report.merges.is_empty());
        assert_eq!(state.partition.live_count(), 2);
    }

    #[test]
    fn separated_pairs_are_not_proposed() {
        let store = annotations(&["a", "b"]);
        let model = table(&[("a", "b", 0.95)]);
        let config = LcaConfig::default();
        let engine = Engine::new(&config, &model, &store);
        let mut state = engine.build(&ids(&store)).unwrap();
        state.separate(c(1), c(2)).unwrap();
        let report = engine.run(&mut state, &BTreeSet::new()).unwrap();
        assert!(report.merges.is_empty());
        assert!(report.conflicts.is_empty());
    }

    struct BrokenModel;

    impl AffinityModel for BrokenModel {
        fn score(&self, _: &Annotation, _: &Annotation) -> Result<Affinity, AffinityError> {
            Ok(Affinity {
                score: 1.5,
                confidence: 1.0,
            })
        }
    }

    #[test]
    fn out_of_range_affinity_is_fatal() {
        let store = annotations(&["a", "b"]);
        let config = LcaConfig::default();
        let engine = Engine::new(&config, &BrokenModel, &store);
        let err = engine.build(&ids(&store)).unwrap_err();
        match err {
            LcaError::InvalidAffinityScore { a, b, score, .. } => {
                assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
                assert_eq!(score, 1.5);
            }
            other => panic!("expected InvalidAffinityScore, got {other:?}"),
        }
    }

    #[test]
    fn parallel_and_serial_runs_agree() {
        // Eight disjoint triangles with a mix of clear and ambiguous scores.
        let mut names = Vec::new();
        let mut pairs = Vec::new();
        for g in 0..8 {
            let n: Vec<String> = (0..3).map(|i| format!("g{g}-{i}")).collect();
            let s = 0.3 + 0.09 * g as f32;
            pairs.push((n[0].clone(), n[1].clone(), s));
            pairs.push((n[1].clone(), n[2].clone(), 0.95));
            pairs.push((n[0].clone(), n[2].clone(), s));
            names.extend(n);
        }
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let store = annotations(&refs);
        let borrowed: Vec<(&str, &str, f32)> = pairs
            .iter()
            .map(|(a, b, s)| (a.as_str(), b.as_str(), *s))
            .collect();
        let model = table(&borrowed);

        let serial = LcaConfig {
            parallel_components: false,
            ..Default::default()
        };
        let parallel = LcaConfig {
            parallel_components: true,
            ..Default::default()
        };
        let (s1, r1) = run(&store, &model, &serial);
        let (s2, r2) = run(&store, &model, &parallel);

        assert_eq!(r1, r2);
        assert_eq!(s1.journal(), s2.journal());
        assert_eq!(s1.partition.live_ids(), s2.partition.live_ids());
        assert!(!r1.merges.is_empty());
        assert!(!r1.conflicts.is_empty());
    }

    #[test]
    fn replayed_journal_matches_live_state() {
        let store = annotations(&["a", "b", "c", "d"]);
        let model = table(&[("a", "b", 0.95), ("c", "d", 0.92), ("b", "c", 0.3)]);
        let config = LcaConfig::default();
        let (state, _) = run(&store, &model, &config);

        let engine = Engine::new(&config, &model, &store);
        let mut rebuilt = engine.build(&ids(&store)).unwrap();
        for op in state.journal() {
            rebuilt.replay(op).unwrap();
        }
        assert_eq!(rebuilt.partition.live_ids(), state.partition.live_ids());
        rebuilt.check(&ids(&store)).unwrap();
    }
}
