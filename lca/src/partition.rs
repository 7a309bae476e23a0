use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use herdid_annotation::{AnnotationStore, Viewpoint};

use crate::{ClusterId, LcaError};

/// Why two clusters were merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrigin {
    /// Committed by the engine with a clear margin.
    Auto,
    /// Applied from a reviewed decision.
    Decision { pair_id: String },
}

/// One mutation of the partition. Replaying a journal of these against the
/// same singleton partition rebuilds it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionOp {
    Merge {
        a: ClusterId,
        b: ClusterId,
        merged: ClusterId,
        origin: MergeOrigin,
    },
    Separate {
        a: ClusterId,
        b: ClusterId,
    },
}

/// A hypothesized individual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub members: BTreeSet<String>,
    pub viewpoint_scope: BTreeSet<Viewpoint>,

    /// Member with the best quality score; stands in for the cluster when a
    /// single exemplar is needed.
    pub representative: String,
    pub representative_quality: f32,

    /// The two clusters this one was merged from.
    pub parents: Option<(ClusterId, ClusterId)>,

    /// Set once this cluster has been merged into another.
    pub superseded_by: Option<ClusterId>,
}

impl Cluster {
    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn ordered(a: ClusterId, b: ClusterId) -> (ClusterId, ClusterId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Arena of clusters indexed by stable ids.
///
/// Live clusters partition the annotation set: every annotation belongs to
/// exactly one of them. Superseded clusters stay in the arena so lineage
/// and old references keep resolving.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    clusters: BTreeMap<ClusterId, Cluster>,
    owner: HashMap<String, ClusterId>,
    separated: BTreeSet<(ClusterId, ClusterId)>,
    next_id: u64,
    journal: Vec<PartitionOp>,
}

impl Partition {
    /// One cluster per annotation. Ids are assigned `1..=n` in annotation-id
    /// order, so the same annotation set always yields the same ids.
    pub fn singletons(annotations: &AnnotationStore, ids: &[String]) -> Result<Self, LcaError> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();

        let mut p = Partition {
            next_id: 1,
            ..Default::default()
        };
        for id in sorted {
            let ann = annotations
                .get(id)
                .ok_or_else(|| LcaError::UnknownAnnotation(id.clone()))?;
            if p.owner.contains_key(id) {
                return Err(LcaError::DuplicateAnnotation(id.clone()));
            }
            let cid = ClusterId(p.next_id);
            p.next_id += 1;
            p.owner.insert(id.clone(), cid);
            p.clusters.insert(
                cid,
                Cluster {
                    id: cid,
                    members: BTreeSet::from([id.clone()]),
                    viewpoint_scope: BTreeSet::from([ann.viewpoint]),
                    representative: id.clone(),
                    representative_quality: ann.quality_score,
                    parents: None,
                    superseded_by: None,
                },
            );
        }
        Ok(p)
    }

    /// Singletons followed by a journal replay.
    pub fn rebuild(
        annotations: &AnnotationStore,
        ids: &[String],
        journal: &[PartitionOp],
    ) -> Result<Self, LcaError> {
        let mut p = Self::singletons(annotations, ids)?;
        for op in journal {
            p.replay(op)?;
        }
        Ok(p)
    }

    pub fn get(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    pub fn is_live(&self, id: ClusterId) -> bool {
        self.clusters.get(&id).is_some_and(Cluster::is_live)
    }

    /// Live clusters in id order.
    pub fn live(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values().filter(|c| c.is_live())
    }

    pub fn live_ids(&self) -> Vec<ClusterId> {
        self.live().map(|c| c.id).collect()
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Live cluster holding the annotation.
    pub fn cluster_of(&self, annotation: &str) -> Option<ClusterId> {
        self.owner.get(annotation).copied()
    }

    pub fn members(&self, id: ClusterId) -> Result<&BTreeSet<String>, LcaError> {
        Ok(&self.live_cluster(id)?.members)
    }

    /// Id the next merge will allocate.
    pub fn next_id(&self) -> ClusterId {
        ClusterId(self.next_id)
    }

    pub fn journal(&self) -> &[PartitionOp] {
        &self.journal
    }

    pub fn is_separated(&self, a: ClusterId, b: ClusterId) -> bool {
        self.separated.contains(&ordered(a, b))
    }

    /// Separations between clusters that are both still live.
    pub fn separations(&self) -> Vec<(ClusterId, ClusterId)> {
        self.separated
            .iter()
            .filter(|(a, b)| self.is_live(*a) && self.is_live(*b))
            .copied()
            .collect()
    }

    fn live_cluster(&self, id: ClusterId) -> Result<&Cluster, LcaError> {
        let c = self.clusters.get(&id).ok_or(LcaError::UnknownCluster(id))?;
        if !c.is_live() {
            return Err(LcaError::Superseded(id));
        }
        Ok(c)
    }

    /// Merges two live clusters into a new one and returns its id.
    pub fn merge(&mut self, a: ClusterId, b: ClusterId, origin: MergeOrigin) -> Result<ClusterId, LcaError> {
        let merged = ClusterId(self.next_id);
        self.apply_merge(a, b, merged, origin)?;
        Ok(merged)
    }

    fn apply_merge(
        &mut self,
        a: ClusterId,
        b: ClusterId,
        merged: ClusterId,
        origin: MergeOrigin,
    ) -> Result<(), LcaError> {
        if a == b {
            return Err(LcaError::PartitionViolation(format!(
                "cannot merge {a} with itself"
            )));
        }
        let ca = self.live_cluster(a)?;
        let cb = self.live_cluster(b)?;

        let members: BTreeSet<String> = ca.members.union(&cb.members).cloned().collect();
        let viewpoint_scope = ca.viewpoint_scope.union(&cb.viewpoint_scope).copied().collect();
        // Best quality wins; ties go to the smaller annotation id.
        let (representative, representative_quality) = if cb.representative_quality
            > ca.representative_quality
            || (cb.representative_quality == ca.representative_quality
                && cb.representative < ca.representative)
        {
            (cb.representative.clone(), cb.representative_quality)
        } else {
            (ca.representative.clone(), ca.representative_quality)
        };

        for m in &members {
            self.owner.insert(m.clone(), merged);
        }
        for id in [a, b] {
            if let Some(c) = self.clusters.get_mut(&id) {
                c.superseded_by = Some(merged);
            }
        }

        // A cluster known to differ from x still differs from x after
        // growing.
        let inherited: Vec<(ClusterId, ClusterId)> = self
            .separated
            .iter()
            .filter_map(|&(x, y)| match (x, y) {
                (x, y) if x == a || x == b => Some(ordered(merged, y)),
                (x, y) if y == a || y == b => Some(ordered(x, merged)),
                _ => None,
            })
            .collect();
        self.separated.extend(inherited);

        self.clusters.insert(
            merged,
            Cluster {
                id: merged,
                members,
                viewpoint_scope,
                representative,
                representative_quality,
                parents: Some((a, b)),
                superseded_by: None,
            },
        );
        self.next_id = merged.0 + 1;
        self.journal.push(PartitionOp::Merge {
            a,
            b,
            merged,
            origin,
        });
        Ok(())
    }

    /// Marks two live clusters as definitively different individuals.
    /// Repeating a separation is a no-op.
    pub fn separate(&mut self, a: ClusterId, b: ClusterId) -> Result<(), LcaError> {
        if a == b {
            return Err(LcaError::PartitionViolation(format!(
                "cannot separate {a} from itself"
            )));
        }
        self.live_cluster(a)?;
        self.live_cluster(b)?;
        if self.separated.insert(ordered(a, b)) {
            self.journal.push(PartitionOp::Separate { a, b });
        }
        Ok(())
    }

    /// Applies a journaled op. Merges must allocate exactly the id recorded
    /// in the op, otherwise the journal does not belong to this partition.
    pub fn replay(&mut self, op: &PartitionOp) -> Result<(), LcaError> {
        match op {
            PartitionOp::Merge {
                a,
                b,
                merged,
                origin,
            } => {
                if *merged != self.next_id() {
                    return Err(LcaError::ReplayMismatch {
                        expected: self.next_id(),
                        got: *merged,
                    });
                }
                self.apply_merge(*a, *b, *merged, origin.clone())
            }
            PartitionOp::Separate { a, b } => self.separate(*a, *b),
        }
    }

    /// The cluster and every cluster it was merged from.
    pub fn lineage(&self, id: ClusterId) -> BTreeSet<ClusterId> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(c) = stack.pop() {
            if !out.insert(c) {
                continue;
            }
            if let Some((a, b)) = self.clusters.get(&c).and_then(|c| c.parents) {
                stack.push(a);
                stack.push(b);
            }
        }
        out
    }

    /// Follows `superseded_by` to the live cluster that absorbed `id`.
    pub fn live_descendant(&self, id: ClusterId) -> Option<ClusterId> {
        let mut cur = self.clusters.get(&id)?;
        while let Some(next) = cur.superseded_by {
            cur = self.clusters.get(&next)?;
        }
        Some(cur.id)
    }

    /// If `a` and `b` were merged directly into each other, the resulting
    /// cluster.
    pub fn merged_pair(&self, a: ClusterId, b: ClusterId) -> Option<ClusterId> {
        let m = self.clusters.get(&a)?.superseded_by?;
        let parents = self.clusters.get(&m)?.parents?;
        (ordered(parents.0, parents.1) == ordered(a, b)).then_some(m)
    }

    /// Verifies that live clusters partition exactly `universe`.
    pub fn check(&self, universe: &[String]) -> Result<(), LcaError> {
        let mut seen: HashMap<&str, ClusterId> = HashMap::new();
        for c in self.live() {
            if c.members.is_empty() {
                return Err(LcaError::PartitionViolation(format!("{} is empty", c.id)));
            }
            for m in &c.members {
                if let Some(prev) = seen.insert(m.as_str(), c.id) {
                    return Err(LcaError::PartitionViolation(format!(
                        "{m:?} is in both {prev} and {}",
                        c.id
                    )));
                }
                if self.owner.get(m) != Some(&c.id) {
                    return Err(LcaError::PartitionViolation(format!(
                        "owner index for {m:?} does not point at {}",
                        c.id
                    )));
                }
            }
        }
        if seen.len() != universe.len() {
            return Err(LcaError::PartitionViolation(format!(
                "{} annotations clustered, expected {}",
                seen.len(),
                universe.len()
            )));
        }
        if let Some(missing) = universe.iter().find(|id| !seen.contains_key(id.as_str())) {
            return Err(LcaError::PartitionViolation(format!(
                "{missing:?} is not in any cluster"
            )));
        }
        Ok(())
    }

    /// Copy restricted to the given live clusters, sharing the id
    /// counter. Used to hand a component to a worker.
    pub(crate) fn extract(&self, ids: &[ClusterId]) -> Partition {
        let keep: BTreeSet<ClusterId> = ids.iter().copied().collect();
        let mut p = Partition {
            next_id: self.next_id,
            ..Default::default()
        };
        for id in &keep {
            if let Some(c) = self.clusters.get(id).filter(|c| c.is_live()) {
                for m in &c.members {
                    p.owner.insert(m.clone(), c.id);
                }
                p.clusters.insert(c.id, c.clone());
            }
        }
        p.separated = self
            .separated
            .iter()
            .filter(|(a, b)| keep.contains(a) && keep.contains(b))
            .copied()
            .collect();
        p
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use herdid_annotation::Annotation;

    use super::*;

    fn store(specs: &[(&str, Viewpoint, f32)]) -> AnnotationStore {
        AnnotationStore::from_records(specs.iter().map(|(id, vp, q)| Annotation {
            id: id.to_string(),
            track_id: None,
            viewpoint: *vp,
            timestamp: Utc::now(),
            location: None,
            embedding_ref: id.to_string(),
            quality_score: *q,
        }))
        .unwrap()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn c(i: u64) -> ClusterId {
        ClusterId(i)
    }

    #[test]
    fn singleton_ids_follow_annotation_order() {
        let s = store(&[("b", Viewpoint::Left, 0.5), ("a", Viewpoint::Right, 0.5)]);
        let p = Partition::singletons(&s, &ids(&["b", "a"])).unwrap();
        assert_eq!(p.cluster_of("a"), Some(c(1)));
        assert_eq!(p.cluster_of("b"), Some(c(2)));
        assert_eq!(p.next_id(), c(3));
        p.check(&ids(&["a", "b"])).unwrap();
    }

    #[test]
    fn singletons_reject_unknown_and_duplicate() {
        let s = store(&[("a", Viewpoint::Left, 0.5)]);
        assert!(matches!(
            Partition::singletons(&s, &ids(&["a", "zz"])),
            Err(LcaError::UnknownAnnotation(_))
        ));
        assert!(matches!(
            Partition::singletons(&s, &ids(&["a", "a"])),
            Err(LcaError::DuplicateAnnotation(_))
        ));
    }

    #[test]
    fn merge_keeps_partition_and_lineage() {
        let s = store(&[
            ("a", Viewpoint::Left, 0.4),
            ("b", Viewpoint::Right, 0.9),
            ("c", Viewpoint::Left, 0.9),
        ]);
        let universe = ids(&["a", "b", "c"]);
        let mut p = Partition::singletons(&s, &universe).unwrap();

        let m = p.merge(c(1), c(2), MergeOrigin::Auto).unwrap();
        assert_eq!(m, c(4));
        let m2 = p.merge(m, c(3), MergeOrigin::Auto).unwrap();
        p.check(&universe).unwrap();

        let cluster = p.get(m2).unwrap();
        assert_eq!(cluster.len(), 3);
        assert_eq!(cluster.representative, "b", "best quality, then smallest id");
        assert_eq!(
            cluster.viewpoint_scope,
            BTreeSet::from([Viewpoint::Left, Viewpoint::Right])
        );
        assert_eq!(p.lineage(m2), BTreeSet::from([c(1), c(2), c(3), c(4), c(5)]));
        assert_eq!(p.live_descendant(c(1)), Some(m2));
        assert_eq!(p.merged_pair(c(2), c(1)), Some(m));
        assert_eq!(p.merged_pair(c(1), c(3)), None);
        assert!(matches!(
            p.merge(c(1), c(3), MergeOrigin::Auto),
            Err(LcaError::Superseded(_))
        ));
    }

    #[test]
    fn separations_follow_merges() {
        let s = store(&[
            ("a", Viewpoint::Left, 0.5),
            ("b", Viewpoint::Left, 0.5),
            ("c", Viewpoint::Left, 0.5),
        ]);
        let mut p = Partition::singletons(&s, &ids(&["a", "b", "c"])).unwrap();
        p.separate(c(1), c(3)).unwrap();
        p.separate(c(3), c(1)).unwrap();
        assert_eq!(p.journal().len(), 1, "repeated separation is not journaled");

        let m = p.merge(c(1), c(2), MergeOrigin::Auto).unwrap();
        assert!(p.is_separated(m, c(3)));
        assert_eq!(p.separations(), vec![(c(3), m)]);
    }

    #[test]
    fn journal_replay_rebuilds_identically() {
        let s = store(&[
            ("a", Viewpoint::Left, 0.5),
            ("b", Viewpoint::Left, 0.5),
            ("c", Viewpoint::Left, 0.5),
            ("d", Viewpoint::Left, 0.5),
        ]);
        let universe = ids(&["a", "b", "c", "d"]);
        let mut p = Partition::singletons(&s, &universe).unwrap();
        let m = p.merge(c(3), c(4), MergeOrigin::Auto).unwrap();
        p.separate(m, c(1)).unwrap();
        p.merge(
            c(1),
            c(2),
            MergeOrigin::Decision {
                pair_id: "p1-2".into(),
            },
        )
        .unwrap();

        // Through msgpack, the way the journal is persisted.
        let bytes = rmp_serde::to_vec_named(p.journal()).unwrap();
        let journal: Vec<PartitionOp> = rmp_serde::from_slice(&bytes).unwrap();

        let q = Partition::rebuild(&s, &universe, &journal).unwrap();
        assert_eq!(q.live_ids(), p.live_ids());
        assert_eq!(q.journal(), p.journal());
        assert!(q.is_separated(c(5), c(1)));
        q.check(&universe).unwrap();
    }

    #[test]
    fn replay_rejects_foreign_journal() {
        let s = store(&[("a", Viewpoint::Left, 0.5), ("b", Viewpoint::Left, 0.5)]);
        let mut p = Partition::singletons(&s, &ids(&["a", "b"])).unwrap();
        let err = p
            .replay(&PartitionOp::Merge {
                a: c(1),
                b: c(2),
                merged: c(9),
                origin: MergeOrigin::Auto,
            })
            .unwrap_err();
        assert!(matches!(err, LcaError::ReplayMismatch { .. }));
    }

    #[test]
    fn check_detects_missing_annotation() {
        let s = store(&[("a", Viewpoint::Left, 0.5), ("b", Viewpoint::Left, 0.5)]);
        let p = Partition::singletons(&s, &ids(&["a"])).unwrap();
        assert!(matches!(
            p.check(&ids(&["a", "b"])),
            Err(LcaError::PartitionViolation(_))
        ));
    }
}
