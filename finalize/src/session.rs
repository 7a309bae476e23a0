use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use herdid_affinity::AffinityModel;
use herdid_annotation::{AnnotationStore, IdentifiabilitySplit};
use herdid_decision::{
    Alternative, ClusterPair, DecisionError, DecisionStore, EnqueueOutcome, Outcome, PairStatus,
};
use herdid_kv::KVStore;
use herdid_lca::{ClusterId, ClusterState, Conflict, Engine, LcaConfig, MergeOrigin, PartitionOp};

use crate::FinalizeError;
use crate::identity::IdentityBook;
use crate::keys::{journal_key, journal_prefix, journal_seq};
use crate::report::{
    Assignment, AssignmentSource, FinalReport, IdentitySummary, RetiredIdentity,
    StructuralIdentityConflict, TrackMember,
};

/// Settings of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Prefix of every key the run writes.
    pub run: String,

    /// Annotations scoring below this are excluded from clustering.
    pub identify_threshold: f32,

    /// Identity ids are `{identity_prefix}:{n:03}`.
    pub identity_prefix: String,

    pub lca: LcaConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            run: "herd".into(),
            identify_threshold: 0.5,
            identity_prefix: "animal".into(),
            lca: LcaConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), FinalizeError> {
        if self.run.is_empty() || self.run.contains(':') {
            return Err(FinalizeError::InvalidConfig(format!(
                "run name {:?} must be non-empty and free of ':'",
                self.run
            )));
        }
        if !(0.0..=1.0).contains(&self.identify_threshold) {
            return Err(FinalizeError::InvalidConfig(format!(
                "identify_threshold {} outside [0, 1]",
                self.identify_threshold
            )));
        }
        if self.identity_prefix.is_empty() {
            return Err(FinalizeError::InvalidConfig(
                "identity_prefix must be non-empty".into(),
            ));
        }
        self.lca.validate()?;
        Ok(())
    }
}

/// What [`Session::cluster`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    pub merges: usize,
    pub conflicts: usize,
    pub queued: usize,
    pub requeued: usize,
    pub unchanged: usize,

    /// Conflicts dropped because a different row holds their pair id.
    pub rejected: usize,

    /// Open pairs swept to stale before the run.
    pub stale: usize,

    pub live_clusters: usize,
    pub passes: usize,
    pub exhausted: usize,
}

/// What [`Session::apply_resolved`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub merged: usize,
    pub split: usize,
    pub deferred: usize,

    /// Merges found already journaled; only the row was behind.
    pub resumed: usize,

    pub stale: usize,
}

impl ApplySummary {
    pub fn applied(&self) -> usize {
        self.merged + self.split + self.deferred + self.resumed
    }
}

/// The effect of one resolved decision on the cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Merged(ClusterId),
    Split,
    Deferred,
    Resumed,
    Stale,
}

/// One run over a KV store: the rebuilt cluster state plus the decision
/// rows and identities persisted next to it.
///
/// Opening a session replays the persisted journal, so a crashed run picks
/// up exactly where its last durable write left it.
pub struct Session<'a> {
    config: SessionConfig,
    kv: Arc<dyn KVStore>,
    annotations: &'a AnnotationStore,
    model: &'a dyn AffinityModel,
    decisions: DecisionStore,
    split: IdentifiabilitySplit,
    state: ClusterState,

    /// Journal entries already in KV.
    persisted: usize,
}

impl<'a> Session<'a> {
    pub fn open(
        config: SessionConfig,
        kv: Arc<dyn KVStore>,
        annotations: &'a AnnotationStore,
        model: &'a dyn AffinityModel,
    ) -> Result<Self, FinalizeError> {
        config.validate()?;
        let split = annotations.split_identifiable(config.identify_threshold);
        let mut state = Engine::new(&config.lca, model, annotations).build(&split.identifiable)?;

        let journal = load_journal(kv.as_ref(), &config.run)?;
        for op in &journal {
            state.replay(op)?;
        }
        state.check(&split.identifiable)?;

        info!(
            run = %config.run,
            identifiable = split.identifiable.len(),
            excluded = split.excluded.len(),
            replayed = journal.len(),
            live = state.partition.live_count(),
            "finalize: session opened"
        );

        let decisions = DecisionStore::new(kv.clone(), config.run.clone());
        Ok(Self {
            config,
            kv,
            annotations,
            model,
            decisions,
            split,
            state,
            persisted: journal.len(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn decisions(&self) -> &DecisionStore {
        &self.decisions
    }

    pub fn split(&self) -> &IdentifiabilitySplit {
        &self.split
    }

    /// Runs the engine with the neighborhood of every open pair frozen,
    /// journals its merges and queues its conflicts.
    pub fn cluster(&mut self) -> Result<ClusterSummary, FinalizeError> {
        let stale = self.stale_orphans()?;

        let mut frozen = BTreeSet::new();
        for pair in self.decisions.pairs()? {
            if pair.status.is_open() {
                frozen.extend(pair.held());
            }
        }

        let report = Engine::new(&self.config.lca, self.model, self.annotations)
            .run(&mut self.state, &frozen)?;
        self.persist_journal()?;

        let mut summary = ClusterSummary {
            merges: report.merges.len(),
            conflicts: report.conflicts.len(),
            stale,
            passes: report.passes,
            exhausted: report.exhausted,
            ..Default::default()
        };
        for conflict in &report.conflicts {
            match self.decisions.enqueue(pair_from_conflict(conflict)) {
                Ok(EnqueueOutcome::Inserted) => summary.queued += 1,
                Ok(EnqueueOutcome::Requeued) => summary.requeued += 1,
                Ok(EnqueueOutcome::Unchanged) => summary.unchanged += 1,
                Err(DecisionError::ConflictingEnqueue(pair_id)) => {
                    warn!(%pair_id, "finalize: existing row differs, conflict not queued");
                    summary.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        summary.live_clusters = self.state.partition.live_count();

        info!(
            run = %self.config.run,
            merges = summary.merges,
            conflicts = summary.conflicts,
            queued = summary.queued,
            live = summary.live_clusters,
            "finalize: clustering pass done"
        );
        Ok(summary)
    }

    /// Applies every resolved decision, in pair-id order.
    ///
    /// Each decision is journaled before its row is marked applied, so a
    /// crash in between is repaired on the next call.
    pub fn apply_resolved(&mut self) -> Result<ApplySummary, FinalizeError> {
        let mut summary = ApplySummary {
            stale: self.stale_orphans()?,
            ..Default::default()
        };

        for pair in self.decisions.with_status(PairStatus::Resolved)? {
            match self.apply_decision(&pair)? {
                Applied::Merged(_) => summary.merged += 1,
                Applied::Split => summary.split += 1,
                Applied::Deferred => summary.deferred += 1,
                Applied::Resumed => summary.resumed += 1,
                Applied::Stale => {
                    summary.stale += 1;
                    continue;
                }
            }
            self.decisions.mark_applied(&pair.pair_id)?;
        }

        // Merges above may have orphaned other open pairs.
        summary.stale += self.stale_orphans()?;

        if summary.applied() + summary.stale > 0 {
            info!(
                run = %self.config.run,
                merged = summary.merged,
                split = summary.split,
                deferred = summary.deferred,
                resumed = summary.resumed,
                stale = summary.stale,
                "finalize: decisions applied"
            );
        }
        Ok(summary)
    }

    /// Carries out one resolved decision on the cluster state and journals
    /// it, leaving the row itself untouched.
    pub(crate) fn apply_decision(&mut self, pair: &ClusterPair) -> Result<Applied, FinalizeError> {
        let Some(outcome) = pair.outcome() else {
            return Err(FinalizeError::MissingDecision(pair.pair_id.clone()));
        };
        let (a, b) = (pair.cluster_a, pair.cluster_b);
        let partition = &self.state.partition;

        if outcome == Outcome::Merge && partition.merged_pair(a, b).is_some() {
            debug!(pair_id = %pair.pair_id, "finalize: merge already journaled");
            return Ok(Applied::Resumed);
        }
        if !pair.held().into_iter().all(|c| partition.is_live(c)) {
            self.decisions.mark_stale(&pair.pair_id)?;
            return Ok(Applied::Stale);
        }

        let applied = match outcome {
            Outcome::Merge => {
                let origin = MergeOrigin::Decision {
                    pair_id: pair.pair_id.clone(),
                };
                let merged = self.state.merge(a, b, origin)?;
                debug!(pair_id = %pair.pair_id, %merged, "finalize: reviewed merge");
                Applied::Merged(merged)
            }
            Outcome::Split => {
                self.state.separate(a, b)?;
                Applied::Split
            }
            Outcome::Defer => Applied::Deferred,
        };
        self.persist_journal()?;
        Ok(applied)
    }

    /// Applies resolved decisions, assigns identities to every cluster no
    /// open pair is waiting on, and reattaches excluded annotations through
    /// their tracks.
    ///
    /// Re-running without new decisions yields the same report.
    pub fn finalize(&mut self) -> Result<FinalReport, FinalizeError> {
        self.apply_resolved()?;
        let partition = &self.state.partition;

        let mut blocked = BTreeSet::new();
        for pair in self.decisions.pairs()? {
            if !pair.status.is_open() {
                continue;
            }
            for c in pair.held() {
                if let Some(live) = partition.live_descendant(c) {
                    blocked.insert(live);
                }
            }
        }
        let ready: Vec<ClusterId> = partition
            .live_ids()
            .into_iter()
            .filter(|c| !blocked.contains(c))
            .collect();

        let mut book = IdentityBook::load(self.kv.as_ref(), &self.config.run, &self.config.identity_prefix)?;
        let changed = book.assign(partition, &ready);
        IdentityBook::persist(self.kv.as_ref(), &self.config.run, &changed)?;

        let mut identities = Vec::with_capacity(ready.len());
        let mut by_cluster: HashMap<ClusterId, &str> = HashMap::new();
        for &cid in &ready {
            let (Some(identity), Some(cluster)) = (book.of_cluster(cid), partition.get(cid)) else {
                continue;
            };
            by_cluster.insert(cid, identity.identity_id.as_str());
            identities.push(IdentitySummary {
                identity_id: identity.identity_id.clone(),
                cluster_id: cid,
                members: cluster.members.iter().cloned().collect(),
                viewpoints: cluster.viewpoint_scope.iter().copied().collect(),
                representative: cluster.representative.clone(),
                assigned_at: identity.assigned_at,
            });
        }
        identities.sort_by(|x, y| x.identity_id.cmp(&y.identity_id));

        // Identities of clustered annotations.
        let mut assigned: BTreeMap<&str, (ClusterId, &str)> = BTreeMap::new();
        for id in &self.split.identifiable {
            if let Some(cid) = partition.cluster_of(id) {
                if let Some(&identity) = by_cluster.get(&cid) {
                    assigned.insert(id.as_str(), (cid, identity));
                }
            }
        }

        // Track integrity, then reattachment.
        let mut structural_conflicts = Vec::new();
        let mut via_track: BTreeMap<String, &str> = BTreeMap::new();
        for track in self.annotations.tracks() {
            let carried: BTreeSet<&str> = track
                .members
                .iter()
                .filter_map(|m| assigned.get(m.as_str()).map(|(_, identity)| *identity))
                .collect();
            match carried.len() {
                0 => {}
                1 => {
                    let Some(&identity) = carried.iter().next() else {
                        continue;
                    };
                    for m in &track.members {
                        if !assigned.contains_key(m.as_str()) && self.is_excluded(m) {
                            via_track.insert(m.clone(), identity);
                        }
                    }
                }
                _ => {
                    let conflict = StructuralIdentityConflict {
                        track_id: track.id.clone(),
                        identities: carried.iter().map(|s| s.to_string()).collect(),
                        annotations: track
                            .members
                            .iter()
                            .map(|m| TrackMember {
                                annotation_id: m.clone(),
                                identity_id: assigned.get(m.as_str()).map(|(_, i)| i.to_string()),
                            })
                            .collect(),
                    };
                    warn!(track_id = %track.id, %conflict, "finalize: structural identity conflict");
                    structural_conflicts.push(conflict);
                }
            }
        }

        let assignments: Vec<Assignment> = self
            .annotations
            .ids()
            .map(|id| {
                if let Some((cid, identity)) = assigned.get(id) {
                    Assignment {
                        annotation_id: id.to_string(),
                        identity_id: Some(identity.to_string()),
                        cluster_id: Some(*cid),
                        source: AssignmentSource::Cluster,
                    }
                } else if let Some(identity) = via_track.get(id) {
                    Assignment {
                        annotation_id: id.to_string(),
                        identity_id: Some(identity.to_string()),
                        cluster_id: None,
                        source: AssignmentSource::Track,
                    }
                } else {
                    Assignment {
                        annotation_id: id.to_string(),
                        identity_id: None,
                        cluster_id: partition.cluster_of(id),
                        source: AssignmentSource::Unassigned,
                    }
                }
            })
            .collect();

        let retired = book
            .records()
            .filter_map(|r| {
                r.retired_into.as_ref().map(|into| RetiredIdentity {
                    identity_id: r.identity_id.clone(),
                    merged_into: into.clone(),
                })
            })
            .collect();

        let audit = self
            .decisions
            .audit_log()?
            .into_iter()
            .filter(|e| e.to == PairStatus::Applied)
            .collect();

        let report = FinalReport {
            run: self.config.run.clone(),
            generated_at: Utc::now(),
            assignments,
            identities,
            retired,
            audit,
            structural_conflicts,
            blocked_clusters: blocked.len(),
        };
        info!(
            run = %report.run,
            identities = report.identities.len(),
            assigned = report.assigned(),
            blocked = report.blocked_clusters,
            structural_conflicts = report.structural_conflicts.len(),
            "finalize: report ready"
        );
        Ok(report)
    }

    fn is_excluded(&self, annotation: &str) -> bool {
        self.split
            .excluded
            .binary_search_by(|e| e.as_str().cmp(annotation))
            .is_ok()
    }

    /// Marks open pairs with a frozen cluster that is no longer live as
    /// stale: their alternatives name clusters that are gone.
    fn stale_orphans(&self) -> Result<usize, FinalizeError> {
        let mut n = 0;
        for pair in self.decisions.pairs()? {
            if !pair.status.is_open() {
                continue;
            }
            let partition = &self.state.partition;
            if pair.held().into_iter().all(|c| partition.is_live(c)) {
                continue;
            }
            // A resolved merge whose clusters are gone because it was
            // already applied is picked up by apply_resolved instead.
            if pair.outcome() == Some(Outcome::Merge)
                && partition.merged_pair(pair.cluster_a, pair.cluster_b).is_some()
            {
                continue;
            }
            match self.decisions.mark_stale(&pair.pair_id) {
                Ok(_) => {
                    debug!(pair_id = %pair.pair_id, "finalize: pair superseded");
                    n += 1;
                }
                // Someone moved the row first; their transition stands.
                Err(DecisionError::StaleTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(n)
    }

    /// Writes journal entries not yet in KV, in one batch.
    fn persist_journal(&mut self) -> Result<usize, FinalizeError> {
        let ops = &self.state.journal()[self.persisted..];
        if ops.is_empty() {
            return Ok(0);
        }
        let encoded = ops
            .iter()
            .enumerate()
            .map(|(i, op)| {
                rmp_serde::to_vec_named(op)
                    .map(|v| (journal_key(&self.config.run, self.persisted + i), v))
                    .map_err(|e| FinalizeError::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let entries: Vec<(&str, &[u8])> = encoded
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
            .collect();
        self.kv.batch_set(&entries)?;

        let n = encoded.len();
        self.persisted += n;
        debug!(run = %self.config.run, written = n, total = self.persisted, "finalize: journal persisted");
        Ok(n)
    }
}

/// Reads the persisted journal in sequence order.
pub fn load_journal(kv: &dyn KVStore, run: &str) -> Result<Vec<PartitionOp>, FinalizeError> {
    let entries = kv.scan(&journal_prefix(run))?;
    let mut ops = Vec::with_capacity(entries.len());
    for (expected, (key, value)) in entries.into_iter().enumerate() {
        if journal_seq(run, &key) != Some(expected) {
            return Err(FinalizeError::CorruptJournal {
                seq: expected,
                reason: format!("unexpected key {key:?}"),
            });
        }
        let op = rmp_serde::from_slice(&value).map_err(|e| FinalizeError::CorruptJournal {
            seq: expected,
            reason: e.to_string(),
        })?;
        ops.push(op);
    }
    Ok(ops)
}

fn pair_from_conflict(conflict: &Conflict) -> ClusterPair {
    let alternatives = conflict
        .alternatives
        .iter()
        .map(|h| Alternative {
            label: h.label.clone(),
            groups: h.groups.clone(),
            score: h.score,
        })
        .collect();
    ClusterPair::new(conflict.cluster_a, conflict.cluster_b, alternatives)
        .with_frozen(conflict.frozen.iter().copied())
}
