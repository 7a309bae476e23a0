//! End-to-end scenarios across engine, decision store and finalizer.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use herdid_affinity::{Linkage, PairScore, TableAffinity};
use herdid_annotation::{Annotation, AnnotationStore, Viewpoint};
use herdid_decision::{Decision, Outcome, PairStatus};
use herdid_kv::{KVStore, MemoryStore, RedbStore};
use herdid_lca::{ClusterId, LcaConfig, MergeOrigin, PartitionOp};

use crate::session::Applied;
use crate::*;

struct Ann<'a> {
    id: &'a str,
    track: Option<&'a str>,
    quality: f32,
}

fn ann(id: &str) -> Ann<'_> {
    Ann {
        id,
        track: None,
        quality: 0.9,
    }
}

fn tracked<'a>(id: &'a str, track: &'a str, quality: f32) -> Ann<'a> {
    Ann {
        id,
        track: Some(track),
        quality,
    }
}

fn store(anns: &[Ann<'_>]) -> AnnotationStore {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
    AnnotationStore::from_records(anns.iter().enumerate().map(|(i, a)| Annotation {
        id: a.id.to_string(),
        track_id: a.track.map(String::from),
        viewpoint: if i % 2 == 0 {
            Viewpoint::Left
        } else {
            Viewpoint::Right
        },
        timestamp: t0 + Duration::seconds(i as i64),
        location: None,
        embedding_ref: a.id.to_string(),
        quality_score: a.quality,
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

fn config() -> SessionConfig {
    SessionConfig {
        run: "test".into(),
        identify_threshold: 0.5,
        identity_prefix: "zebra".into(),
        lca: LcaConfig::default(),
    }
}

fn c(i: u64) -> ClusterId {
    ClusterId(i)
}

fn resolve(session: &Session<'_>, pair_id: &str, outcome: Outcome) {
    session
        .decisions()
        .resolve(pair_id, Decision::new(pair_id, outcome, "alice"))
        .unwrap();
}

#[test]
fn review_round_trip() {
    let anns = store(&[ann("x1"), ann("x2"), ann("y1"), ann("y2")]);
    let model = table(&[("x1", "x2", 0.95), ("y1", "y2", 0.55)]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
    let mut session = Session::open(config(), kv, &anns, &model).unwrap();

    let summary = session.cluster().unwrap();
    assert_eq!(summary.merges, 1);
    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.queued, 1);
    assert_eq!(summary.live_clusters, 3);

    let pending: Vec<_> = session
        .decisions()
        .list_pending()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].pair_id, "p3-4");
    assert!(pending[0].alternatives.len() >= 2);

    // The y pair blocks its clusters; x is already final.
    let report = session.finalize().unwrap();
    assert_eq!(report.blocked_clusters, 2);
    assert_eq!(report.identity_of("x1"), Some("zebra:001"));
    assert_eq!(report.identity_of("x2"), Some("zebra:001"));
    assert_eq!(report.identity_of("y1"), None);
    assert!(report.is_clean());

    resolve(&session, "p3-4", Outcome::Merge);
    let report = session.finalize().unwrap();
    assert_eq!(report.blocked_clusters, 0);
    assert_eq!(report.identity_of("x1"), Some("zebra:001"));
    assert_eq!(report.identity_of("y1"), Some("zebra:002"));
    assert_eq!(report.identity_of("y2"), Some("zebra:002"));
    assert_eq!(report.audit.len(), 1);
    assert_eq!(report.audit[0].pair_id, "p3-4");
    assert_eq!(report.audit[0].to, PairStatus::Applied);

    // Nothing is left for the engine.
    let again = session.cluster().unwrap();
    assert_eq!((again.merges, again.conflicts), (0, 0));
}

#[test]
fn resolved_merges_apply_once_after_crash() {
    let anns = store(&[
        ann("a1"),
        ann("a2"),
        ann("b1"),
        ann("b2"),
        ann("d1"),
        ann("d2"),
    ]);
    let model = table(&[("a1", "a2", 0.55), ("b1", "b2", 0.55), ("d1", "d2", 0.55)]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());

    {
        let mut session = Session::open(config(), kv.clone(), &anns, &model).unwrap();
        assert_eq!(session.cluster().unwrap().queued, 3);
        for pair_id in ["p1-2", "p3-4", "p5-6"] {
            resolve(&session, pair_id, Outcome::Merge);
        }

        // Journal the first merge, then die before marking the row.
        let pair = session.decisions().get("p1-2").unwrap().unwrap();
        assert!(matches!(
            session.apply_decision(&pair).unwrap(),
            Applied::Merged(_)
        ));
    }
    assert_eq!(load_journal(kv.as_ref(), "test").unwrap().len(), 1);

    let mut session = Session::open(config(), kv.clone(), &anns, &model).unwrap();
    assert_eq!(session.state().partition.live_count(), 5);

    let summary = session.apply_resolved().unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.merged, 2);
    assert_eq!(summary.stale, 0);

    let journal = load_journal(kv.as_ref(), "test").unwrap();
    assert_eq!(journal.len(), 3);
    for pair_id in ["p1-2", "p3-4", "p5-6"] {
        let applied = journal
            .iter()
            .filter(|op| {
                matches!(op, PartitionOp::Merge { origin: MergeOrigin::Decision { pair_id: p }, .. } if p == pair_id)
            })
            .count();
        assert_eq!(applied, 1, "{pair_id} must be merged exactly once");
        let row = session.decisions().get(pair_id).unwrap().unwrap();
        assert_eq!(row.status, PairStatus::Applied);
    }

    assert_eq!(session.apply_resolved().unwrap(), ApplySummary::default());
    assert_eq!(session.state().partition.live_count(), 3);
}

#[test]
fn track_spanning_two_identities() {
    let anns = store(&[
        tracked("e1", "T", 0.2),
        tracked("e2", "U", 0.2),
        tracked("x1", "T", 0.9),
        tracked("x2", "T", 0.9),
        tracked("x3", "T", 0.9),
        tracked("x4", "T", 0.9),
        tracked("y1", "T", 0.9),
        tracked("z1", "U", 0.9),
    ]);
    let model = table(&[
        ("x1", "x2", 0.95),
        ("x1", "x3", 0.95),
        ("x1", "x4", 0.95),
        ("x2", "x3", 0.95),
        ("x2", "x4", 0.95),
        ("x3", "x4", 0.95),
    ]);
    let mut cfg = config();
    cfg.lca.margin = 0.4;
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
    let mut session = Session::open(cfg, kv, &anns, &model).unwrap();
    assert_eq!(session.split().excluded, vec!["e1", "e2"]);

    session.cluster().unwrap();
    let report = session.finalize().unwrap();

    // y1 and z1 are singletons with lower cluster ids than the merged x's.
    assert_eq!(report.identity_of("y1"), Some("zebra:001"));
    assert_eq!(report.identity_of("z1"), Some("zebra:002"));
    for x in ["x1", "x2", "x3", "x4"] {
        assert_eq!(report.identity_of(x), Some("zebra:003"));
    }

    assert!(!report.is_clean());
    assert_eq!(report.structural_conflicts.len(), 1);
    let conflict = &report.structural_conflicts[0];
    assert_eq!(conflict.track_id, "T");
    assert_eq!(conflict.identities, vec!["zebra:001", "zebra:003"]);
    assert_eq!(conflict.annotations.len(), 6);

    // Never auto-fixed: e1 stays unassigned; e2's track is unambiguous.
    assert_eq!(report.identity_of("e1"), None);
    let e2 = report
        .assignments
        .iter()
        .find(|a| a.annotation_id == "e2")
        .unwrap();
    assert_eq!(e2.identity_id.as_deref(), Some("zebra:002"));
    assert_eq!(e2.source, AssignmentSource::Track);
    assert_eq!(report.assignments.len(), 8);
}

#[test]
fn parallel_and_serial_runs_agree() {
    let anns = store(&[
        ann("a1"),
        ann("a2"),
        ann("a3"),
        ann("b1"),
        ann("b2"),
        ann("d1"),
        ann("d2"),
        ann("d3"),
    ]);
    let model = table(&[
        ("a1", "a2", 0.9),
        ("a2", "a3", 0.9),
        ("a1", "a3", 0.85),
        ("b1", "b2", 0.55),
        ("d1", "d2", 0.9),
        ("d2", "d3", 0.6),
    ]);

    let run = |parallel: bool| {
        let mut cfg = config();
        cfg.lca.parallel_components = parallel;
        let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
        let mut session = Session::open(cfg, kv, &anns, &model).unwrap();
        session.cluster().unwrap();
        let pairs: Vec<_> = session
            .decisions()
            .pairs()
            .unwrap()
            .into_iter()
            .map(|p| (p.pair_id, p.alternatives))
            .collect();
        let report = session.finalize().unwrap();
        let identities: Vec<_> = anns
            .ids()
            .map(|id| report.identity_of(id).map(String::from))
            .collect();
        (session.state().journal().to_vec(), pairs, identities)
    };

    assert_eq!(run(true), run(false));
}

#[test]
fn finalize_is_idempotent() {
    let anns = store(&[
        tracked("e1", "T", 0.1),
        tracked("x1", "T", 0.9),
        tracked("x2", "T", 0.9),
        ann("y1"),
        ann("y2"),
    ]);
    let model = table(&[("x1", "x2", 0.95), ("y1", "y2", 0.55)]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());

    let mut session = Session::open(config(), kv.clone(), &anns, &model).unwrap();
    session.cluster().unwrap();
    let first = session.finalize().unwrap();
    let second = session.finalize().unwrap();
    assert_eq!(first.assignments, second.assignments);
    assert_eq!(first.identities, second.identities);
    assert_eq!(first.blocked_clusters, second.blocked_clusters);
    assert_eq!(first.identity_of("e1"), Some("zebra:001"));

    // A fresh session over the same store agrees too.
    let mut reopened = Session::open(config(), kv, &anns, &model).unwrap();
    assert_eq!(reopened.cluster().unwrap().queued, 0);
    let third = reopened.finalize().unwrap();
    assert_eq!(first.assignments, third.assignments);
    assert_eq!(first.identities, third.identities);
}

#[test]
fn split_pair_is_never_proposed_again() {
    let anns = store(&[ann("y1"), ann("y2")]);
    let model = table(&[("y1", "y2", 0.55)]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());

    let mut session = Session::open(config(), kv.clone(), &anns, &model).unwrap();
    assert_eq!(session.cluster().unwrap().queued, 1);
    resolve(&session, "p1-2", Outcome::Split);

    let applied = session.apply_resolved().unwrap();
    assert_eq!(applied.split, 1);
    assert!(session.state().partition.is_separated(c(1), c(2)));

    let summary = session.cluster().unwrap();
    assert_eq!((summary.merges, summary.conflicts), (0, 0));

    // The separation survives a restart through the journal.
    let mut reopened = Session::open(config(), kv, &anns, &model).unwrap();
    let summary = reopened.cluster().unwrap();
    assert_eq!((summary.merges, summary.conflicts), (0, 0));

    let report = reopened.finalize().unwrap();
    assert_eq!(report.identity_of("y1"), Some("zebra:001"));
    assert_eq!(report.identity_of("y2"), Some("zebra:002"));
}

#[test]
fn deferred_pair_stays_apart() {
    let anns = store(&[ann("y1"), ann("y2")]);
    let model = table(&[("y1", "y2", 0.55)]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());

    let mut session = Session::open(config(), kv, &anns, &model).unwrap();
    session.cluster().unwrap();
    resolve(&session, "p1-2", Outcome::Defer);
    assert_eq!(session.apply_resolved().unwrap().deferred, 1);
    assert!(!session.state().partition.is_separated(c(1), c(2)));

    // The same question comes back unchanged and stays answered.
    let summary = session.cluster().unwrap();
    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(session.decisions().pending_count().unwrap(), 0);

    let report = session.finalize().unwrap();
    assert_eq!(report.blocked_clusters, 0);
    assert_ne!(report.identity_of("y1"), report.identity_of("y2"));
}

#[test]
fn merge_makes_overlapping_pair_stale() {
    let anns = store(&[ann("a"), ann("b"), ann("c")]);
    let model = table(&[]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
    let mut session = Session::open(config(), kv, &anns, &model).unwrap();

    let decisions = session.decisions();
    decisions
        .enqueue(herdid_decision::ClusterPair::new(c(1), c(2), Vec::new()))
        .unwrap();
    decisions
        .enqueue(herdid_decision::ClusterPair::new(c(1), c(3), Vec::new()))
        .unwrap();
    resolve(&session, "p1-2", Outcome::Merge);
    resolve(&session, "p1-3", Outcome::Merge);

    let summary = session.apply_resolved().unwrap();
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.stale, 1);
    let row = session.decisions().get("p1-3").unwrap().unwrap();
    assert_eq!(row.status, PairStatus::Stale);

    // Stale pairs do not block anything.
    let report = session.finalize().unwrap();
    assert_eq!(report.blocked_clusters, 0);
    assert_eq!(report.identity_of("c"), Some("zebra:001"));
    assert_eq!(report.identity_of("a"), Some("zebra:002"));
    assert_eq!(report.identity_of("b"), Some("zebra:002"));
}

#[test]
fn open_pair_holds_its_whole_neighborhood() {
    let anns = store(&[ann("a"), ann("b"), ann("c"), ann("d")]);
    let model = table(&[
        ("a", "b", 0.9),
        ("a", "c", 0.5),
        ("b", "c", 0.5),
        ("b", "d", 0.95),
    ]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());

    {
        let mut session = Session::open(config(), kv.clone(), &anns, &model).unwrap();
        let summary = session.cluster().unwrap();
        assert_eq!((summary.merges, summary.conflicts), (0, 1));
    }

    let mut session = Session::open(config(), kv, &anns, &model).unwrap();
    let pending: Vec<_> = session
        .decisions()
        .list_pending()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pending.len(), 1);
    let pair_id = pending[0].pair_id.clone();
    assert_eq!(pending[0].frozen, vec![c(1), c(2), c(3)]);

    // b is in the top alternative, so it must not be merged into d while
    // the pair waits.
    let summary = session.cluster().unwrap();
    assert_eq!(summary.merges, 0);
    assert_eq!(summary.live_clusters, 4);
    let row = session.decisions().get(&pair_id).unwrap().unwrap();
    assert_eq!(row.status, PairStatus::Pending);

    let report = session.finalize().unwrap();
    assert_eq!(report.blocked_clusters, 3);
    assert_eq!(report.identity_of("b"), None);
    assert!(report.identity_of("d").is_some());
}

#[test]
fn superseded_neighbor_makes_pair_stale() {
    let anns = store(&[ann("a"), ann("b"), ann("c"), ann("d")]);
    let model = table(&[]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
    let mut session = Session::open(config(), kv, &anns, &model).unwrap();

    let decisions = session.decisions();
    decisions
        .enqueue(herdid_decision::ClusterPair::new(c(1), c(2), Vec::new()).with_frozen([c(3)]))
        .unwrap();
    decisions
        .enqueue(herdid_decision::ClusterPair::new(c(3), c(4), Vec::new()))
        .unwrap();
    resolve(&session, "p3-4", Outcome::Merge);

    let summary = session.apply_resolved().unwrap();
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.stale, 1);
    let row = session.decisions().get("p1-2").unwrap().unwrap();
    assert_eq!(row.status, PairStatus::Stale);
}

#[test]
fn merged_identities_keep_the_oldest() {
    let anns = store(&[ann("a"), ann("b")]);
    let model = table(&[]);
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
    let mut session = Session::open(config(), kv, &anns, &model).unwrap();

    let report = session.finalize().unwrap();
    assert_eq!(report.identity_of("a"), Some("zebra:001"));
    assert_eq!(report.identity_of("b"), Some("zebra:002"));

    session
        .decisions()
        .enqueue(herdid_decision::ClusterPair::new(c(1), c(2), Vec::new()))
        .unwrap();
    resolve(&session, "p1-2", Outcome::Merge);

    let report = session.finalize().unwrap();
    assert_eq!(report.identity_of("a"), Some("zebra:001"));
    assert_eq!(report.identity_of("b"), Some("zebra:001"));
    assert_eq!(report.identities.len(), 1);
    assert_eq!(report.identities[0].cluster_id, c(3));
    assert_eq!(report.retired.len(), 1);
    assert_eq!(report.retired[0].identity_id, "zebra:002");
    assert_eq!(report.retired[0].merged_into, "zebra:001");
}

#[test]
fn redb_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("herd.redb");
    let anns = store(&[ann("x1"), ann("x2"), ann("y1"), ann("y2")]);
    let model = table(&[("x1", "x2", 0.95), ("y1", "y2", 0.55)]);

    {
        let kv: Arc<dyn KVStore> = Arc::new(RedbStore::open(&path).unwrap());
        let mut session = Session::open(config(), kv, &anns, &model).unwrap();
        session.cluster().unwrap();
        resolve(&session, "p3-4", Outcome::Merge);
    }

    let kv: Arc<dyn KVStore> = Arc::new(RedbStore::open(&path).unwrap());
    let mut session = Session::open(config(), kv, &anns, &model).unwrap();
    assert_eq!(session.state().partition.live_count(), 3);
    let report = session.finalize().unwrap();
    assert_eq!(report.identity_of("x1"), Some("zebra:001"));
    assert_eq!(report.identity_of("y2"), Some("zebra:002"));
}
