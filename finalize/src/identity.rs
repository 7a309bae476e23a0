use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use herdid_kv::KVStore;
use herdid_lca::{ClusterId, Partition};

use crate::FinalizeError;
use crate::keys::{identity_key, identity_prefix};

/// A stable label for one individual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: String,

    /// Allocation order; the `n` in `{prefix}:{n:03}`.
    pub seq: u64,

    /// The live cluster currently carrying this identity.
    pub cluster_id: ClusterId,

    pub assigned_at: DateTime<Utc>,

    /// Set when the cluster was merged into one carrying an older identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_into: Option<String>,
}

impl Identity {
    pub fn is_retired(&self) -> bool {
        self.retired_into.is_some()
    }
}

/// All identity records of a run, loaded from and written back to KV.
#[derive(Debug, Default)]
pub(crate) struct IdentityBook {
    prefix: String,
    records: BTreeMap<String, Identity>,

    /// Live cluster → the active identity it carries.
    active: HashMap<ClusterId, String>,
}

impl IdentityBook {
    pub(crate) fn load(kv: &dyn KVStore, run: &str, prefix: &str) -> Result<Self, FinalizeError> {
        let mut records = BTreeMap::new();
        for (_, value) in kv.scan(&identity_prefix(run))? {
            let record: Identity = serde_json::from_slice(&value)
                .map_err(|e| FinalizeError::Serialization(e.to_string()))?;
            records.insert(record.identity_id.clone(), record);
        }
        let active = records
            .values()
            .filter(|r| !r.is_retired())
            .map(|r| (r.cluster_id, r.identity_id.clone()))
            .collect();
        Ok(Self {
            prefix: prefix.to_string(),
            records,
            active,
        })
    }

    /// Active identity carried by `cluster`.
    pub(crate) fn of_cluster(&self, cluster: ClusterId) -> Option<&Identity> {
        self.records.get(self.active.get(&cluster)?)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &Identity> {
        self.records.values()
    }

    /// Gives every ready cluster an identity.
    ///
    /// A cluster whose lineage already carries identities inherits the
    /// oldest one and retires the rest; otherwise a new id is allocated.
    /// `ready` must be in ascending cluster-id order so allocation is
    /// deterministic. Returns the records that changed.
    pub(crate) fn assign(&mut self, partition: &Partition, ready: &[ClusterId]) -> Vec<Identity> {
        let mut changed: BTreeMap<String, Identity> = BTreeMap::new();
        let now = Utc::now();

        for &cluster in ready {
            if self.active.contains_key(&cluster) {
                continue;
            }

            let mut inherited: Vec<(u64, String, ClusterId)> = partition
                .lineage(cluster)
                .into_iter()
                .filter_map(|c| {
                    let id = self.active.get(&c)?;
                    let seq = self.records.get(id)?.seq;
                    Some((seq, id.clone(), c))
                })
                .collect();
            inherited.sort();

            let Some((_, keep, _)) = inherited.first().cloned() else {
                let seq = self.records.len() as u64 + 1;
                let identity_id = format!("{}:{:03}", self.prefix, seq);
                let record = Identity {
                    identity_id: identity_id.clone(),
                    seq,
                    cluster_id: cluster,
                    assigned_at: now,
                    retired_into: None,
                };
                debug!(identity = %identity_id, %cluster, "finalize: identity allocated");
                self.active.insert(cluster, identity_id.clone());
                self.records.insert(identity_id.clone(), record.clone());
                changed.insert(identity_id, record);
                continue;
            };

            for (_, id, ancestor) in &inherited {
                self.active.remove(ancestor);
                let Some(record) = self.records.get_mut(id) else {
                    continue;
                };
                if *id == keep {
                    record.cluster_id = cluster;
                } else {
                    record.retired_into = Some(keep.clone());
                    info!(retired = %id, into = %keep, "finalize: identity retired by merge");
                }
                changed.insert(id.clone(), record.clone());
            }
            self.active.insert(cluster, keep);
        }
        changed.into_values().collect()
    }

    /// Writes `changed` in one batch.
    pub(crate) fn persist(
        kv: &dyn KVStore,
        run: &str,
        changed: &[Identity],
    ) -> Result<(), FinalizeError> {
        if changed.is_empty() {
            return Ok(());
        }
        let encoded = changed
            .iter()
            .map(|r| {
                serde_json::to_vec(r)
                    .map(|v| (identity_key(run, &r.identity_id), v))
                    .map_err(|e| FinalizeError::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let entries: Vec<(&str, &[u8])> = encoded
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
            .collect();
        kv.batch_set(&entries)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use herdid_annotation::{Annotation, AnnotationStore, Viewpoint};
    use herdid_kv::MemoryStore;
    use herdid_lca::MergeOrigin;

    use super::*;

    fn partition(ids: &[&str]) -> Partition {
        let store = AnnotationStore::from_records(ids.iter().map(|id| Annotation {
            id: id.to_string(),
            track_id: None,
            viewpoint: Viewpoint::Left,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            location: None,
            embedding_ref: id.to_string(),
            quality_score: 0.9,
        }))
        .unwrap();
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        Partition::singletons(&store, &ids).unwrap()
    }

    #[test]
    fn allocates_in_cluster_order() {
        let p = partition(&["a", "b", "c"]);
        let mut book = IdentityBook {
            prefix: "zebra".into(),
            ..Default::default()
        };
        let changed = book.assign(&p, &[ClusterId(1), ClusterId(3)]);
        let ids: Vec<&str> = changed.iter().map(|r| r.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["zebra:001", "zebra:002"]);
        assert_eq!(book.of_cluster(ClusterId(3)).unwrap().identity_id, "zebra:002");

        // Nothing changes the second time.
        assert!(book.assign(&p, &[ClusterId(1), ClusterId(3)]).is_empty());
    }

    #[test]
    fn merge_inherits_oldest_identity() {
        let mut p = partition(&["a", "b"]);
        let mut book = IdentityBook {
            prefix: "zebra".into(),
            ..Default::default()
        };
        book.assign(&p, &[ClusterId(1), ClusterId(2)]);

        let merged = p.merge(ClusterId(2), ClusterId(1), MergeOrigin::Auto).unwrap();
        let changed = book.assign(&p, &[merged]);
        assert_eq!(changed.len(), 2);

        let kept = book.of_cluster(merged).unwrap();
        assert_eq!(kept.identity_id, "zebra:001");
        assert!(book.of_cluster(ClusterId(1)).is_none());
        assert!(book.of_cluster(ClusterId(2)).is_none());
        let retired: Vec<_> = book.records().filter(|r| r.is_retired()).collect();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].identity_id, "zebra:002");
        assert_eq!(retired[0].retired_into.as_deref(), Some("zebra:001"));
        assert_eq!(book.records().count(), 2, "no new identity for an inherited cluster");
    }

    #[test]
    fn persist_and_reload() {
        let kv = MemoryStore::new();
        let p = partition(&["a"]);
        let mut book = IdentityBook::load(&kv, "run", "zebra").unwrap();
        let changed = book.assign(&p, &[ClusterId(1)]);
        IdentityBook::persist(&kv, "run", &changed).unwrap();

        let reloaded = IdentityBook::load(&kv, "run", "zebra").unwrap();
        assert_eq!(reloaded.of_cluster(ClusterId(1)), book.of_cluster(ClusterId(1)));
        assert!(reloaded.of_cluster(ClusterId(2)).is_none());
    }
}
