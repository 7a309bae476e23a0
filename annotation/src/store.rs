use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::{Annotation, AnnotationError};

/// Annotations sharing one tracking id, ordered by capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub members: Vec<String>,
}

/// Result of filtering annotations by identifiability score.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifiabilitySplit {
    /// Annotations at or above the threshold, in id order. These are clustered.
    pub identifiable: Vec<String>,

    /// Annotations below the threshold, in id order. These are only
    /// reattached after identities are final.
    pub excluded: Vec<String>,
}

/// Owns every annotation of a run.
///
/// Iteration is always in ascending id order so everything built on top of
/// the store is deterministic.
#[derive(Debug, Clone, Default)]
pub struct AnnotationStore {
    records: BTreeMap<String, Annotation>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from records, rejecting duplicates and invalid scores.
    pub fn from_records<I>(records: I) -> Result<Self, AnnotationError>
    where
        I: IntoIterator<Item = Annotation>,
    {
        let mut store = Self::new();
        for ann in records {
            store.insert(ann)?;
        }
        Ok(store)
    }

    /// Loads a JSON array of annotation records.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, AnnotationError> {
        let data = fs::read(path)?;
        let records: Vec<Annotation> = serde_json::from_slice(&data)?;
        Self::from_records(records)
    }

    /// Adds a record. Records are immutable: re-inserting an id fails.
    pub fn insert(&mut self, ann: Annotation) -> Result<(), AnnotationError> {
        ann.validate()?;
        if self.records.contains_key(&ann.id) {
            return Err(AnnotationError::DuplicateId(ann.id));
        }
        self.records.insert(ann.id.clone(), ann);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Annotation> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All annotations in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Splits annotations into identifiable and excluded sets.
    pub fn split_identifiable(&self, threshold: f32) -> IdentifiabilitySplit {
        let mut split = IdentifiabilitySplit::default();
        for ann in self.records.values() {
            if ann.quality_score >= threshold {
                split.identifiable.push(ann.id.clone());
            } else {
                split.excluded.push(ann.id.clone());
            }
        }
        split
    }

    /// Groups annotations by track id. Tracks are returned in id order and
    /// their members in (timestamp, id) order.
    pub fn tracks(&self) -> Vec<Track> {
        let mut grouped: BTreeMap<&str, Vec<&Annotation>> = BTreeMap::new();
        for ann in self.records.values() {
            if let Some(track) = ann.track_id.as_deref() {
                grouped.entry(track).or_default().push(ann);
            }
        }
        grouped
            .into_iter()
            .map(|(id, mut anns)| {
                anns.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
                Track {
                    id: id.to_string(),
                    members: anns.into_iter().map(|a| a.id.clone()).collect(),
                }
            })
            .collect()
    }
}
