use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use herdid_annotation::Annotation;

use crate::affinity::{Affinity, AffinityModel, Linkage};
use crate::AffinityError;

fn full_confidence() -> f32 {
    1.0
}

/// One scored annotation pair as written by the upstream matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub a: String,
    pub b: String,
    pub score: f32,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

/// Precomputed pair scores keyed by annotation id.
///
/// Pairs absent from the table score [`Affinity::NONE`]. Only listed pairs
/// are offered as graph candidates.
#[derive(Debug, Clone, Default)]
pub struct TableAffinity {
    pairs: BTreeMap<(String, String), Affinity>,
    linkage: Linkage,
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl TableAffinity {
    pub fn new(linkage: Linkage) -> Self {
        Self {
            pairs: BTreeMap::new(),
            linkage,
        }
    }

    /// Builds a table, validating every score. A pair listed twice must
    /// carry the same values both times.
    pub fn from_pairs<I>(pairs: I, linkage: Linkage) -> Result<Self, AffinityError>
    where
        I: IntoIterator<Item = PairScore>,
    {
        let mut table = Self::new(linkage);
        for p in pairs {
            table.insert(&p.a, &p.b, Affinity::new(p.score, p.confidence)?)?;
        }
        Ok(table)
    }

    /// Loads a JSON array of [`PairScore`] records.
    pub fn load_json<P: AsRef<Path>>(path: P, linkage: Linkage) -> Result<Self, AffinityError> {
        let data = fs::read(path)?;
        let pairs: Vec<PairScore> = serde_json::from_slice(&data)?;
        Self::from_pairs(pairs, linkage)
    }

    pub fn insert(&mut self, a: &str, b: &str, affinity: Affinity) -> Result<(), AffinityError> {
        let key = ordered(a, b);
        if let Some(existing) = self.pairs.get(&key) {
            if *existing != affinity {
                return Err(AffinityError::InconsistentPair { a: key.0, b: key.1 });
            }
            return Ok(());
        }
        self.pairs.insert(key, affinity);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl AffinityModel for TableAffinity {
    fn score(&self, a: &Annotation, b: &Annotation) -> Result<Affinity, AffinityError> {
        Ok(self
            .pairs
            .get(&ordered(&a.id, &b.id))
            .copied()
            .unwrap_or(Affinity::NONE))
    }

    fn linkage(&self) -> Linkage {
        self.linkage
    }

    fn candidate_pairs(&self) -> Option<Vec<(String, String)>> {
        Some(self.pairs.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::Utc;
    use herdid_annotation::Viewpoint;

    use super::*;

    fn ann(id: &str) -> Annotation {
        Annotation {
            id: id.into(),
            track_id: None,
            viewpoint: Viewpoint::Left,
            timestamp: Utc::now(),
            location: None,
            embedding_ref: id.into(),
            quality_score: 1.0,
        }
    }

    fn pair(a: &str, b: &str, score: f32) -> PairScore {
        PairScore {
            a: a.into(),
            b: b.into(),
            score,
            confidence: 1.0,
        }
    }

    #[test]
    fn lookup_is_order_independent() {
        let table = TableAffinity::from_pairs([pair("b", "a", 0.7)], Linkage::Average).unwrap();
        let ab = table.score(&ann("a"), &ann("b")).unwrap();
        let ba = table.score(&ann("b"), &ann("a")).unwrap();
        assert_eq!(ab.score, 0.7);
        assert_eq!(ab, ba);
        assert_eq!(table.score(&ann("a"), &ann("c")).unwrap(), Affinity::NONE);
    }

    #[test]
    fn out_of_range_score_is_rejected_not_clamped() {
        let err = TableAffinity::from_pairs([pair("a", "b", 1.2)], Linkage::Average).unwrap_err();
        assert!(matches!(err, AffinityError::InvalidScore { .. }));
    }

    #[test]
    fn repeated_pairs_must_agree() {
        assert!(
            TableAffinity::from_pairs([pair("a", "b", 0.4), pair("b", "a", 0.4)], Linkage::Average)
                .is_ok()
        );
        let err = TableAffinity::from_pairs([pair("a", "b", 0.4), pair("b", "a", 0.5)], Linkage::Average)
            .unwrap_err();
        assert!(matches!(err, AffinityError::InconsistentPair { .. }));
    }

    #[test]
    fn candidates_are_sorted_pairs() {
        let table = TableAffinity::from_pairs(
            [pair("c", "a", 0.4), pair("a", "b", 0.9)],
            Linkage::Average,
        )
        .unwrap();
        assert_eq!(
            table.candidate_pairs().unwrap(),
            vec![("a".to_string(), "b".to_string()), ("a".to_string(), "c".to_string())]
        );
    }

    #[test]
    fn load_with_default_confidence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"a": "x", "b": "y", "score": 0.25}}]"#).unwrap();
        let table = TableAffinity::load_json(file.path(), Linkage::Single).unwrap();
        let aff = table.score(&ann("x"), &ann("y")).unwrap();
        assert_eq!(aff.confidence, 1.0);
        assert_eq!(table.linkage(), Linkage::Single);
    }
}
