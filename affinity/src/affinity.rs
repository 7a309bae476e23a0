use serde::{Deserialize, Serialize};

use herdid_annotation::Annotation;

use crate::AffinityError;

/// A validated similarity score with the model's confidence in it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    pub score: f32,
    pub confidence: f32,
}

impl Affinity {
    /// No evidence either way.
    pub const NONE: Affinity = Affinity {
        score: 0.0,
        confidence: 0.0,
    };

    /// Validates both values lie in [0, 1]. NaN is rejected.
    pub fn new(score: f32, confidence: f32) -> Result<Self, AffinityError> {
        if !(0.0..=1.0).contains(&score) || !(0.0..=1.0).contains(&confidence) {
            return Err(AffinityError::InvalidScore { score, confidence });
        }
        Ok(Self { score, confidence })
    }
}

/// How pairwise annotation scores combine into a cluster-to-cluster score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Confidence-weighted mean over all member pairs.
    #[default]
    Average,
    /// The most similar member pair.
    Single,
    /// The least similar member pair.
    Complete,
    /// Similarity of member centroids. Only embedding models support it;
    /// others fall back to `Average`.
    Centroid,
}

/// Similarity model consumed by the clustering engine.
///
/// Implementations must be pure: symmetric in their arguments and
/// deterministic for a fixed pair.
pub trait AffinityModel: Send + Sync {
    /// Scores two annotations.
    fn score(&self, a: &Annotation, b: &Annotation) -> Result<Affinity, AffinityError>;

    /// Scores two clusters given their members. Defaults to combining
    /// pairwise scores with [`AffinityModel::linkage`].
    fn score_clusters(
        &self,
        a: &[&Annotation],
        b: &[&Annotation],
    ) -> Result<Affinity, AffinityError> {
        linkage_score(self, self.linkage(), a, b)
    }

    /// Linkage used by the default [`AffinityModel::score_clusters`].
    fn linkage(&self) -> Linkage {
        Linkage::Average
    }

    /// Sparse candidate pairs (annotation ids), when the model only knows a
    /// subset of all pairs. `None` means every pair may be scored.
    fn candidate_pairs(&self) -> Option<Vec<(String, String)>> {
        None
    }
}

/// Combines pairwise annotation scores into one cluster score.
pub fn linkage_score<M: AffinityModel + ?Sized>(
    model: &M,
    linkage: Linkage,
    a: &[&Annotation],
    b: &[&Annotation],
) -> Result<Affinity, AffinityError> {
    if a.is_empty() || b.is_empty() {
        return Ok(Affinity::NONE);
    }

    let mut pairs = Vec::with_capacity(a.len() * b.len());
    for x in a {
        for y in b {
            // Re-check: a model may hand back an unvalidated literal.
            let p = model.score(x, y)?;
            pairs.push(Affinity::new(p.score, p.confidence)?);
        }
    }

    match linkage {
        Linkage::Single => Ok(pick(&pairs, |cand, best| cand > best)),
        Linkage::Complete => Ok(pick(&pairs, |cand, best| cand < best)),
        Linkage::Average | Linkage::Centroid => {
            let n = pairs.len() as f64;
            let conf_sum: f64 = pairs.iter().map(|p| p.confidence as f64).sum();
            let score = if conf_sum > 0.0 {
                pairs
                    .iter()
                    .map(|p| p.score as f64 * p.confidence as f64)
                    .sum::<f64>()
                    / conf_sum
            } else {
                pairs.iter().map(|p| p.score as f64).sum::<f64>() / n
            };
            // Averages of values in [0, 1] stay in range up to rounding.
            Affinity::new(score.min(1.0) as f32, (conf_sum / n).min(1.0) as f32)
        }
    }
}

/// First pair whose score beats all others under `better`; input order
/// breaks ties so the result is deterministic.
fn pick(pairs: &[Affinity], better: impl Fn(f32, f32) -> bool) -> Affinity {
    let mut best = pairs[0];
    for p in &pairs[1..] {
        if better(p.score, best.score) {
            best = *p;
        }
    }
    best
}
