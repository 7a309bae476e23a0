use std::collections::HashMap;
use std::fs;
use std::path::Path;

use herdid_annotation::Annotation;

use crate::affinity::{Affinity, AffinityModel, Linkage, linkage_score};
use crate::AffinityError;

/// L2-normalized embeddings keyed by `embedding_ref`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingTable {
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl EmbeddingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON object mapping embedding refs to float arrays.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, AffinityError> {
        let data = fs::read(path)?;
        let raw: HashMap<String, Vec<f32>> = serde_json::from_slice(&data)?;
        // Sort so a dimension mismatch always reports the same ref.
        let mut entries: Vec<_> = raw.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut table = Self::new();
        for (key, emb) in entries {
            table.insert(key, emb)?;
        }
        Ok(table)
    }

    /// Stores a normalized copy of `emb`. The first insert fixes the
    /// dimension.
    pub fn insert(&mut self, key: impl Into<String>, mut emb: Vec<f32>) -> Result<(), AffinityError> {
        if self.vectors.is_empty() {
            self.dim = emb.len();
        } else if emb.len() != self.dim {
            return Err(AffinityError::DimensionMismatch {
                expected: self.dim,
                got: emb.len(),
            });
        }
        l2_norm(&mut emb);
        self.vectors.insert(key.into(), emb);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&[f32]> {
        self.vectors.get(key).map(Vec::as_slice)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    fn lookup(&self, ann: &Annotation) -> Result<&[f32], AffinityError> {
        self.get(&ann.embedding_ref)
            .ok_or_else(|| AffinityError::MissingEmbedding(ann.embedding_ref.clone()))
    }
}

/// Cosine similarity over upstream embeddings.
///
/// Negative similarities map to 0. Confidence is the geometric mean of the
/// two annotations' quality scores, so blurry detections weigh less when
/// cluster scores are averaged.
pub struct CosineAffinity {
    table: EmbeddingTable,
    linkage: Linkage,
}

impl CosineAffinity {
    pub fn new(table: EmbeddingTable, linkage: Linkage) -> Self {
        Self { table, linkage }
    }

    pub fn table(&self) -> &EmbeddingTable {
        &self.table
    }

    fn centroid(&self, members: &[&Annotation]) -> Result<Vec<f32>, AffinityError> {
        let mut centroid = vec![0.0f32; self.table.dim()];
        for ann in members {
            for (c, v) in centroid.iter_mut().zip(self.table.lookup(ann)?) {
                *c += v;
            }
        }
        l2_norm(&mut centroid);
        Ok(centroid)
    }
}

fn to_affinity(sim: f32, confidence: f32) -> Result<Affinity, AffinityError> {
    // Rounding can push normalized cosine a hair past 1.
    Affinity::new(sim.clamp(0.0, 1.0), confidence)
}

fn mean_quality(members: &[&Annotation]) -> f32 {
    members.iter().map(|a| a.quality_score).sum::<f32>() / members.len() as f32
}

impl AffinityModel for CosineAffinity {
    fn score(&self, a: &Annotation, b: &Annotation) -> Result<Affinity, AffinityError> {
        let sim = cosine_sim(self.table.lookup(a)?, self.table.lookup(b)?);
        to_affinity(sim, (a.quality_score * b.quality_score).sqrt())
    }

    fn score_clusters(
        &self,
        a: &[&Annotation],
        b: &[&Annotation],
    ) -> Result<Affinity, AffinityError> {
        if self.linkage != Linkage::Centroid {
            return linkage_score(self, self.linkage, a, b);
        }
        if a.is_empty() || b.is_empty() {
            return Ok(Affinity::NONE);
        }
        let sim = cosine_sim(&self.centroid(a)?, &self.centroid(b)?);
        to_affinity(sim, (mean_quality(a) * mean_quality(b)).sqrt())
    }

    fn linkage(&self) -> Linkage {
        self.linkage
    }
}

/// Cosine similarity between two vectors, with f64 accumulation.
pub(crate) fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    let mut dot: f64 = 0.0;
    let mut na: f64 = 0.0;
    let mut nb: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Normalizes a vector to unit length in-place.
pub(crate) fn l2_norm(v: &mut [f32]) {
    let sum: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum();
    let norm = sum.sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}
