use serde::{Deserialize, Serialize};

use crate::LcaError;

fn default_similarity_floor() -> f32 {
    0.25
}

fn default_margin() -> f32 {
    0.5
}

fn default_max_neighbors() -> usize {
    3
}

fn default_max_candidates() -> usize {
    10
}

fn default_max_passes() -> usize {
    32
}

fn default_parallel() -> bool {
    true
}

/// Tunables of the clustering engine.
///
/// Neighborhood size and enumeration bounds are configuration, not
/// algorithmic constants; the defaults suit a few thousand annotations per
/// run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcaConfig {
    /// Minimum edge score for a cluster to count as a neighbor.
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,

    /// Required lead of the best hypothesis over the second best before it
    /// is committed without review.
    #[serde(default = "default_margin")]
    pub margin: f32,

    /// Neighbors considered per neighborhood (best first).
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,

    /// Edges kept per annotation when building the graph. 0 keeps all.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Upper bound on worklist sweeps per component.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,

    /// Run disjoint components on worker threads.
    #[serde(default = "default_parallel")]
    pub parallel_components: bool,
}

impl Default for LcaConfig {
    fn default() -> Self {
        Self {
            similarity_floor: default_similarity_floor(),
            margin: default_margin(),
            max_neighbors: default_max_neighbors(),
            max_candidates: default_max_candidates(),
            max_passes: default_max_passes(),
            parallel_components: default_parallel(),
        }
    }
}

impl LcaConfig {
    pub fn validate(&self) -> Result<(), LcaError> {
        if !(0.0..=1.0).contains(&self.similarity_floor) {
            return Err(LcaError::InvalidConfig(format!(
                "similarity_floor {} outside [0, 1]",
                self.similarity_floor
            )));
        }
        if !(0.0..=1.0).contains(&self.margin) {
            return Err(LcaError::InvalidConfig(format!(
                "margin {} outside [0, 1]",
                self.margin
            )));
        }
        if self.max_neighbors == 0 {
            return Err(LcaError::InvalidConfig("max_neighbors must be positive".into()));
        }
        if self.max_passes == 0 {
            return Err(LcaError::InvalidConfig("max_passes must be positive".into()));
        }
        Ok(())
    }
}
