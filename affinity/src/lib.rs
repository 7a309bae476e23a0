//! Pairwise similarity between annotations and clusters.
//!
//! The similarity model itself is produced upstream; this crate only
//! defines the [`AffinityModel`] seam the clustering engine consumes and two
//! adapters for the artifacts upstream hands over:
//!
//! - [`CosineAffinity`]: per-annotation embeddings compared by cosine
//!   similarity.
//! - [`TableAffinity`]: a precomputed list of scored annotation pairs.
//!
//! Every score leaving this crate has passed through [`Affinity::new`], so
//! consumers can rely on both values lying in [0, 1].

mod affinity;
mod cosine;
mod error;
mod table;

pub use affinity::{Affinity, AffinityModel, Linkage, linkage_score};
pub use cosine::{CosineAffinity, EmbeddingTable};
pub use error::AffinityError;
pub use table::{PairScore, TableAffinity};
