//! Run configuration.
//!
//! Loaded from a YAML file; every field has a default and every flag on the
//! command line overrides the file.
//!
//! ```yaml
//! run: mara-2024
//! store: herd.redb
//! identify_threshold: 0.5
//! identity_prefix: zebra
//! inputs:
//!   annotations: annotations.json
//!   embeddings: embeddings.json
//!   linkage: average
//! lca:
//!   margin: 0.5
//!   max_neighbors: 3
//! review:
//!   poll_interval_secs: 2
//!   claim_timeout_secs: 600
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use herdid_affinity::{AffinityModel, CosineAffinity, EmbeddingTable, Linkage, TableAffinity};
use herdid_annotation::AnnotationStore;
use herdid_finalize::SessionConfig;
use herdid_kv::{KVError, KVStore, RedbStore};
use herdid_lca::LcaConfig;

fn default_run() -> String {
    "herd".into()
}

fn default_store() -> PathBuf {
    PathBuf::from("herd.redb")
}

fn default_identify_threshold() -> f32 {
    0.5
}

fn default_identity_prefix() -> String {
    "animal".into()
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_claim_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HerdConfig {
    #[serde(default = "default_run")]
    pub run: String,

    /// redb file holding decisions, journal and identities.
    #[serde(default = "default_store")]
    pub store: PathBuf,

    #[serde(default = "default_identify_threshold")]
    pub identify_threshold: f32,

    #[serde(default = "default_identity_prefix")]
    pub identity_prefix: String,

    #[serde(default)]
    pub inputs: Inputs,

    #[serde(default)]
    pub lca: LcaConfig,

    #[serde(default)]
    pub review: ReviewConfig,
}

/// Files produced upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<PathBuf>,

    /// `{embedding_ref: [f32, ...]}`, compared by cosine similarity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<PathBuf>,

    /// `[{a, b, score, confidence}]`, used when no embeddings are given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<PathBuf>,

    #[serde(default)]
    pub linkage: Linkage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Claims without a heartbeat for this long are released.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
        }
    }
}

impl ReviewConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        i64::try_from(self.claim_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub run: Option<String>,
    pub store: Option<PathBuf>,
    pub annotations: Option<PathBuf>,
    pub embeddings: Option<PathBuf>,
    pub pairs: Option<PathBuf>,
    pub identify_threshold: Option<f32>,
    pub margin: Option<f32>,
}

impl Default for HerdConfig {
    fn default() -> Self {
        Self {
            run: default_run(),
            store: default_store(),
            identify_threshold: default_identify_threshold(),
            identity_prefix: default_identity_prefix(),
            inputs: Inputs::default(),
            lca: LcaConfig::default(),
            review: ReviewConfig::default(),
        }
    }
}

impl HerdConfig {
    /// Reads `path`, or returns the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_overrides(mut self, o: &Overrides) -> Self {
        if let Some(run) = &o.run {
            self.run = run.clone();
        }
        if let Some(store) = &o.store {
            self.store = store.clone();
        }
        if let Some(p) = &o.annotations {
            self.inputs.annotations = Some(p.clone());
        }
        if let Some(p) = &o.embeddings {
            self.inputs.embeddings = Some(p.clone());
        }
        if let Some(p) = &o.pairs {
            self.inputs.pairs = Some(p.clone());
        }
        if let Some(t) = o.identify_threshold {
            self.identify_threshold = t;
        }
        if let Some(m) = o.margin {
            self.lca.margin = m;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.session_config().validate()?;
        if self.review.poll_interval_secs == 0 {
            bail!("review.poll_interval_secs must be positive");
        }
        if self.review.claim_timeout_secs == 0 {
            bail!("review.claim_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            run: self.run.clone(),
            identify_threshold: self.identify_threshold,
            identity_prefix: self.identity_prefix.clone(),
            lca: self.lca.clone(),
        }
    }

    pub fn open_store(&self) -> Result<Arc<dyn KVStore>, KVError> {
        Ok(Arc::new(RedbStore::open(&self.store)?))
    }

    pub fn load_annotations(&self) -> Result<AnnotationStore> {
        let Some(path) = &self.inputs.annotations else {
            bail!("no annotations file, set inputs.annotations or pass --annotations");
        };
        AnnotationStore::load_json(path)
            .with_context(|| format!("failed to load annotations {}", path.display()))
    }

    /// Embeddings win over a pair table when both are configured.
    pub fn load_model(&self) -> Result<Box<dyn AffinityModel>> {
        let linkage = self.inputs.linkage;
        if let Some(path) = &self.inputs.embeddings {
            let table = EmbeddingTable::load_json(path)
                .with_context(|| format!("failed to load embeddings {}", path.display()))?;
            return Ok(Box::new(CosineAffinity::new(table, linkage)));
        }
        if let Some(path) = &self.inputs.pairs {
            let table = TableAffinity::load_json(path, linkage)
                .with_context(|| format!("failed to load pair scores {}", path.display()))?;
            return Ok(Box::new(table));
        }
        bail!("no affinity input, set inputs.embeddings or inputs.pairs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = HerdConfig::from_yaml("").unwrap();
        assert_eq!(cfg, HerdConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = HerdConfig::from_yaml(
            "run: mara\nidentity_prefix: zebra\nlca:\n  margin: 0.3\ninputs:\n  pairs: p.json\n  linkage: single\n",
        )
        .unwrap();
        assert_eq!(cfg.run, "mara");
        assert_eq!(cfg.identity_prefix, "zebra");
        assert_eq!(cfg.lca.margin, 0.3);
        assert_eq!(cfg.lca.max_neighbors, LcaConfig::default().max_neighbors);
        assert_eq!(cfg.inputs.pairs, Some(PathBuf::from("p.json")));
        assert_eq!(cfg.inputs.linkage, Linkage::Single);
        assert_eq!(cfg.review, ReviewConfig::default());
        assert_eq!(cfg.store, PathBuf::from("herd.redb"));
    }

    #[test]
    fn flags_override_file() {
        let cfg = HerdConfig::from_yaml("run: mara\nidentify_threshold: 0.4\n")
            .unwrap()
            .with_overrides(&Overrides {
                run: Some("serengeti".into()),
                margin: Some(0.2),
                ..Default::default()
            });
        assert_eq!(cfg.run, "serengeti");
        assert_eq!(cfg.identify_threshold, 0.4);
        assert_eq!(cfg.lca.margin, 0.2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cfg = HerdConfig::default().with_overrides(&Overrides {
            identify_threshold: Some(2.0),
            ..Default::default()
        });
        assert!(cfg.validate().is_err());

        let mut cfg = HerdConfig::default();
        cfg.review.poll_interval_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = HerdConfig::default();
        cfg.review.claim_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn review_timings() {
        let review = HerdConfig::from_yaml("review:\n  claim_timeout_secs: 90\n")
            .unwrap()
            .review;
        assert_eq!(review.claim_timeout(), chrono::Duration::seconds(90));
        assert_eq!(review.poll_interval(), Duration::from_secs(2));

        let forever = ReviewConfig {
            claim_timeout_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(forever.claim_timeout(), chrono::Duration::MAX);
    }

    #[test]
    fn missing_inputs_are_reported() {
        let cfg = HerdConfig::default();
        let err = cfg.load_model().err().unwrap();
        assert!(err.to_string().contains("no affinity input"));
        assert!(cfg.load_annotations().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herd.yaml");
        std::fs::write(&path, "run: mara\n").unwrap();
        assert_eq!(HerdConfig::load(Some(&path)).unwrap().run, "mara");
        assert_eq!(HerdConfig::load(None).unwrap(), HerdConfig::default());
    }
}
