//! Input fixtures and argument helpers for command tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use herdid_decision::DecisionStore;
use herdid_kv::RedbStore;

use crate::Cli;

/// A tempdir holding a store plus annotation and pair score files.
pub(crate) struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    /// `anns` is `(id, track, quality)`; viewpoints alternate left/right and
    /// timestamps one second apart, in the order given.
    pub fn new(anns: &[(&str, Option<&str>, f32)], pairs: &[(&str, &str, f32)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = anns
            .iter()
            .enumerate()
            .map(|(i, (id, track, quality))| {
                let mut record = json!({
                    "id": id,
                    "viewpoint": if i % 2 == 0 { "left" } else { "right" },
                    "timestamp": format!("2024-03-01T06:00:{i:02}Z"),
                    "embedding_ref": id,
                    "quality_score": quality,
                });
                if let Some(track) = track {
                    record["track_id"] = json!(track);
                }
                record
            })
            .collect();
        let scores: Vec<_> = pairs
            .iter()
            .map(|(a, b, score)| json!({"a": a, "b": b, "score": score}))
            .collect();
        std::fs::write(dir.path().join("annotations.json"), json!(records).to_string()).unwrap();
        std::fs::write(dir.path().join("pairs.json"), json!(scores).to_string()).unwrap();
        Self { dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn store(&self) -> PathBuf {
        self.path("herd.redb")
    }

    /// `herdid --store ... --annotations ... --pairs ... <args>`.
    pub fn cli(&self, args: &[&str]) -> Cli {
        let store = self.store();
        let annotations = self.path("annotations.json");
        let pairs = self.path("pairs.json");
        let mut argv: Vec<&str> = vec![
            "herdid",
            "--store",
            path_str(&store),
            "--annotations",
            path_str(&annotations),
            "--pairs",
            path_str(&pairs),
        ];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    /// Opens the decision store directly. Drop it before the next command.
    pub fn decisions(&self) -> DecisionStore {
        DecisionStore::new(Arc::new(RedbStore::open(self.store()).unwrap()), "herd")
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}
