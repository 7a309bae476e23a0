//! Utility functions for CLI commands.

use std::path::Path;

use herdid_decision::DecisionStore;

use crate::Cli;
use crate::config::{HerdConfig, Overrides};

/// Loads the config file and applies command line overrides.
pub fn get_config(cli: &Cli) -> anyhow::Result<HerdConfig> {
    let overrides = Overrides {
        run: cli.run.clone(),
        store: cli.store.clone(),
        annotations: cli.annotations.clone(),
        embeddings: cli.embeddings.clone(),
        pairs: cli.pairs.clone(),
        identify_threshold: cli.identify_threshold,
        margin: cli.margin,
    };
    let cfg = HerdConfig::load(cli.config.as_deref())?.with_overrides(&overrides);
    cfg.validate()?;
    Ok(cfg)
}

/// Opens the decision store of the configured run.
pub fn open_decisions(cfg: &HerdConfig) -> anyhow::Result<DecisionStore> {
    Ok(DecisionStore::new(cfg.open_store()?, cfg.run.clone()))
}

/// Outputs a result as YAML or JSON.
pub fn output_result<T: serde::Serialize>(
    result: &T,
    output_path: Option<&Path>,
    as_json: bool,
) -> anyhow::Result<()> {
    let output = if as_json {
        serde_json::to_string_pretty(result)? + "\n"
    } else {
        serde_yaml::to_string(result)?
    };

    match output_path {
        Some(path) => std::fs::write(path, output)?,
        None => print!("{}", output),
    }

    Ok(())
}

/// Prints success message.
pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}

/// Prints warning message.
pub fn print_warning(msg: &str) {
    eprintln!("\x1b[33m!\x1b[0m {}", msg);
}

/// Prints info message.
pub fn print_info(msg: &str) {
    eprintln!("\x1b[34mℹ\x1b[0m {}", msg);
}
