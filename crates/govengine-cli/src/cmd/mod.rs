pub mod action;
pub mod element;
pub mod init;
pub mod process;
pub mod run;

use anyhow::Context;
use govengine_core::config::Config;
use govengine_core::engine::GovernanceEngine;
use govengine_core::paths;
use govengine_core::repository::RedbRepository;
use std::path::Path;
use std::sync::Arc;

/// An initialized project opened for one command.
pub struct Project {
    pub config: Config,
    pub repo: Arc<RedbRepository>,
    pub engine: GovernanceEngine,
}

pub fn open(root: &Path) -> anyhow::Result<Project> {
    let config = Config::load(root).context("failed to load config (run `govengine init` first)")?;
    let path = paths::repository_path(root);
    let repo = Arc::new(
        RedbRepository::open(&path)
            .with_context(|| format!("failed to open repository {}", path.display()))?,
    );
    let engine = GovernanceEngine::new(config.engine.clone(), Arc::clone(&repo));
    Ok(Project {
        config,
        repo,
        engine,
    })
}

/// Parse `KEY=VALUE` arguments.
pub fn parse_kv(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, _)) if k.trim().is_empty() => Err(format!("key cannot be empty in: {s}")),
        Some((k, v)) => Ok((k.trim().to_string(), v.to_string())),
        None => Err(format!("expected KEY=VALUE, got: {s}")),
    }
}
