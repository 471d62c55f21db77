use anyhow::Context;
use govengine_core::config::{Config, EngineSettings};
use govengine_core::process::ProcessDefinition;
use govengine_core::repository::RedbRepository;
use govengine_core::{io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing governance engine in: {}", root.display());

    for dir in [paths::GOVENGINE_DIR, paths::SCRIPTS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::new(EngineSettings::default())
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    if paths::process_path(root).exists() {
        println!("  exists:  {}", paths::PROCESS_FILE);
    } else {
        ProcessDefinition::new("default")
            .save(root)
            .context("failed to write process.yaml")?;
        println!("  created: {}", paths::PROCESS_FILE);
    }

    let repository = paths::repository_path(root);
    let existed = repository.exists();
    RedbRepository::open(&repository)
        .with_context(|| format!("failed to open repository {}", repository.display()))?;
    if existed {
        println!("  exists:  {}", paths::REPOSITORY_FILE);
    } else {
        println!("  created: {}", paths::REPOSITORY_FILE);
    }

    Ok(())
}
