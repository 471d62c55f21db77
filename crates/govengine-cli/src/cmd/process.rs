use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use govengine_core::config::{Config, WarnLevel};
use govengine_core::process::ProcessDefinition;
use std::path::Path;

#[derive(Subcommand)]
pub enum ProcessSubcommand {
    /// Print the process definition
    Show,
    /// Check the config and process definition for mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ProcessSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ProcessSubcommand::Show => show(root, json),
        ProcessSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let process = ProcessDefinition::load(root).context("failed to load process definition")?;
    if json {
        return print_json(&process);
    }
    println!("Process: {}", process.name);
    if process.steps.is_empty() {
        println!("  (no steps)");
    }
    for step in &process.steps {
        println!("  {} / {}", step.trigger_request_type, step.trigger_guard);
        for next in &step.next {
            match next.wait_time_secs {
                0 => println!("    -> {}", next.request_type),
                secs => println!("    -> {} (after {secs}s)", next.request_type),
            }
        }
    }
    Ok(())
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let process = ProcessDefinition::load(root).context("failed to load process definition")?;
    let mut warnings = config.validate();
    warnings.extend(config.validate_process(&process));

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config and process definition are valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("validation found errors");
    }
    Ok(())
}
