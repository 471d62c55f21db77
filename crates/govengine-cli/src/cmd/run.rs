use crate::cmd::open;
use crate::output::print_json;
use anyhow::Context;
use govengine_core::process::ProcessDefinition;
use govengine_core::script::ScriptServiceProvider;
use std::path::Path;
use tracing::info;

/// Run the engine over this project's repository: script services from
/// `config.yaml`, steps from `process.yaml`.
pub fn run(root: &Path, once: bool, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let process = ProcessDefinition::load(root).context("failed to load process definition")?;
    let installed = ScriptServiceProvider::install(&project.engine, &project.config, root)
        .context("failed to install script services")?;
    project.engine.set_process_definition(process)?;
    let engine = project.engine;

    let rt = tokio::runtime::Runtime::new()?;

    if once {
        let report = rt.block_on(engine.run_once())?;
        if json {
            print_json(&report)?;
        } else {
            println!(
                "recovered: {}  started: {}  deferred: {}  awaiting approval: {}  failed: {}  lost: {}",
                report.recovered,
                report.started,
                report.deferred,
                report.awaiting_approval,
                report.failed,
                report.lost
            );
        }
        return Ok(());
    }

    println!(
        "Governance engine '{}' running with {installed} registration(s). Ctrl-C to stop.",
        engine.guid()
    );

    rt.block_on(async move {
        let mut runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });

        tokio::select! {
            finished = &mut runner => {
                finished??;
                return Ok(());
            }
            signal = tokio::signal::ctrl_c() => signal?,
        }

        info!("interrupt received; waiting for running handlers");
        engine.shutdown();
        runner.await??;
        Ok::<(), anyhow::Error>(())
    })
}
