use crate::cmd::open;
use crate::output::{print_fields, print_json, print_table};
use anyhow::Context;
use chrono::{Duration, Utc};
use govengine_core::action::{EngineAction, NewEngineAction};
use govengine_core::types::EngineActionStatus;
use std::path::Path;

/// Everything `govengine initiate` accepts.
pub struct InitiateArgs {
    pub qualified_name: String,
    pub request_type: String,
    pub targets: Vec<String>,
    pub sources: Vec<String>,
    pub params: Vec<(String, String)>,
    pub start_in_secs: Option<u64>,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

pub fn initiate(root: &Path, user: &str, args: InitiateArgs, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let mut request = NewEngineAction::new(&args.qualified_name, &args.request_type);
    request.action_target_guids = args.targets;
    request.request_source_guids = args.sources;
    request.request_parameters = args.params.into_iter().collect();
    request.display_name = args.display_name;
    request.description = args.description;
    if let Some(secs) = args.start_in_secs {
        let secs = i64::try_from(secs).context("--start-in-secs is too large")?;
        request.start_time = Some(Utc::now() + Duration::seconds(secs));
    }

    let guid = project
        .engine
        .initiate_governance_action(user, request)
        .with_context(|| format!("failed to initiate '{}'", args.qualified_name))?;

    if json {
        print_json(&serde_json::json!({ "guid": guid }))?;
    } else {
        println!("{guid}");
    }
    Ok(())
}

pub fn status(root: &Path, guid: &str, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let status = project.engine.get_governance_action_status(guid)?;
    if json {
        print_json(&serde_json::json!({ "guid": guid, "status": status }))?;
    } else {
        println!("{status}");
    }
    Ok(())
}

pub fn show(root: &Path, guid: &str, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let action = project.engine.get_engine_action(guid)?;
    if json {
        return print_json(&action);
    }

    let guards: Vec<&str> = action.completion_guards.iter().map(String::as_str).collect();
    print_fields(&[
        ("Engine action", action.guid.clone()),
        ("Name", action.qualified_name.clone()),
        ("Display name", action.display_name.clone().unwrap_or_default()),
        ("Request type", action.request_type.clone()),
        ("Status", action.status.to_string()),
        ("Requested by", action.requested_by.clone()),
        ("Engine", action.processing_engine_guid.clone().unwrap_or_default()),
        (
            "Triggered by",
            action
                .triggered_by
                .as_ref()
                .map(|t| format!("{} ({})", t.action_guid, t.guard))
                .unwrap_or_default(),
        ),
        (
            "Scheduled",
            action.scheduled_start.map(|at| at.to_rfc3339()).unwrap_or_default(),
        ),
        ("Guards", guards.join(", ")),
        ("Message", action.completion_message.clone().unwrap_or_default()),
    ]);
    if !action.request_parameters.is_empty() {
        println!("\nParameters:");
        for (k, v) in &action.request_parameters {
            println!("  {k} = {v}");
        }
    }
    if !action.request_source_guids.is_empty() {
        println!("\nRequest sources:");
        for guid in &action.request_source_guids {
            println!("  {guid}");
        }
    }
    if !action.action_targets.is_empty() {
        println!("\nAction targets:");
        for target in &action.action_targets {
            match &target.completion_message {
                Some(message) => println!("  {} [{}] {message}", target.guid, target.status),
                None => println!("  {} [{}]", target.guid, target.status),
            }
        }
    }
    Ok(())
}

pub fn list(root: &Path, statuses: &[EngineActionStatus], json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let actions = project.engine.list_engine_actions(statuses)?;
    if json {
        return print_json(&actions);
    }
    if actions.is_empty() {
        println!("No engine actions.");
        return Ok(());
    }
    let rows = actions.iter().map(row).collect();
    print_table(&["GUID", "NAME", "REQUEST TYPE", "STATUS", "UPDATED"], rows);
    Ok(())
}

fn row(action: &EngineAction) -> Vec<String> {
    vec![
        action.guid.clone(),
        action.qualified_name.clone(),
        action.request_type.clone(),
        action.status.to_string(),
        action.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    ]
}

pub fn approve(root: &Path, user: &str, guid: &str, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let action = project.engine.approve_governance_action(user, guid)?;
    if json {
        print_json(&action)?;
    } else {
        println!("Approved {guid}");
    }
    Ok(())
}

pub fn cancel(root: &Path, user: &str, guid: &str, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let action = project.engine.cancel_governance_action(user, guid)?;
    if json {
        print_json(&action)?;
    } else {
        println!("Cancelled {guid}");
    }
    Ok(())
}
