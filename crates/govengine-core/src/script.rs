//! Governance action services backed by external commands.
//!
//! A script service is declared in `config.yaml` and speaks a JSON
//! stdin/stdout protocol:
//!
//! - stdin: one `ScriptRequest` describing the invocation.
//! - stdout: one `ScriptCompletion`, recorded as the action's completion.
//! - stderr: passed through so script log lines reach the operator.
//!
//! A script that exits non-zero without writing anything fails the action.
//! A script that exits zero without writing anything leaves the action
//! incomplete, which the engine also records as a failure. Watchdogs cannot
//! be scripts: they need a listener that outlives one process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::action::Completion;
use crate::config::Config;
use crate::context::{
    ActionContext, ProvisioningContext, RemediationContext, TriageContext, VerificationContext,
};
use crate::engine::GovernanceEngine;
use crate::error::{GovError, Result};
use crate::handler::{
    GovernanceHandler, HandlerFailure, HandlerResult, ProvisioningService, RemediationService,
    TriageService, VerificationService,
};
use crate::registry::{ServiceDescriptor, ServiceProvider, ServiceRegistration};
use crate::types::{CompletionStatus, ServiceRole};

/// Set for every script so it can find the project.
pub const ROOT_ENV: &str = "GOVENGINE_ROOT";
pub const ACTION_ENV: &str = "GOVENGINE_ACTION";

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub engine_action_guid: String,
    pub request_type: String,
    pub request_parameters: BTreeMap<String, String>,
    pub requester: String,
    pub request_sources: Vec<String>,
    pub action_targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configuration_properties: BTreeMap<String, String>,
}

impl ScriptRequest {
    fn from_context(ctx: &ActionContext) -> Self {
        Self {
            engine_action_guid: ctx.engine_action_guid().to_string(),
            request_type: ctx.request_type().to_string(),
            request_parameters: ctx.request_parameters().clone(),
            requester: ctx.requester_user_id().to_string(),
            request_sources: ctx.request_source_guids().to_vec(),
            action_targets: ctx.action_target_guids().to_vec(),
            configuration_properties: ctx.registration().configuration_properties.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptCompletion {
    pub status: CompletionStatus,
    #[serde(default)]
    pub guards: Vec<String>,
    #[serde(default)]
    pub new_action_targets: Vec<String>,
    #[serde(default)]
    pub new_request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<ScriptCompletion> for Completion {
    fn from(c: ScriptCompletion) -> Self {
        Completion {
            status: c.status,
            guards: c.guards,
            new_action_targets: c.new_action_targets,
            new_request_parameters: c.new_request_parameters,
            message: c.message,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct ScriptServiceProvider {
    descriptor: ServiceDescriptor,
    program: PathBuf,
    args: Vec<String>,
    root: PathBuf,
}

/// Bare names are looked up on `PATH`; anything with a path separator is
/// taken relative to `root`.
fn resolve_program(command: &str, root: &Path) -> Result<PathBuf> {
    if command.trim().is_empty() {
        return Err(GovError::invalid("script command is empty"));
    }
    let path = Path::new(command);
    if path.is_absolute() || path.components().count() > 1 {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        if !full.is_file() {
            return Err(GovError::invalid(format!(
                "script '{}' not found",
                full.display()
            )));
        }
        return Ok(full);
    }
    which::which(command)
        .map_err(|e| GovError::invalid(format!("command '{command}' not found on PATH: {e}")))
}

impl ScriptServiceProvider {
    pub fn from_definition(definition: &crate::config::ServiceDefinition, root: &Path) -> Result<Self> {
        if definition.role == ServiceRole::Watchdog {
            return Err(GovError::invalid(format!(
                "service '{}': watchdog services cannot be scripts",
                definition.name
            )));
        }
        Ok(Self {
            descriptor: definition.descriptor(),
            program: resolve_program(&definition.command, root)?,
            args: definition.args.clone(),
            root: root.to_path_buf(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Register every script service in `config` with `engine`. A service
    /// whose command cannot be found is skipped with a warning so the rest of
    /// the engine still runs. Returns the number of registrations installed.
    pub fn install(engine: &GovernanceEngine, config: &Config, root: &Path) -> Result<usize> {
        let mut installed = 0;
        for definition in &config.services {
            let provider = match Self::from_definition(definition, root) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(service = %definition.name, error = %e, "script service skipped");
                    continue;
                }
            };
            engine.register_provider(std::sync::Arc::new(provider))?;
            for reg in &definition.registrations {
                let mut registration =
                    ServiceRegistration::new(engine.guid(), &definition.name, &reg.request_type);
                if let Some(rt) = &reg.service_request_type {
                    registration = registration.service_request_type(rt);
                }
                registration.request_parameters = reg.request_parameters.clone();
                registration.configuration_properties = definition.configuration_properties.clone();
                engine.register_service(registration)?;
                installed += 1;
            }
            debug!(service = %definition.name, role = %definition.role, "script service installed");
        }
        Ok(installed)
    }
}

impl ServiceProvider for ScriptServiceProvider {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn create_handler(&self, _registration: &ServiceRegistration) -> Result<GovernanceHandler> {
        let handler = Box::new(ScriptHandler {
            service: self.descriptor.name.clone(),
            program: self.program.clone(),
            args: self.args.clone(),
            root: self.root.clone(),
        });
        Ok(match self.descriptor.role {
            ServiceRole::Verification => GovernanceHandler::Verification(handler),
            ServiceRole::Triage => GovernanceHandler::Triage(handler),
            ServiceRole::Remediation => GovernanceHandler::Remediation(handler),
            ServiceRole::Provisioning => GovernanceHandler::Provisioning(handler),
            ServiceRole::Watchdog => {
                return Err(GovError::invalid(format!(
                    "service '{}': watchdog services cannot be scripts",
                    self.descriptor.name
                )))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

struct ScriptHandler {
    service: String,
    program: PathBuf,
    args: Vec<String>,
    root: PathBuf,
}

impl ScriptHandler {
    async fn invoke(&self, ctx: &ActionContext) -> HandlerResult<()> {
        let input = serde_json::to_vec(&ScriptRequest::from_context(ctx))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ROOT_ENV, &self.root)
            .env(ACTION_ENV, ctx.engine_action_guid())
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.cancelled() => {
                info!(engine_action = %ctx.engine_action_guid(), service = %self.service, "action cancelled; script stopped");
                return Ok(());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            if output.status.success() {
                return Ok(());
            }
            return Err(HandlerFailure::new(
                "ScriptExit",
                format!("{} exited with {}", self.service, output.status),
            ));
        }

        let completion: ScriptCompletion = serde_json::from_str(stdout)?;
        if !output.status.success() {
            debug!(service = %self.service, status = %output.status, "script exited non-zero with a completion");
        }
        ctx.record_completion(completion.into())?;
        Ok(())
    }
}

#[async_trait]
impl VerificationService for ScriptHandler {
    async fn start(&mut self, ctx: &VerificationContext) -> HandlerResult<()> {
        self.invoke(ctx).await
    }
}

#[async_trait]
impl TriageService for ScriptHandler {
    async fn start(&mut self, ctx: &TriageContext) -> HandlerResult<()> {
        self.invoke(ctx).await
    }
}

#[async_trait]
impl RemediationService for ScriptHandler {
    async fn start(&mut self, ctx: &RemediationContext) -> HandlerResult<()> {
        self.invoke(ctx).await
    }
}

#[async_trait]
impl ProvisioningService for ScriptHandler {
    async fn start(&mut self, ctx: &ProvisioningContext) -> HandlerResult<()> {
        self.invoke(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceDefinition;
    use tempfile::TempDir;

    fn definition(role: ServiceRole, command: &str) -> ServiceDefinition {
        ServiceDefinition {
            name: "check-owner".into(),
            role,
            description: String::new(),
            command: command.into(),
            args: Vec::new(),
            supported_request_parameters: Vec::new(),
            supported_action_targets: Vec::new(),
            produced_guards: Vec::new(),
            configuration_properties: BTreeMap::new(),
            registrations: Vec::new(),
        }
    }

    #[test]
    fn watchdog_scripts_rejected() {
        let dir = TempDir::new().unwrap();
        let err = ScriptServiceProvider::from_definition(
            &definition(ServiceRole::Watchdog, "sh"),
            dir.path(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("watchdog"));
    }

    #[test]
    fn relative_scripts_resolve_against_root() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("scripts/check.sh");
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        let provider = ScriptServiceProvider::from_definition(
            &definition(ServiceRole::Verification, "scripts/check.sh"),
            dir.path(),
        )
        .unwrap();
        assert_eq!(provider.program(), script.as_path());

        let missing = ScriptServiceProvider::from_definition(
            &definition(ServiceRole::Verification, "scripts/missing.sh"),
            dir.path(),
        );
        assert!(missing.is_err());
    }

    #[test]
    fn empty_command_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(resolve_program("  ", dir.path()).is_err());
    }

    #[test]
    fn completion_parses_with_defaults() {
        let parsed: ScriptCompletion =
            serde_json::from_str(r#"{"status":"actioned","guards":["PASS"]}"#).unwrap();
        let completion: Completion = parsed.into();
        assert_eq!(completion.status, CompletionStatus::Actioned);
        assert_eq!(completion.guards, vec!["PASS".to_string()]);
        assert!(completion.new_action_targets.is_empty());
        assert!(completion.message.is_none());
    }
}
