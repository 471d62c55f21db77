//! Engine action data model.
//!
//! An `EngineAction` is the persisted record of one invocation of a governance
//! action service: what was asked for, which elements it works on, where it is
//! in its lifecycle, and which guards it produced. The engine's dispatch loop
//! and completion path are the only writers while it is non-terminal.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GovError, Result};
use crate::types::{ActionTargetStatus, CompletionStatus, EngineActionStatus};

pub const DEFAULT_TARGET_NAME: &str = "actionTarget";

// ---------------------------------------------------------------------------
// ActionTarget
// ---------------------------------------------------------------------------

/// A metadata element bound to one engine action, with its own progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub guid: String,
    #[serde(default = "default_target_name")]
    pub name: String,
    pub status: ActionTargetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_message: Option<String>,
}

fn default_target_name() -> String {
    DEFAULT_TARGET_NAME.to_string()
}

impl ActionTarget {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            name: default_target_name(),
            status: ActionTargetStatus::Requested,
            start_date: None,
            completion_date: None,
            completion_message: None,
        }
    }

    pub fn set_status(&mut self, status: ActionTargetStatus, message: Option<String>) {
        let now = Utc::now();
        if status == ActionTargetStatus::InProgress && self.start_date.is_none() {
            self.start_date = Some(now);
        }
        if status.is_closed() {
            self.completion_date = Some(now);
        }
        if message.is_some() {
            self.completion_message = message;
        }
        self.status = status;
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// The completed action and guard that caused this action to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub action_guid: String,
    pub guard: String,
}

// ---------------------------------------------------------------------------
// NewEngineAction
// ---------------------------------------------------------------------------

/// Everything a caller supplies to initiate a governance action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEngineAction {
    pub qualified_name: String,
    #[serde(default)]
    pub domain_identifier: u32,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub request_source_guids: Vec<String>,
    #[serde(default)]
    pub action_target_guids: Vec<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    pub request_type: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
}

impl NewEngineAction {
    pub fn new(qualified_name: impl Into<String>, request_type: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            request_type: request_type.into(),
            ..Default::default()
        }
    }

    pub fn target(mut self, guid: impl Into<String>) -> Self {
        self.action_target_guids.push(guid.into());
        self
    }

    pub fn source(mut self, guid: impl Into<String>) -> Self {
        self.request_source_guids.push(guid.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_parameters.insert(key.into(), value.into());
        self
    }

    pub fn start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.qualified_name.trim().is_empty() {
            return Err(GovError::invalid("qualified name must not be empty"));
        }
        if self.request_type.trim().is_empty() {
            return Err(GovError::invalid("request type must not be empty"));
        }
        if let Some(blank) = self
            .action_target_guids
            .iter()
            .chain(&self.request_source_guids)
            .find(|g| g.trim().is_empty())
        {
            return Err(GovError::invalid(format!("blank element guid '{blank}'")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// What a handler reports when it finishes.
///
/// Starts from a bare status; guards, new action targets, new request
/// parameters and a message are optional additions to the same report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
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

impl Completion {
    pub fn new(status: CompletionStatus) -> Self {
        Self {
            status,
            guards: Vec::new(),
            new_action_targets: Vec::new(),
            new_request_parameters: BTreeMap::new(),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(CompletionStatus::Failed).message(message)
    }

    pub fn guard(mut self, guard: impl Into<String>) -> Self {
        self.guards.push(guard.into());
        self
    }

    pub fn guards<I, S>(mut self, guards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guards.extend(guards.into_iter().map(Into::into));
        self
    }

    pub fn new_target(mut self, guid: impl Into<String>) -> Self {
        self.new_action_targets.push(guid.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.new_request_parameters.insert(key.into(), value.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.guards.iter().any(|g| g.trim().is_empty()) {
            return Err(GovError::invalid("guards must not be blank"));
        }
        if self.new_action_targets.iter().any(|g| g.trim().is_empty()) {
            return Err(GovError::invalid("new action target guids must not be blank"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAction {
    pub guid: String,
    pub qualified_name: String,
    #[serde(default)]
    pub domain_identifier: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub request_type: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub request_source_guids: Vec<String>,
    #[serde(default)]
    pub action_targets: Vec<ActionTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<DateTime<Utc>>,
    pub status: EngineActionStatus,
    #[serde(default)]
    pub completion_guards: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_engine_guid: Option<String>,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<Trigger>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by the store on every successful update.
    #[serde(default)]
    pub version: u64,
}

impl EngineAction {
    /// Build a `Requested` action from a validated request.
    pub fn new(request: NewEngineAction, requested_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            guid: Uuid::new_v4().to_string(),
            qualified_name: request.qualified_name,
            domain_identifier: request.domain_identifier,
            display_name: request.display_name,
            description: request.description,
            request_type: request.request_type,
            request_parameters: request.request_parameters,
            request_source_guids: request.request_source_guids,
            action_targets: request
                .action_target_guids
                .into_iter()
                .map(ActionTarget::new)
                .collect(),
            scheduled_start: request.start_time,
            status: EngineActionStatus::Requested,
            completion_guards: BTreeSet::new(),
            completion_message: None,
            processing_engine_guid: None,
            requested_by: requested_by.into(),
            triggered_by: None,
            cancel_requested: false,
            start_time: None,
            completion_time: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start.map(|at| at <= now).unwrap_or(true)
    }

    pub fn target_guids(&self) -> Vec<String> {
        self.action_targets.iter().map(|t| t.guid.clone()).collect()
    }

    pub fn target_mut(&mut self, guid: &str) -> Option<&mut ActionTarget> {
        self.action_targets.iter_mut().find(|t| t.guid == guid)
    }

    /// Move to `to`, stamping the start and completion times.
    pub fn transition(&mut self, to: EngineActionStatus) -> Result<()> {
        self.status.check_transition(to)?;
        let now = Utc::now();
        if to == EngineActionStatus::InProgress {
            self.start_time = Some(now);
        }
        if to.is_terminal() {
            self.completion_time = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Apply a handler's completion report: terminal status, guards, message,
    /// and closure of every action target the handler left open.
    pub fn apply_completion(&mut self, completion: &Completion) -> Result<()> {
        completion.validate()?;
        self.transition(completion.status.action_status())?;
        self.completion_guards = completion.guards.iter().cloned().collect();
        self.completion_message = completion.message.clone();
        let target_status = completion.status.target_status();
        for target in self.action_targets.iter_mut().filter(|t| !t.status.is_closed()) {
            target.set_status(target_status, None);
        }
        Ok(())
    }

    /// Terminate as `Failed` with no guards.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.apply_completion(&Completion::failed(message))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
