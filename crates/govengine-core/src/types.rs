//! Status and role enums shared by actions, targets and handlers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GovError, Result};

// ---------------------------------------------------------------------------
// EngineActionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an engine action.
///
/// Transitions: `Requested → Approved → Waiting → Activating → InProgress →
/// Actioned | Invalid | Ignored | Failed`, with `Approved` and `Waiting`
/// optional and `Cancelled` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineActionStatus {
    Requested,
    Approved,
    Waiting,
    Activating,
    InProgress,
    Actioned,
    Invalid,
    Ignored,
    Failed,
    Cancelled,
}

impl EngineActionStatus {
    pub fn all() -> &'static [EngineActionStatus] {
        &[
            EngineActionStatus::Requested,
            EngineActionStatus::Approved,
            EngineActionStatus::Waiting,
            EngineActionStatus::Activating,
            EngineActionStatus::InProgress,
            EngineActionStatus::Actioned,
            EngineActionStatus::Invalid,
            EngineActionStatus::Ignored,
            EngineActionStatus::Failed,
            EngineActionStatus::Cancelled,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineActionStatus::Requested => "requested",
            EngineActionStatus::Approved => "approved",
            EngineActionStatus::Waiting => "waiting",
            EngineActionStatus::Activating => "activating",
            EngineActionStatus::InProgress => "in_progress",
            EngineActionStatus::Actioned => "actioned",
            EngineActionStatus::Invalid => "invalid",
            EngineActionStatus::Ignored => "ignored",
            EngineActionStatus::Failed => "failed",
            EngineActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineActionStatus::Actioned
                | EngineActionStatus::Invalid
                | EngineActionStatus::Ignored
                | EngineActionStatus::Failed
                | EngineActionStatus::Cancelled
        )
    }

    /// States the dispatch loop may pick up.
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            EngineActionStatus::Requested
                | EngineActionStatus::Approved
                | EngineActionStatus::Waiting
        )
    }

    /// Check that moving from `self` to `to` respects the state machine.
    ///
    /// `Activating → Activating` and `InProgress → InProgress` are the restart
    /// claims taken by recovery; no other self-transition is allowed.
    pub fn check_transition(self, to: EngineActionStatus) -> Result<()> {
        use EngineActionStatus::*;

        let reject = |reason: &str| {
            Err(GovError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.is_terminal() {
            return reject("terminal engine actions are immutable");
        }

        let allowed = match to {
            Requested => false,
            Approved => self == Requested,
            Waiting => matches!(self, Requested | Approved),
            Activating => matches!(self, Requested | Approved | Waiting | Activating),
            InProgress => matches!(self, Activating | InProgress),
            Actioned | Invalid | Ignored => self == InProgress,
            Failed => matches!(self, Activating | InProgress),
            Cancelled => true,
        };

        if allowed {
            Ok(())
        } else {
            reject("transitions are forward-only")
        }
    }
}

impl fmt::Display for EngineActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineActionStatus {
    type Err = GovError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EngineActionStatus::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s || (s == "in-progress" && *st == EngineActionStatus::InProgress))
            .ok_or_else(|| GovError::invalid(format!("unknown engine action status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// CompletionStatus
// ---------------------------------------------------------------------------

/// The outcome a handler declares when it records completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Actioned,
    Invalid,
    Ignored,
    Failed,
}

impl CompletionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::Actioned => "actioned",
            CompletionStatus::Invalid => "invalid",
            CompletionStatus::Ignored => "ignored",
            CompletionStatus::Failed => "failed",
        }
    }

    pub fn action_status(self) -> EngineActionStatus {
        match self {
            CompletionStatus::Actioned => EngineActionStatus::Actioned,
            CompletionStatus::Invalid => EngineActionStatus::Invalid,
            CompletionStatus::Ignored => EngineActionStatus::Ignored,
            CompletionStatus::Failed => EngineActionStatus::Failed,
        }
    }

    pub fn target_status(self) -> ActionTargetStatus {
        match self {
            CompletionStatus::Actioned => ActionTargetStatus::Actioned,
            CompletionStatus::Invalid => ActionTargetStatus::Invalid,
            CompletionStatus::Ignored => ActionTargetStatus::Ignored,
            CompletionStatus::Failed => ActionTargetStatus::Failed,
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompletionStatus {
    type Err = GovError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "actioned" => Ok(CompletionStatus::Actioned),
            "invalid" => Ok(CompletionStatus::Invalid),
            "ignored" => Ok(CompletionStatus::Ignored),
            "failed" => Ok(CompletionStatus::Failed),
            _ => Err(GovError::invalid(format!("unknown completion status '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionTargetStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTargetStatus {
    Requested,
    InProgress,
    Actioned,
    Invalid,
    Ignored,
    Failed,
}

impl ActionTargetStatus {
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            ActionTargetStatus::Actioned
                | ActionTargetStatus::Invalid
                | ActionTargetStatus::Ignored
                | ActionTargetStatus::Failed
        )
    }
}

impl fmt::Display for ActionTargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionTargetStatus::Requested => "requested",
            ActionTargetStatus::InProgress => "in_progress",
            ActionTargetStatus::Actioned => "actioned",
            ActionTargetStatus::Invalid => "invalid",
            ActionTargetStatus::Ignored => "ignored",
            ActionTargetStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ServiceRole
// ---------------------------------------------------------------------------

/// The five behavioral contracts a governance action service can fulfil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Watchdog,
    Verification,
    Triage,
    Remediation,
    Provisioning,
}

impl ServiceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Watchdog => "watchdog",
            ServiceRole::Verification => "verification",
            ServiceRole::Triage => "triage",
            ServiceRole::Remediation => "remediation",
            ServiceRole::Provisioning => "provisioning",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceRole {
    type Err = GovError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "watchdog" => Ok(ServiceRole::Watchdog),
            "verification" => Ok(ServiceRole::Verification),
            "triage" => Ok(ServiceRole::Triage),
            "remediation" => Ok(ServiceRole::Remediation),
            "provisioning" => Ok(ServiceRole::Provisioning),
            _ => Err(GovError::invalid(format!("unknown service role '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
