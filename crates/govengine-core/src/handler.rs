//! The five governance action service roles.
//!
//! A handler is one of five role traits wrapped in `GovernanceHandler`; the
//! engine picks the context to build and the lifecycle to run from the
//! variant. Every role shares the same shape: `start` with the context for
//! this invocation, then `disconnect`. Completion is reported through the
//! context, not through the return value.

use std::any::type_name;
use std::fmt;

use async_trait::async_trait;

use crate::context::{
    ActionContext, ProvisioningContext, RemediationContext, TriageContext, VerificationContext,
    WatchdogContext,
};
use crate::error::{GovError, Result};
use crate::types::ServiceRole;

// ---------------------------------------------------------------------------
// HandlerFailure
// ---------------------------------------------------------------------------

/// An error raised inside handler code.
///
/// Any `std::error::Error` converts into it with `?`, keeping the concrete
/// type name so the failed engine action records what actually went wrong.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub error_type: String,
    pub message: String,
}

pub type HandlerResult<T> = std::result::Result<T, HandlerFailure>;

impl HandlerFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// A failure with no underlying error value.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("HandlerFailure", message)
    }

    pub(crate) fn into_error(self, method: &str) -> GovError {
        GovError::UnexpectedHandlerFailure {
            error_type: self.error_type,
            message: self.message,
            method: method.to_string(),
        }
    }
}

impl<E> From<E> for HandlerFailure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::new(type_name::<E>(), e.to_string())
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

// ---------------------------------------------------------------------------
// Role traits
// ---------------------------------------------------------------------------

/// Listens to metadata changes. `start` usually registers one or more
/// listeners and returns; the invocation stays open until a listener records
/// completion, the action is cancelled or the engine shuts down.
#[async_trait]
pub trait WatchdogService: Send {
    async fn start(&mut self, ctx: &WatchdogContext) -> HandlerResult<()>;

    async fn disconnect(&mut self) -> HandlerResult<()> {
        Ok(())
    }
}

/// Read-only checks that report pass/fail style guards.
#[async_trait]
pub trait VerificationService: Send {
    async fn start(&mut self, ctx: &VerificationContext) -> HandlerResult<()>;

    async fn disconnect(&mut self) -> HandlerResult<()> {
        Ok(())
    }
}

/// Opens to-dos for people, or resolves immediately.
#[async_trait]
pub trait TriageService: Send {
    async fn start(&mut self, ctx: &TriageContext) -> HandlerResult<()>;

    async fn disconnect(&mut self) -> HandlerResult<()> {
        Ok(())
    }
}

/// Changes metadata, limited to the bound action targets.
#[async_trait]
pub trait RemediationService: Send {
    async fn start(&mut self, ctx: &RemediationContext) -> HandlerResult<()>;

    async fn disconnect(&mut self) -> HandlerResult<()> {
        Ok(())
    }
}

/// Creates metadata and lineage from request sources to action targets.
#[async_trait]
pub trait ProvisioningService: Send {
    async fn start(&mut self, ctx: &ProvisioningContext) -> HandlerResult<()>;

    async fn disconnect(&mut self) -> HandlerResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GovernanceHandler
// ---------------------------------------------------------------------------

pub enum GovernanceHandler {
    Watchdog(Box<dyn WatchdogService>),
    Verification(Box<dyn VerificationService>),
    Triage(Box<dyn TriageService>),
    Remediation(Box<dyn RemediationService>),
    Provisioning(Box<dyn ProvisioningService>),
}

impl fmt::Debug for GovernanceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GovernanceHandler::{}", self.role())
    }
}

/// Start errors win over disconnect errors.
fn settle(started: HandlerResult<()>, disconnected: HandlerResult<()>) -> Result<()> {
    started.map_err(|f| f.into_error("start"))?;
    disconnected.map_err(|f| f.into_error("disconnect"))
}

impl GovernanceHandler {
    pub fn role(&self) -> ServiceRole {
        match self {
            GovernanceHandler::Watchdog(_) => ServiceRole::Watchdog,
            GovernanceHandler::Verification(_) => ServiceRole::Verification,
            GovernanceHandler::Triage(_) => ServiceRole::Triage,
            GovernanceHandler::Remediation(_) => ServiceRole::Remediation,
            GovernanceHandler::Provisioning(_) => ServiceRole::Provisioning,
        }
    }

    /// Run one invocation: build the role context, start, wait for a
    /// watchdog to settle, disconnect.
    pub(crate) async fn run(self, ctx: ActionContext) -> Result<()> {
        match self {
            GovernanceHandler::Watchdog(mut handler) => {
                let ctx = WatchdogContext::new(ctx);
                let started = handler.start(&ctx).await;
                if started.is_ok() {
                    ctx.settle().await;
                }
                ctx.stop_listeners();
                let disconnected = handler.disconnect().await;
                if let Some(failure) = ctx.take_listener_failure() {
                    return Err(failure);
                }
                settle(started, disconnected)
            }
            GovernanceHandler::Verification(mut handler) => {
                let ctx = VerificationContext::new(ctx);
                let started = handler.start(&ctx).await;
                let disconnected = handler.disconnect().await;
                settle(started, disconnected)
            }
            GovernanceHandler::Triage(mut handler) => {
                let ctx = TriageContext::new(ctx);
                let started = handler.start(&ctx).await;
                let disconnected = handler.disconnect().await;
                settle(started, disconnected)
            }
            GovernanceHandler::Remediation(mut handler) => {
                let ctx = RemediationContext::new(ctx);
                let started = handler.start(&ctx).await;
                let disconnected = handler.disconnect().await;
                settle(started, disconnected)
            }
            GovernanceHandler::Provisioning(mut handler) => {
                let ctx = ProvisioningContext::new(ctx);
                let started = handler.start(&ctx).await;
                let disconnected = handler.disconnect().await;
                settle(started, disconnected)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_depth(raw: &str) -> HandlerResult<u32> {
        Ok(raw.parse::<u32>()?)
    }

    #[test]
    fn std_errors_convert_with_type_name() {
        let failure = parse_depth("deep").unwrap_err();
        assert!(failure.error_type.contains("ParseIntError"));
        assert!(failure.message.contains("invalid digit"));
    }

    #[test]
    fn gov_errors_convert_too() {
        fn inner() -> HandlerResult<()> {
            let lookup: Result<()> = Err(GovError::invalid("no such element"));
            lookup?;
            Ok(())
        }
        let failure = inner().unwrap_err();
        assert!(failure.error_type.ends_with("GovError"));
        assert_eq!(failure.message, "invalid parameter: no such element");
    }

    #[test]
    fn into_error_names_the_method() {
        let err = HandlerFailure::msg("boom").into_error("start");
        assert_eq!(err.to_string(), "start failed with HandlerFailure: boom");
        assert_eq!(err.kind(), crate::error::ErrorKind::UnexpectedHandlerFailure);
    }

    #[test]
    fn start_error_takes_precedence() {
        let err = settle(
            Err(HandlerFailure::msg("first")),
            Err(HandlerFailure::msg("second")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("first"));
        let err = settle(Ok(()), Err(HandlerFailure::msg("second"))).unwrap_err();
        assert!(err.to_string().starts_with("disconnect"));
        assert!(settle(Ok(()), Ok(())).is_ok());
    }
}
