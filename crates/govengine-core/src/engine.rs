//! The governance engine: accepts requests, dispatches them to handlers,
//! records their completion and launches whatever the process definition
//! says comes next.
//!
//! # Dispatch
//!
//! Each pass lists the dispatchable actions and, for each one that is due,
//! claims it with a conditional update to `Activating`. Losing that update to
//! another worker is normal: the loser logs it and walks away without touching
//! anything. The winner resolves the registered service, builds the role
//! context, moves the action to `InProgress` and spawns the handler.
//!
//! # Completion
//!
//! Handlers report through their context. The terminal status, guards and
//! message are persisted first; the children the process definition asks for
//! are created afterwards. A handler that returns without reporting fails the
//! action, unless the engine is shutting down, in which case the action stays
//! `InProgress` and is re-invoked by `recover` on the next start. A handler
//! that fails, during shutdown or not, always leaves its action `Failed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::action::{Completion, EngineAction, NewEngineAction, Trigger};
use crate::config::{ConfigWarning, EngineSettings};
use crate::context::{settle_state, ActionContext, InvocationState, StateSender};
use crate::error::{GovError, Result};
use crate::handler::GovernanceHandler;
use crate::metadata::{MetadataReader, OpenMetadataStore};
use crate::process::ProcessDefinition;
use crate::registry::{ServiceProvider, ServiceRegistration, ServiceRegistry};
use crate::store::EngineActionStore;
use crate::types::{ActionTargetStatus, EngineActionStatus, ServiceRole};

/// Conditional updates retried this many times before giving up.
const MAX_UPDATE_ATTEMPTS: usize = 8;

pub const NO_COMPLETION_MESSAGE: &str = "handler terminated without completion";

// ---------------------------------------------------------------------------
// Dispatch results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Handler spawned.
    Started,
    /// Not due yet; moved to (or left in) `Waiting`.
    Deferred,
    /// `Requested` while auto-approval is off.
    AwaitingApproval,
    /// Terminated as `Failed` before a handler ran.
    Failed,
    /// Another worker claimed it first.
    LostRace,
    /// Every concurrency slot is taken.
    Busy,
    /// Not ours to dispatch.
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub recovered: usize,
    pub started: usize,
    pub deferred: usize,
    pub awaiting_approval: usize,
    pub failed: usize,
    pub lost: usize,
    pub errors: usize,
    pub busy: bool,
}

impl DispatchReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Started => self.started += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
            DispatchOutcome::AwaitingApproval => self.awaiting_approval += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::LostRace => self.lost += 1,
            DispatchOutcome::Busy => self.busy = true,
            DispatchOutcome::Skipped => {}
        }
    }

    pub fn is_idle(&self) -> bool {
        self.recovered == 0
            && self.started == 0
            && self.failed == 0
            && self.lost == 0
            && self.errors == 0
            && !self.busy
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct Tracked {
    state: StateSender,
    role: Option<ServiceRole>,
}

/// State shared between the engine handle, its handler tasks and their
/// contexts.
pub(crate) struct Core {
    pub(crate) settings: EngineSettings,
    pub(crate) actions: Arc<dyn EngineActionStore>,
    pub(crate) store: Arc<dyn OpenMetadataStore>,
    pub(crate) reader: Arc<dyn MetadataReader>,
    pub(crate) registry: Arc<ServiceRegistry>,
    process: RwLock<ProcessDefinition>,
    running: Mutex<HashMap<String, Tracked>>,
    permits: Arc<Semaphore>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl Core {
    fn running(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self, guid: &str) -> bool {
        self.running().contains_key(guid)
    }

    /// Reserve `guid` for one invocation in this engine.
    fn track(&self, guid: &str) -> Option<StateSender> {
        let mut running = self.running();
        if running.contains_key(guid) {
            return None;
        }
        let (state, _) = watch::channel(InvocationState::Running);
        let state = Arc::new(state);
        running.insert(
            guid.to_string(),
            Tracked {
                state: Arc::clone(&state),
                role: None,
            },
        );
        Some(state)
    }

    fn set_role(&self, guid: &str, role: ServiceRole) {
        if let Some(tracked) = self.running().get_mut(guid) {
            tracked.role = Some(role);
        }
    }

    fn untrack(&self, guid: &str) {
        self.running().remove(guid);
    }

    fn signal(&self, guid: &str, next: InvocationState) {
        if let Some(tracked) = self.running().get(guid) {
            settle_state(&tracked.state, next);
        }
    }

    fn authorize(&self, user: &str, action: &str) -> Result<()> {
        if self.settings.is_authorized(user) {
            Ok(())
        } else {
            Err(GovError::NotAuthorized {
                user: user.to_string(),
                action: action.to_string(),
            })
        }
    }

    pub(crate) fn load(&self, guid: &str) -> Result<EngineAction> {
        self.actions
            .get(guid)?
            .ok_or_else(|| GovError::invalid(format!("unknown engine action {guid}")))
    }

    /// Read, change and conditionally write one action, retrying when another
    /// writer got there first.
    pub(crate) fn modify_action<F>(&self, guid: &str, mut change: F) -> Result<EngineAction>
    where
        F: FnMut(&mut EngineAction) -> Result<()>,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut action = self.load(guid)?;
            change(&mut action)?;
            match self.actions.update(&action) {
                Err(GovError::Conflict { .. }) => {
                    debug!(engine_action = %guid, "concurrent update; retrying");
                    continue;
                }
                other => return other,
            }
        }
        Err(GovError::property_server(format!(
            "engine action {guid} kept changing; gave up after {MAX_UPDATE_ATTEMPTS} attempts"
        )))
    }

    /// Persist a handler's completion, then launch the follow-on actions.
    pub(crate) fn complete(&self, guid: &str, completion: &Completion) -> Result<EngineAction> {
        let done = self.modify_action(guid, |action| {
            if action.is_terminal() {
                return Err(GovError::invalid(format!(
                    "engine action {} is already {}",
                    action.guid, action.status
                )));
            }
            action.apply_completion(completion)
        })?;
        info!(
            engine_action = %guid,
            status = %done.status,
            guards = ?completion.guards,
            "engine action completed"
        );
        let children = self.launch_children(&done, completion);
        if !children.is_empty() {
            self.wake.notify_one();
        }
        Ok(done)
    }

    /// Terminate as `Failed` unless something already terminated it.
    fn fail(&self, guid: &str, message: &str) -> Result<Option<EngineAction>> {
        if self.load(guid)?.is_terminal() {
            return Ok(None);
        }
        let failed = self.modify_action(guid, |action| {
            if action.is_terminal() {
                return Err(GovError::invalid(format!(
                    "engine action {} is already {}",
                    action.guid, action.status
                )));
            }
            action.fail(message)
        })?;
        warn!(engine_action = %guid, %message, "engine action failed");
        Ok(Some(failed))
    }

    /// Create one child per matching next action. Failures are logged; the
    /// parent's terminal state stands either way.
    fn launch_children(&self, parent: &EngineAction, completion: &Completion) -> Vec<String> {
        if parent.status == EngineActionStatus::Cancelled {
            return Vec::new();
        }
        let process = self.process.read().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let mut created = Vec::new();
        for (guard, next) in process.next_actions(&parent.request_type, &completion.guards) {
            let request = next.child_request(parent, completion, now);
            let mut child = EngineAction::new(request, parent.requested_by.clone());
            child.triggered_by = Some(Trigger {
                action_guid: parent.guid.clone(),
                guard: guard.to_string(),
            });
            if child.scheduled_start.is_some() {
                if let Err(e) = child.transition(EngineActionStatus::Waiting) {
                    error!(engine_action = %parent.guid, error = %e, "could not schedule child action");
                    continue;
                }
            }
            match self.actions.insert(&child) {
                Ok(()) => {
                    info!(
                        engine_action = %child.guid,
                        parent = %parent.guid,
                        guard = %guard,
                        request_type = %child.request_type,
                        "follow-on action created"
                    );
                    created.push(child.guid);
                }
                Err(e) => error!(
                    parent = %parent.guid,
                    guard = %guard,
                    request_type = %child.request_type,
                    error = %e,
                    "could not create follow-on action"
                ),
            }
        }
        if created.is_empty() && !completion.guards.is_empty() {
            debug!(engine_action = %parent.guid, "no process step matches; branch ends");
        }
        created
    }
}

// ---------------------------------------------------------------------------
// GovernanceEngine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct GovernanceEngine {
    core: Arc<Core>,
}

impl GovernanceEngine {
    pub fn new<R>(settings: EngineSettings, repository: Arc<R>) -> Self
    where
        R: EngineActionStore + OpenMetadataStore + 'static,
    {
        Self::with_registry(settings, repository, Arc::new(ServiceRegistry::new()))
    }

    pub fn with_registry<R>(
        settings: EngineSettings,
        repository: Arc<R>,
        registry: Arc<ServiceRegistry>,
    ) -> Self
    where
        R: EngineActionStore + OpenMetadataStore + 'static,
    {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_actions.max(1)));
        let (shutdown, _) = watch::channel(false);
        let actions: Arc<dyn EngineActionStore> = repository.clone();
        let store: Arc<dyn OpenMetadataStore> = repository.clone();
        let reader: Arc<dyn MetadataReader> = repository;
        Self {
            core: Arc::new(Core {
                settings,
                actions,
                store,
                reader,
                registry,
                process: RwLock::new(ProcessDefinition::default()),
                running: Mutex::new(HashMap::new()),
                permits,
                wake: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn guid(&self) -> &str {
        &self.core.settings.guid
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.core.settings
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.core.registry
    }

    pub fn register_provider(&self, provider: Arc<dyn ServiceProvider>) -> Result<()> {
        self.core.registry.add_provider(provider)
    }

    pub fn register_service(&self, registration: ServiceRegistration) -> Result<()> {
        self.core.registry.register(registration)
    }

    /// Replace the process definition. Returns (and logs) its warnings; a
    /// definition with warnings is still installed.
    pub fn set_process_definition(&self, process: ProcessDefinition) -> Result<Vec<ConfigWarning>> {
        let mut warnings = process.validate();
        warnings.extend(self.core.registry.validate_process(self.guid(), &process)?);
        for w in &warnings {
            warn!(process = %process.name, level = ?w.level, "{}", w.message);
        }
        info!(process = %process.name, steps = process.steps.len(), "process definition installed");
        *self
            .core
            .process
            .write()
            .unwrap_or_else(PoisonError::into_inner) = process;
        Ok(warnings)
    }

    pub fn process_definition(&self) -> ProcessDefinition {
        self.core
            .process
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -----------------------------------------------------------------------
    // Requests and administration
    // -----------------------------------------------------------------------

    /// Persist a new `Requested` action and return its guid. Never waits for
    /// the action to run.
    pub fn initiate_governance_action(&self, user: &str, request: NewEngineAction) -> Result<String> {
        self.core.authorize(user, "initiate governance actions")?;
        request.validate()?;
        let action = EngineAction::new(request, user);
        self.core.actions.insert(&action)?;
        info!(
            engine_action = %action.guid,
            qualified_name = %action.qualified_name,
            request_type = %action.request_type,
            "governance action initiated"
        );
        self.core.wake.notify_one();
        Ok(action.guid)
    }

    pub fn get_governance_action_status(&self, guid: &str) -> Result<EngineActionStatus> {
        Ok(self.core.load(guid)?.status)
    }

    pub fn get_engine_action(&self, guid: &str) -> Result<EngineAction> {
        self.core.load(guid)
    }

    /// Actions in any of `statuses`, oldest first. An empty filter lists all.
    pub fn list_engine_actions(&self, statuses: &[EngineActionStatus]) -> Result<Vec<EngineAction>> {
        if statuses.is_empty() {
            self.core.actions.list()
        } else {
            self.core.actions.list_by_status(statuses)
        }
    }

    pub fn approve_governance_action(&self, user: &str, guid: &str) -> Result<EngineAction> {
        self.core.authorize(user, "approve governance actions")?;
        let approved = self.core.modify_action(guid, |action| {
            if action.status != EngineActionStatus::Requested {
                return Err(GovError::invalid(format!(
                    "only requested actions can be approved; {} is {}",
                    action.guid, action.status
                )));
            }
            action.transition(EngineActionStatus::Approved)
        })?;
        info!(engine_action = %guid, %user, "governance action approved");
        self.core.wake.notify_one();
        Ok(approved)
    }

    /// Cancel a non-terminal action. The running handler, if any, is told
    /// through its context; it is not interrupted.
    pub fn cancel_governance_action(&self, user: &str, guid: &str) -> Result<EngineAction> {
        self.core.authorize(user, "cancel governance actions")?;
        let cancelled = self.core.modify_action(guid, |action| {
            if action.is_terminal() {
                return Err(GovError::invalid(format!(
                    "engine action {} is already {}",
                    action.guid, action.status
                )));
            }
            action.transition(EngineActionStatus::Cancelled)?;
            action.cancel_requested = true;
            action.completion_message = Some(format!("cancelled by {user}"));
            Ok(())
        })?;
        self.core.signal(guid, InvocationState::Cancelled);
        info!(engine_action = %guid, %user, "governance action cancelled");
        Ok(cancelled)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn candidates(&self) -> Result<Vec<EngineAction>> {
        let mut statuses = vec![
            EngineActionStatus::Approved,
            EngineActionStatus::Waiting,
            EngineActionStatus::Activating,
        ];
        if self.core.settings.auto_approve {
            statuses.push(EngineActionStatus::Requested);
        }
        Ok(self
            .core
            .actions
            .list_by_status(&statuses)?
            .into_iter()
            .filter(|a| {
                a.status != EngineActionStatus::Activating
                    || (a.processing_engine_guid.as_deref() == Some(self.guid())
                        && !self.core.is_running(&a.guid))
            })
            .collect())
    }

    /// One pass over every dispatchable action.
    pub fn dispatch_once(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        if self.is_shutting_down() {
            return Ok(report);
        }
        for action in self.candidates()? {
            let guid = action.guid.clone();
            match self.dispatch(action, now, false) {
                Ok(DispatchOutcome::Busy) => {
                    report.record(DispatchOutcome::Busy);
                    break;
                }
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!(engine_action = %guid, error = %e, "dispatch failed; will retry");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Dispatch one action from the snapshot the caller read. A stale snapshot
    /// loses the claim and returns `LostRace` without side effects.
    pub fn dispatch_action(&self, action: EngineAction, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        self.dispatch(action, now, false)
    }

    fn dispatch(
        &self,
        action: EngineAction,
        now: DateTime<Utc>,
        restart: bool,
    ) -> Result<DispatchOutcome> {
        let ours = action.processing_engine_guid.as_deref() == Some(self.guid());
        match action.status {
            s if s.is_terminal() => return Ok(DispatchOutcome::Skipped),
            EngineActionStatus::InProgress if !(restart && ours) => {
                return Ok(DispatchOutcome::Skipped)
            }
            EngineActionStatus::Activating if !ours => return Ok(DispatchOutcome::Skipped),
            EngineActionStatus::Requested if !self.core.settings.auto_approve => {
                return Ok(DispatchOutcome::AwaitingApproval)
            }
            _ => {}
        }

        if action.status.is_dispatchable() && !action.is_due(now) {
            if action.status != EngineActionStatus::Waiting {
                let mut waiting = action.clone();
                waiting.transition(EngineActionStatus::Waiting)?;
                match self.core.actions.update(&waiting) {
                    Err(GovError::Conflict { .. }) => return Ok(DispatchOutcome::LostRace),
                    Err(e) => return Err(e),
                    Ok(_) => debug!(engine_action = %action.guid, "not due yet; waiting"),
                }
            }
            return Ok(DispatchOutcome::Deferred);
        }

        let Ok(permit) = Arc::clone(&self.core.permits).try_acquire_owned() else {
            return Ok(DispatchOutcome::Busy);
        };
        let Some(state) = self.core.track(&action.guid) else {
            return Ok(DispatchOutcome::Skipped);
        };
        let guid = action.guid.clone();
        let outcome = self.launch(action, now, permit, state);
        if !matches!(outcome, Ok(DispatchOutcome::Started)) {
            self.core.untrack(&guid);
        }
        outcome
    }

    fn claim(&self, action: &EngineAction, now: DateTime<Utc>) -> Result<EngineAction> {
        let mut claimed = action.clone();
        if claimed.status != EngineActionStatus::InProgress {
            claimed.transition(EngineActionStatus::Activating)?;
        }
        claimed.processing_engine_guid = Some(self.guid().to_string());
        claimed.updated_at = now;
        self.core.actions.update(&claimed)
    }

    fn launch(
        &self,
        action: EngineAction,
        now: DateTime<Utc>,
        permit: OwnedSemaphorePermit,
        state: StateSender,
    ) -> Result<DispatchOutcome> {
        let claimed = match self.claim(&action, now) {
            Ok(claimed) => claimed,
            Err(GovError::Conflict { found, .. }) => {
                warn!(
                    engine_action = %action.guid,
                    version = action.version,
                    found,
                    "lost dispatch race; another worker claimed the action"
                );
                return Ok(DispatchOutcome::LostRace);
            }
            Err(e) => return Err(e),
        };

        let Some((registration, provider)) =
            self.core.registry.resolve(self.guid(), &claimed.request_type)?
        else {
            let message = format!(
                "no governance service registered for request type '{}'",
                claimed.request_type
            );
            self.core.fail(&claimed.guid, &message)?;
            return Ok(DispatchOutcome::Failed);
        };

        let handler = match provider.create_handler(&registration) {
            Ok(handler) => handler,
            Err(e) => {
                let message = format!(
                    "could not create handler for service '{}': {e}",
                    registration.service_name
                );
                self.core.fail(&claimed.guid, &message)?;
                return Ok(DispatchOutcome::Failed);
            }
        };
        let role = handler.role();
        self.core.set_role(&claimed.guid, role);

        let mut in_progress = claimed;
        in_progress.transition(EngineActionStatus::InProgress)?;
        for target in in_progress
            .action_targets
            .iter_mut()
            .filter(|t| t.status == ActionTargetStatus::Requested)
        {
            target.set_status(ActionTargetStatus::InProgress, None);
        }
        let in_progress = match self.core.actions.update(&in_progress) {
            Ok(updated) => updated,
            Err(GovError::Conflict { .. }) => return Ok(DispatchOutcome::LostRace),
            Err(e) => return Err(e),
        };

        info!(
            engine_action = %in_progress.guid,
            request_type = %in_progress.request_type,
            service = %registration.service_name,
            %role,
            "engine action in progress"
        );
        let ctx = ActionContext::new(Arc::clone(&self.core), &in_progress, registration, state);
        tokio::spawn(invoke(Arc::clone(&self.core), handler, ctx, permit));
        Ok(DispatchOutcome::Started)
    }

    /// Re-invoke every action this engine claimed but did not finish before
    /// it last stopped. Returns how many were restarted.
    pub fn recover(&self) -> Result<usize> {
        let stranded: Vec<EngineAction> = self
            .core
            .actions
            .list_by_status(&[EngineActionStatus::Activating, EngineActionStatus::InProgress])?
            .into_iter()
            .filter(|a| a.processing_engine_guid.as_deref() == Some(self.guid()))
            .filter(|a| !self.core.is_running(&a.guid))
            .collect();

        let now = Utc::now();
        let mut restarted = 0;
        for action in stranded {
            let guid = action.guid.clone();
            match self.dispatch(action, now, true) {
                Ok(DispatchOutcome::Started) => {
                    info!(engine_action = %guid, "engine action restarted");
                    restarted += 1;
                }
                Ok(DispatchOutcome::Busy) => break,
                Ok(_) => {}
                Err(e) => warn!(engine_action = %guid, error = %e, "could not restart engine action"),
            }
        }
        Ok(restarted)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Recover, then dispatch on every poll tick and whenever woken, until
    /// `shutdown` is called. Waits for running handlers before returning.
    pub async fn run(&self) -> Result<()> {
        let recovered = self.recover()?;
        info!(engine = %self.guid(), recovered, "governance engine started");

        let mut shutdown = self.core.shutdown.subscribe();
        let period = Duration::from_millis(self.core.settings.poll_interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                _ = tick.tick() => {}
                _ = self.core.wake.notified() => {}
            }
            match self.dispatch_once(Utc::now()) {
                Ok(report) if report.is_idle() => {}
                Ok(report) => debug!(?report, "dispatch pass"),
                Err(e) => warn!(error = %e, "dispatch pass failed"),
            }
        }

        info!(engine = %self.guid(), "governance engine stopping; waiting for running handlers");
        self.wait_idle().await;
        Ok(())
    }

    /// Recover and dispatch once, release watchdogs, and wait for every
    /// started handler to finish.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let recovered = self.recover()?;
        let mut report = self.dispatch_once(Utc::now())?;
        report.recovered = recovered;
        for tracked in self.core.running().values() {
            if tracked.role == Some(ServiceRole::Watchdog) {
                settle_state(&tracked.state, InvocationState::ShuttingDown);
            }
        }
        self.wait_idle().await;
        Ok(report)
    }

    /// Stop dispatching and release watchdogs. Their actions stay
    /// `InProgress` for the next `recover`.
    pub fn shutdown(&self) {
        self.core.shutdown.send_replace(true);
        for tracked in self.core.running().values() {
            settle_state(&tracked.state, InvocationState::ShuttingDown);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.core.shutdown.borrow()
    }

    /// Wait until no handler is running.
    pub async fn wait_idle(&self) {
        let all = self.core.settings.max_concurrent_actions.max(1) as u32;
        if let Ok(permits) = self.core.permits.acquire_many(all).await {
            drop(permits);
        }
    }

    /// Handlers running in this engine right now.
    pub fn running_actions(&self) -> Vec<String> {
        let mut guids: Vec<String> = self.core.running().keys().cloned().collect();
        guids.sort();
        guids
    }
}

// ---------------------------------------------------------------------------
// Handler task
// ---------------------------------------------------------------------------

/// A handler task that panicked or was aborted, as a handler failure raised
/// from `method`.
pub(crate) fn panic_failure(join: JoinError, method: &str) -> GovError {
    let message = if join.is_panic() {
        let payload = join.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string())
    } else {
        "handler task was aborted".to_string()
    };
    GovError::UnexpectedHandlerFailure {
        error_type: "panic".to_string(),
        message,
        method: method.to_string(),
    }
}

async fn invoke(
    core: Arc<Core>,
    handler: GovernanceHandler,
    ctx: ActionContext,
    _permit: OwnedSemaphorePermit,
) {
    let guid = ctx.engine_action_guid().to_string();
    let outcome = match tokio::spawn(handler.run(ctx.clone())).await {
        Ok(result) => result,
        Err(join) => Err(panic_failure(join, "start")),
    };

    match ctx.state() {
        InvocationState::Completed => {
            if let Err(e) = outcome {
                warn!(engine_action = %guid, error = %e, "handler failed after recording completion");
            }
        }
        InvocationState::Cancelled => {
            debug!(engine_action = %guid, "cancelled handler finished");
        }
        InvocationState::ShuttingDown => match &outcome {
            Ok(()) => {
                info!(engine_action = %guid, "engine shutting down; action left in progress for restart");
            }
            // Handler failures are terminal even while stopping; restart only
            // re-invokes handlers that were released cleanly.
            Err(e) => {
                if let Err(fail_err) = core.fail(&guid, &e.to_string()) {
                    error!(engine_action = %guid, error = %fail_err, "could not record handler failure");
                }
            }
        },
        InvocationState::Running => {
            let message = match &outcome {
                Err(e) => e.to_string(),
                Ok(()) => NO_COMPLETION_MESSAGE.to_string(),
            };
            if let Err(e) = core.fail(&guid, &message) {
                error!(engine_action = %guid, error = %e, "could not record handler failure");
            }
            core.signal(&guid, InvocationState::Completed);
        }
    }

    core.untrack(&guid);
    core.wake.notify_one();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn engine() -> GovernanceEngine {
        GovernanceEngine::new(
            EngineSettings::new("engine-1"),
            Arc::new(MemoryRepository::new()),
        )
    }

    #[test]
    fn report_counts_outcomes() {
        let mut report = DispatchReport::default();
        assert!(report.is_idle());
        report.record(DispatchOutcome::Deferred);
        report.record(DispatchOutcome::AwaitingApproval);
        report.record(DispatchOutcome::Skipped);
        assert!(report.is_idle());
        report.record(DispatchOutcome::Started);
        report.record(DispatchOutcome::Busy);
        assert_eq!(report.started, 1);
        assert!(report.busy);
        assert!(!report.is_idle());
    }

    #[test]
    fn modify_action_rejects_unknown_guids() {
        let engine = engine();
        let err = engine.core.modify_action("missing", |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
    }

    #[test]
    fn terminal_actions_are_skipped() {
        let engine = engine();
        let guid = engine
            .initiate_governance_action("alice", NewEngineAction::new("q1", "scan-asset"))
            .unwrap();
        let cancelled = engine.cancel_governance_action("alice", &guid).unwrap();
        assert_eq!(
            engine.dispatch_action(cancelled, Utc::now()).unwrap(),
            DispatchOutcome::Skipped
        );
        assert!(engine.dispatch_once(Utc::now()).unwrap().is_idle());
    }

    #[test]
    fn other_engines_claims_are_left_alone() {
        let engine = engine();
        let guid = engine
            .initiate_governance_action("alice", NewEngineAction::new("q1", "scan-asset"))
            .unwrap();
        let claimed = engine
            .core
            .modify_action(&guid, |a| {
                a.transition(EngineActionStatus::Activating)?;
                a.processing_engine_guid = Some("engine-2".into());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            engine.dispatch_action(claimed, Utc::now()).unwrap(),
            DispatchOutcome::Skipped
        );
        assert_eq!(engine.recover().unwrap(), 0);
    }

    #[test]
    fn shutdown_stops_dispatch() {
        let engine = engine();
        engine
            .initiate_governance_action("alice", NewEngineAction::new("q1", "scan-asset"))
            .unwrap();
        engine.shutdown();
        assert!(engine.is_shutting_down());
        assert!(engine.dispatch_once(Utc::now()).unwrap().is_idle());
    }
}
