//! Per-invocation contexts handed to governance action services.
//!
//! `ActionContext` is the capability set every role shares. The role contexts
//! wrap it and deref to it, adding only what that role may do. A context is
//! built by the engine for exactly one invocation and is never re-pointed at
//! another action.

use std::collections::{BTreeMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::action::{Completion, EngineAction};
use crate::engine::Core;
use crate::error::{GovError, Result};
use crate::metadata::{MetadataElement, MetadataReader, PropertyBag, PropertyValue};
use crate::registry::ServiceRegistration;
use crate::types::{ActionTargetStatus, CompletionStatus};
use crate::watchdog::{ListenerId, ListenerSet, WatchdogListener};

pub const INCIDENT_REPORT_TYPE: &str = "IncidentReport";
pub const IMPACTED_RESOURCE_TYPE: &str = "ImpactedResource";
pub const TODO_TYPE: &str = "ToDo";
pub const ACTION_ASSIGNMENT_TYPE: &str = "ActionAssignment";

// ---------------------------------------------------------------------------
// InvocationState
// ---------------------------------------------------------------------------

/// Where one running invocation stands, as seen by its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvocationState {
    Running,
    Completed,
    Cancelled,
    ShuttingDown,
}

pub(crate) type StateSender = Arc<watch::Sender<InvocationState>>;

/// Move out of `Running`. Later signals are ignored.
pub(crate) fn settle_state(state: &watch::Sender<InvocationState>, next: InvocationState) -> bool {
    state.send_if_modified(|current| {
        if *current == InvocationState::Running {
            *current = next;
            true
        } else {
            false
        }
    })
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentReport {
    /// Defaults to `IncidentReport::<uuid>`.
    #[serde(default)]
    pub qualified_name: Option<String>,
    pub background: String,
    /// Ordinal on an engine-defined scale.
    #[serde(default)]
    pub severity: u32,
    #[serde(default)]
    pub impacted_resources: Vec<String>,
    #[serde(default)]
    pub properties: PropertyBag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToDo {
    #[serde(default)]
    pub qualified_name: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// Guid of the element representing the responsible party.
    pub assigned_to: String,
}

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ActionContext {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<Core>,
    engine_action_guid: String,
    request_type: String,
    request_parameters: BTreeMap<String, String>,
    requester: String,
    request_source_guids: Vec<String>,
    action_target_guids: Vec<String>,
    registration: ServiceRegistration,
    completed: AtomicBool,
    state: StateSender,
}

impl ActionContext {
    pub(crate) fn new(
        core: Arc<Core>,
        action: &EngineAction,
        registration: ServiceRegistration,
        state: StateSender,
    ) -> Self {
        let mut request_parameters = registration.request_parameters.clone();
        request_parameters.extend(
            action
                .request_parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Self {
            inner: Arc::new(Inner {
                core,
                engine_action_guid: action.guid.clone(),
                request_type: registration.effective_request_type().to_string(),
                request_parameters,
                requester: action.requested_by.clone(),
                request_source_guids: action.request_source_guids.clone(),
                action_target_guids: action.target_guids(),
                registration,
                completed: AtomicBool::new(false),
                state,
            }),
        }
    }

    pub fn engine_action_guid(&self) -> &str {
        &self.inner.engine_action_guid
    }

    pub fn engine_guid(&self) -> &str {
        &self.inner.core.settings.guid
    }

    pub fn request_type(&self) -> &str {
        &self.inner.request_type
    }

    /// Registration parameters overlaid with the action's own.
    pub fn request_parameters(&self) -> &BTreeMap<String, String> {
        &self.inner.request_parameters
    }

    pub fn request_parameter(&self, name: &str) -> Option<&str> {
        self.inner.request_parameters.get(name).map(String::as_str)
    }

    pub fn requester_user_id(&self) -> &str {
        &self.inner.requester
    }

    pub fn request_source_guids(&self) -> &[String] {
        &self.inner.request_source_guids
    }

    pub fn action_target_guids(&self) -> &[String] {
        &self.inner.action_target_guids
    }

    pub fn is_action_target(&self, guid: &str) -> bool {
        self.inner.action_target_guids.iter().any(|g| g == guid)
    }

    pub fn is_request_source(&self, guid: &str) -> bool {
        self.inner.request_source_guids.iter().any(|g| g == guid)
    }

    pub fn registration(&self) -> &ServiceRegistration {
        &self.inner.registration
    }

    /// Read-only view of the metadata store.
    pub fn metadata(&self) -> &dyn MetadataReader {
        self.inner.core.reader.as_ref()
    }

    pub fn request_source_elements(&self) -> Result<Vec<MetadataElement>> {
        self.load_elements(&self.inner.request_source_guids)
    }

    pub fn action_target_elements(&self) -> Result<Vec<MetadataElement>> {
        self.load_elements(&self.inner.action_target_guids)
    }

    fn load_elements(&self, guids: &[String]) -> Result<Vec<MetadataElement>> {
        guids
            .iter()
            .map(|guid| self.metadata().get_element(&self.inner.requester, guid))
            .collect()
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    pub(crate) fn state(&self) -> InvocationState {
        *self.inner.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<InvocationState> {
        self.inner.state.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            InvocationState::Running => Ok(()),
            other => Err(GovError::invalid(format!(
                "engine action {} is no longer running ({other:?})",
                self.inner.engine_action_guid
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Progress reporting
    // -----------------------------------------------------------------------

    /// Record progress on one bound action target.
    pub fn update_action_target_status(
        &self,
        target_guid: &str,
        status: ActionTargetStatus,
        message: Option<String>,
    ) -> Result<()> {
        let guid = &self.inner.engine_action_guid;
        self.inner.core.modify_action(guid, |action| {
            let target = action.target_mut(target_guid).ok_or_else(|| {
                GovError::invalid(format!(
                    "element {target_guid} is not an action target of engine action {guid}"
                ))
            })?;
            target.set_status(status, message.clone());
            action.updated_at = Utc::now();
            Ok(())
        })?;
        debug!(engine_action = %guid, target = %target_guid, %status, "action target updated");
        Ok(())
    }

    /// Create an `IncidentReport` element linked to each impacted resource.
    pub fn create_incident_report(&self, report: IncidentReport) -> Result<String> {
        if report.background.trim().is_empty() {
            return Err(GovError::invalid("incident report background must not be empty"));
        }
        let store = &self.inner.core.store;
        let user = &self.inner.requester;
        let qualified_name = report
            .qualified_name
            .unwrap_or_else(|| format!("{INCIDENT_REPORT_TYPE}::{}", Uuid::new_v4()));

        let mut properties = report.properties;
        properties.insert("qualifiedName".into(), qualified_name.into());
        properties.insert("background".into(), report.background.into());
        properties.insert("severity".into(), report.severity.into());
        properties.insert(
            "engineActionGUID".into(),
            self.inner.engine_action_guid.clone().into(),
        );

        let report_guid = store.create_element(user, INCIDENT_REPORT_TYPE, properties)?;
        for resource in &report.impacted_resources {
            store.create_relationship(
                user,
                IMPACTED_RESOURCE_TYPE,
                &report_guid,
                resource,
                PropertyBag::new(),
            )?;
        }
        info!(
            engine_action = %self.inner.engine_action_guid,
            report = %report_guid,
            "incident report raised"
        );
        Ok(report_guid)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Report the outcome of this invocation. Accepted once; every later call
    /// fails with `InvalidParameter` and changes nothing.
    pub fn record_completion(&self, completion: Completion) -> Result<()> {
        completion.validate()?;
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            return Err(GovError::invalid(format!(
                "completion already recorded for engine action {}",
                self.inner.engine_action_guid
            )));
        }
        match self
            .inner
            .core
            .complete(&self.inner.engine_action_guid, &completion)
        {
            Ok(_) => {
                settle_state(&self.inner.state, InvocationState::Completed);
                Ok(())
            }
            Err(e) => {
                if e.is_retryable() {
                    self.inner.completed.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    pub fn record_completion_status<I, S>(&self, status: CompletionStatus, guards: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record_completion(Completion::new(status).guards(guards))
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    pub fn is_cancel_requested(&self) -> bool {
        self.state() == InvocationState::Cancelled
    }

    /// Resolves once an administrator cancels this action. Never resolves
    /// otherwise, so use it inside `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut state = self.watch_state();
        let _ = state
            .wait_for(|s| *s == InvocationState::Cancelled)
            .await;
    }

    // -----------------------------------------------------------------------
    // Registration management
    // -----------------------------------------------------------------------

    pub fn register_service(&self, registration: ServiceRegistration) -> Result<()> {
        self.inner.core.registry.register(registration)
    }

    pub fn unregister_service(
        &self,
        engine_guid: &str,
        request_type: &str,
    ) -> Result<ServiceRegistration> {
        self.inner.core.registry.unregister(engine_guid, request_type)
    }

    pub fn service_registrations(&self, engine_guid: &str) -> Result<Vec<ServiceRegistration>> {
        self.inner.core.registry.registrations(engine_guid)
    }
}

// ---------------------------------------------------------------------------
// WatchdogContext
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WatchdogContext {
    base: ActionContext,
    listeners: Arc<ListenerSet>,
}

impl Deref for WatchdogContext {
    type Target = ActionContext;

    fn deref(&self) -> &ActionContext {
        &self.base
    }
}

impl WatchdogContext {
    pub(crate) fn new(base: ActionContext) -> Self {
        let capacity = base.core().settings.listener_queue_capacity;
        Self {
            base,
            listeners: Arc::new(ListenerSet::new(capacity)),
        }
    }

    /// Subscribe `listener` to the change events `filter` selects.
    pub fn register_listener(
        &self,
        filter: crate::metadata::EventFilter,
        listener: Box<dyn WatchdogListener>,
    ) -> Result<ListenerId> {
        self.base.ensure_running()?;
        let events = self.base.core().store.subscribe();
        let id = self.listeners.spawn(events, filter, listener, self.clone());
        info!(engine_action = %self.engine_action_guid(), listener = %id, "listener registered");
        Ok(id)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> Result<()> {
        if !self.listeners.remove(id) {
            return Err(GovError::invalid(format!("unknown listener {id}")));
        }
        info!(engine_action = %self.engine_action_guid(), listener = %id, "listener unregistered");
        Ok(())
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners.active()
    }

    /// Wait until the invocation leaves `Running` or has no listeners left.
    pub(crate) async fn settle(&self) {
        let mut state = self.base.watch_state();
        let mut count = self.listeners.watch_count();
        tokio::select! {
            _ = async { let _ = state.wait_for(|s| *s != InvocationState::Running).await; } => {}
            _ = async { let _ = count.wait_for(|n| *n == 0).await; } => {}
        }
    }

    pub(crate) fn stop_listeners(&self) {
        self.listeners.stop_all();
    }

    /// The panic that stopped a listener, if one did.
    pub(crate) fn take_listener_failure(&self) -> Option<GovError> {
        self.listeners.take_failure()
    }
}

// ---------------------------------------------------------------------------
// VerificationContext / TriageContext
// ---------------------------------------------------------------------------

/// Verification handlers only read: the shared capability set and nothing else.
#[derive(Clone)]
pub struct VerificationContext {
    base: ActionContext,
}

impl VerificationContext {
    pub(crate) fn new(base: ActionContext) -> Self {
        Self { base }
    }
}

impl Deref for VerificationContext {
    type Target = ActionContext;

    fn deref(&self) -> &ActionContext {
        &self.base
    }
}

#[derive(Clone)]
pub struct TriageContext {
    base: ActionContext,
}

impl Deref for TriageContext {
    type Target = ActionContext;

    fn deref(&self) -> &ActionContext {
        &self.base
    }
}

impl TriageContext {
    pub(crate) fn new(base: ActionContext) -> Self {
        Self { base }
    }

    /// Create a `ToDo` element assigned to `todo.assigned_to`. Returns its guid.
    pub fn open_to_do(&self, todo: ToDo) -> Result<String> {
        if todo.title.trim().is_empty() {
            return Err(GovError::invalid("to-do title must not be empty"));
        }
        if todo.assigned_to.trim().is_empty() {
            return Err(GovError::invalid("to-do must be assigned to someone"));
        }
        let store = &self.core().store;
        let user = self.requester_user_id();
        let qualified_name = todo
            .qualified_name
            .unwrap_or_else(|| format!("{TODO_TYPE}::{}", Uuid::new_v4()));

        let mut properties = PropertyBag::new();
        properties.insert("qualifiedName".into(), qualified_name.into());
        properties.insert("name".into(), todo.title.into());
        if let Some(description) = todo.description {
            properties.insert("description".into(), description.into());
        }
        properties.insert("priority".into(), todo.priority.into());
        if let Some(due) = todo.due_date {
            properties.insert("dueDate".into(), PropertyValue::String(due.to_rfc3339()));
        }
        properties.insert("status".into(), "Open".into());
        properties.insert(
            "engineActionGUID".into(),
            self.engine_action_guid().to_string().into(),
        );

        let todo_guid = store.create_element(user, TODO_TYPE, properties)?;
        store.create_relationship(
            user,
            ACTION_ASSIGNMENT_TYPE,
            &todo.assigned_to,
            &todo_guid,
            PropertyBag::new(),
        )?;
        info!(
            engine_action = %self.engine_action_guid(),
            todo = %todo_guid,
            assigned_to = %todo.assigned_to,
            "to-do opened"
        );
        Ok(todo_guid)
    }
}

// ---------------------------------------------------------------------------
// RemediationContext
// ---------------------------------------------------------------------------

/// Mutations limited to the bound action targets and to elements this
/// invocation created. Anything else fails with `InvalidParameter` before the
/// store is touched.
#[derive(Clone)]
pub struct RemediationContext {
    base: ActionContext,
    created: Arc<Mutex<HashSet<String>>>,
}

impl Deref for RemediationContext {
    type Target = ActionContext;

    fn deref(&self) -> &ActionContext {
        &self.base
    }
}

impl RemediationContext {
    pub(crate) fn new(base: ActionContext) -> Self {
        Self {
            base,
            created: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn created(&self) -> MutexGuard<'_, HashSet<String>> {
        self.created.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_bound(&self, guid: &str) -> bool {
        self.is_action_target(guid) || self.created().contains(guid)
    }

    fn check_bound(&self, guid: &str) -> Result<()> {
        if self.is_bound(guid) {
            return Ok(());
        }
        Err(GovError::invalid(format!(
            "element {guid} is not an action target of engine action {}",
            self.engine_action_guid()
        )))
    }

    pub fn create_element(&self, type_name: &str, properties: PropertyBag) -> Result<String> {
        let guid = self
            .core()
            .store
            .create_element(self.requester_user_id(), type_name, properties)?;
        self.created().insert(guid.clone());
        Ok(guid)
    }

    pub fn update_element(&self, guid: &str, properties: PropertyBag, replace: bool) -> Result<()> {
        self.check_bound(guid)?;
        self.core()
            .store
            .update_element(self.requester_user_id(), guid, properties, replace)
    }

    pub fn delete_element(&self, guid: &str) -> Result<()> {
        self.check_bound(guid)?;
        self.core()
            .store
            .delete_element(self.requester_user_id(), guid)
    }

    pub fn classify(&self, guid: &str, classification: &str, properties: PropertyBag) -> Result<()> {
        self.check_bound(guid)?;
        self.core()
            .store
            .classify(self.requester_user_id(), guid, classification, properties)
    }

    pub fn reclassify(
        &self,
        guid: &str,
        classification: &str,
        properties: PropertyBag,
    ) -> Result<()> {
        self.check_bound(guid)?;
        self.core()
            .store
            .reclassify(self.requester_user_id(), guid, classification, properties)
    }

    pub fn declassify(&self, guid: &str, classification: &str) -> Result<()> {
        self.check_bound(guid)?;
        self.core()
            .store
            .declassify(self.requester_user_id(), guid, classification)
    }

    /// Relate two elements. At least one end must be bound.
    pub fn relate(
        &self,
        type_name: &str,
        end1_guid: &str,
        end2_guid: &str,
        properties: PropertyBag,
    ) -> Result<String> {
        if !self.is_bound(end1_guid) && !self.is_bound(end2_guid) {
            return Err(GovError::invalid(format!(
                "neither {end1_guid} nor {end2_guid} is an action target of engine action {}",
                self.engine_action_guid()
            )));
        }
        self.core().store.create_relationship(
            self.requester_user_id(),
            type_name,
            end1_guid,
            end2_guid,
            properties,
        )
    }

    /// Delete a relationship attached to a bound element.
    pub fn unrelate(&self, relationship_guid: &str) -> Result<()> {
        let user = self.requester_user_id();
        let mut bound: Vec<String> = self.action_target_guids().to_vec();
        bound.extend(self.created().iter().cloned());
        for guid in &bound {
            let attached = match self.metadata().relationships(user, guid) {
                Ok(rels) => rels,
                // A bound element may already have been deleted.
                Err(GovError::InvalidParameter(_)) => continue,
                Err(e) => return Err(e),
            };
            if attached.iter().any(|r| r.guid == relationship_guid) {
                return self.core().store.delete_relationship(user, relationship_guid);
            }
        }
        Err(GovError::invalid(format!(
            "relationship {relationship_guid} is not attached to an action target of engine action {}",
            self.engine_action_guid()
        )))
    }
}

// ---------------------------------------------------------------------------
// ProvisioningContext
// ---------------------------------------------------------------------------

pub const DEFAULT_LINEAGE_TYPE: &str = "LineageMapping";

#[derive(Clone)]
pub struct ProvisioningContext {
    remediation: RemediationContext,
}

impl Deref for ProvisioningContext {
    type Target = RemediationContext;

    fn deref(&self) -> &RemediationContext {
        &self.remediation
    }
}

impl ProvisioningContext {
    pub(crate) fn new(base: ActionContext) -> Self {
        Self {
            remediation: RemediationContext::new(base),
        }
    }

    /// Link `source_guid` (a request source or bound element) to
    /// `target_guid` (a bound element).
    pub fn create_lineage(
        &self,
        source_guid: &str,
        target_guid: &str,
        lineage_type: Option<&str>,
    ) -> Result<String> {
        if !self.is_request_source(source_guid) && !self.is_bound(source_guid) {
            return Err(GovError::invalid(format!(
                "lineage source {source_guid} is neither a request source nor an action target"
            )));
        }
        if !self.is_bound(target_guid) {
            return Err(GovError::invalid(format!(
                "lineage target {target_guid} is not an action target of engine action {}",
                self.engine_action_guid()
            )));
        }
        let mut properties = PropertyBag::new();
        properties.insert(
            "engineActionGUID".into(),
            self.engine_action_guid().to_string().into(),
        );
        self.core().store.create_relationship(
            self.requester_user_id(),
            lineage_type.unwrap_or(DEFAULT_LINEAGE_TYPE),
            source_guid,
            target_guid,
            properties,
        )
    }

    /// A request parameter if set, else the registration's configuration
    /// property of the same name.
    pub fn config_property(&self, name: &str) -> Option<&str> {
        self.request_parameter(name).or_else(|| {
            self.registration()
                .configuration_properties
                .get(name)
                .map(String::as_str)
        })
    }
}
