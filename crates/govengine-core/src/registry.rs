//! Service descriptors, registrations and the provider registry.
//!
//! A provider is the factory for one connector type. It carries an immutable
//! `ServiceDescriptor` built once, and hands out a fresh handler for every
//! invocation. Registrations bind `(engine_guid, request_type)` to a provider
//! by name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ConfigWarning, WarnLevel};
use crate::error::{GovError, Result};
use crate::handler::GovernanceHandler;
use crate::paths;
use crate::process::ProcessDefinition;
use crate::types::{CompletionStatus, ServiceRole};

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// The completion status this guard is reported with, if fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_status: Option<CompletionStatus>,
}

impl GuardDescriptor {
    pub fn new(name: impl Into<String>, completion_status: CompletionStatus) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            completion_status: Some(completion_status),
        }
    }
}

/// What a connector type declares about itself. Never mutated after the
/// provider is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub role: ServiceRole,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub supported_request_types: Vec<String>,
    #[serde(default)]
    pub supported_request_parameters: Vec<String>,
    #[serde(default)]
    pub supported_action_targets: Vec<String>,
    /// Every guard this service can ever produce.
    #[serde(default)]
    pub produced_guards: Vec<GuardDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, role: ServiceRole) -> Self {
        Self {
            name: name.into(),
            role,
            description: String::new(),
            supported_request_types: Vec::new(),
            supported_request_parameters: Vec::new(),
            supported_action_targets: Vec::new(),
            produced_guards: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn request_type(mut self, request_type: impl Into<String>) -> Self {
        self.supported_request_types.push(request_type.into());
        self
    }

    pub fn guard(mut self, name: impl Into<String>, status: CompletionStatus) -> Self {
        self.produced_guards.push(GuardDescriptor::new(name, status));
        self
    }

    pub fn produces(&self, guard: &str) -> bool {
        self.produced_guards.iter().any(|g| g.name == guard)
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistration
// ---------------------------------------------------------------------------

/// "When this engine receives this request type, run this service."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub engine_guid: String,
    pub service_name: String,
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_request_type: Option<String>,
    /// Seeded into every invocation; the action's own parameters win.
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub configuration_properties: BTreeMap<String, String>,
}

impl ServiceRegistration {
    pub fn new(
        engine_guid: impl Into<String>,
        service_name: impl Into<String>,
        request_type: impl Into<String>,
    ) -> Self {
        Self {
            engine_guid: engine_guid.into(),
            service_name: service_name.into(),
            request_type: request_type.into(),
            service_request_type: None,
            request_parameters: BTreeMap::new(),
            configuration_properties: BTreeMap::new(),
        }
    }

    pub fn service_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.service_request_type = Some(request_type.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_parameters.insert(key.into(), value.into());
        self
    }

    pub fn config_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration_properties.insert(key.into(), value.into());
        self
    }

    /// The request type the handler is told it is serving.
    pub fn effective_request_type(&self) -> &str {
        self.service_request_type
            .as_deref()
            .unwrap_or(&self.request_type)
    }
}

// ---------------------------------------------------------------------------
// ServiceProvider
// ---------------------------------------------------------------------------

pub trait ServiceProvider: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Build a fresh handler for one invocation.
    fn create_handler(&self, registration: &ServiceRegistration) -> Result<GovernanceHandler>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

type RegistrationKey = (String, String);

#[derive(Default)]
pub struct ServiceRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ServiceProvider>>>,
    registrations: RwLock<BTreeMap<RegistrationKey, ServiceRegistration>>,
}

fn poisoned<T>(_: T) -> GovError {
    GovError::property_server("service registry lock poisoned")
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn providers(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<dyn ServiceProvider>>>> {
        self.providers.read().map_err(poisoned)
    }

    fn registrations_mut(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<RegistrationKey, ServiceRegistration>>> {
        self.registrations.write().map_err(poisoned)
    }

    fn registrations_ref(
        &self,
    ) -> Result<RwLockReadGuard<'_, BTreeMap<RegistrationKey, ServiceRegistration>>> {
        self.registrations.read().map_err(poisoned)
    }

    /// Add a provider under its descriptor name. Names are unique.
    pub fn add_provider(&self, provider: Arc<dyn ServiceProvider>) -> Result<()> {
        let name = provider.descriptor().name.clone();
        paths::validate_name("service name", &name)?;
        let mut providers = self.providers.write().map_err(poisoned)?;
        if providers.contains_key(&name) {
            return Err(GovError::invalid(format!(
                "a service named '{name}' is already registered"
            )));
        }
        info!(service = %name, role = %provider.descriptor().role, "service provider added");
        providers.insert(name, provider);
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Result<Option<Arc<dyn ServiceProvider>>> {
        Ok(self.providers()?.get(name).cloned())
    }

    /// Descriptors of every provider, sorted by name.
    pub fn descriptors(&self) -> Result<Vec<ServiceDescriptor>> {
        let mut all: Vec<ServiceDescriptor> = self
            .providers()?
            .values()
            .map(|p| p.descriptor().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    /// Bind a request type on an engine to a provider. Replaces an existing
    /// binding for the same `(engine_guid, request_type)`.
    pub fn register(&self, registration: ServiceRegistration) -> Result<()> {
        paths::validate_name("request type", &registration.request_type)?;
        let provider = self.provider(&registration.service_name)?.ok_or_else(|| {
            GovError::invalid(format!(
                "unknown governance service '{}'",
                registration.service_name
            ))
        })?;
        let descriptor = provider.descriptor();
        let effective = registration.effective_request_type();
        if !descriptor.supported_request_types.is_empty()
            && !descriptor
                .supported_request_types
                .iter()
                .any(|t| t == effective)
        {
            warn!(
                service = %descriptor.name,
                request_type = %effective,
                "service does not declare support for this request type"
            );
        }

        let key = (
            registration.engine_guid.clone(),
            registration.request_type.clone(),
        );
        info!(
            engine = %registration.engine_guid,
            request_type = %registration.request_type,
            service = %registration.service_name,
            "service registered"
        );
        self.registrations_mut()?.insert(key, registration);
        Ok(())
    }

    pub fn unregister(&self, engine_guid: &str, request_type: &str) -> Result<ServiceRegistration> {
        let key = (engine_guid.to_string(), request_type.to_string());
        self.registrations_mut()?.remove(&key).ok_or_else(|| {
            GovError::invalid(format!(
                "no service registered for request type '{request_type}' on engine {engine_guid}"
            ))
        })
    }

    pub fn registrations(&self, engine_guid: &str) -> Result<Vec<ServiceRegistration>> {
        Ok(self
            .registrations_ref()?
            .values()
            .filter(|r| r.engine_guid == engine_guid)
            .cloned()
            .collect())
    }

    /// The registration and provider serving `request_type` on `engine_guid`.
    pub fn resolve(
        &self,
        engine_guid: &str,
        request_type: &str,
    ) -> Result<Option<(ServiceRegistration, Arc<dyn ServiceProvider>)>> {
        let key = (engine_guid.to_string(), request_type.to_string());
        let Some(registration) = self.registrations_ref()?.get(&key).cloned() else {
            return Ok(None);
        };
        let provider = self.provider(&registration.service_name)?.ok_or_else(|| {
            GovError::property_server(format!(
                "registration for '{request_type}' names missing service '{}'",
                registration.service_name
            ))
        })?;
        Ok(Some((registration, provider)))
    }

    /// Check every trigger guard in `process` against the guards the service
    /// registered for its trigger request type declares. Never fails.
    pub fn validate_process(
        &self,
        engine_guid: &str,
        process: &ProcessDefinition,
    ) -> Result<Vec<ConfigWarning>> {
        let mut by_request_type = HashMap::new();
        for registration in self.registrations(engine_guid)? {
            if let Some(provider) = self.provider(&registration.service_name)? {
                by_request_type.insert(
                    registration.request_type.clone(),
                    provider.descriptor().clone(),
                );
            }
        }
        Ok(guard_vocabulary_warnings(process, &by_request_type))
    }
}

/// Warn for each step whose trigger request type has no service, or whose
/// trigger guard the service never declares.
pub fn guard_vocabulary_warnings(
    process: &ProcessDefinition,
    services: &HashMap<String, ServiceDescriptor>,
) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();
    for step in &process.steps {
        match services.get(&step.trigger_request_type) {
            None => warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "no service is registered for trigger request type '{}'",
                    step.trigger_request_type
                ),
            }),
            Some(descriptor) if !descriptor.produces(&step.trigger_guard) => {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "guard '{}' on request type '{}' is not declared by service '{}'",
                        step.trigger_guard, step.trigger_request_type, descriptor.name
                    ),
                })
            }
            Some(_) => {}
        }
    }
    warnings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
