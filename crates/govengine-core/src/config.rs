//! `.govengine/config.yaml`: engine settings and the governance services it
//! hosts, with validation against the process definition.

use crate::error::{GovError, Result};
use crate::paths;
use crate::process::ProcessDefinition;
use crate::registry::{guard_vocabulary_warnings, GuardDescriptor, ServiceDescriptor};
use crate::types::ServiceRole;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// EngineSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Identity recorded as `processing_engine_guid` on claimed actions.
    #[serde(default = "default_engine_guid")]
    pub guid: String,
    #[serde(default = "default_engine_name")]
    pub name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,
    #[serde(default = "default_listener_queue_capacity")]
    pub listener_queue_capacity: usize,
    /// When false, `Requested` actions wait for an explicit approval.
    #[serde(default = "default_auto_approve")]
    pub auto_approve: bool,
    /// When set, only these users may initiate, approve or cancel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_users: Option<Vec<String>>,
}

fn default_engine_guid() -> String {
    "local-governance-engine".to_string()
}

fn default_engine_name() -> String {
    "governance-engine".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_concurrent_actions() -> usize {
    8
}

fn default_listener_queue_capacity() -> usize {
    256
}

fn default_auto_approve() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            guid: default_engine_guid(),
            name: default_engine_name(),
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_actions: default_max_concurrent_actions(),
            listener_queue_capacity: default_listener_queue_capacity(),
            auto_approve: default_auto_approve(),
            authorized_users: None,
        }
    }
}

impl EngineSettings {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            ..Default::default()
        }
    }

    pub fn is_authorized(&self, user: &str) -> bool {
        match &self.authorized_users {
            Some(users) => users.iter().any(|u| u == user),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceDefinition
// ---------------------------------------------------------------------------

/// One request type this service answers on this engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationDefinition {
    pub request_type: String,
    /// Request type the handler sees, when it differs from the engine's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_request_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_parameters: BTreeMap<String, String>,
}

/// A script-backed governance action service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub role: ServiceRole,
    #[serde(default)]
    pub description: String,
    /// Program to run. Bare names are resolved on `PATH`, relative paths
    /// against the project root.
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_request_parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_action_targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produced_guards: Vec<GuardDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configuration_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub registrations: Vec<RegistrationDefinition>,
}

impl ServiceDefinition {
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name.clone(),
            role: self.role,
            description: self.description.clone(),
            supported_request_types: self
                .registrations
                .iter()
                .map(|r| {
                    r.service_request_type
                        .clone()
                        .unwrap_or_else(|| r.request_type.clone())
                })
                .collect(),
            supported_request_parameters: self.supported_request_parameters.clone(),
            supported_action_targets: self.supported_action_targets.clone(),
            produced_guards: self.produced_guards.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceDefinition>,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(engine: EngineSettings) -> Self {
        Self {
            version: 1,
            engine,
            services: Vec::new(),
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(GovError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let error = |message: String| ConfigWarning {
            level: WarnLevel::Error,
            message,
        };
        let warning = |message: String| ConfigWarning {
            level: WarnLevel::Warning,
            message,
        };

        if self.engine.guid.trim().is_empty() {
            warnings.push(error("engine.guid is empty".into()));
        }
        if self.engine.poll_interval_ms == 0 {
            warnings.push(error("engine.poll_interval_ms must be greater than 0".into()));
        }
        if self.engine.max_concurrent_actions == 0 {
            warnings.push(error(
                "engine.max_concurrent_actions must be greater than 0".into(),
            ));
        }
        if self.engine.listener_queue_capacity == 0 {
            warnings.push(error(
                "engine.listener_queue_capacity must be greater than 0".into(),
            ));
        }
        if matches!(&self.engine.authorized_users, Some(users) if users.is_empty()) {
            warnings.push(warning(
                "engine.authorized_users is empty; nobody can initiate actions".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut request_types: HashMap<&str, &str> = HashMap::new();
        for service in &self.services {
            if paths::validate_name("service name", &service.name).is_err() {
                warnings.push(error(format!("invalid service name '{}'", service.name)));
            }
            if !names.insert(service.name.as_str()) {
                warnings.push(error(format!(
                    "service '{}' is defined more than once",
                    service.name
                )));
            }
            if service.role == ServiceRole::Watchdog {
                warnings.push(error(format!(
                    "service '{}': script services cannot take the watchdog role",
                    service.name
                )));
            }
            if service.command.trim().is_empty() {
                warnings.push(error(format!(
                    "service '{}' has an empty command",
                    service.name
                )));
            }
            if service.registrations.is_empty() {
                warnings.push(warning(format!(
                    "service '{}' has no registrations and will never run",
                    service.name
                )));
            }
            if service.produced_guards.is_empty() {
                warnings.push(warning(format!(
                    "service '{}' declares no guards",
                    service.name
                )));
            }
            for reg in &service.registrations {
                if paths::validate_name("request type", &reg.request_type).is_err() {
                    warnings.push(error(format!(
                        "service '{}': invalid request type '{}'",
                        service.name, reg.request_type
                    )));
                }
                if let Some(previous) =
                    request_types.insert(reg.request_type.as_str(), service.name.as_str())
                {
                    warnings.push(error(format!(
                        "request type '{}' is registered by both '{}' and '{}'",
                        reg.request_type, previous, service.name
                    )));
                }
            }
        }

        warnings
    }

    /// Process-definition checks against the services this config declares:
    /// structural problems plus trigger guards no registered service produces.
    pub fn validate_process(&self, process: &ProcessDefinition) -> Vec<ConfigWarning> {
        let mut by_request_type = HashMap::new();
        for service in &self.services {
            let descriptor = service.descriptor();
            for reg in &service.registrations {
                by_request_type.insert(reg.request_type.clone(), descriptor.clone());
            }
        }
        let mut warnings = process.validate();
        warnings.extend(guard_vocabulary_warnings(process, &by_request_type));
        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NextAction;
    use crate::types::CompletionStatus;

    fn scan_service() -> ServiceDefinition {
        ServiceDefinition {
            name: "asset-scanner".into(),
            role: ServiceRole::Verification,
            description: "checks assets for a schema".into(),
            command: "scripts/scan.sh".into(),
            args: vec![],
            supported_request_parameters: vec![],
            supported_action_targets: vec!["Asset".into()],
            produced_guards: vec![
                GuardDescriptor::new("SCHEMA-PRESENT", CompletionStatus::Actioned),
                GuardDescriptor::new("SCHEMA-MISSING", CompletionStatus::Actioned),
            ],
            configuration_properties: BTreeMap::new(),
            registrations: vec![RegistrationDefinition {
                request_type: "scan-asset".into(),
                service_request_type: None,
                request_parameters: BTreeMap::new(),
            }],
        }
    }

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::new(EngineSettings::new("engine-1"));
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.engine.guid, "engine-1");
        assert_eq!(parsed.version, 1);
        assert!(!yaml.contains("services"));
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("version: 1\n").unwrap();
        assert_eq!(cfg.engine.poll_interval_ms, 1000);
        assert_eq!(cfg.engine.max_concurrent_actions, 8);
        assert_eq!(cfg.engine.listener_queue_capacity, 256);
        assert!(cfg.engine.auto_approve);
        assert!(cfg.engine.authorized_users.is_none());
        assert!(cfg.engine.is_authorized("anyone"));
    }

    #[test]
    fn service_definition_from_yaml() {
        let yaml = r#"
engine:
  guid: e1
  auto_approve: false
  authorized_users: [alice]
services:
  - name: asset-scanner
    role: verification
    command: ./scan.sh
    produced_guards:
      - name: SCHEMA-MISSING
        completion_status: actioned
    configuration_properties:
      catalog: main
    registrations:
      - request_type: scan-asset
        service_request_type: scan
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!cfg.engine.auto_approve);
        assert!(cfg.engine.is_authorized("alice"));
        assert!(!cfg.engine.is_authorized("bob"));
        let svc = cfg.service("asset-scanner").unwrap();
        assert_eq!(svc.role, ServiceRole::Verification);
        assert_eq!(svc.configuration_properties["catalog"], "main");
        let descriptor = svc.descriptor();
        assert_eq!(descriptor.supported_request_types, vec!["scan".to_string()]);
        assert!(descriptor.produces("SCHEMA-MISSING"));
    }

    #[test]
    fn validate_valid_config_no_warnings() {
        let mut cfg = Config::new(EngineSettings::new("engine-1"));
        cfg.services.push(scan_service());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_rejects_script_watchdog_and_duplicates() {
        let mut cfg = Config::new(EngineSettings::new("engine-1"));
        let mut watchdog = scan_service();
        watchdog.role = ServiceRole::Watchdog;
        cfg.services.push(scan_service());
        cfg.services.push(watchdog);
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("watchdog role")));
        assert!(warnings.iter().any(|w| w.message.contains("more than once")));
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("registered by both")));
    }

    #[test]
    fn validate_zero_limits() {
        let mut cfg = Config::new(EngineSettings::new("engine-1"));
        cfg.engine.max_concurrent_actions = 0;
        cfg.engine.poll_interval_ms = 0;
        cfg.engine.authorized_users = Some(vec![]);
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("max_concurrent_actions")));
        assert!(warnings.iter().any(|w| w.message.contains("poll_interval_ms")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("nobody")));
    }

    #[test]
    fn validate_process_flags_undeclared_guard() {
        let mut cfg = Config::new(EngineSettings::new("engine-1"));
        cfg.services.push(scan_service());
        let process = ProcessDefinition::new("p")
            .step("scan-asset", "SCHEMA-MISSING", vec![NextAction::new("infer-schema")])
            .step("scan-asset", "SCHEMA-BROKEN", vec![NextAction::new("repair")]);
        let warnings = cfg.validate_process(&process);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
        assert!(warnings[0].message.contains("SCHEMA-BROKEN"));
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(GovError::NotInitialized)
        ));
        Config::new(EngineSettings::new("e")).save(dir.path()).unwrap();
        assert_eq!(Config::load(dir.path()).unwrap().engine.guid, "e");
    }
}
