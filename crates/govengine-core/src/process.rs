//! Process definitions: which action comes next, given the request type that
//! just finished and the guards it produced.
//!
//! A definition is a flat list of steps keyed by `(trigger_request_type,
//! trigger_guard)`. The engine never mutates it; administrators replace it
//! wholesale via `.govengine/process.yaml` or
//! `GovernanceEngine::set_process_definition`.
//!
//! ```yaml
//! name: asset-onboarding
//! steps:
//!   - trigger_request_type: scan-asset
//!     trigger_guard: SCHEMA-MISSING
//!     next:
//!       - request_type: infer-schema
//!         parameter_overrides:
//!           sample-size: "100"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{Completion, EngineAction, NewEngineAction};
use crate::config::{ConfigWarning, WarnLevel};
use crate::error::Result;
use crate::paths;

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Where a child action's targets come from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetBinding {
    /// The completion's new action targets if it reported any, else the parent's.
    #[default]
    Default,
    Parent,
    Completion,
    Fixed { guids: Vec<String> },
}

/// Where a child action's request sources come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceBinding {
    /// Carry the parent's request sources forward.
    #[default]
    Parent,
    /// The parent engine action itself is the request source.
    ParentAction,
    None,
}

// ---------------------------------------------------------------------------
// NextAction / ProcessStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub request_type: String,
    #[serde(default)]
    pub target_binding: TargetBinding,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameter_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub request_sources: SourceBinding,
    /// Delay before the child becomes due. Zero means as soon as possible.
    #[serde(default)]
    pub wait_time_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl NextAction {
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            target_binding: TargetBinding::Default,
            parameter_overrides: BTreeMap::new(),
            request_sources: SourceBinding::Parent,
            wait_time_secs: 0,
            display_name: None,
        }
    }

    pub fn targets(mut self, binding: TargetBinding) -> Self {
        self.target_binding = binding;
        self
    }

    pub fn sources(mut self, binding: SourceBinding) -> Self {
        self.request_sources = binding;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameter_overrides.insert(key.into(), value.into());
        self
    }

    pub fn wait(mut self, secs: u64) -> Self {
        self.wait_time_secs = secs;
        self
    }

    /// Build the request for a child of `parent`.
    ///
    /// Parameters are layered parent, then completion, then step overrides;
    /// later layers win on key collision.
    pub fn child_request(
        &self,
        parent: &EngineAction,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> NewEngineAction {
        let action_target_guids = match &self.target_binding {
            TargetBinding::Default if !completion.new_action_targets.is_empty() => {
                completion.new_action_targets.clone()
            }
            TargetBinding::Default | TargetBinding::Parent => parent.target_guids(),
            TargetBinding::Completion => completion.new_action_targets.clone(),
            TargetBinding::Fixed { guids } => guids.clone(),
        };

        let request_source_guids = match self.request_sources {
            SourceBinding::Parent => parent.request_source_guids.clone(),
            SourceBinding::ParentAction => vec![parent.guid.clone()],
            SourceBinding::None => Vec::new(),
        };

        let mut request_parameters = parent.request_parameters.clone();
        request_parameters.extend(
            completion
                .new_request_parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        request_parameters.extend(
            self.parameter_overrides
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let start_time = (self.wait_time_secs > 0)
            .then(|| now + Duration::seconds(self.wait_time_secs as i64));

        NewEngineAction {
            qualified_name: format!("{}::{}", self.request_type, uuid::Uuid::new_v4()),
            domain_identifier: parent.domain_identifier,
            display_name: self.display_name.clone(),
            description: None,
            request_source_guids,
            action_target_guids,
            start_time,
            request_type: self.request_type.clone(),
            request_parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub trigger_request_type: String,
    pub trigger_guard: String,
    #[serde(default)]
    pub next: Vec<NextAction>,
}

// ---------------------------------------------------------------------------
// ProcessDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<ProcessStep>,
}

impl ProcessDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append `(request_type, guard) -> next`.
    pub fn step(
        mut self,
        request_type: impl Into<String>,
        guard: impl Into<String>,
        next: Vec<NextAction>,
    ) -> Self {
        self.steps.push(ProcessStep {
            trigger_request_type: request_type.into(),
            trigger_guard: guard.into(),
            next,
        });
        self
    }

    /// Every next action triggered by `guards` on an action of `request_type`,
    /// paired with the guard that matched. Guard order first, then step order.
    /// A guard repeated in `guards` matches once.
    pub fn next_actions<'a>(
        &'a self,
        request_type: &str,
        guards: &'a [String],
    ) -> Vec<(&'a str, &'a NextAction)> {
        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        for guard in guards {
            if !seen.insert(guard.as_str()) {
                continue;
            }
            for step in self
                .steps
                .iter()
                .filter(|s| s.trigger_request_type == request_type && s.trigger_guard == *guard)
            {
                matched.extend(step.next.iter().map(|n| (guard.as_str(), n)));
            }
        }
        matched
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load `.govengine/process.yaml`. A missing file is an empty definition.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::process_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::process_path(root), data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Structural checks. Guard vocabulary checks need the registered services
    /// and live in `ServiceRegistry::validate_process`.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut keys = HashSet::new();

        for step in &self.steps {
            if step.trigger_request_type.trim().is_empty() || step.trigger_guard.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "process step has an empty trigger request type or guard".into(),
                });
                continue;
            }
            if !keys.insert((&step.trigger_request_type, &step.trigger_guard)) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "step ({}, {}) is declared more than once; all of its next actions run",
                        step.trigger_request_type, step.trigger_guard
                    ),
                });
            }
            if step.next.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "step ({}, {}) has no next actions",
                        step.trigger_request_type, step.trigger_guard
                    ),
                });
            }
            for next in &step.next {
                if next.request_type.trim().is_empty() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "step ({}, {}) has a next action with an empty request type",
                            step.trigger_request_type, step.trigger_guard
                        ),
                    });
                }
                if let TargetBinding::Fixed { guids } = &next.target_binding {
                    if guids.iter().any(|g| g.trim().is_empty()) {
                        warnings.push(ConfigWarning {
                            level: WarnLevel::Error,
                            message: format!(
                                "next action '{}' binds an empty target guid",
                                next.request_type
                            ),
                        });
                    }
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompletionStatus;

    fn guards(gs: &[&str]) -> Vec<String> {
        gs.iter().map(|g| g.to_string()).collect()
    }

    fn pass_fail() -> ProcessDefinition {
        ProcessDefinition::new("t")
            .step("T1", "PASS", vec![NextAction::new("T2")])
            .step("T1", "FAIL", vec![NextAction::new("T3")])
    }

    fn parent() -> EngineAction {
        EngineAction::new(
            NewEngineAction::new("scan", "scan-asset")
                .target("asset-1")
                .source("req-1")
                .param("depth", "1")
                .param("owner", "alice"),
            "tester",
        )
    }

    #[test]
    fn pass_selects_only_matching_step() {
        let def = pass_fail();
        let g = guards(&["PASS"]);
        let next = def.next_actions("T1", &g);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].0, "PASS");
        assert_eq!(next[0].1.request_type, "T2");
    }

    #[test]
    fn unknown_guard_or_type_matches_nothing() {
        let def = pass_fail();
        assert!(def.next_actions("T1", &guards(&["MAYBE"])).is_empty());
        assert!(def.next_actions("T9", &guards(&["PASS"])).is_empty());
        assert!(def.next_actions("T1", &[]).is_empty());
    }

    #[test]
    fn matches_follow_guard_order_then_step_order() {
        let def = ProcessDefinition::new("t")
            .step("T1", "B", vec![NextAction::new("b1"), NextAction::new("b2")])
            .step("T1", "A", vec![NextAction::new("a1")])
            .step("T1", "B", vec![NextAction::new("b3")]);
        let g = guards(&["A", "B", "A"]);
        let types: Vec<&str> = def
            .next_actions("T1", &g)
            .into_iter()
            .map(|(_, n)| n.request_type.as_str())
            .collect();
        assert_eq!(types, vec!["a1", "b1", "b2", "b3"]);
    }

    #[test]
    fn default_binding_inherits_parent_targets() {
        let p = parent();
        let child = NextAction::new("infer-schema").child_request(
            &p,
            &Completion::new(CompletionStatus::Actioned),
            Utc::now(),
        );
        assert_eq!(child.action_target_guids, vec!["asset-1".to_string()]);
        assert_eq!(child.request_source_guids, vec!["req-1".to_string()]);
        assert!(child.qualified_name.starts_with("infer-schema::"));
        assert!(child.start_time.is_none());
    }

    #[test]
    fn default_binding_prefers_completion_targets() {
        let p = parent();
        let completion = Completion::new(CompletionStatus::Actioned).new_target("schema-9");
        let child = NextAction::new("x").child_request(&p, &completion, Utc::now());
        assert_eq!(child.action_target_guids, vec!["schema-9".to_string()]);

        let explicit_parent = NextAction::new("x")
            .targets(TargetBinding::Parent)
            .child_request(&p, &completion, Utc::now());
        assert_eq!(explicit_parent.action_target_guids, vec!["asset-1".to_string()]);

        let fixed = NextAction::new("x")
            .targets(TargetBinding::Fixed {
                guids: vec!["g1".into(), "g2".into()],
            })
            .child_request(&p, &completion, Utc::now());
        assert_eq!(fixed.action_target_guids.len(), 2);
    }

    #[test]
    fn parameters_layer_parent_completion_overrides() {
        let p = parent();
        let completion = Completion::new(CompletionStatus::Actioned)
            .param("depth", "2")
            .param("found", "3");
        let child = NextAction::new("x")
            .param("depth", "5")
            .child_request(&p, &completion, Utc::now());
        assert_eq!(child.request_parameters["depth"], "5");
        assert_eq!(child.request_parameters["found"], "3");
        assert_eq!(child.request_parameters["owner"], "alice");
    }

    #[test]
    fn source_bindings_and_wait() {
        let p = parent();
        let now = Utc::now();
        let c = Completion::new(CompletionStatus::Actioned);
        let child = NextAction::new("x")
            .sources(SourceBinding::ParentAction)
            .wait(60)
            .child_request(&p, &c, now);
        assert_eq!(child.request_source_guids, vec![p.guid.clone()]);
        assert_eq!(child.start_time, Some(now + Duration::seconds(60)));

        let none = NextAction::new("x")
            .sources(SourceBinding::None)
            .child_request(&p, &c, now);
        assert!(none.request_source_guids.is_empty());
    }

    #[test]
    fn yaml_roundtrip_with_defaults() {
        let yaml = r#"
name: onboarding
steps:
  - trigger_request_type: scan-asset
    trigger_guard: SCHEMA-MISSING
    next:
      - request_type: infer-schema
      - request_type: notify
        target_binding:
          type: fixed
          guids: [steward-1]
        request_sources: none
        wait_time_secs: 30
"#;
        let def: ProcessDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.steps.len(), 1);
        let next = &def.steps[0].next;
        assert_eq!(next[0].target_binding, TargetBinding::Default);
        assert_eq!(next[0].request_sources, SourceBinding::Parent);
        assert_eq!(
            next[1].target_binding,
            TargetBinding::Fixed {
                guids: vec!["steward-1".into()]
            }
        );
        assert_eq!(next[1].request_sources, SourceBinding::None);
        assert_eq!(next[1].wait_time_secs, 30);

        let out = serde_yaml::to_string(&def).unwrap();
        let again: ProcessDefinition = serde_yaml::from_str(&out).unwrap();
        assert_eq!(again, def);
    }

    #[test]
    fn validate_flags_structural_problems() {
        let def = ProcessDefinition::new("t")
            .step("T1", "PASS", vec![])
            .step("T1", "PASS", vec![NextAction::new("")])
            .step("", "X", vec![NextAction::new("T2")]);
        let warnings = def.validate();
        assert!(warnings.iter().any(|w| w.message.contains("no next actions")));
        assert!(warnings.iter().any(|w| w.message.contains("more than once")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("empty request type")));
        assert!(warnings.iter().any(|w| w.message.contains("empty trigger")));
        assert!(pass_fail().validate().is_empty());
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let def = ProcessDefinition::load(dir.path()).unwrap();
        assert!(def.steps.is_empty());
        pass_fail().save(dir.path()).unwrap();
        assert_eq!(ProcessDefinition::load(dir.path()).unwrap(), pass_fail());
    }
}
