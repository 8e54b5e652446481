use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::json;

use cadence_core::EventBus;
use cadence_types::{Event, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGateStatus {
    Passed,
    Failed,
    Adapted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Continue,
    Retry,
    Adapt,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityGateResult {
    pub workflow_name: String,
    pub status: QualityGateStatus,
    pub success: bool,
    pub missing_artifacts: Vec<String>,
    pub action: GateAction,
    pub adaptation_note: String,
}

/// Validates that a workflow produced the artifacts it was expected to,
/// and decides whether the sequence should continue, retry, or adapt.
pub struct QualityGateManager {
    project_root: PathBuf,
    event_bus: EventBus,
    gates: HashMap<String, Vec<String>>,
}

impl QualityGateManager {
    pub fn new(
        project_root: PathBuf,
        event_bus: EventBus,
        gates_config: Option<HashMap<String, Vec<String>>>,
    ) -> Self {
        let gates = gates_config.unwrap_or_else(default_gates);
        tracing::info!(configured_gates = gates.len(), "quality gate manager initialized");
        Self {
            project_root,
            event_bus,
            gates,
        }
    }

    pub fn validate_artifacts(
        &self,
        workflow_name: &str,
        expected_artifacts: Option<&[String]>,
    ) -> QualityGateResult {
        let configured = self.gates.get(workflow_name);
        let artifacts: Vec<String> = expected_artifacts
            .map(|a| a.to_vec())
            .or_else(|| configured.cloned())
            .unwrap_or_default();

        if artifacts.is_empty() {
            self.event_bus.publish(Event::new(
                EventType::QualityGateStarted,
                json!({"workflow_name": workflow_name, "status": "no_gates_configured"}),
            ));
            return QualityGateResult {
                workflow_name: workflow_name.to_string(),
                status: QualityGateStatus::Passed,
                success: true,
                missing_artifacts: Vec::new(),
                action: GateAction::Continue,
                adaptation_note: String::new(),
            };
        }

        self.event_bus.publish(Event::new(
            EventType::QualityGateStarted,
            json!({"workflow_name": workflow_name, "expected": artifacts.len()}),
        ));

        let mut missing = self.missing_of(&artifacts);

        // The stories directory existing is not enough: it has to contain
        // story documents.
        if workflow_name == "create-story" && missing.is_empty() && !self.has_story_files() {
            missing.push("docs/stories (empty)".to_string());
        }

        if missing.is_empty() {
            self.event_bus.publish(Event::new(
                EventType::QualityGatePassed,
                json!({"workflow_name": workflow_name, "artifacts_found": artifacts.len()}),
            ));
            tracing::info!(workflow = workflow_name, "quality gate passed");
            return QualityGateResult {
                workflow_name: workflow_name.to_string(),
                status: QualityGateStatus::Passed,
                success: true,
                missing_artifacts: Vec::new(),
                action: GateAction::Continue,
                adaptation_note: String::new(),
            };
        }

        let result = self.apply_gate_logic(workflow_name, missing);
        self.event_bus.publish(Event::new(
            EventType::QualityGateFailed,
            json!({
                "workflow_name": workflow_name,
                "missing_artifacts": result.missing_artifacts,
                "action": result.action,
                "status": result.status,
            }),
        ));
        tracing::warn!(
            workflow = workflow_name,
            missing = result.missing_artifacts.len(),
            action = ?result.action,
            "quality gate failed"
        );
        result
    }

    pub fn set_workflow_gates(&mut self, workflow_name: &str, artifacts: Vec<String>) {
        self.gates.insert(workflow_name.to_string(), artifacts);
    }

    pub fn workflow_gates(&self, workflow_name: &str) -> &[String] {
        self.gates
            .get(workflow_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn missing_of(&self, artifacts: &[String]) -> Vec<String> {
        artifacts
            .iter()
            .filter(|path| !self.project_root.join(path.as_str()).exists())
            .cloned()
            .collect()
    }

    fn has_story_files(&self) -> bool {
        let stories_dir = self.project_root.join("docs").join("stories");
        let Ok(entries) = std::fs::read_dir(&stories_dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() && name.starts_with("epic-") {
                if let Ok(stories) = std::fs::read_dir(entry.path()) {
                    for story in stories.flatten() {
                        let story_name = story.file_name().to_string_lossy().to_string();
                        if story_name.starts_with("story-") && story_name.ends_with(".md") {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    fn apply_gate_logic(&self, workflow_name: &str, missing: Vec<String>) -> QualityGateResult {
        match workflow_name {
            // A missing PRD is tolerable when the epics overview exists.
            "prd" => {
                if self.project_root.join("docs").join("epics.md").exists() {
                    QualityGateResult {
                        workflow_name: workflow_name.to_string(),
                        status: QualityGateStatus::Adapted,
                        success: false,
                        missing_artifacts: missing,
                        action: GateAction::Adapt,
                        adaptation_note:
                            "epics.md found instead of PRD.md, proceeding with epics".to_string(),
                    }
                } else {
                    QualityGateResult {
                        workflow_name: workflow_name.to_string(),
                        status: QualityGateStatus::Failed,
                        success: false,
                        missing_artifacts: missing,
                        action: GateAction::Retry,
                        adaptation_note: "PRD and epics.md both missing".to_string(),
                    }
                }
            }
            "create-story" => {
                if self.has_story_files() {
                    QualityGateResult {
                        workflow_name: workflow_name.to_string(),
                        status: QualityGateStatus::Passed,
                        success: true,
                        missing_artifacts: Vec::new(),
                        action: GateAction::Continue,
                        adaptation_note: String::new(),
                    }
                } else {
                    QualityGateResult {
                        workflow_name: workflow_name.to_string(),
                        status: QualityGateStatus::Failed,
                        success: false,
                        missing_artifacts: missing,
                        action: GateAction::Retry,
                        adaptation_note: "stories directory is empty or missing".to_string(),
                    }
                }
            }
            _ => QualityGateResult {
                workflow_name: workflow_name.to_string(),
                status: QualityGateStatus::Adapted,
                success: false,
                missing_artifacts: missing,
                action: GateAction::Adapt,
                adaptation_note: format!(
                    "Some artifacts missing for {workflow_name}, continuing anyway"
                ),
            },
        }
    }
}

fn default_gates() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("prd".to_string(), vec!["docs/PRD.md".to_string()]),
        (
            "architecture".to_string(),
            vec!["docs/ARCHITECTURE.md".to_string()],
        ),
        ("create-story".to_string(), vec!["docs/stories".to_string()]),
        ("dev-story".to_string(), Vec::new()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> QualityGateManager {
        QualityGateManager::new(dir.path().to_path_buf(), EventBus::new(), None)
    }

    #[test]
    fn no_configured_gates_passes() {
        let dir = TempDir::new().expect("tempdir");
        let gate = manager(&dir);
        let result = gate.validate_artifacts("dev-story", None);
        assert_eq!(result.status, QualityGateStatus::Passed);
        assert_eq!(result.action, GateAction::Continue);
    }

    #[test]
    fn all_artifacts_present_passes() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("docs")).expect("mkdir");
        std::fs::write(dir.path().join("docs/PRD.md"), "# PRD").expect("write");

        let gate = manager(&dir);
        let result = gate.validate_artifacts("prd", None);
        assert_eq!(result.status, QualityGateStatus::Passed);
        assert!(result.missing_artifacts.is_empty());
    }

    #[test]
    fn missing_prd_adapts_when_epics_overview_exists() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("docs")).expect("mkdir");
        std::fs::write(dir.path().join("docs/epics.md"), "# Epics").expect("write");

        let gate = manager(&dir);
        let result = gate.validate_artifacts("prd", None);
        assert_eq!(result.status, QualityGateStatus::Adapted);
        assert_eq!(result.action, GateAction::Adapt);

        // Without the fallback document the gate asks for a retry.
        let bare = TempDir::new().expect("tempdir");
        let gate = manager(&bare);
        let result = gate.validate_artifacts("prd", None);
        assert_eq!(result.status, QualityGateStatus::Failed);
        assert_eq!(result.action, GateAction::Retry);
    }

    #[test]
    fn empty_stories_directory_retries() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("docs/stories")).expect("mkdir");

        let gate = manager(&dir);
        let result = gate.validate_artifacts("create-story", None);
        assert_eq!(result.status, QualityGateStatus::Failed);
        assert_eq!(result.action, GateAction::Retry);
        assert_eq!(result.missing_artifacts, vec!["docs/stories (empty)"]);

        std::fs::create_dir_all(dir.path().join("docs/stories/epic-1")).expect("mkdir");
        std::fs::write(dir.path().join("docs/stories/epic-1/story-1.1.md"), "s")
            .expect("write");
        let result = gate.validate_artifacts("create-story", None);
        assert_eq!(result.status, QualityGateStatus::Passed);
    }

    #[test]
    fn other_missing_artifacts_adapt() {
        let dir = TempDir::new().expect("tempdir");
        let gate = manager(&dir);
        let result = gate.validate_artifacts("architecture", None);
        assert_eq!(result.status, QualityGateStatus::Adapted);
        assert_eq!(result.action, GateAction::Adapt);
        assert!(!result.adaptation_note.is_empty());
    }

    #[test]
    fn explicit_overrides_replace_configured_gates() {
        let dir = TempDir::new().expect("tempdir");
        let gate = manager(&dir);
        let overrides = vec!["docs/custom.md".to_string()];
        let result = gate.validate_artifacts("architecture", Some(overrides.as_slice()));
        assert_eq!(result.missing_artifacts, vec!["docs/custom.md"]);
    }
}
