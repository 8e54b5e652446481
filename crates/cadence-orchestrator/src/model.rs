use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cadence_core::WorkflowDefinition;
use cadence_types::{CeremonyType, ProjectType, ScaleLevel, WorkflowRunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Outcome of the external analysis pass over the initial request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptAnalysis {
    pub scale_level: ScaleLevel,
    pub project_type: ProjectType,
    pub is_greenfield: bool,
    pub is_brownfield: bool,
    pub is_game_project: bool,
    pub estimated_stories: u32,
    pub estimated_epics: u32,
    pub technical_complexity: Complexity,
    pub domain_complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_hint: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
}

/// Ordered workflows the planner selected, with the routing rationale.
/// An empty `workflows` list together with non-empty `clarifying_questions`
/// means the caller must supply answers and re-plan.
#[derive(Debug, Clone)]
pub struct WorkflowSequence {
    pub scale_level: ScaleLevel,
    pub project_type: ProjectType,
    pub workflows: Vec<WorkflowDefinition>,
    pub routing_rationale: String,
    pub phase_breakdown: Vec<(String, Vec<String>)>,
    pub jit_tech_specs: bool,
    pub estimated_stories: u32,
    pub estimated_epics: u32,
    pub clarifying_questions: Vec<String>,
}

impl WorkflowSequence {
    pub fn needs_clarification(&self) -> bool {
        self.workflows.is_empty() && !self.clarifying_questions.is_empty()
    }
}

/// Mutable context threaded through a sequence execution.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    pub initial_prompt: String,
    pub project_root: PathBuf,
    pub scale_level: Option<ScaleLevel>,
    pub project_type: Option<ProjectType>,
    pub params: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    /// Ceremony outcomes appended as the story loop progresses.
    pub ceremonies: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_name: String,
    pub agent: String,
    pub status: StepStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub artifacts_created: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub retries: u32,
}

impl StepResult {
    pub fn started(step_name: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            agent: agent_for_workflow(step_name).to_string(),
            status: StepStatus::InProgress,
            output: String::new(),
            error_message: None,
            artifacts_created: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            retries: 0,
        }
    }

    pub fn finalize(&mut self) {
        let completed = Utc::now();
        self.completed_at = Some(completed);
        self.duration_ms = Some((completed - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SequenceResult {
    pub sequence_id: String,
    pub workflow_name: String,
    pub initial_prompt: String,
    pub status: WorkflowRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_artifacts: usize,
}

/// Which agent role owns a workflow. The mapping follows workflow naming
/// conventions; anything unrecognized falls to the orchestrator itself.
pub fn agent_for_workflow(workflow_name: &str) -> &'static str {
    let name = workflow_name.to_lowercase();
    if name.contains("prd") {
        "pm"
    } else if name.contains("architecture") || name.contains("tech-spec") {
        "architect"
    } else if name.contains("story") && name.contains("create") {
        "scrum"
    } else if name.contains("implement") || name.contains("dev") {
        "dev"
    } else if name.contains("test") || name.contains("qa") {
        "qa"
    } else if name.contains("ux") || name.contains("design") {
        "ux"
    } else if name.contains("brief") || name.contains("research") {
        "analyst"
    } else {
        "orchestrator"
    }
}

pub fn participants_for(ceremony_type: CeremonyType) -> Vec<String> {
    let roles: &[&str] = match ceremony_type {
        CeremonyType::Planning => &["pm", "architect", "scrum"],
        CeremonyType::Standup => &["scrum", "dev", "qa"],
        CeremonyType::Retrospective => &["pm", "architect", "ux", "scrum", "dev", "qa"],
    };
    roles.iter().map(|r| r.to_string()).collect()
}
