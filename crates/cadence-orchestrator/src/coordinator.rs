use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cadence_core::{EventBus, WorkflowDefinition, WorkflowExecutor};
use cadence_store::StateStore;
use cadence_types::{
    Event, EventType, RunOutput, StepRecord, WorkflowRun, WorkflowRunStatus,
};

use crate::artifacts::ArtifactManager;
use crate::ceremony::{
    CeremonyFailureHandler, CeremonyFailurePolicy, CeremonyOrchestrator, CeremonyTriggerEngine,
    TriggerContext,
};
use crate::model::{
    participants_for, SequenceResult, StepResult, StepStatus, WorkflowContext, WorkflowSequence,
};
use crate::quality_gate::QualityGateManager;

/// One unit of work handed to the agent runtime: the workflow, its scope,
/// the rendered instructions, and the variables they were rendered with.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub workflow: WorkflowDefinition,
    pub epic: i64,
    pub story: i64,
    pub instructions: String,
    pub variables: std::collections::BTreeMap<String, String>,
}

/// The single boundary to the external agent runtime: a callback yielding
/// a lazy, finite stream of output chunks. A non-empty stream is success;
/// an error item is a retryable failure.
pub type AgentExecutor =
    Arc<dyn Fn(AgentTask) -> BoxStream<'static, anyhow::Result<String>> + Send + Sync>;

const STORY_LOOP_WORKFLOWS: [&str; 3] = ["create-story", "dev-story", "story-done"];
const DEFAULT_STORY_CAP: u32 = 100;

#[derive(Clone)]
pub struct CeremonySuite {
    pub triggers: Arc<CeremonyTriggerEngine>,
    pub orchestrator: Arc<CeremonyOrchestrator>,
    pub failures: Arc<CeremonyFailureHandler>,
}

/// Drives a workflow sequence: setup phase first, then the story loop.
/// Each step is retried with exponential backoff, snapshots the
/// filesystem around the agent call, and publishes lifecycle events.
pub struct WorkflowCoordinator {
    event_bus: EventBus,
    agent_executor: AgentExecutor,
    executor: Arc<WorkflowExecutor>,
    store: Arc<StateStore>,
    artifacts: Arc<ArtifactManager>,
    quality_gate: Arc<QualityGateManager>,
    ceremonies: Option<CeremonySuite>,
    max_retries: u32,
    backoff_base: Duration,
    story_cap: u32,
    step_deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl WorkflowCoordinator {
    pub fn new(
        event_bus: EventBus,
        agent_executor: AgentExecutor,
        executor: Arc<WorkflowExecutor>,
        store: Arc<StateStore>,
        artifacts: Arc<ArtifactManager>,
        quality_gate: Arc<QualityGateManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            event_bus,
            agent_executor,
            executor,
            store,
            artifacts,
            quality_gate,
            ceremonies: None,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            story_cap: DEFAULT_STORY_CAP,
            step_deadline: None,
            cancel,
        }
    }

    pub fn with_ceremonies(mut self, suite: CeremonySuite) -> Self {
        self.ceremonies = Some(suite);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_story_cap(mut self, story_cap: u32) -> Self {
        self.story_cap = story_cap.max(1);
        self
    }

    /// Per-step agent-call deadline; unbounded when unset.
    pub fn with_step_deadline(mut self, deadline: Duration) -> Self {
        self.step_deadline = Some(deadline);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn execute_sequence(
        &self,
        sequence: &WorkflowSequence,
        context: &mut WorkflowContext,
    ) -> SequenceResult {
        let sequence_id = format!("seq_{}", Utc::now().format("%Y%m%d_%H%M%S%3f"));
        let mut result = SequenceResult {
            sequence_id: sequence_id.clone(),
            workflow_name: sequence
                .workflows
                .first()
                .map(|w| w.name.clone())
                .unwrap_or_else(|| "empty-sequence".to_string()),
            initial_prompt: context.initial_prompt.clone(),
            status: WorkflowRunStatus::Running,
            error_message: None,
            step_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            total_artifacts: 0,
        };

        if sequence.workflows.is_empty() {
            result.status = WorkflowRunStatus::Failed;
            result.error_message = Some("Empty workflow sequence".to_string());
            result.completed_at = Some(Utc::now());
            tracing::warn!("empty workflow sequence");
            self.event_bus.publish(Event::new(
                EventType::WorkflowSequenceFailed,
                json!({"sequence_id": sequence_id, "error": "Empty workflow sequence"}),
            ));
            return result;
        }

        self.event_bus.publish(Event::new(
            EventType::WorkflowSequenceStarted,
            json!({
                "sequence_id": sequence_id,
                "workflow_count": sequence.workflows.len(),
            }),
        ));
        tracing::info!(
            sequence_id,
            workflow_count = sequence.workflows.len(),
            scale_level = sequence.scale_level.value(),
            "workflow sequence started"
        );

        let (setup, story): (Vec<_>, Vec<_>) = sequence
            .workflows
            .iter()
            .partition(|w| !STORY_LOOP_WORKFLOWS.contains(&w.name.to_lowercase().as_str()));

        let mut step_number = 1u32;
        let total_steps = sequence.workflows.len() as u32;

        tracing::info!(setup_workflows = setup.len(), "setup phase starting");
        for workflow in setup {
            if self.cancel.is_cancelled() {
                result.status = WorkflowRunStatus::Cancelled;
                return self.finalize(result);
            }
            let step = self
                .execute_workflow(workflow, step_number, total_steps, context, 1, 1)
                .await;
            step_number += 1;
            let failed = step.status == StepStatus::Failed;
            let cancelled = step.status == StepStatus::Cancelled;
            let step_error = step.error_message.clone();
            let step_name = step.step_name.clone();
            result.step_results.push(step);

            if cancelled {
                result.status = WorkflowRunStatus::Cancelled;
                return self.finalize(result);
            }
            if failed {
                let error = format!(
                    "Setup phase failed at {step_name}: {}",
                    step_error.unwrap_or_default()
                );
                tracing::error!(step = step_name, "workflow step failed");
                result.status = WorkflowRunStatus::Failed;
                result.error_message = Some(error.clone());
                self.event_bus.publish(Event::new(
                    EventType::WorkflowSequenceFailed,
                    json!({
                        "sequence_id": sequence_id,
                        "failed_at_step": step_number - 1,
                        "error": error,
                    }),
                ));
                return self.finalize(result);
            }
        }

        if !story.is_empty() {
            self.execute_story_loop(
                &story,
                sequence,
                context,
                &mut result,
                &sequence_id,
                step_number,
            )
            .await;
        }

        if result.status == WorkflowRunStatus::Running {
            result.status = WorkflowRunStatus::Completed;
            result.completed_at = Some(Utc::now());
            let duration_seconds = (Utc::now() - result.started_at).num_milliseconds() as f64
                / 1000.0;
            self.event_bus.publish(Event::new(
                EventType::WorkflowSequenceCompleted,
                json!({
                    "sequence_id": sequence_id,
                    "duration_seconds": duration_seconds,
                    "total_steps": result.step_results.len(),
                }),
            ));
            tracing::info!(
                sequence_id,
                steps = result.step_results.len(),
                "workflow sequence completed"
            );
        }

        self.finalize(result)
    }

    fn finalize(&self, mut result: SequenceResult) -> SequenceResult {
        if result.completed_at.is_none() {
            result.completed_at = Some(Utc::now());
        }
        result.total_artifacts = result
            .step_results
            .iter()
            .map(|s| s.artifacts_created.len())
            .sum();
        result
    }

    async fn execute_story_loop(
        &self,
        story_workflows: &[&WorkflowDefinition],
        sequence: &WorkflowSequence,
        context: &mut WorkflowContext,
        result: &mut SequenceResult,
        sequence_id: &str,
        starting_step_number: u32,
    ) {
        let find = |name: &str| {
            story_workflows
                .iter()
                .find(|w| w.name.eq_ignore_ascii_case(name))
                .copied()
        };
        let Some(create_story) = find("create-story") else {
            tracing::warn!("story loop skipped: missing create-story workflow");
            return;
        };
        let Some(dev_story) = find("dev-story") else {
            tracing::warn!("story loop skipped: missing dev-story workflow");
            return;
        };
        let story_done = find("story-done");

        let estimated = sequence.estimated_stories.max(1);
        let max_stories = estimated.min(self.story_cap);
        let total_steps = max_stories * 3;
        let epic = 1i64;
        tracing::info!(
            estimated_stories = estimated,
            max_stories,
            "story loop starting"
        );

        let mut step_number = starting_step_number;

        // Epic-start ceremonies (planning, at scale >= 3) before any story.
        if self
            .run_ceremonies(sequence, context, epic, None, 0, max_stories, result)
            .await
            .is_err()
        {
            self.mark_sequence_failed(result, sequence_id, step_number, "planning ceremony failed");
            return;
        }

        for story_num in 1..=max_stories {
            if self.cancel.is_cancelled() {
                result.status = WorkflowRunStatus::Cancelled;
                return;
            }
            tracing::info!(story = story_num, total = max_stories, "story loop iteration");

            for workflow in [create_story, dev_story] {
                let step = self
                    .execute_workflow(
                        workflow,
                        step_number,
                        total_steps,
                        context,
                        epic,
                        story_num as i64,
                    )
                    .await;
                step_number += 1;
                let status = step.status;
                let step_error = step.error_message.clone();
                result.step_results.push(step);

                match status {
                    StepStatus::Cancelled => {
                        result.status = WorkflowRunStatus::Cancelled;
                        return;
                    }
                    StepStatus::Failed => {
                        let error = format!(
                            "Story loop failed at story {story_num}, workflow {}: {}",
                            workflow.name,
                            step_error.unwrap_or_default()
                        );
                        tracing::error!(story = story_num, workflow = workflow.name, "story loop failed");
                        self.mark_sequence_failed(result, sequence_id, step_number - 1, &error);
                        return;
                    }
                    _ => {}
                }
            }

            if let Some(done) = story_done {
                let step = self
                    .execute_workflow(done, step_number, total_steps, context, epic, story_num as i64)
                    .await;
                step_number += 1;
                if step.status == StepStatus::Failed {
                    // story-done is advisory; the loop carries on.
                    tracing::warn!(story = story_num, "story-done failed but continuing");
                }
                result.step_results.push(step);
            }

            if self
                .run_ceremonies(
                    sequence,
                    context,
                    epic,
                    Some(story_num as i64),
                    story_num,
                    max_stories,
                    result,
                )
                .await
                .is_err()
            {
                self.mark_sequence_failed(
                    result,
                    sequence_id,
                    step_number,
                    "ceremony failure aborted the workflow",
                );
                return;
            }

            tracing::info!(
                story = story_num,
                remaining = max_stories - story_num,
                "story complete"
            );
        }

        tracing::info!(total_stories = max_stories, "story loop completed");
    }

    fn mark_sequence_failed(
        &self,
        result: &mut SequenceResult,
        sequence_id: &str,
        failed_at_step: u32,
        error: &str,
    ) {
        result.status = WorkflowRunStatus::Failed;
        result.error_message = Some(error.to_string());
        self.event_bus.publish(Event::new(
            EventType::WorkflowSequenceFailed,
            json!({
                "sequence_id": sequence_id,
                "failed_at_step": failed_at_step,
                "error": error,
            }),
        ));
    }

    /// Evaluate the trigger table at this progress point and run whatever
    /// fires. Returns `Err` only for an aborting policy (planning).
    async fn run_ceremonies(
        &self,
        sequence: &WorkflowSequence,
        context: &mut WorkflowContext,
        epic_num: i64,
        story_num: Option<i64>,
        stories_completed: u32,
        total_stories: u32,
        result: &SequenceResult,
    ) -> Result<(), ()> {
        let Some(suite) = &self.ceremonies else {
            return Ok(());
        };

        let trigger_context = TriggerContext {
            epic_num,
            story_num,
            scale_level: sequence.scale_level,
            stories_completed,
            total_stories,
            quality_gates_passed: result
                .step_results
                .iter()
                .all(|s| s.status != StepStatus::Failed),
            failure_count: result
                .step_results
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count() as u32,
            project_type: sequence.project_type,
            last_standup: None,
        };

        let fired = match suite.triggers.evaluate_all_triggers(&trigger_context).await {
            Ok(fired) => fired,
            Err(error) => {
                tracing::warn!(error = %error, "trigger evaluation failed; skipping ceremonies");
                return Ok(());
            }
        };

        for ceremony_type in fired {
            let held = suite
                .orchestrator
                .hold_ceremony(
                    ceremony_type,
                    epic_num,
                    participants_for(ceremony_type),
                    story_num,
                    json!({
                        "initial_prompt": context.initial_prompt,
                        "stories_completed": stories_completed,
                        "total_stories": total_stories,
                        "feature_name": context.metadata.get("feature_name"),
                    }),
                )
                .await;

            match held {
                Ok(outcome) => {
                    suite.failures.reset_failures(ceremony_type, epic_num);
                    if let Err(error) = suite
                        .triggers
                        .record_ceremony_execution(epic_num, ceremony_type, true)
                        .await
                    {
                        tracing::warn!(error = %error, "ceremony execution record failed");
                    }
                    context.ceremonies.push(outcome.summary());
                }
                Err(error) => {
                    if let Err(record_error) = suite
                        .triggers
                        .record_ceremony_execution(epic_num, ceremony_type, false)
                        .await
                    {
                        tracing::warn!(error = %record_error, "ceremony execution record failed");
                    }
                    let policy = suite.failures.handle_failure(
                        ceremony_type,
                        epic_num,
                        &anyhow::Error::new(error),
                    );
                    match policy {
                        CeremonyFailurePolicy::Abort => {
                            tracing::error!(
                                ceremony_type = ceremony_type.as_str(),
                                "workflow aborted due to ceremony failure"
                            );
                            return Err(());
                        }
                        CeremonyFailurePolicy::Skip => {
                            tracing::error!(
                                epic_num,
                                "circuit open; remaining ceremonies disabled for this epic"
                            );
                            break;
                        }
                        CeremonyFailurePolicy::Continue | CeremonyFailurePolicy::Retry => {
                            tracing::warn!(
                                ceremony_type = ceremony_type.as_str(),
                                "ceremony failed; continuing"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Execute one workflow step with retry and exponential backoff.
    pub async fn execute_workflow(
        &self,
        workflow: &WorkflowDefinition,
        step_number: u32,
        total_steps: u32,
        context: &WorkflowContext,
        epic: i64,
        story: i64,
    ) -> StepResult {
        let mut step = StepResult::started(&workflow.name);
        self.event_bus.publish(Event::new(
            EventType::WorkflowStepStarted,
            json!({
                "workflow_id": workflow.name,
                "step_number": step_number,
                "total_steps": total_steps,
            }),
        ));
        tracing::info!(
            workflow = workflow.name,
            step = step_number,
            agent = step.agent,
            "workflow step started"
        );

        let run_id = Uuid::new_v4().to_string();
        self.persist_run_started(&run_id, workflow, epic, story, &step).await;

        // Bind variables and render the instructions once; a resolution
        // failure is a validation error and is never retried.
        let mut params = context.params.clone();
        params.insert("epic".to_string(), epic.to_string());
        params.insert("story".to_string(), story.to_string());
        params.insert("epic_num".to_string(), epic.to_string());
        params.insert("story_num".to_string(), story.to_string());
        let task = match self
            .executor
            .resolve_variables(workflow, &params, Some(&context.metadata))
            .await
        {
            Ok(variables) => {
                let instructions = self
                    .executor
                    .render_template(&workflow.instructions(), &variables);
                AgentTask {
                    workflow: workflow.clone(),
                    epic,
                    story,
                    instructions,
                    variables,
                }
            }
            Err(error) => {
                tracing::error!(
                    workflow = workflow.name,
                    error = %error,
                    "variable resolution failed"
                );
                self.event_bus.publish(Event::new(
                    EventType::WorkflowStepFailed,
                    json!({
                        "workflow_id": workflow.name,
                        "step_number": step_number,
                        "error": error.to_string(),
                        "retry_count": 0,
                    }),
                ));
                step.status = StepStatus::Failed;
                step.error_message = Some(error.to_string());
                step.finalize();
                self.persist_run_finished(&run_id, &step, context).await;
                return step;
            }
        };

        let mut retry_count = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                step.status = StepStatus::Cancelled;
                step.error_message = Some("cancelled".to_string());
                break;
            }

            let before = self.artifacts.snapshot();
            match self.run_agent(task.clone()).await {
                Ok(chunks) => {
                    step.output = chunks.join("\n");
                    step.status = StepStatus::Success;

                    let after = self.artifacts.snapshot();
                    let detected = self.artifacts.detect(&before, &after);
                    self.artifacts
                        .register(
                            &detected,
                            &workflow.name,
                            epic,
                            story,
                            &step.agent,
                            phase_label(workflow.phase),
                            &context.params,
                        )
                        .await;
                    step.artifacts_created = detected
                        .iter()
                        .map(|p| p.to_string_lossy().to_string())
                        .collect();

                    self.quality_gate.validate_artifacts(&workflow.name, None);

                    step.finalize();
                    self.event_bus.publish(Event::new(
                        EventType::WorkflowStepCompleted,
                        json!({
                            "workflow_id": workflow.name,
                            "step_number": step_number,
                            "duration_seconds": step.duration_ms.unwrap_or(0) as f64 / 1000.0,
                            "artifacts": step.artifacts_created,
                        }),
                    ));
                    tracing::info!(
                        workflow = workflow.name,
                        retry_count,
                        "workflow step completed"
                    );
                    break;
                }
                Err(error) => {
                    retry_count += 1;
                    step.retries = retry_count;
                    tracing::warn!(
                        workflow = workflow.name,
                        retry_count,
                        max_retries = self.max_retries,
                        error = %error,
                        "workflow step failed"
                    );
                    self.event_bus.publish(Event::new(
                        EventType::WorkflowStepFailed,
                        json!({
                            "workflow_id": workflow.name,
                            "step_number": step_number,
                            "error": error.to_string(),
                            "retry_count": retry_count,
                        }),
                    ));

                    if retry_count > self.max_retries {
                        step.status = StepStatus::Failed;
                        step.error_message = Some(format!(
                            "Failed after {} retries: {error}",
                            self.max_retries
                        ));
                        tracing::error!(
                            workflow = workflow.name,
                            max_retries = self.max_retries,
                            "workflow step exhausted retries"
                        );
                        break;
                    }

                    let backoff = self.backoff_base * 2u32.saturating_pow(retry_count);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => {
                            step.status = StepStatus::Cancelled;
                            step.error_message = Some("cancelled".to_string());
                            break;
                        }
                    }
                }
            }
        }

        if step.completed_at.is_none() {
            step.finalize();
        }
        self.persist_run_finished(&run_id, &step, context).await;
        step
    }

    async fn run_agent(&self, task: AgentTask) -> anyhow::Result<Vec<String>> {
        let consume = async {
            let mut stream = (self.agent_executor)(task);
            let mut chunks = Vec::new();
            while let Some(item) = stream.next().await {
                chunks.push(item?);
            }
            Ok(chunks)
        };
        match self.step_deadline {
            Some(deadline) => tokio::time::timeout(deadline, consume)
                .await
                .unwrap_or_else(|_| {
                    Err(anyhow::anyhow!("agent call exceeded step deadline {deadline:?}"))
                }),
            None => consume.await,
        }
    }

    async fn persist_run_started(
        &self,
        run_id: &str,
        workflow: &WorkflowDefinition,
        epic: i64,
        story: i64,
        step: &StepResult,
    ) {
        if let Err(error) = self
            .store
            .ensure_epic(epic, &format!("Epic {epic}"), "mvp")
            .await
        {
            tracing::warn!(error = %error, "epic bookkeeping failed");
        }
        let run = WorkflowRun {
            workflow_id: run_id.to_string(),
            workflow_name: workflow.name.clone(),
            epic_num: Some(epic),
            story_num: Some(story),
            status: WorkflowRunStatus::Running,
            started_at: step.started_at,
            completed_at: None,
            duration_ms: None,
            output: RunOutput::default(),
            error_message: None,
        };
        if let Err(error) = self.store.insert_run(&run).await {
            tracing::warn!(error = %error, "workflow run persist failed");
        }
    }

    async fn persist_run_finished(
        &self,
        run_id: &str,
        step: &StepResult,
        context: &WorkflowContext,
    ) {
        let status = match step.status {
            StepStatus::Success => WorkflowRunStatus::Completed,
            StepStatus::Cancelled => WorkflowRunStatus::Cancelled,
            _ => WorkflowRunStatus::Failed,
        };
        let mut variables = serde_json::Map::new();
        for (key, value) in &context.params {
            variables.insert(key.clone(), json!(value));
        }
        let output = RunOutput {
            steps: vec![StepRecord {
                name: step.step_name.clone(),
                status: format!("{:?}", step.status).to_lowercase(),
                duration_ms: step.duration_ms,
                tool_calls: 0,
                outputs: if step.output.is_empty() {
                    Vec::new()
                } else {
                    vec![step.output.clone()]
                },
                started_at: step.started_at,
                completed_at: step.completed_at,
            }],
            variables,
            artifacts: step.artifacts_created.clone(),
            errors: step.error_message.clone().into_iter().collect(),
        };
        if let Err(error) = self
            .store
            .finish_run(run_id, status, &output, step.error_message.as_deref())
            .await
        {
            tracing::warn!(error = %error, "workflow run finish persist failed");
        }
    }
}

fn phase_label(phase: u8) -> &'static str {
    match phase {
        1 => "analysis",
        2 => "planning",
        3 => "solutioning",
        _ => "implementation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceremony::{CeremonyContext, CeremonyOutput, CeremonyRunner, GitStateManager};
    use async_trait::async_trait;
    use cadence_core::{ConfigFile, ConfigStore, STATE_DIR_NAME};
    use cadence_types::{ProjectType, ScaleLevel};
    use futures::stream;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: String::new(),
            phase: 4,
            variables: BTreeMap::new(),
            required_tools: Vec::new(),
            templates: BTreeMap::new(),
            output_file: None,
            installed_path: PathBuf::new(),
        }
    }

    fn sequence_of(names: &[&str], scale_level: ScaleLevel, estimated: u32) -> WorkflowSequence {
        WorkflowSequence {
            scale_level,
            project_type: ProjectType::Software,
            workflows: names.iter().map(|n| definition(n)).collect(),
            routing_rationale: String::new(),
            phase_breakdown: Vec::new(),
            jit_tech_specs: false,
            estimated_stories: estimated,
            estimated_epics: 1,
            clarifying_questions: Vec::new(),
        }
    }

    fn context() -> WorkflowContext {
        WorkflowContext {
            initial_prompt: "build a todo app".to_string(),
            ..WorkflowContext::default()
        }
    }

    fn ok_executor() -> AgentExecutor {
        Arc::new(|_task| {
            let items: Vec<anyhow::Result<String>> = vec![Ok("ok".to_string())];
            stream::iter(items).boxed()
        })
    }

    fn flaky_executor(failures: usize, attempts: Arc<AtomicUsize>) -> AgentExecutor {
        Arc::new(move |_task| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            let items: Vec<anyhow::Result<String>> = if n < failures {
                vec![Err(anyhow::anyhow!("agent unavailable"))]
            } else {
                vec![Ok("ok".to_string())]
            };
            stream::iter(items).boxed()
        })
    }

    type Captured = Arc<StdMutex<Vec<(EventType, Value)>>>;

    fn capture_events(bus: &EventBus) -> Captured {
        let captured: Captured = Arc::new(StdMutex::new(Vec::new()));
        for event_type in EventType::ALL {
            let captured = captured.clone();
            bus.subscribe(
                event_type,
                Arc::new(move |event: &Event| {
                    captured
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((event.event_type, event.data.clone()));
                    Ok(())
                }),
            );
        }
        captured
    }

    fn count(captured: &Captured, event_type: EventType) -> usize {
        captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(t, _)| *t == event_type)
            .count()
    }

    async fn build_coordinator(
        dir: &TempDir,
        executor: AgentExecutor,
    ) -> (Arc<StateStore>, EventBus, WorkflowCoordinator) {
        let store = Arc::new(
            StateStore::new(&dir.path().join(STATE_DIR_NAME).join("state.db"))
                .await
                .expect("store"),
        );
        let bus = EventBus::new();
        let artifacts = Arc::new(ArtifactManager::new(
            dir.path().to_path_buf(),
            vec!["docs".to_string()],
            Some(store.clone()),
        ));
        let gate = Arc::new(QualityGateManager::new(
            dir.path().to_path_buf(),
            bus.clone(),
            None,
        ));
        let workflow_executor = Arc::new(WorkflowExecutor::new(
            ConfigStore::from_file(dir.path(), ConfigFile::default()),
            None,
        ));
        let coordinator = WorkflowCoordinator::new(
            bus.clone(),
            executor,
            workflow_executor,
            store.clone(),
            artifacts,
            gate,
            CancellationToken::new(),
        )
        .with_retries(3, Duration::from_millis(1));
        (store, bus, coordinator)
    }

    struct OkCeremonyRunner;

    #[async_trait]
    impl CeremonyRunner for OkCeremonyRunner {
        async fn run(&self, context: &CeremonyContext) -> anyhow::Result<CeremonyOutput> {
            Ok(CeremonyOutput {
                transcript: format!("# {}\n", context.ceremony_type.as_str()),
                action_items: Vec::new(),
                learnings: Vec::new(),
                decisions: Vec::new(),
                metrics: Value::Null,
            })
        }
    }

    struct FailingCeremonyRunner;

    #[async_trait]
    impl CeremonyRunner for FailingCeremonyRunner {
        async fn run(&self, _context: &CeremonyContext) -> anyhow::Result<CeremonyOutput> {
            anyhow::bail!("ceremony runner unavailable")
        }
    }

    fn suite_with(
        store: Arc<StateStore>,
        bus: EventBus,
        dir: &TempDir,
        runner: Arc<dyn CeremonyRunner>,
    ) -> CeremonySuite {
        let orchestrator = CeremonyOrchestrator::new(
            store.clone(),
            runner,
            bus,
            dir.path(),
            GitStateManager::new(dir.path(), false),
        )
        .with_retry(1, Duration::from_millis(1));
        CeremonySuite {
            triggers: Arc::new(CeremonyTriggerEngine::new(store)),
            orchestrator: Arc::new(orchestrator),
            failures: Arc::new(CeremonyFailureHandler::new()),
        }
    }

    #[tokio::test]
    async fn happy_path_level1_runs_setup_then_story_loop() {
        let dir = TempDir::new().expect("tempdir");
        let (_store, bus, coordinator) = build_coordinator(&dir, ok_executor()).await;
        let captured = capture_events(&bus);

        let sequence = sequence_of(
            &["tech-spec", "create-story", "dev-story", "story-done"],
            ScaleLevel::Level1,
            3,
        );
        let mut ctx = context();
        let result = coordinator.execute_sequence(&sequence, &mut ctx).await;

        assert_eq!(result.status, WorkflowRunStatus::Completed);
        // One setup step plus three stories of three workflows each.
        assert_eq!(result.step_results.len(), 10);
        assert!(result
            .step_results
            .iter()
            .all(|s| s.status == StepStatus::Success));

        assert_eq!(count(&captured, EventType::WorkflowSequenceStarted), 1);
        assert_eq!(count(&captured, EventType::WorkflowSequenceCompleted), 1);
        assert_eq!(count(&captured, EventType::WorkflowStepFailed), 0);
        // Step accounting: one terminal event per step result.
        assert_eq!(
            count(&captured, EventType::WorkflowStepCompleted),
            result.step_results.len()
        );

        let events = captured.lock().unwrap_or_else(|e| e.into_inner());
        let started_id = events
            .iter()
            .find(|(t, _)| *t == EventType::WorkflowSequenceStarted)
            .and_then(|(_, d)| d.get("sequence_id").cloned());
        let completed_id = events
            .iter()
            .find(|(t, _)| *t == EventType::WorkflowSequenceCompleted)
            .and_then(|(_, d)| d.get("sequence_id").cloned());
        assert_eq!(started_id, completed_id);
        assert!(started_id.is_some());
    }

    #[tokio::test]
    async fn step_retries_then_succeeds_after_two_failures() {
        let dir = TempDir::new().expect("tempdir");
        let attempts = Arc::new(AtomicUsize::new(0));
        let (_store, bus, coordinator) =
            build_coordinator(&dir, flaky_executor(2, attempts.clone())).await;
        let captured = capture_events(&bus);

        let sequence = sequence_of(&["tech-spec"], ScaleLevel::Level0, 1);
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.step_results[0].status, StepStatus::Success);
        assert_eq!(result.step_results[0].retries, 2);

        // Two failures precede the completion.
        let events = captured.lock().unwrap_or_else(|e| e.into_inner());
        let step_events: Vec<EventType> = events
            .iter()
            .map(|(t, _)| *t)
            .filter(|t| {
                matches!(
                    t,
                    EventType::WorkflowStepCompleted | EventType::WorkflowStepFailed
                )
            })
            .collect();
        assert_eq!(
            step_events,
            vec![
                EventType::WorkflowStepFailed,
                EventType::WorkflowStepFailed,
                EventType::WorkflowStepCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn empty_sequence_fails_immediately() {
        let dir = TempDir::new().expect("tempdir");
        let (_store, bus, coordinator) = build_coordinator(&dir, ok_executor()).await;
        let captured = capture_events(&bus);

        let sequence = sequence_of(&[], ScaleLevel::Level1, 1);
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Failed);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Empty workflow sequence")
        );
        assert_eq!(count(&captured, EventType::WorkflowSequenceFailed), 1);
        assert_eq!(count(&captured, EventType::WorkflowSequenceStarted), 0);
    }

    #[tokio::test]
    async fn story_loop_is_bounded_by_the_safety_cap() {
        let dir = TempDir::new().expect("tempdir");
        let (_store, _bus, coordinator) = build_coordinator(&dir, ok_executor()).await;
        let coordinator = coordinator.with_story_cap(4);

        let sequence = sequence_of(
            &["create-story", "dev-story", "story-done"],
            ScaleLevel::Level1,
            50,
        );
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Completed);
        assert_eq!(result.step_results.len(), 12);
    }

    #[tokio::test]
    async fn zero_max_retries_makes_exactly_one_attempt() {
        let dir = TempDir::new().expect("tempdir");
        let attempts = Arc::new(AtomicUsize::new(0));
        let (_store, bus, coordinator) =
            build_coordinator(&dir, flaky_executor(usize::MAX, attempts.clone())).await;
        let coordinator = coordinator.with_retries(0, Duration::from_millis(1));
        let captured = capture_events(&bus);

        let sequence = sequence_of(&["tech-spec"], ScaleLevel::Level0, 1);
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(count(&captured, EventType::WorkflowStepFailed), 1);
    }

    #[tokio::test]
    async fn story_done_failure_is_warned_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let executor: AgentExecutor = Arc::new(|task| {
            let items: Vec<anyhow::Result<String>> = if task.workflow.name == "story-done" {
                vec![Err(anyhow::anyhow!("wrap-up agent crashed"))]
            } else {
                vec![Ok("ok".to_string())]
            };
            stream::iter(items).boxed()
        });
        let (_store, _bus, coordinator) = build_coordinator(&dir, executor).await;
        let coordinator = coordinator.with_retries(0, Duration::from_millis(1));

        let sequence = sequence_of(
            &["create-story", "dev-story", "story-done"],
            ScaleLevel::Level1,
            2,
        );
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Completed);
        let done_steps: Vec<_> = result
            .step_results
            .iter()
            .filter(|s| s.step_name == "story-done")
            .collect();
        assert_eq!(done_steps.len(), 2);
        assert!(done_steps.iter().all(|s| s.status == StepStatus::Failed));
    }

    #[tokio::test]
    async fn setup_failure_fails_the_whole_sequence() {
        let dir = TempDir::new().expect("tempdir");
        let executor: AgentExecutor = Arc::new(|task| {
            let items: Vec<anyhow::Result<String>> = if task.workflow.name == "tech-spec" {
                vec![Err(anyhow::anyhow!("no spec for you"))]
            } else {
                vec![Ok("ok".to_string())]
            };
            stream::iter(items).boxed()
        });
        let (_store, bus, coordinator) = build_coordinator(&dir, executor).await;
        let coordinator = coordinator.with_retries(0, Duration::from_millis(1));
        let captured = capture_events(&bus);

        let sequence = sequence_of(
            &["tech-spec", "create-story", "dev-story"],
            ScaleLevel::Level1,
            2,
        );
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Failed);
        assert_eq!(result.step_results.len(), 1);
        assert!(result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .starts_with("Setup phase failed at tech-spec"));
        assert_eq!(count(&captured, EventType::WorkflowSequenceFailed), 1);
    }

    #[tokio::test]
    async fn step_deadline_turns_a_hung_agent_into_a_failure() {
        let dir = TempDir::new().expect("tempdir");
        let executor: AgentExecutor =
            Arc::new(|_task| stream::pending::<anyhow::Result<String>>().boxed());
        let (_store, bus, coordinator) = build_coordinator(&dir, executor).await;
        let coordinator = coordinator
            .with_retries(0, Duration::from_millis(1))
            .with_step_deadline(Duration::from_millis(20));
        let captured = capture_events(&bus);

        let sequence = sequence_of(&["tech-spec"], ScaleLevel::Level0, 1);
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Failed);
        assert_eq!(count(&captured, EventType::WorkflowStepFailed), 1);
        assert!(result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("deadline"));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_sequence() {
        let dir = TempDir::new().expect("tempdir");
        let (_store, _bus, coordinator) = build_coordinator(&dir, ok_executor()).await;
        coordinator.cancellation_token().cancel();

        let sequence = sequence_of(&["tech-spec"], ScaleLevel::Level0, 1);
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;
        assert_eq!(result.status, WorkflowRunStatus::Cancelled);
    }

    #[tokio::test]
    async fn detected_artifacts_land_on_the_step_result() {
        let dir = TempDir::new().expect("tempdir");
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(&docs).expect("mkdir");
        let docs_for_agent = docs.clone();
        let executor: AgentExecutor = Arc::new(move |_task| {
            std::fs::write(docs_for_agent.join("PRD.md"), "# PRD").expect("agent writes");
            let items: Vec<anyhow::Result<String>> = vec![Ok("wrote prd".to_string())];
            stream::iter(items).boxed()
        });
        let (store, _bus, coordinator) = build_coordinator(&dir, executor).await;

        let sequence = sequence_of(&["prd"], ScaleLevel::Level2, 1);
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Completed);
        assert_eq!(result.step_results[0].artifacts_created, vec!["docs/PRD.md"]);
        assert_eq!(result.total_artifacts, 1);
        assert_eq!(store.artifact_count("prd").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn ceremonies_fire_through_the_story_loop() {
        let dir = TempDir::new().expect("tempdir");
        let (store, bus, coordinator) = build_coordinator(&dir, ok_executor()).await;
        let suite = suite_with(store.clone(), bus.clone(), &dir, Arc::new(OkCeremonyRunner));
        let coordinator = coordinator.with_ceremonies(suite);

        // Level 3: planning at epic start, standup every 2 stories,
        // retrospective at completion.
        let sequence = sequence_of(&["create-story", "dev-story"], ScaleLevel::Level3, 2);
        let mut ctx = context();
        let result = coordinator.execute_sequence(&sequence, &mut ctx).await;

        assert_eq!(result.status, WorkflowRunStatus::Completed);
        let held: Vec<String> = ctx
            .ceremonies
            .iter()
            .filter_map(|c| c.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .collect();
        assert_eq!(held, vec!["planning", "standup", "retrospective"]);
        assert_eq!(store.list_ceremonies(1).await.expect("rows").len(), 3);
    }

    #[tokio::test]
    async fn planning_ceremony_failure_aborts_the_sequence() {
        let dir = TempDir::new().expect("tempdir");
        let (store, bus, coordinator) = build_coordinator(&dir, ok_executor()).await;
        let suite = suite_with(
            store.clone(),
            bus.clone(),
            &dir,
            Arc::new(FailingCeremonyRunner),
        );
        let coordinator = coordinator.with_ceremonies(suite);

        let sequence = sequence_of(&["create-story", "dev-story"], ScaleLevel::Level3, 2);
        let result = coordinator
            .execute_sequence(&sequence, &mut context())
            .await;

        assert_eq!(result.status, WorkflowRunStatus::Failed);
        assert!(result.step_results.is_empty());
        assert!(store.list_ceremonies(1).await.expect("rows").is_empty());
    }
}
