use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use cadence_core::{EventBus, STATE_DIR_NAME};
use cadence_store::StateStore;
use cadence_types::{CeremonyRecord, CeremonyType, Epic, Event, EventType, Story};

use super::git::GitStateManager;

const CEREMONIES_DIR_NAME: &str = "ceremonies";

#[derive(Debug, Error)]
pub enum CeremonyError {
    #[error("ceremony preparation failed: {0}")]
    Preparation(String),

    #[error("ceremony execution failed: {0}")]
    Execution(String),

    #[error("ceremony recording failed: {0}")]
    Recording(String),

    #[error("ceremony timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeremonyPhase {
    Idle,
    Preparing,
    Executing,
    Recording,
    Done,
    RolledBack,
}

/// Everything the external agent runtime needs to hold the ceremony.
#[derive(Debug, Clone)]
pub struct CeremonyContext {
    pub ceremony_type: CeremonyType,
    pub epic_num: i64,
    pub story_num: Option<i64>,
    pub participants: Vec<String>,
    pub agenda: Vec<String>,
    pub epic: Option<Epic>,
    pub stories: Vec<Story>,
    pub recent_ceremonies: Vec<CeremonyRecord>,
    pub additional_context: Value,
}

/// What the agent runtime produced during the ceremony.
#[derive(Debug, Clone, Default)]
pub struct CeremonyOutput {
    pub transcript: String,
    pub action_items: Vec<String>,
    pub learnings: Vec<String>,
    pub decisions: Vec<String>,
    pub metrics: Value,
}

/// Boundary to the external agent runtime that actually runs the
/// multi-agent conversation.
#[async_trait]
pub trait CeremonyRunner: Send + Sync {
    async fn run(&self, context: &CeremonyContext) -> anyhow::Result<CeremonyOutput>;
}

#[derive(Debug, Clone)]
pub struct CeremonyOutcome {
    pub ceremony_id: String,
    pub ceremony_type: CeremonyType,
    pub epic_num: i64,
    pub transcript_path: String,
    pub action_items: Vec<String>,
    pub learnings: Vec<String>,
}

impl CeremonyOutcome {
    pub fn summary(&self) -> Value {
        json!({
            "type": self.ceremony_type,
            "id": self.ceremony_id,
            "transcript_path": self.transcript_path,
            "action_items": self.action_items,
            "learnings": self.learnings,
        })
    }
}

/// Holds a ceremony as a prepare -> execute -> record transaction.
///
/// Recording touches three resources: the ceremony row, the transcript
/// file, and (when auto-commit is on) the git working tree. The pre-
/// transaction head is captured first and every partial effect is undone
/// on failure, so a failed attempt leaves no row, no transcript, and an
/// unchanged head.
pub struct CeremonyOrchestrator {
    store: std::sync::Arc<StateStore>,
    runner: std::sync::Arc<dyn CeremonyRunner>,
    event_bus: EventBus,
    project_root: PathBuf,
    git: GitStateManager,
    max_attempts: u32,
    backoff_base: Duration,
    attempt_deadline: Duration,
    phase: Mutex<CeremonyPhase>,
}

impl CeremonyOrchestrator {
    pub fn new(
        store: std::sync::Arc<StateStore>,
        runner: std::sync::Arc<dyn CeremonyRunner>,
        event_bus: EventBus,
        project_root: &Path,
        git: GitStateManager,
    ) -> Self {
        Self {
            store,
            runner,
            event_bus,
            project_root: project_root.to_path_buf(),
            git,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            attempt_deadline: Duration::from_secs(600),
            phase: Mutex::new(CeremonyPhase::Idle),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_deadline(mut self, attempt_deadline: Duration) -> Self {
        self.attempt_deadline = attempt_deadline;
        self
    }

    pub fn phase(&self) -> CeremonyPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: CeremonyPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    pub fn ceremonies_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR_NAME).join(CEREMONIES_DIR_NAME)
    }

    /// Single entry point. Transient failures are retried with exponential
    /// backoff; the final failure escapes to the caller.
    pub async fn hold_ceremony(
        &self,
        ceremony_type: CeremonyType,
        epic_num: i64,
        participants: Vec<String>,
        story_num: Option<i64>,
        additional_context: Value,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(
                self.attempt_deadline,
                self.attempt_ceremony(
                    ceremony_type,
                    epic_num,
                    participants.clone(),
                    story_num,
                    additional_context.clone(),
                ),
            )
            .await
            .unwrap_or(Err(CeremonyError::Timeout(self.attempt_deadline)));

            match result {
                Ok(outcome) => {
                    tracing::info!(
                        ceremony_type = ceremony_type.as_str(),
                        epic_num,
                        attempt,
                        "ceremony executed successfully"
                    );
                    return Ok(outcome);
                }
                Err(error) if attempt < self.max_attempts => {
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        ceremony_type = ceremony_type.as_str(),
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "ceremony attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    tracing::error!(
                        ceremony_type = ceremony_type.as_str(),
                        attempts = attempt,
                        error = %error,
                        "ceremony failed all attempts"
                    );
                    return Err(error);
                }
            }
        }
    }

    // Legacy per-type entry points; each delegates to hold_ceremony.

    pub async fn hold_planning(
        &self,
        epic_num: i64,
        participants: Vec<String>,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        self.hold_ceremony(CeremonyType::Planning, epic_num, participants, None, Value::Null)
            .await
    }

    pub async fn hold_standup(
        &self,
        epic_num: i64,
        participants: Vec<String>,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        self.hold_ceremony(CeremonyType::Standup, epic_num, participants, None, Value::Null)
            .await
    }

    pub async fn hold_retrospective(
        &self,
        epic_num: i64,
        participants: Vec<String>,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        self.hold_ceremony(
            CeremonyType::Retrospective,
            epic_num,
            participants,
            None,
            Value::Null,
        )
        .await
    }

    async fn attempt_ceremony(
        &self,
        ceremony_type: CeremonyType,
        epic_num: i64,
        participants: Vec<String>,
        story_num: Option<i64>,
        additional_context: Value,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        self.set_phase(CeremonyPhase::Preparing);
        let context = match self
            .prepare(ceremony_type, epic_num, story_num, participants, additional_context)
            .await
        {
            Ok(context) => context,
            Err(error) => {
                self.fail(ceremony_type, epic_num, &error);
                return Err(error);
            }
        };

        self.set_phase(CeremonyPhase::Executing);
        self.event_bus.publish(Event::new(
            EventType::CeremonyStarted,
            json!({
                "ceremony_type": ceremony_type,
                "epic_num": epic_num,
                "participants": context.participants,
            }),
        ));
        let output = match self.runner.run(&context).await {
            Ok(output) => output,
            Err(error) => {
                let error = CeremonyError::Execution(error.to_string());
                self.fail(ceremony_type, epic_num, &error);
                return Err(error);
            }
        };

        self.set_phase(CeremonyPhase::Recording);
        match self.record(&context, &output).await {
            Ok(outcome) => {
                self.set_phase(CeremonyPhase::Done);
                self.event_bus.publish(Event::new(
                    EventType::CeremonyCompleted,
                    json!({
                        "ceremony_id": outcome.ceremony_id,
                        "ceremony_type": ceremony_type,
                        "epic_num": epic_num,
                        "transcript_path": outcome.transcript_path,
                        "action_items": outcome.action_items.len(),
                        "learnings": outcome.learnings.len(),
                    }),
                ));
                self.set_phase(CeremonyPhase::Idle);
                Ok(outcome)
            }
            Err(error) => {
                self.fail(ceremony_type, epic_num, &error);
                Err(error)
            }
        }
    }

    fn fail(&self, ceremony_type: CeremonyType, epic_num: i64, error: &CeremonyError) {
        self.set_phase(CeremonyPhase::RolledBack);
        self.event_bus.publish(Event::new(
            EventType::CeremonyFailed,
            json!({
                "ceremony_type": ceremony_type,
                "epic_num": epic_num,
                "error": error.to_string(),
            }),
        ));
        self.set_phase(CeremonyPhase::Idle);
    }

    async fn prepare(
        &self,
        ceremony_type: CeremonyType,
        epic_num: i64,
        story_num: Option<i64>,
        participants: Vec<String>,
        additional_context: Value,
    ) -> Result<CeremonyContext, CeremonyError> {
        let epic = self
            .store
            .get_epic(epic_num)
            .await
            .map_err(|e| CeremonyError::Preparation(e.to_string()))?;
        let stories = self
            .store
            .list_stories(epic_num)
            .await
            .map_err(|e| CeremonyError::Preparation(e.to_string()))?;
        let mut recent_ceremonies = self
            .store
            .list_ceremonies(epic_num)
            .await
            .map_err(|e| CeremonyError::Preparation(e.to_string()))?;
        // Only the tail is relevant context.
        if recent_ceremonies.len() > 3 {
            recent_ceremonies.drain(..recent_ceremonies.len() - 3);
        }

        Ok(CeremonyContext {
            ceremony_type,
            epic_num,
            story_num,
            participants,
            agenda: agenda_for(ceremony_type),
            epic,
            stories,
            recent_ceremonies,
            additional_context,
        })
    }

    /// The atomic part: head first, then the row, then the transcript,
    /// then the commit. Any failure undoes everything already done.
    async fn record(
        &self,
        context: &CeremonyContext,
        output: &CeremonyOutput,
    ) -> Result<CeremonyOutcome, CeremonyError> {
        let head = if self.git.auto_commit_enabled() {
            self.git.head().await
        } else {
            None
        };

        let ceremony_id = Uuid::new_v4().to_string();
        let filename = format!(
            "{}-epic-{}-{}.md",
            context.ceremony_type.as_str(),
            context.epic_num,
            &ceremony_id[..8],
        );
        let transcript_rel = format!("{STATE_DIR_NAME}/{CEREMONIES_DIR_NAME}/{filename}");
        let transcript_abs = self.ceremonies_dir().join(&filename);

        let feature = context
            .additional_context
            .get("feature_name")
            .and_then(|v| v.as_str())
            .unwrap_or("mvp");
        self.store
            .ensure_epic(context.epic_num, &format!("Epic {}", context.epic_num), feature)
            .await
            .map_err(|e| CeremonyError::Recording(e.to_string()))?;

        let record = CeremonyRecord {
            id: ceremony_id.clone(),
            ceremony_type: context.ceremony_type,
            epic_num: context.epic_num,
            story_num: context.story_num,
            transcript_path: transcript_rel.clone(),
            action_items: output.action_items.clone(),
            learnings: output.learnings.clone(),
            participants: context.participants.clone(),
            created_at: Utc::now(),
        };
        self.store
            .insert_ceremony(&record)
            .await
            .map_err(|e| CeremonyError::Recording(e.to_string()))?;

        let write = async {
            tokio::fs::create_dir_all(self.ceremonies_dir()).await?;
            tokio::fs::write(&transcript_abs, &output.transcript).await
        }
        .await;
        if let Err(error) = write {
            self.undo(&ceremony_id, &transcript_abs, head.as_deref()).await;
            return Err(CeremonyError::Recording(format!(
                "transcript write failed: {error}"
            )));
        }

        if self.git.auto_commit_enabled() {
            let message = format!(
                "chore(ceremony): record {} for epic {}",
                context.ceremony_type.as_str(),
                context.epic_num
            );
            if let Err(error) = self.git.commit_all(&message).await {
                self.undo(&ceremony_id, &transcript_abs, head.as_deref()).await;
                return Err(CeremonyError::Recording(format!(
                    "version control commit failed: {error}"
                )));
            }
        }

        Ok(CeremonyOutcome {
            ceremony_id,
            ceremony_type: context.ceremony_type,
            epic_num: context.epic_num,
            transcript_path: transcript_rel,
            action_items: output.action_items.clone(),
            learnings: output.learnings.clone(),
        })
    }

    async fn undo(&self, ceremony_id: &str, transcript_abs: &Path, head: Option<&str>) {
        if transcript_abs.exists() {
            if let Err(error) = tokio::fs::remove_file(transcript_abs).await {
                tracing::error!(error = %error, "rollback: transcript removal failed");
            }
        }
        if let Err(error) = self.store.delete_ceremony(ceremony_id).await {
            tracing::error!(error = %error, "rollback: ceremony row removal failed");
        }
        if let Some(head) = head {
            if let Err(error) = self.git.reset_hard(head).await {
                tracing::error!(error = %error, "rollback: git reset failed");
            }
        }
    }
}

fn agenda_for(ceremony_type: CeremonyType) -> Vec<String> {
    let items: &[&str] = match ceremony_type {
        CeremonyType::Planning => &[
            "Review story estimates and sequencing",
            "Commit to epic scope and capacity",
            "Identify risks and dependencies",
        ],
        CeremonyType::Standup => &[
            "Progress since the last story",
            "Current blockers and impediments",
            "Action items for team support",
        ],
        CeremonyType::Retrospective => &[
            "What went well",
            "What could be improved",
            "Action items for the next epic",
        ],
    };
    items.iter().map(|i| i.to_string()).collect()
}
