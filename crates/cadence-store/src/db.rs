use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::Mutex;

use cadence_types::{
    ArtifactRecord, CeremonyRecord, CeremonyType, ConversationType, Epic, EpicStatus,
    FeatureRecord, MessageRecord, RunOutput, Story, StoryStatus, Thread, WorkflowRun,
    WorkflowRunStatus,
};

use crate::error::{StoreError, StoreResult};
use crate::migrations;

/// Connection manager for the single-file project state database.
///
/// Writers serialize behind the connection mutex; the database runs in WAL
/// mode with a busy timeout so a concurrent reader process does not fail
/// spuriously.
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl StateStore {
    pub async fn new(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub async fn applied_migrations(&self) -> StoreResult<Vec<i64>> {
        let conn = self.conn.lock().await;
        migrations::applied_versions(&conn)
    }

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    pub async fn upsert_feature(&self, name: &str, description: Option<&str>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO features (name, description, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET description = excluded.description",
            params![name, description, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn get_feature(&self, name: &str) -> StoreResult<Option<FeatureRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT name, description, created_at FROM features WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(name, description, created_at)| FeatureRecord {
            name,
            description,
            created_at: parse_timestamp(&created_at),
        }))
    }

    pub async fn list_features(&self) -> StoreResult<Vec<FeatureRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT name, description, created_at FROM features ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut features = Vec::new();
        for row in rows {
            let (name, description, created_at) = row?;
            features.push(FeatureRecord {
                name,
                description,
                created_at: parse_timestamp(&created_at),
            });
        }
        Ok(features)
    }

    // ------------------------------------------------------------------
    // Epics
    // ------------------------------------------------------------------

    /// Create the epic row on first mention; later calls are no-ops.
    pub async fn ensure_epic(&self, epic_num: i64, title: &str, feature: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO epics (epic_num, title, feature, status, created_at)
             VALUES (?1, ?2, ?3, 'planned', ?4)",
            params![epic_num, title, feature, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn get_epic(&self, epic_num: i64) -> StoreResult<Option<Epic>> {
        let conn = self.conn.lock().await;
        let epic = conn
            .query_row(
                "SELECT epic_num, title, feature, status, total_points, completed_points, created_at
                 FROM epics WHERE epic_num = ?1",
                [epic_num],
                epic_from_row,
            )
            .optional()?;
        Ok(epic)
    }

    pub async fn list_epics(&self) -> StoreResult<Vec<Epic>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT epic_num, title, feature, status, total_points, completed_points, created_at
             FROM epics ORDER BY epic_num",
        )?;
        let rows = stmt.query_map([], epic_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn set_epic_status(&self, epic_num: i64, status: EpicStatus) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE epics SET status = ?2 WHERE epic_num = ?1",
            params![epic_num, epic_status_str(status)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "epic",
                key: epic_num.to_string(),
            });
        }
        Ok(())
    }

    pub async fn add_epic_points(&self, epic_num: i64, total: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE epics SET total_points = total_points + ?2 WHERE epic_num = ?1",
            params![epic_num, total],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stories
    // ------------------------------------------------------------------

    pub async fn upsert_story(&self, story: &Story) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO stories
                (epic_num, story_num, title, status, owner, points, priority, rework_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(epic_num, story_num) DO UPDATE SET
                title = excluded.title,
                owner = excluded.owner,
                points = excluded.points,
                priority = excluded.priority",
            params![
                story.epic_num,
                story.story_num,
                story.title,
                story_status_str(story.status),
                story.owner,
                story.points,
                story.priority,
                story.rework_count,
                story.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_story(&self, epic_num: i64, story_num: i64) -> StoreResult<Option<Story>> {
        let conn = self.conn.lock().await;
        let story = conn
            .query_row(
                "SELECT epic_num, story_num, title, status, owner, points, priority, rework_count, created_at
                 FROM stories WHERE epic_num = ?1 AND story_num = ?2",
                params![epic_num, story_num],
                story_from_row,
            )
            .optional()?;
        Ok(story)
    }

    pub async fn list_stories(&self, epic_num: i64) -> StoreResult<Vec<Story>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT epic_num, story_num, title, status, owner, points, priority, rework_count, created_at
             FROM stories WHERE epic_num = ?1 ORDER BY story_num",
        )?;
        let rows = stmt.query_map([epic_num], story_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Move a story forward. Transitions are monotonic: going backwards is
    /// rejected; rework goes through [`StateStore::mark_story_rework`] which
    /// increments the rework counter instead of reverting status.
    pub async fn update_story_status(
        &self,
        epic_num: i64,
        story_num: i64,
        status: StoryStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM stories WHERE epic_num = ?1 AND story_num = ?2",
                params![epic_num, story_num],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound {
            entity: "story",
            key: format!("{epic_num}.{story_num}"),
        })?;
        let from = story_status_from_str(&current)?;
        if story_rank(status) < story_rank(from) {
            return Err(StoreError::InvalidTransition {
                epic_num,
                story_num,
                from: story_status_str(from).to_string(),
                to: story_status_str(status).to_string(),
            });
        }
        conn.execute(
            "UPDATE stories SET status = ?3 WHERE epic_num = ?1 AND story_num = ?2",
            params![epic_num, story_num, story_status_str(status)],
        )?;
        if status == StoryStatus::Done {
            conn.execute(
                "UPDATE epics SET completed_points = completed_points +
                    (SELECT points FROM stories WHERE epic_num = ?1 AND story_num = ?2)
                 WHERE epic_num = ?1",
                params![epic_num, story_num],
            )?;
        }
        Ok(())
    }

    pub async fn mark_story_rework(&self, epic_num: i64, story_num: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE stories SET status = 'in_progress', rework_count = rework_count + 1
             WHERE epic_num = ?1 AND story_num = ?2",
            params![epic_num, story_num],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "story",
                key: format!("{epic_num}.{story_num}"),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workflow runs
    // ------------------------------------------------------------------

    pub async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflow_runs
                (workflow_id, workflow_name, epic_num, story_num, status,
                 started_at, completed_at, duration_ms, output, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.workflow_id,
                run.workflow_name,
                run.epic_num,
                run.story_num,
                run.status.as_str(),
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.duration_ms.map(|d| d as i64),
                serde_json::to_string(&run.output)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?,
                run.error_message,
            ],
        )?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        workflow_id: &str,
        status: WorkflowRunStatus,
        output: &RunOutput,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let completed_at = Utc::now();
        let conn = self.conn.lock().await;
        let started_at: Option<String> = conn
            .query_row(
                "SELECT started_at FROM workflow_runs WHERE workflow_id = ?1",
                [workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        let started_at = started_at.ok_or_else(|| StoreError::NotFound {
            entity: "workflow_run",
            key: workflow_id.to_string(),
        })?;
        let duration_ms = (completed_at - parse_timestamp(&started_at))
            .num_milliseconds()
            .max(0);
        conn.execute(
            "UPDATE workflow_runs
             SET status = ?2, completed_at = ?3, duration_ms = ?4, output = ?5, error_message = ?6
             WHERE workflow_id = ?1",
            params![
                workflow_id,
                status.as_str(),
                completed_at.to_rfc3339(),
                duration_ms,
                serde_json::to_string(output)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?,
                error_message,
            ],
        )?;
        Ok(())
    }

    pub async fn get_run(&self, workflow_id: &str) -> StoreResult<Option<WorkflowRun>> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                "SELECT workflow_id, workflow_name, epic_num, story_num, status,
                        started_at, completed_at, duration_ms, output, error_message
                 FROM workflow_runs WHERE workflow_id = ?1",
                [workflow_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub async fn list_runs(&self) -> StoreResult<Vec<WorkflowRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT workflow_id, workflow_name, epic_num, story_num, status,
                    started_at, completed_at, duration_ms, output, error_message
             FROM workflow_runs ORDER BY started_at",
        )?;
        let rows = stmt.query_map([], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------------------------------------------
    // Ceremonies
    // ------------------------------------------------------------------

    pub async fn insert_ceremony(&self, record: &CeremonyRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO ceremonies
                (id, ceremony_type, epic_num, story_num, transcript_path,
                 action_items, learnings, participants, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.ceremony_type.as_str(),
                record.epic_num,
                record.story_num,
                record.transcript_path,
                serde_json::to_string(&record.action_items)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?,
                serde_json::to_string(&record.learnings)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?,
                serde_json::to_string(&record.participants)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_ceremony(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM ceremonies WHERE id = ?1", [id])?;
        Ok(())
    }

    pub async fn get_ceremony(&self, id: &str) -> StoreResult<Option<CeremonyRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, ceremony_type, epic_num, story_num, transcript_path,
                        action_items, learnings, participants, created_at
                 FROM ceremonies WHERE id = ?1",
                [id],
                ceremony_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_ceremonies(&self, epic_num: i64) -> StoreResult<Vec<CeremonyRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, ceremony_type, epic_num, story_num, transcript_path,
                    action_items, learnings, participants, created_at
             FROM ceremonies WHERE epic_num = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([epic_num], ceremony_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn record_ceremony_execution(
        &self,
        epic_num: i64,
        ceremony_type: CeremonyType,
        success: bool,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO ceremony_executions (epic_num, ceremony_type, success, executed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                epic_num,
                ceremony_type.as_str(),
                success as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn ceremony_execution_count(
        &self,
        epic_num: i64,
        ceremony_type: CeremonyType,
        successful_only: bool,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let count = if successful_only {
            conn.query_row(
                "SELECT COUNT(*) FROM ceremony_executions
                 WHERE epic_num = ?1 AND ceremony_type = ?2 AND success = 1",
                params![epic_num, ceremony_type.as_str()],
                |row| row.get::<_, i64>(0),
            )?
        } else {
            conn.query_row(
                "SELECT COUNT(*) FROM ceremony_executions
                 WHERE epic_num = ?1 AND ceremony_type = ?2",
                params![epic_num, ceremony_type.as_str()],
                |row| row.get::<_, i64>(0),
            )?
        };
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    pub async fn insert_artifact(
        &self,
        record: &ArtifactRecord,
        variables: &Value,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO artifacts
                (id, path, doc_type, workflow_name, epic_num, story_num, agent, phase, variables, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.path,
                record.doc_type,
                record.workflow_name,
                record.epic_num,
                record.story_num,
                record.agent,
                record.phase,
                variables.to_string(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn artifact_count(&self, workflow_name: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM artifacts WHERE workflow_name = ?1",
            [workflow_name],
            |row| row.get::<_, i64>(0),
        )?)
    }

    // ------------------------------------------------------------------
    // Threads and messages
    // ------------------------------------------------------------------

    pub async fn create_thread(
        &self,
        parent_message_id: &str,
        conversation_id: &str,
        conversation_type: ConversationType,
    ) -> StoreResult<Thread> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO threads (parent_message_id, conversation_id, conversation_type)
             VALUES (?1, ?2, ?3)",
            params![
                parent_message_id,
                conversation_id,
                conversation_type.as_str()
            ],
        )?;
        let id = conn.last_insert_rowid();
        let thread = conn.query_row(
            "SELECT id, parent_message_id, conversation_id, conversation_type,
                    reply_count, created_at, updated_at
             FROM threads WHERE id = ?1",
            [id],
            thread_from_row,
        )?;
        Ok(thread)
    }

    pub async fn get_thread(&self, id: i64) -> StoreResult<Option<Thread>> {
        let conn = self.conn.lock().await;
        let thread = conn
            .query_row(
                "SELECT id, parent_message_id, conversation_id, conversation_type,
                        reply_count, created_at, updated_at
                 FROM threads WHERE id = ?1",
                [id],
                thread_from_row,
            )
            .optional()?;
        Ok(thread)
    }

    pub async fn insert_message(&self, message: &MessageRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages
                (id, conversation_id, conversation_type, content, role,
                 agent_id, thread_id, reply_to_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                message.conversation_id,
                message.conversation_type.as_str(),
                message.content,
                message.role.as_str(),
                message.agent_id,
                message.thread_id,
                message.reply_to_message_id,
            ],
        )?;
        Ok(())
    }

    pub async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        let conn = self.conn.lock().await;
        let message = conn
            .query_row(
                "SELECT id, conversation_id, conversation_type, content, role,
                        agent_id, thread_id, reply_to_message_id, thread_count,
                        created_at, updated_at
                 FROM messages WHERE id = ?1",
                [id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    // sqlite's datetime('now') default
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn epic_status_str(status: EpicStatus) -> &'static str {
    match status {
        EpicStatus::Planned => "planned",
        EpicStatus::InProgress => "in_progress",
        EpicStatus::Done => "done",
    }
}

fn epic_status_from_str(raw: &str) -> Result<EpicStatus, rusqlite::Error> {
    match raw {
        "planned" => Ok(EpicStatus::Planned),
        "in_progress" => Ok(EpicStatus::InProgress),
        "done" => Ok(EpicStatus::Done),
        _ => Err(rusqlite::Error::InvalidQuery),
    }
}

fn story_status_str(status: StoryStatus) -> &'static str {
    match status {
        StoryStatus::Pending => "pending",
        StoryStatus::InProgress => "in_progress",
        StoryStatus::InReview => "in_review",
        StoryStatus::Done => "done",
    }
}

fn story_status_from_str(raw: &str) -> StoreResult<StoryStatus> {
    match raw {
        "pending" => Ok(StoryStatus::Pending),
        "in_progress" => Ok(StoryStatus::InProgress),
        "in_review" => Ok(StoryStatus::InReview),
        "done" => Ok(StoryStatus::Done),
        other => Err(StoreError::InvalidData(format!(
            "unknown story status: {other}"
        ))),
    }
}

fn story_rank(status: StoryStatus) -> u8 {
    match status {
        StoryStatus::Pending => 0,
        StoryStatus::InProgress => 1,
        StoryStatus::InReview => 2,
        StoryStatus::Done => 3,
    }
}

fn run_status_from_str(raw: &str) -> Result<WorkflowRunStatus, rusqlite::Error> {
    match raw {
        "pending" => Ok(WorkflowRunStatus::Pending),
        "running" => Ok(WorkflowRunStatus::Running),
        "completed" => Ok(WorkflowRunStatus::Completed),
        "failed" => Ok(WorkflowRunStatus::Failed),
        "cancelled" => Ok(WorkflowRunStatus::Cancelled),
        _ => Err(rusqlite::Error::InvalidQuery),
    }
}

fn conversation_type_from_str(raw: &str) -> Result<ConversationType, rusqlite::Error> {
    match raw {
        "dm" => Ok(ConversationType::Dm),
        "channel" => Ok(ConversationType::Channel),
        _ => Err(rusqlite::Error::InvalidQuery),
    }
}

fn epic_from_row(row: &Row<'_>) -> rusqlite::Result<Epic> {
    Ok(Epic {
        epic_num: row.get(0)?,
        title: row.get(1)?,
        feature: row.get(2)?,
        status: epic_status_from_str(&row.get::<_, String>(3)?)?,
        total_points: row.get(4)?,
        completed_points: row.get(5)?,
        created_at: parse_timestamp(&row.get::<_, String>(6)?),
    })
}

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<Story> {
    let status = match story_status_from_str(&row.get::<_, String>(3)?) {
        Ok(status) => status,
        Err(_) => return Err(rusqlite::Error::InvalidQuery),
    };
    Ok(Story {
        epic_num: row.get(0)?,
        story_num: row.get(1)?,
        title: row.get(2)?,
        status,
        owner: row.get(4)?,
        points: row.get(5)?,
        priority: row.get(6)?,
        rework_count: row.get(7)?,
        created_at: parse_timestamp(&row.get::<_, String>(8)?),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    let output: RunOutput =
        serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default();
    Ok(WorkflowRun {
        workflow_id: row.get(0)?,
        workflow_name: row.get(1)?,
        epic_num: row.get(2)?,
        story_num: row.get(3)?,
        status: run_status_from_str(&row.get::<_, String>(4)?)?,
        started_at: parse_timestamp(&row.get::<_, String>(5)?),
        completed_at: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_timestamp(&raw)),
        duration_ms: row.get::<_, Option<i64>>(7)?.map(|d| d.max(0) as u64),
        output,
        error_message: row.get(9)?,
    })
}

fn ceremony_from_row(row: &Row<'_>) -> rusqlite::Result<CeremonyRecord> {
    let ceremony_type = CeremonyType::parse(&row.get::<_, String>(1)?)
        .ok_or(rusqlite::Error::InvalidQuery)?;
    Ok(CeremonyRecord {
        id: row.get(0)?,
        ceremony_type,
        epic_num: row.get(2)?,
        story_num: row.get(3)?,
        transcript_path: row.get(4)?,
        action_items: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        learnings: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        participants: serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
        created_at: parse_timestamp(&row.get::<_, String>(8)?),
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        parent_message_id: row.get(1)?,
        conversation_id: row.get(2)?,
        conversation_type: conversation_type_from_str(&row.get::<_, String>(3)?)?,
        reply_count: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role = match row.get::<_, String>(4)?.as_str() {
        "user" => cadence_types::MessageRole::User,
        "agent" => cadence_types::MessageRole::Agent,
        _ => return Err(rusqlite::Error::InvalidQuery),
    };
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        conversation_type: conversation_type_from_str(&row.get::<_, String>(2)?)?,
        content: row.get(3)?,
        role,
        agent_id: row.get(5)?,
        thread_id: row.get(6)?,
        reply_to_message_id: row.get(7)?,
        thread_count: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::MessageRole;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn open_store() -> (TempDir, StateStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(&dir.path().join("state.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn sample_story(epic_num: i64, story_num: i64) -> Story {
        Story {
            epic_num,
            story_num,
            title: format!("Story {epic_num}.{story_num}"),
            status: StoryStatus::Pending,
            owner: Some("dev".to_string()),
            points: 3,
            priority: 1,
            rework_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("state.db");
        let store = StateStore::new(&db_path).await.expect("first open");
        let first = store.applied_migrations().await.expect("versions");
        drop(store);

        // Re-opening re-runs the migration pass against the same file.
        let store = StateStore::new(&db_path).await.expect("second open");
        let second = store.applied_migrations().await.expect("versions");
        assert_eq!(first, second);
        assert_eq!(
            *second.last().expect("at least one"),
            migrations::latest_version()
        );
    }

    #[tokio::test]
    async fn story_transitions_are_monotonic() {
        let (_dir, store) = open_store().await;
        store.ensure_epic(1, "Epic 1", "mvp").await.expect("epic");
        store
            .upsert_story(&sample_story(1, 1))
            .await
            .expect("story");

        store
            .update_story_status(1, 1, StoryStatus::InProgress)
            .await
            .expect("forward");
        store
            .update_story_status(1, 1, StoryStatus::Done)
            .await
            .expect("forward to done");

        let err = store
            .update_story_status(1, 1, StoryStatus::Pending)
            .await
            .expect_err("backwards transition rejected");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // Explicit rework increments the counter rather than reverting.
        store.mark_story_rework(1, 1).await.expect("rework");
        let story = store.get_story(1, 1).await.expect("get").expect("present");
        assert_eq!(story.status, StoryStatus::InProgress);
        assert_eq!(story.rework_count, 1);
    }

    #[tokio::test]
    async fn completing_a_story_rolls_points_into_the_epic() {
        let (_dir, store) = open_store().await;
        store.ensure_epic(1, "Epic 1", "mvp").await.expect("epic");
        store.add_epic_points(1, 3).await.expect("points");
        store
            .upsert_story(&sample_story(1, 1))
            .await
            .expect("story");

        store
            .update_story_status(1, 1, StoryStatus::Done)
            .await
            .expect("done");
        let epic = store.get_epic(1).await.expect("get").expect("present");
        assert_eq!(epic.completed_points, 3);
    }

    #[tokio::test]
    async fn thread_triggers_maintain_reply_and_thread_counts() {
        let (_dir, store) = open_store().await;

        let parent = MessageRecord {
            id: "msg-1".to_string(),
            conversation_id: "channel-general".to_string(),
            conversation_type: ConversationType::Channel,
            content: "kicking off".to_string(),
            role: MessageRole::User,
            agent_id: None,
            thread_id: None,
            reply_to_message_id: None,
            thread_count: 0,
            created_at: String::new(),
            updated_at: String::new(),
        };
        store.insert_message(&parent).await.expect("parent");

        let thread = store
            .create_thread("msg-1", "channel-general", ConversationType::Channel)
            .await
            .expect("thread");
        assert_eq!(thread.reply_count, 0);

        for n in 0..2 {
            let reply = MessageRecord {
                id: format!("msg-reply-{n}"),
                conversation_id: "channel-general".to_string(),
                conversation_type: ConversationType::Channel,
                content: format!("reply {n}"),
                role: MessageRole::Agent,
                agent_id: Some("scrum".to_string()),
                thread_id: Some(thread.id),
                reply_to_message_id: Some("msg-1".to_string()),
                thread_count: 0,
                created_at: String::new(),
                updated_at: String::new(),
            };
            store.insert_message(&reply).await.expect("reply");
        }

        let thread = store
            .get_thread(thread.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(thread.reply_count, 2);

        let parent = store
            .get_message("msg-1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(parent.thread_count, 2);
    }

    #[tokio::test]
    async fn workflow_run_round_trips_with_output_blob() {
        let (_dir, store) = open_store().await;
        let run = WorkflowRun {
            workflow_id: "wf_123".to_string(),
            workflow_name: "tech-spec".to_string(),
            epic_num: None,
            story_num: None,
            status: WorkflowRunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            output: RunOutput::default(),
            error_message: None,
        };
        store.insert_run(&run).await.expect("insert");

        let mut output = RunOutput::default();
        output.artifacts.push("docs/tech-spec.md".to_string());
        store
            .finish_run("wf_123", WorkflowRunStatus::Completed, &output, None)
            .await
            .expect("finish");

        let loaded = store
            .get_run("wf_123")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.status, WorkflowRunStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert!(loaded.duration_ms.is_some());
        assert_eq!(loaded.output.artifacts, vec!["docs/tech-spec.md"]);
    }

    #[tokio::test]
    async fn ceremony_rows_round_trip_and_delete() {
        let (_dir, store) = open_store().await;
        store.ensure_epic(2, "Epic 2", "payments").await.expect("epic");

        let record = CeremonyRecord {
            id: Uuid::new_v4().to_string(),
            ceremony_type: CeremonyType::Standup,
            epic_num: 2,
            story_num: Some(4),
            transcript_path: ".cadence/ceremonies/standup-epic2.md".to_string(),
            action_items: vec!["unblock story 5".to_string()],
            learnings: vec![],
            participants: vec!["scrum".to_string(), "dev".to_string()],
            created_at: Utc::now(),
        };
        store.insert_ceremony(&record).await.expect("insert");

        let loaded = store
            .get_ceremony(&record.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.ceremony_type, CeremonyType::Standup);
        assert_eq!(loaded.action_items, vec!["unblock story 5"]);

        store.delete_ceremony(&record.id).await.expect("delete");
        assert!(store
            .get_ceremony(&record.id)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn ceremony_execution_counts_filter_on_success() {
        let (_dir, store) = open_store().await;
        store
            .record_ceremony_execution(1, CeremonyType::Standup, true)
            .await
            .expect("record");
        store
            .record_ceremony_execution(1, CeremonyType::Standup, false)
            .await
            .expect("record");

        let all = store
            .ceremony_execution_count(1, CeremonyType::Standup, false)
            .await
            .expect("count");
        let successful = store
            .ceremony_execution_count(1, CeremonyType::Standup, true)
            .await
            .expect("count");
        assert_eq!(all, 2);
        assert_eq!(successful, 1);
    }
}
