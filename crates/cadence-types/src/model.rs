use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleLevel {
    Level0,
    Level1,
    Level2,
    Level3,
    Level4,
}

impl ScaleLevel {
    pub fn value(self) -> i64 {
        match self {
            ScaleLevel::Level0 => 0,
            ScaleLevel::Level1 => 1,
            ScaleLevel::Level2 => 2,
            ScaleLevel::Level3 => 3,
            ScaleLevel::Level4 => 4,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(ScaleLevel::Level0),
            1 => Some(ScaleLevel::Level1),
            2 => Some(ScaleLevel::Level2),
            3 => Some(ScaleLevel::Level3),
            4 => Some(ScaleLevel::Level4),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ScaleLevel::Level0 => "Single atomic change (1 story)",
            ScaleLevel::Level1 => "Small feature (2-10 stories, 1 epic)",
            ScaleLevel::Level2 => "Medium project (5-15 stories, 1-2 epics)",
            ScaleLevel::Level3 => "Large project (12-40 stories, 2-5 epics)",
            ScaleLevel::Level4 => "Enterprise system (40+ stories, 5+ epics)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Greenfield,
    Brownfield,
    Game,
    Software,
    BugFix,
    Enhancement,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectType::Greenfield => "greenfield",
            ProjectType::Brownfield => "brownfield",
            ProjectType::Game => "game",
            ProjectType::Software => "software",
            ProjectType::BugFix => "bug_fix",
            ProjectType::Enhancement => "enhancement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Planned,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub epic_num: i64,
    pub title: String,
    pub feature: String,
    pub status: EpicStatus,
    pub total_points: i64,
    pub completed_points: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    InReview,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub epic_num: i64,
    pub story_num: i64,
    pub title: String,
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub points: i64,
    pub priority: i64,
    #[serde(default)]
    pub rework_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowRunStatus::Pending => "pending",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutput {
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_num: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_num: Option<i64>,
    pub status: WorkflowRunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub output: RunOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyType {
    Planning,
    Standup,
    Retrospective,
}

impl CeremonyType {
    pub fn as_str(self) -> &'static str {
        match self {
            CeremonyType::Planning => "planning",
            CeremonyType::Standup => "standup",
            CeremonyType::Retrospective => "retrospective",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planning" => Some(CeremonyType::Planning),
            "standup" => Some(CeremonyType::Standup),
            "retrospective" => Some(CeremonyType::Retrospective),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CeremonyRecord {
    pub id: String,
    pub ceremony_type: CeremonyType,
    pub epic_num: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_num: Option<i64>,
    pub transcript_path: String,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub learnings: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Dm,
    Channel,
}

impl ConversationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationType::Dm => "dm",
            ConversationType::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub parent_message_id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub reply_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub content: String,
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub thread_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub path: String,
    pub doc_type: String,
    pub workflow_name: String,
    pub epic_num: i64,
    pub story_num: i64,
    pub agent: String,
    pub phase: String,
    pub created_at: DateTime<Utc>,
}
