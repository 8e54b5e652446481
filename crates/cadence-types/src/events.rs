use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowSequenceStarted,
    WorkflowSequenceCompleted,
    WorkflowSequenceFailed,
    WorkflowStepStarted,
    WorkflowStepCompleted,
    WorkflowStepFailed,
    QualityGateStarted,
    QualityGatePassed,
    QualityGateFailed,
    CeremonyStarted,
    CeremonyCompleted,
    CeremonyFailed,
    #[serde(rename = "file.modified")]
    FileModified,
    #[serde(rename = "thread.created")]
    ThreadCreated,
    #[serde(rename = "thread.reply")]
    ThreadReply,
    #[serde(rename = "thread.updated")]
    ThreadUpdated,
    #[serde(rename = "system.heartbeat")]
    SystemHeartbeat,
}

impl EventType {
    pub const ALL: [EventType; 17] = [
        EventType::WorkflowSequenceStarted,
        EventType::WorkflowSequenceCompleted,
        EventType::WorkflowSequenceFailed,
        EventType::WorkflowStepStarted,
        EventType::WorkflowStepCompleted,
        EventType::WorkflowStepFailed,
        EventType::QualityGateStarted,
        EventType::QualityGatePassed,
        EventType::QualityGateFailed,
        EventType::CeremonyStarted,
        EventType::CeremonyCompleted,
        EventType::CeremonyFailed,
        EventType::FileModified,
        EventType::ThreadCreated,
        EventType::ThreadReply,
        EventType::ThreadUpdated,
        EventType::SystemHeartbeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::WorkflowSequenceStarted => "WorkflowSequenceStarted",
            EventType::WorkflowSequenceCompleted => "WorkflowSequenceCompleted",
            EventType::WorkflowSequenceFailed => "WorkflowSequenceFailed",
            EventType::WorkflowStepStarted => "WorkflowStepStarted",
            EventType::WorkflowStepCompleted => "WorkflowStepCompleted",
            EventType::WorkflowStepFailed => "WorkflowStepFailed",
            EventType::QualityGateStarted => "QualityGateStarted",
            EventType::QualityGatePassed => "QualityGatePassed",
            EventType::QualityGateFailed => "QualityGateFailed",
            EventType::CeremonyStarted => "CeremonyStarted",
            EventType::CeremonyCompleted => "CeremonyCompleted",
            EventType::CeremonyFailed => "CeremonyFailed",
            EventType::FileModified => "file.modified",
            EventType::ThreadCreated => "thread.created",
            EventType::ThreadReply => "thread.reply",
            EventType::ThreadUpdated => "thread.updated",
            EventType::SystemHeartbeat => "system.heartbeat",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Envelope the hub sends to observers: the bus event plus the per-hub
/// sequence number and a millisecond-precision timestamp string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: String,
    pub sequence_number: u64,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl WireEvent {
    pub fn from_event(event: &Event, sequence_number: u64, metadata: Value) -> Self {
        Self {
            event_type: event.event_type,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            sequence_number,
            data: event.data.clone(),
            metadata,
        }
    }
}
