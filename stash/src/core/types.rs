//! Persistent record types for projects, conversations, messages, runs, and events.
//!
//! These types are plain data. Every enum has a stable lowercase string form
//! used both in JSON and in the SQLite columns, so the two never drift apart.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RFC 3339 UTC timestamp with microsecond precision (lexicographically ordered).
pub type Timestamp = String;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Author of a message.
    Role {
        User => "user",
        Assistant => "assistant",
        Tool => "tool",
        System => "system",
    }
);

string_enum!(
    ConversationStatus {
        Active => "active",
        Archived => "archived",
    }
);

string_enum!(
    /// Lifecycle of a run. `Done`, `Failed`, and `Cancelled` are terminal.
    RunStatus {
        Pending => "pending",
        Running => "running",
        Done => "done",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

string_enum!(
    RunMode {
        Manual => "manual",
        Proactive => "proactive",
    }
);

string_enum!(
    StepKind {
        Plan => "plan",
        Execute => "execute",
    }
);

string_enum!(
    StepStatus {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
);

string_enum!(
    /// Observable fact types published on the event bus.
    EventType {
        ConversationCreated => "conversation_created",
        ConversationUpdated => "conversation_updated",
        MessageCreated => "message_created",
        RunStarted => "run_started",
        RunPlanned => "run_planned",
        RunStepStarted => "run_step_started",
        RunStepCompleted => "run_step_completed",
        RunCompleted => "run_completed",
        RunFailed => "run_failed",
        RunCancelled => "run_cancelled",
    }
);

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Monotonic transition table: finished runs never come back.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => matches!(next, Self::Done | Self::Failed | Self::Cancelled),
            Self::Done | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Manual
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub created_at: Timestamp,
    pub last_opened_at: Timestamp,
    pub active_conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub pinned: bool,
    pub created_at: Timestamp,
    pub last_message_at: Option<Timestamp>,
    pub summary: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub parent_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub parts: Vec<Value>,
    pub parent_message_id: Option<String>,
    pub sequence_no: i64,
    pub created_at: Timestamp,
    pub superseded_by: Option<String>,
    pub metadata: Value,
    pub asset_ids: Vec<String>,
}

impl Message {
    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }
}

/// Input for appending a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewMessage {
    pub role: Option<Role>,
    pub content: String,
    pub parts: Vec<Value>,
    pub parent_message_id: Option<String>,
    pub metadata: Option<Value>,
    pub asset_ids: Vec<String>,
    pub idempotency_key: Option<String>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(mut self, parent_message_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_message_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_parts(mut self, parts: Vec<Value>) -> Self {
        self.parts = parts;
        self
    }

    pub fn role(&self) -> Role {
        self.role.unwrap_or(Role::User)
    }
}

/// One page of a cursor-paginated transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// `sequence_no` of the last returned message; pass back as `cursor`.
    pub next_cursor: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub conversation_id: String,
    pub trigger_message_id: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub output_summary: Option<String>,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub run_id: String,
    pub step_index: i64,
    pub kind: StepKind,
    pub input: Value,
    pub output: Option<Value>,
    pub status: StepStatus,
    pub error: Option<String>,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Global append order; doubles as the replay cursor.
    pub seq: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub project_id: String,
    pub conversation_id: Option<String>,
    pub run_id: Option<String>,
    pub created_at: Timestamp,
    pub payload: Value,
}

/// Input for recording an event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub project_id: String,
    pub conversation_id: Option<String>,
    pub run_id: Option<String>,
    pub payload: Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, project_id: impl Into<String>) -> Self {
        Self {
            event_type,
            project_id: project_id.into(),
            conversation_id: None,
            run_id: None,
            payload: Value::Object(Default::default()),
        }
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
