//! Domain projection of server-owned entities.
//!
//! The server is the only authority over these records. The client holds
//! read-only copies inside its query cache and never mutates them except
//! through optimistic patches that are later overwritten by a refetch.

use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Server-assigned numeric identifier.
pub type EntityId = i64;

/// A user account as embedded in other entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Account id.
    pub id: EntityId,
    /// Login name, unique per server.
    pub username: String,
    /// Contact address, omitted by some endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Kanban column a task sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not started.
    #[serde(rename = "TO_DO", alias = "TODO")]
    Todo,
    /// Being worked on.
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    /// Done.
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl TaskStatus {
    /// All statuses in board order.
    pub const ALL: [Self; 3] = [Self::Todo, Self::InProgress, Self::Completed];

    /// Wire spelling, also used as the kanban column id.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "TO_DO",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parse a column id or status string. Accepts `TODO` as well as `TO_DO`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "TO_DO" | "TODO" => Some(Self::Todo),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" | "DONE" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    /// Low.
    Low,
    /// Medium, the server default.
    #[default]
    Medium,
    /// High.
    High,
}

/// A collaboration group. The owner is implicitly a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Creator; cannot be removed while the group exists.
    pub owner: User,
    /// Members other than (or including) the owner.
    #[serde(default)]
    pub members: Vec<User>,
}

impl Group {
    /// Whether `user_id` belongs to the group, counting the owner.
    #[must_use]
    pub fn is_member(&self, user_id: EntityId) -> bool {
        self.owner.id == user_id || self.members.iter().any(|m| m.id == user_id)
    }
}

/// Cached projection of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task id.
    pub id: EntityId,
    /// Short title.
    pub title: String,
    /// Rich-text HTML body.
    #[serde(default)]
    pub description: String,
    /// Current column.
    pub status: TaskStatus,
    /// Priority, defaults to medium.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Optional due date.
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// Creation time, assigned by the server.
    pub created_at: NaiveDateTime,
    /// Set when the task moves to completed.
    #[serde(default)]
    pub completed_at: Option<NaiveDateTime>,
    /// Creator and the only user allowed to edit protected fields.
    #[serde(alias = "user")]
    pub owner: User,
    /// Group the task belongs to, if any.
    #[serde(default)]
    pub group: Option<Group>,
    /// Assignee; must be a member of `group` when set.
    #[serde(default)]
    pub assigned_user: Option<User>,
}

impl Task {
    /// Whether `username` created this task.
    #[must_use]
    pub fn is_owned_by(&self, username: &str) -> bool {
        self.owner.username == username
    }

    /// Whether `username` is the assignee.
    #[must_use]
    pub fn is_assigned_to(&self, username: &str) -> bool {
        self.assigned_user
            .as_ref()
            .is_some_and(|u| u.username == username)
    }

    /// Id of the owning group, if any.
    #[must_use]
    pub fn group_id(&self) -> Option<EntityId> {
        self.group.as_ref().map(|g| g.id)
    }

    /// Id of the assignee, if any.
    #[must_use]
    pub fn assignee_id(&self) -> Option<EntityId> {
        self.assigned_user.as_ref().map(|u| u.id)
    }
}

/// Lifecycle of an invitation. Accepted and rejected are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationStatus {
    /// Awaiting a response.
    Pending,
    /// Joined the group.
    Accepted,
    /// Declined.
    Rejected,
}

impl InvitationStatus {
    /// Terminal states are never reopened by the client.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

/// An invitation to join a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    /// Invitation id.
    pub id: EntityId,
    /// Invited address.
    pub email: String,
    /// Target group.
    pub group: Group,
    /// Current state.
    pub status: InvitationStatus,
    /// When the invitation was sent.
    pub invited_at: NaiveDateTime,
}

/// A comment attached to exactly one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    /// Comment id.
    pub id: EntityId,
    /// Plain text.
    pub text: String,
    /// Server timestamp.
    pub created_at: NaiveDateTime,
    /// Writer.
    #[serde(alias = "user")]
    pub author: User,
}

/// Kind of activity recorded by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    /// A task was created.
    TaskCreated,
    /// A task changed column.
    StatusChange,
    /// A comment was posted.
    CommentAdded,
    /// A task changed assignee.
    AssigneeChange,
}

/// Minimal task reference carried by activity entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Task id.
    pub id: EntityId,
    /// Title at the time the log was read.
    #[serde(default)]
    pub title: String,
}

/// Server-generated, append-only activity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    /// Entry id.
    pub id: EntityId,
    /// Kind of change.
    #[serde(rename = "type")]
    pub kind: ActivityType,
    /// Human-readable summary.
    pub description: String,
    /// When the change happened.
    pub timestamp: NaiveDateTime,
    /// Who made it.
    pub user: User,
    /// Affected task, when the activity concerns one.
    #[serde(default)]
    pub task: Option<TaskRef>,
}

/// Paginated response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Items on this page.
    pub content: Vec<T>,
    /// Number of pages available.
    pub total_pages: u32,
    /// Number of items across all pages.
    pub total_elements: u64,
    /// Zero-based page index.
    pub number: u32,
    /// Requested page size.
    pub size: u32,
}

impl<T> Page<T> {
    /// Whether a page after this one exists.
    #[must_use]
    pub const fn has_next(&self) -> bool {
        self.number + 1 < self.total_pages
    }
}

/// Sort direction for paginated listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SortDir {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl SortDir {
    /// Query parameter spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Error envelope returned by the server on failed requests.
///
/// Every field is optional on input because some endpoints answer with a
/// bare string instead of the structured form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Top-level message.
    #[serde(default)]
    pub message: String,
    /// Request description or extra context.
    #[serde(default)]
    pub details: Option<String>,
    /// Field name to validation message.
    #[serde(default)]
    pub validation_errors: Option<HashMap<String, String>>,
}

impl ErrorBody {
    /// Parse a response body leniently: structured JSON, a JSON string, or
    /// raw text all produce a usable message.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if let Ok(body) = serde_json::from_slice::<Self>(bytes) {
            return body;
        }
        if let Ok(text) = serde_json::from_slice::<String>(bytes) {
            return Self {
                message: text,
                ..Self::default()
            };
        }
        Self {
            message: String::from_utf8_lossy(bytes).trim().to_string(),
            ..Self::default()
        }
    }

    /// Validation message for a single field, if the server reported one.
    #[must_use]
    pub fn field_error(&self, field: &str) -> Option<&str> {
        self.validation_errors
            .as_ref()
            .and_then(|m| m.get(field))
            .map(String::as_str)
    }
}
