//! Request bodies for task mutations.
//!
//! References to other entities travel as nested `{ "id": n }` objects.
//! Reference fields use a double `Option`: the outer layer decides whether
//! the field is sent at all, the inner one whether it carries a value or an
//! explicit `null` that clears the server-side link.

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::{EntityId, TaskPriority, TaskStatus};

/// Nested reference shape expected by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntityRef {
    /// Referenced id.
    pub id: EntityId,
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        Self { id }
    }
}

/// Body of `POST /tasks` and `PUT /tasks/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Title.
    pub title: String,
    /// Rich-text HTML body.
    pub description: String,
    /// Column.
    pub status: TaskStatus,
    /// Priority.
    pub priority: TaskPriority,
    /// Due date; `None` is sent as `null`.
    pub due_date: Option<NaiveDate>,
    /// Group link. Outer `None` omits the field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Option<EntityRef>>,
    /// Assignee link. Outer `None` omits the field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_user: Option<Option<EntityRef>>,
}

/// Body of `POST /tasks/{id}/comments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentPayload {
    /// Comment text.
    pub text: String,
}

/// Body of `POST /invitations/invite`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    /// Target group, sent as a string the way the server's map binding expects.
    pub group_id: String,
    /// Invitee address.
    pub email: String,
}
