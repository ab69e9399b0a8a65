//! Optimistic patches, task payload shaping, and the edit permission rule.

use chrono::NaiveDate;
use taskflow_proto::model::{EntityId, Task, TaskPriority, TaskStatus};
use taskflow_proto::payload::{EntityRef, TaskPayload};

use crate::cache::{CacheKey, QueryCache, Snapshot};
use crate::http::ApiError;

/// Phase of an optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Local patch applied, server answer outstanding.
    Pending,
    /// Server accepted the change.
    Confirmed,
    /// Server refused; the local patch was rolled back.
    Reverted,
}

/// A set of cache patches applied ahead of a server call.
///
/// Starts [`Pending`](MutationState::Pending) and ends either
/// [`confirm`](Self::confirm)ed or [`revert`](Self::revert)ed. Dropping a
/// pending update leaves the patches in place; the invalidation that follows
/// every mutation overwrites them with server data.
#[derive(Debug)]
pub struct OptimisticUpdate {
    snapshots: Vec<Snapshot>,
    state: MutationState,
}

impl Default for OptimisticUpdate {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticUpdate {
    /// An update with no patches yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            snapshots: Vec::new(),
            state: MutationState::Pending,
        }
    }

    /// Patch `key` if it holds a `T`. Keys that are not cached are skipped.
    pub fn patch<T>(&mut self, cache: &QueryCache, key: &CacheKey, updater: impl FnOnce(&mut T)) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(snapshot) = cache.set_optimistic(key, updater) {
            self.snapshots.push(snapshot);
        }
        self
    }

    /// Number of cache entries patched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether nothing was patched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> MutationState {
        self.state
    }

    /// Keep the patches; the server agreed.
    pub fn confirm(&mut self) -> MutationState {
        if self.state == MutationState::Pending {
            self.snapshots.clear();
            self.state = MutationState::Confirmed;
        }
        self.state
    }

    /// Roll every patch back, newest first.
    pub fn revert(&mut self, cache: &QueryCache) -> MutationState {
        if self.state == MutationState::Pending {
            while let Some(snapshot) = self.snapshots.pop() {
                cache.restore(snapshot);
            }
            self.state = MutationState::Reverted;
        }
        self.state
    }
}

/// Editable fields of a task, with references by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDraft {
    /// Title.
    pub title: String,
    /// Rich-text HTML body.
    pub description: String,
    /// Column.
    pub status: TaskStatus,
    /// Priority.
    pub priority: TaskPriority,
    /// Due date.
    pub due_date: Option<NaiveDate>,
    /// Owning group.
    pub group_id: Option<EntityId>,
    /// Assignee.
    pub assignee_id: Option<EntityId>,
}

impl TaskDraft {
    /// A new to-do task with medium priority and no links.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            due_date: None,
            group_id: None,
            assignee_id: None,
        }
    }

    /// The editable state of an existing task.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            priority: task.priority,
            due_date: task.due_date,
            group_id: task.group_id(),
            assignee_id: task.assignee_id(),
        }
    }

    /// Body for `POST /tasks`. Missing links are left out.
    #[must_use]
    pub fn to_create_payload(&self) -> TaskPayload {
        TaskPayload {
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            priority: self.priority,
            due_date: self.due_date,
            group: self.group_id.map(|id| Some(EntityRef::from(id))),
            assigned_user: self.assignee_id.map(|id| Some(EntityRef::from(id))),
        }
    }

    /// Body for `PUT /tasks/{id}`. Missing links are sent as `null` so the
    /// server clears them.
    #[must_use]
    pub fn to_update_payload(&self) -> TaskPayload {
        TaskPayload {
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            priority: self.priority,
            due_date: self.due_date,
            group: Some(self.group_id.map(EntityRef::from)),
            assigned_user: Some(self.assignee_id.map(EntityRef::from)),
        }
    }

    fn protected_eq(&self, other: &Self) -> bool {
        self.title == other.title
            && self.description == other.description
            && self.priority == other.priority
            && self.due_date == other.due_date
            && self.group_id == other.group_id
            && self.assignee_id == other.assignee_id
    }
}

/// Whether `username` may change `task`'s column.
#[must_use]
pub fn can_change_status(task: &Task, username: &str) -> bool {
    task.is_owned_by(username) || task.is_assigned_to(username)
}

/// Whether `username` may comment on `task`.
#[must_use]
pub fn can_comment(task: &Task, username: &str) -> bool {
    can_change_status(task, username)
}

/// Check an edit of `current` into `draft` by `username`.
///
/// # Errors
///
/// [`ApiError::Forbidden`] if a non-owner touches a protected field or a
/// user who is neither owner nor assignee changes anything.
pub fn check_update(current: &Task, draft: &TaskDraft, username: &str) -> Result<(), ApiError> {
    if current.is_owned_by(username) {
        return Ok(());
    }
    if !current.is_assigned_to(username) {
        return Err(ApiError::Forbidden(format!(
            "task {} belongs to {}",
            current.id, current.owner.username
        )));
    }
    if !TaskDraft::from_task(current).protected_eq(draft) {
        return Err(ApiError::Forbidden(
            "only the owner can edit this task; assignees may change its status".to_string(),
        ));
    }
    Ok(())
}

/// Check that `username` may delete `task`.
///
/// # Errors
///
/// [`ApiError::Forbidden`] unless `username` owns the task.
pub fn check_delete(task: &Task, username: &str) -> Result<(), ApiError> {
    if task.is_owned_by(username) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "only {} can delete task {}",
            task.owner.username, task.id
        )))
    }
}
