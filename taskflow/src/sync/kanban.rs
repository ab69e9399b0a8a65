//! Moving cards between kanban columns.

use taskflow_proto::model::{EntityId, Task, TaskStatus};

use super::SyncCoordinator;
use super::mutation::{OptimisticUpdate, TaskDraft, can_change_status};
use crate::cache::CacheKey;
use crate::http::ApiError;

/// Where a dragged card was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropTarget {
    /// A column.
    Column(TaskStatus),
    /// Another card; the dragged card joins that card's column.
    Task(EntityId),
}

impl DropTarget {
    /// Parse a droppable id: a column id such as `IN_PROGRESS`, or a task id.
    #[must_use]
    pub fn parse(id: &str) -> Option<Self> {
        if let Ok(task_id) = id.trim().parse::<EntityId>() {
            return Some(Self::Task(task_id));
        }
        TaskStatus::parse(id).map(Self::Column)
    }

    /// Column the card lands in, or `None` if the target card is not on
    /// the board.
    #[must_use]
    pub fn resolve(self, board: &[Task]) -> Option<TaskStatus> {
        match self {
            Self::Column(status) => Some(status),
            Self::Task(id) => board.iter().find(|t| t.id == id).map(|t| t.status),
        }
    }
}

/// Result of [`SyncCoordinator::move_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Same column or unknown target; nothing was sent.
    Unchanged,
    /// The server accepted the move.
    Moved(Task),
}

impl SyncCoordinator {
    /// Move a card on `board` (a cached task list such as
    /// [`CacheKey::Tasks`] or [`CacheKey::GroupTasks`]).
    ///
    /// Dropping a card into its own column sends nothing. Otherwise every
    /// cached copy of the task is patched to the new status, one update is
    /// sent, and task lists are invalidated whatever the outcome. A refused
    /// update reverts the patch first.
    ///
    /// # Errors
    ///
    /// - [`ApiError::InvalidState`] if the board is not loaded or the card
    ///   is not on it.
    /// - [`ApiError::Forbidden`] if the user neither owns nor is assigned
    ///   the task.
    /// - Any error from the update call.
    pub async fn move_task(&self, board: &CacheKey, task_id: EntityId, target: DropTarget) -> Result<MoveOutcome, ApiError> {
        let cache = self.cache();
        let tasks = cache
            .get::<Vec<Task>>(board)
            .ok_or_else(|| ApiError::InvalidState(format!("board {board} is not loaded")))?
            .data;
        let task = tasks
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .ok_or_else(|| ApiError::InvalidState(format!("task {task_id} is not on board {board}")))?;

        let Some(status) = target.resolve(&tasks) else {
            return Ok(MoveOutcome::Unchanged);
        };
        if status == task.status {
            tracing::trace!(task_id, %status, "dropped on own column");
            return Ok(MoveOutcome::Unchanged);
        }

        let username = self.username()?;
        if !can_change_status(&task, &username) {
            return Err(ApiError::Forbidden(format!(
                "{username} cannot move task {task_id}"
            )));
        }

        let mut draft = TaskDraft::from_task(&task);
        draft.status = status;
        let payload = draft.to_update_payload();

        let mut update = OptimisticUpdate::new();
        let set_status = |list: &mut Vec<Task>| {
            if let Some(t) = list.iter_mut().find(|t| t.id == task_id) {
                t.status = status;
            }
        };
        for key in &patched_lists(board, &task) {
            update.patch::<Vec<Task>>(cache, key, set_status);
        }
        update.patch::<Task>(cache, &CacheKey::Task(task_id), |t| t.status = status);
        tracing::debug!(task_id, from = %task.status, to = %status, patched = update.len(), "moving task");

        let result = self.api().update_task(task_id, &payload).await;
        let state = match &result {
            Ok(_) => update.confirm(),
            Err(e) => {
                tracing::warn!(task_id, err = %e, "move refused, reverting");
                update.revert(cache)
            }
        };
        tracing::debug!(task_id, ?state, "move settled");
        self.invalidate_task_lists();

        result.map(MoveOutcome::Moved)
    }
}

/// Task lists holding a copy of `task`, each listed once.
fn patched_lists(board: &CacheKey, task: &Task) -> Vec<CacheKey> {
    let mut keys = vec![board.clone()];
    let others = [Some(CacheKey::Tasks), task.group_id().map(CacheKey::GroupTasks)];
    for key in others.into_iter().flatten() {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}
