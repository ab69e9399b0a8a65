use std::fmt;

use taskflow_proto::model::{EntityId, TaskStatus};

use crate::api::PageRequest;

/// Identifies one cached query.
///
/// The `Display` form matches the query keys of the web client
/// (`tasks`, `group-tasks:5`, ...) and is what appears in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Every visible task.
    Tasks,
    /// One page of the paginated task listing.
    TasksPage(PageRequest),
    /// Tasks in one column.
    TasksByStatus(TaskStatus),
    /// One task.
    Task(EntityId),
    /// Tasks of one group.
    GroupTasks(EntityId),
    /// Groups the user belongs to.
    Groups,
    /// Invitations awaiting a response.
    PendingInvitations,
    /// Global activity feed.
    Activities,
    /// Comments on one task.
    TaskComments(EntityId),
    /// Activity of one task.
    TaskActivities(EntityId),
}

impl CacheKey {
    /// Whether the key holds task data that a task push can change.
    #[must_use]
    pub const fn is_task_list(&self) -> bool {
        matches!(
            self,
            Self::Tasks | Self::TasksPage(_) | Self::TasksByStatus(_) | Self::Task(_) | Self::GroupTasks(_)
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tasks => f.write_str("tasks"),
            Self::TasksPage(p) => write!(
                f,
                "tasks-page:{}:{}:{}:{}",
                p.page,
                p.size,
                p.sort_by,
                p.sort_dir.as_str()
            ),
            Self::TasksByStatus(s) => write!(f, "tasks-status:{s}"),
            Self::Task(id) => write!(f, "task:{id}"),
            Self::GroupTasks(id) => write!(f, "group-tasks:{id}"),
            Self::Groups => f.write_str("groups"),
            Self::PendingInvitations => f.write_str("pending-invitations"),
            Self::Activities => f.write_str("activities"),
            Self::TaskComments(id) => write!(f, "task-comments:{id}"),
            Self::TaskActivities(id) => write!(f, "task-activities:{id}"),
        }
    }
}
