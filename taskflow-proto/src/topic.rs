//! Broker destinations the server publishes change notifications on.

use std::fmt;

use crate::model::EntityId;

/// A real-time topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `/topic/tasks`: any task the user can see changed.
    Tasks,
    /// `/topic/groups/{id}/tasks`: a task in the group changed.
    GroupTasks(EntityId),
    /// `/topic/tasks/{id}/comments`: a comment was added to the task.
    TaskComments(EntityId),
    /// Any other destination, kept verbatim.
    Other(String),
}

impl Topic {
    /// Parse a destination string.
    #[must_use]
    pub fn parse(destination: &str) -> Self {
        let segments: Vec<&str> = destination
            .trim_start_matches('/')
            .split('/')
            .collect();
        match segments.as_slice() {
            ["topic", "tasks"] => Self::Tasks,
            ["topic", "groups", id, "tasks"] => id
                .parse()
                .map_or_else(|_| Self::Other(destination.into()), Self::GroupTasks),
            ["topic", "tasks", id, "comments"] => id
                .parse()
                .map_or_else(|_| Self::Other(destination.into()), Self::TaskComments),
            _ => Self::Other(destination.into()),
        }
    }

    /// Destination string used in SUBSCRIBE frames.
    #[must_use]
    pub fn destination(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tasks => f.write_str("/topic/tasks"),
            Self::GroupTasks(id) => write!(f, "/topic/groups/{id}/tasks"),
            Self::TaskComments(id) => write!(f, "/topic/tasks/{id}/comments"),
            Self::Other(s) => f.write_str(s),
        }
    }
}
