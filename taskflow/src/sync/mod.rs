//! Glue between server pushes, local mutations and the query cache.
//!
//! Pushes never carry data into the cache. A message on a topic only marks
//! the affected keys stale; watchers then refetch the server's current
//! state. Local mutations follow the same rule after the server answers.
//!
//! | Topic                         | Invalidated keys                                  |
//! |-------------------------------|---------------------------------------------------|
//! | `/topic/tasks`                | every task list, `activities`                     |
//! | `/topic/groups/{id}/tasks`    | every task list except other groups, `activities` |
//! | `/topic/tasks/{id}/comments`  | `task-comments:{id}`, `task-activities:{id}`, `activities` |

mod kanban;
mod mutation;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use taskflow_proto::model::{ActivityLog, Comment, EntityId, Group, Invitation, InvitationStatus, Page, Task, TaskStatus};
use taskflow_proto::topic::Topic;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use kanban::{DropTarget, MoveOutcome};
pub use mutation::{
    MutationState, OptimisticUpdate, TaskDraft, can_change_status, can_comment, check_delete,
    check_update,
};

use crate::api::{Api, PageRequest};
use crate::cache::{CacheKey, QueryCache, QueryHandle};
use crate::http::ApiError;
use crate::realtime::{Handler, RealtimeBridge, RealtimeMessage, SubscriptionHandle};

/// Page size of the activity feed.
pub const ACTIVITY_PAGE_SIZE: u32 = 15;

/// Whether a push on `topic` makes `key` stale.
#[must_use]
pub fn affects(topic: &Topic, key: &CacheKey) -> bool {
    match topic {
        Topic::Tasks => key.is_task_list() || matches!(key, CacheKey::Activities | CacheKey::TaskActivities(_)),
        Topic::GroupTasks(group) => match key {
            CacheKey::GroupTasks(id) => id == group,
            CacheKey::Activities => true,
            other => other.is_task_list(),
        },
        Topic::TaskComments(task) => match key {
            CacheKey::TaskComments(id) | CacheKey::TaskActivities(id) => id == task,
            CacheKey::Activities => true,
            _ => false,
        },
        Topic::Other(_) => false,
    }
}

fn apply_push(cache: &QueryCache, message: &RealtimeMessage) {
    let count = cache.invalidate_matching(|key| affects(&message.topic, key));
    tracing::debug!(topic = %message.topic, invalidated = count, "push received");
}

#[derive(Default)]
struct Interest {
    count: usize,
    handle: Option<SubscriptionHandle>,
}

struct Inner {
    api: Api,
    cache: QueryCache,
    bridge: RealtimeBridge,
    handler: Handler,
    interests: Mutex<HashMap<Topic, Interest>>,
    resolved_invitations: Mutex<HashMap<EntityId, InvitationStatus>>,
    sessions: AtomicU64,
}

/// Coordinates reads, mutations and push-driven invalidation. Cheap to
/// clone.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("topics", &self.inner.interests.lock().len())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Wire the coordinator to its collaborators. Call
    /// [`start`](Self::start) to open the real-time connection.
    #[must_use]
    pub fn new(api: Api, cache: QueryCache, bridge: RealtimeBridge) -> Self {
        let push_cache = cache.clone();
        let handler: Handler = Arc::new(move |msg: &RealtimeMessage| apply_push(&push_cache, msg));
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                bridge,
                handler,
                interests: Mutex::new(HashMap::new()),
                resolved_invitations: Mutex::new(HashMap::new()),
                sessions: AtomicU64::new(0),
            }),
        }
    }

    /// REST facade.
    #[must_use]
    pub fn api(&self) -> &Api {
        &self.inner.api
    }

    /// Shared cache.
    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Real-time bridge.
    #[must_use]
    pub fn bridge(&self) -> &RealtimeBridge {
        &self.inner.bridge
    }

    /// Connect the bridge. Every handshake re-subscribes the topics that
    /// currently have interest; after a reconnect their keys are also
    /// invalidated, since pushes may have been missed while offline.
    pub fn start(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.bridge.connect(move || {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.on_ready();
            }
        });
    }

    /// Disconnect the bridge and drop all subscriptions. Topic interests
    /// are kept and resubscribe on the next [`start`](Self::start).
    pub async fn stop(&self) {
        self.inner.bridge.disconnect().await;
        for interest in self.inner.interests.lock().values_mut() {
            interest.handle = None;
        }
    }

    fn on_ready(&self) {
        let reconnect = self.inner.sessions.fetch_add(1, Ordering::SeqCst) > 0;
        let mut interests = self.inner.interests.lock();
        for (topic, interest) in interests.iter_mut() {
            interest.handle = self
                .inner
                .bridge
                .subscribe(topic, Arc::clone(&self.inner.handler));
            if reconnect {
                self.inner.cache.invalidate_matching(|key| affects(topic, key));
            }
        }
        tracing::info!(topics = interests.len(), reconnect, "realtime subscriptions restored");
    }

    /// Declare interest in `topic` for as long as the returned guard lives.
    /// The broker subscription is shared with other interests in the same
    /// topic and released with the last one.
    #[must_use]
    pub fn watch_topic(&self, topic: Topic) -> TopicInterest {
        let mut interests = self.inner.interests.lock();
        let interest = interests.entry(topic.clone()).or_default();
        interest.count += 1;
        if interest.handle.is_none() && self.inner.bridge.is_connected() {
            interest.handle = self
                .inner
                .bridge
                .subscribe(&topic, Arc::clone(&self.inner.handler));
        }
        TopicInterest {
            inner: Arc::downgrade(&self.inner),
            topic,
        }
    }

    /// Topics with at least one live interest.
    #[must_use]
    pub fn watched_topics(&self) -> HashSet<Topic> {
        self.inner.interests.lock().keys().cloned().collect()
    }

    /// Apply a push as if it had arrived on the bridge.
    pub fn handle_push(&self, message: &RealtimeMessage) {
        apply_push(&self.inner.cache, message);
    }

    pub(crate) fn invalidate_task_lists(&self) {
        self.inner
            .cache
            .invalidate_matching(|k| k.is_task_list() || *k == CacheKey::Activities);
    }

    fn username(&self) -> Result<String, ApiError> {
        self.inner
            .api
            .http()
            .tokens()
            .username()
            .ok_or(ApiError::Unauthorized)
    }

    /// Spawn a task that invalidates the activity feed every `period` until
    /// `cancel` fires.
    #[must_use]
    pub fn spawn_activity_poller(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.inner.cache.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => cache.invalidate(&CacheKey::Activities),
                }
            }
            tracing::debug!("activity poller stopped");
        })
    }

    // Reads.

    /// Every visible task.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn tasks(&self) -> Result<Arc<Vec<Task>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::Tasks, move || async move { api.list_tasks().await })
            .await
    }

    /// One page of tasks.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn tasks_page(&self, page: PageRequest) -> Result<Arc<Page<Task>>, ApiError> {
        let api = self.inner.api.clone();
        let req = page.clone();
        self.inner
            .cache
            .fetch(CacheKey::TasksPage(page), move || async move { api.tasks_page(&req).await })
            .await
    }

    /// Tasks in one column.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Arc<Vec<Task>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::TasksByStatus(status), move || async move {
                api.tasks_by_status(status).await
            })
            .await
    }

    /// One task.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn task(&self, id: EntityId) -> Result<Arc<Task>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::Task(id), move || async move { api.get_task(id).await })
            .await
    }

    /// Tasks of one group.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn group_tasks(&self, group_id: EntityId) -> Result<Arc<Vec<Task>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::GroupTasks(group_id), move || async move {
                api.tasks_by_group(group_id).await
            })
            .await
    }

    /// Groups the user belongs to.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn groups(&self) -> Result<Arc<Vec<Group>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::Groups, move || async move { api.my_groups().await })
            .await
    }

    /// Invitations awaiting an answer.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn pending_invitations(&self) -> Result<Arc<Vec<Invitation>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::PendingInvitations, move || async move {
                api.pending_invitations().await
            })
            .await
    }

    /// Comments on a task.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn task_comments(&self, task_id: EntityId) -> Result<Arc<Vec<Comment>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::TaskComments(task_id), move || async move {
                api.comments(task_id).await
            })
            .await
    }

    /// First page of the activity feed.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn activities(&self) -> Result<Arc<Page<ActivityLog>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::Activities, move || async move {
                api.recent_activities(0, ACTIVITY_PAGE_SIZE).await
            })
            .await
    }

    /// First page of one task's activity.
    ///
    /// # Errors
    ///
    /// Propagates the load error.
    pub async fn task_activities(&self, task_id: EntityId) -> Result<Arc<Page<ActivityLog>>, ApiError> {
        let api = self.inner.api.clone();
        self.inner
            .cache
            .fetch(CacheKey::TaskActivities(task_id), move || async move {
                api.task_activities(task_id, 0, ACTIVITY_PAGE_SIZE).await
            })
            .await
    }

    /// Live view of every visible task.
    #[must_use]
    pub fn watch_tasks(&self) -> QueryHandle<Vec<Task>> {
        let api = self.inner.api.clone();
        self.inner.cache.watch(CacheKey::Tasks, move || {
            let api = api.clone();
            async move { api.list_tasks().await }
        })
    }

    /// Live view of one group's tasks.
    #[must_use]
    pub fn watch_group_tasks(&self, group_id: EntityId) -> QueryHandle<Vec<Task>> {
        let api = self.inner.api.clone();
        self.inner.cache.watch(CacheKey::GroupTasks(group_id), move || {
            let api = api.clone();
            async move { api.tasks_by_group(group_id).await }
        })
    }

    // Task mutations.

    /// Create a task. Task lists are invalidated on success.
    ///
    /// # Errors
    ///
    /// [`ApiError::Validation`] for a rejected payload; the cache is left
    /// untouched.
    pub async fn create_task(&self, draft: &TaskDraft) -> Result<Task, ApiError> {
        let created = self.inner.api.create_task(&draft.to_create_payload()).await?;
        tracing::info!(task_id = created.id, "task created");
        self.invalidate_task_lists();
        Ok(created)
    }

    /// Replace a task's fields, subject to the edit permission rule.
    ///
    /// # Errors
    ///
    /// [`ApiError::Forbidden`] before any request when the user may not make
    /// this edit, otherwise the server's answer.
    pub async fn update_task(&self, id: EntityId, draft: &TaskDraft) -> Result<Task, ApiError> {
        let current = self.task(id).await?;
        check_update(&current, draft, &self.username()?)?;
        let updated = self.inner.api.update_task(id, &draft.to_update_payload()).await?;
        self.invalidate_task_lists();
        Ok(updated)
    }

    /// Delete a task. Only its owner may.
    ///
    /// # Errors
    ///
    /// [`ApiError::Forbidden`] for non-owners, otherwise the server's answer.
    pub async fn delete_task(&self, id: EntityId) -> Result<(), ApiError> {
        let current = self.task(id).await?;
        check_delete(&current, &self.username()?)?;
        self.inner.api.delete_task(id).await?;
        self.invalidate_task_lists();
        Ok(())
    }

    /// Comment on a task as its owner or assignee.
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidState`] for blank text, [`ApiError::Forbidden`]
    /// for other users.
    pub async fn add_comment(&self, task_id: EntityId, text: &str) -> Result<Comment, ApiError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ApiError::InvalidState("comment is empty".to_string()));
        }
        let task = self.task(task_id).await?;
        let username = self.username()?;
        if !can_comment(&task, &username) {
            return Err(ApiError::Forbidden(format!(
                "{username} cannot comment on task {task_id}"
            )));
        }
        let comment = self.inner.api.add_comment(task_id, text).await?;
        for key in [
            CacheKey::TaskComments(task_id),
            CacheKey::TaskActivities(task_id),
            CacheKey::Activities,
        ] {
            self.inner.cache.invalidate(&key);
        }
        Ok(comment)
    }

    // Group and invitation mutations.

    /// Create a group.
    ///
    /// # Errors
    ///
    /// Propagates the server's answer.
    pub async fn create_group(&self, name: &str) -> Result<Group, ApiError> {
        let group = self.inner.api.create_group(name.trim()).await?;
        self.inner.cache.invalidate(&CacheKey::Groups);
        Ok(group)
    }

    /// Leave a group. Its tasks drop out of the visible lists.
    ///
    /// # Errors
    ///
    /// Propagates the server's answer.
    pub async fn leave_group(&self, id: EntityId) -> Result<(), ApiError> {
        self.inner.api.leave_group(id).await?;
        self.inner.cache.invalidate(&CacheKey::Groups);
        self.invalidate_task_lists();
        Ok(())
    }

    /// Delete a group and, server-side, its tasks.
    ///
    /// # Errors
    ///
    /// Propagates the server's answer.
    pub async fn delete_group(&self, id: EntityId) -> Result<(), ApiError> {
        self.inner.api.delete_group(id).await?;
        self.inner.cache.invalidate(&CacheKey::Groups);
        self.invalidate_task_lists();
        Ok(())
    }

    /// Invite `email` to a group.
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidState`] for a blank address, otherwise the
    /// server's answer.
    pub async fn invite(&self, group_id: EntityId, email: &str) -> Result<(), ApiError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(ApiError::InvalidState("email is empty".to_string()));
        }
        self.inner.api.invite(group_id, email).await
    }

    /// Accept a pending invitation.
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidState`] if the invitation was already answered.
    pub async fn accept_invitation(&self, id: EntityId) -> Result<(), ApiError> {
        self.ensure_pending(id)?;
        self.inner.api.accept_invitation(id).await?;
        self.resolve_invitation(id, InvitationStatus::Accepted);
        self.inner.cache.invalidate(&CacheKey::PendingInvitations);
        self.inner.cache.invalidate(&CacheKey::Groups);
        Ok(())
    }

    /// Decline a pending invitation.
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidState`] if the invitation was already answered.
    pub async fn decline_invitation(&self, id: EntityId) -> Result<(), ApiError> {
        self.ensure_pending(id)?;
        self.inner.api.decline_invitation(id).await?;
        self.resolve_invitation(id, InvitationStatus::Rejected);
        self.inner.cache.invalidate(&CacheKey::PendingInvitations);
        Ok(())
    }

    fn ensure_pending(&self, id: EntityId) -> Result<(), ApiError> {
        let known = self.inner.resolved_invitations.lock().get(&id).copied().or_else(|| {
            self.inner
                .cache
                .get::<Vec<Invitation>>(&CacheKey::PendingInvitations)
                .and_then(|e| e.data.iter().find(|i| i.id == id).map(|i| i.status))
        });
        match known {
            Some(status) if status.is_terminal() => Err(ApiError::InvalidState(format!(
                "invitation {id} is already {status:?}"
            ))),
            _ => Ok(()),
        }
    }

    fn resolve_invitation(&self, id: EntityId, status: InvitationStatus) {
        self.inner.resolved_invitations.lock().insert(id, status);
    }
}

/// Guard returned by [`SyncCoordinator::watch_topic`].
#[derive(Debug)]
pub struct TopicInterest {
    inner: Weak<Inner>,
    topic: Topic,
}

impl TopicInterest {
    /// Watched topic.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for TopicInterest {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut interests = inner.interests.lock();
        let Some(interest) = interests.get_mut(&self.topic) else {
            return;
        };
        interest.count = interest.count.saturating_sub(1);
        if interest.count == 0
            && let Some(removed) = interests.remove(&self.topic)
            && let Some(handle) = removed.handle
        {
            inner.bridge.unsubscribe(&handle);
        }
    }
}
