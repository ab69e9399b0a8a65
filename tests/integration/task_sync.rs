// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::too_many_lines
)]

//! Integration tests for task synchronization: mutations, kanban moves,
//! optimistic updates and push-driven invalidation.
//!
//! The REST API is a wiremock server; real-time tests add the in-process
//! `taskflow-broker`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use taskflow::api::Api;
use taskflow::cache::{CacheKey, QueryCache};
use taskflow::http::{ApiError, HttpClient, HttpConfig};
use taskflow::realtime::{RealtimeBridge, RealtimeConfig, RealtimeMessage};
use taskflow::session::TokenStore;
use taskflow::sync::{DropTarget, MoveOutcome, SyncCoordinator, TaskDraft};
use taskflow_broker::broker::{self, BrokerState};
use taskflow_proto::model::{Task, TaskPriority, TaskStatus};
use taskflow_proto::topic::Topic;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Helpers
// =============================================================================

fn user(id: i64, username: &str) -> serde_json::Value {
    serde_json::json!({ "id": id, "username": username })
}

fn task(id: i64, title: &str, status: &str, owner: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": title,
        "description": "",
        "status": status,
        "priority": "MEDIUM",
        "createdAt": "2026-03-01T09:00:00",
        "owner": user(1, owner),
    })
}

fn assigned(mut task: serde_json::Value, assignee: &str) -> serde_json::Value {
    task["assignedUser"] = user(2, assignee);
    task
}

fn sync_for(server: &MockServer, ws_url: &str) -> SyncCoordinator {
    let tokens = Arc::new(TokenStore::in_memory());
    tokens.set_credentials("a1", "r1", "alice");
    let http = HttpClient::new(
        HttpConfig::with_base_url(format!("{}/api", server.uri())),
        Arc::clone(&tokens),
    )
    .unwrap();
    let bridge = RealtimeBridge::new(
        RealtimeConfig {
            reconnect_delay: Duration::from_millis(100),
            ..RealtimeConfig::with_url(ws_url)
        },
        tokens,
    );
    SyncCoordinator::new(Api::new(http), QueryCache::default(), bridge)
}

/// Coordinator whose bridge is never connected.
fn offline_sync(server: &MockServer) -> SyncCoordinator {
    sync_for(server, "ws://127.0.0.1:9/ws")
}

async fn mount_board(server: &MockServer, tasks: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tasks))
        .mount(server)
        .await;
}

fn cached_status(sync: &SyncCoordinator, id: i64) -> TaskStatus {
    let entry = sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).unwrap();
    entry.data.iter().find(|t| t.id == id).unwrap().status
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Creating tasks
// =============================================================================

#[tokio::test]
async fn created_task_shows_up_on_next_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    let created = serde_json::json!({
        "id": 42,
        "title": "Ship release",
        "description": "",
        "status": "TO_DO",
        "priority": "HIGH",
        "createdAt": "2026-03-02T10:15:00",
        "owner": user(1, "alice"),
    });
    Mock::given(method("POST"))
        .and(path("/api/tasks"))
        .and(body_partial_json(serde_json::json!({
            "title": "Ship release",
            "status": "TO_DO",
            "priority": "HIGH"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(&created))
        .expect(1)
        .mount(&server)
        .await;
    mount_board(&server, serde_json::json!([created])).await;

    let sync = offline_sync(&server);
    assert!(sync.tasks().await.unwrap().is_empty());

    let draft = TaskDraft {
        priority: TaskPriority::High,
        ..TaskDraft::new("Ship release")
    };
    let task = sync.create_task(&draft).await.unwrap();
    assert_eq!(task.id, 42);
    assert!(sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).unwrap().is_stale);

    let tasks = sync.tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, 42);
    assert_eq!(tasks[0].created_at.to_string(), "2026-03-02 10:15:00");
}

#[tokio::test]
async fn rejected_create_leaves_cache_untouched() {
    let server = MockServer::start().await;
    mount_board(&server, serde_json::json!([task(1, "a", "TO_DO", "alice")])).await;
    Mock::given(method("POST"))
        .and(path("/api/tasks"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "message": "Validation failed",
                "validationErrors": { "title": "must not be blank" }
            })),
        )
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    let err = sync.create_task(&TaskDraft::new("")).await.unwrap_err();
    assert_eq!(err.field_error("title"), Some("must not be blank"));
    assert!(!sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).unwrap().is_stale);
}

// =============================================================================
// Kanban moves
// =============================================================================

#[tokio::test]
async fn drag_to_another_column_sends_one_update() {
    let server = MockServer::start().await;
    mount_board(&server, serde_json::json!([task(1, "a", "TO_DO", "alice")])).await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/1"))
        .and(body_partial_json(serde_json::json!({ "status": "IN_PROGRESS", "title": "a" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(1, "a", "IN_PROGRESS", "alice")))
        .expect(1)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    let outcome = sync
        .move_task(&CacheKey::Tasks, 1, DropTarget::Column(TaskStatus::InProgress))
        .await
        .unwrap();
    let MoveOutcome::Moved(moved) = outcome else {
        panic!("expected a move");
    };
    assert_eq!(moved.status, TaskStatus::InProgress);
    assert_eq!(cached_status(&sync, 1), TaskStatus::InProgress);
    assert!(sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).unwrap().is_stale);
}

#[tokio::test]
async fn drop_on_a_card_uses_that_cards_column() {
    let server = MockServer::start().await;
    mount_board(
        &server,
        serde_json::json!([task(1, "a", "TO_DO", "alice"), task(2, "b", "COMPLETED", "alice")]),
    )
    .await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/1"))
        .and(body_partial_json(serde_json::json!({ "status": "COMPLETED" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(1, "a", "COMPLETED", "alice")))
        .expect(1)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    let target = DropTarget::parse("2").unwrap();
    let outcome = sync.move_task(&CacheKey::Tasks, 1, target).await.unwrap();
    assert!(matches!(outcome, MoveOutcome::Moved(t) if t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn drop_on_own_column_makes_no_request() {
    let server = MockServer::start().await;
    mount_board(
        &server,
        serde_json::json!([task(1, "a", "TO_DO", "alice"), task(2, "b", "TO_DO", "alice")]),
    )
    .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    for target in [
        DropTarget::Column(TaskStatus::Todo),
        DropTarget::Task(2),
        DropTarget::Task(99),
    ] {
        let outcome = sync.move_task(&CacheKey::Tasks, 1, target).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Unchanged);
    }
    assert!(!sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).unwrap().is_stale);
}

#[tokio::test]
async fn move_is_visible_before_the_server_answers() {
    let server = MockServer::start().await;
    mount_board(&server, serde_json::json!([task(1, "a", "TO_DO", "alice")])).await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(task(1, "a", "COMPLETED", "alice"))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    let mover = sync.clone();
    let pending = tokio::spawn(async move {
        mover
            .move_task(&CacheKey::Tasks, 1, DropTarget::Column(TaskStatus::Completed))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cached_status(&sync, 1), TaskStatus::Completed);

    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn refused_move_is_reverted() {
    let server = MockServer::start().await;
    mount_board(&server, serde_json::json!([task(1, "a", "TO_DO", "alice")])).await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    let err = sync
        .move_task(&CacheKey::Tasks, 1, DropTarget::Column(TaskStatus::InProgress))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Server { status: 500, .. }));

    let entry = sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).unwrap();
    assert_eq!(entry.data[0].status, TaskStatus::Todo);
    assert!(entry.is_stale);
}

#[tokio::test]
async fn only_owner_or_assignee_may_move() {
    let server = MockServer::start().await;
    mount_board(
        &server,
        serde_json::json!([
            task(1, "theirs", "TO_DO", "bob"),
            assigned(task(2, "mine to do", "TO_DO", "bob"), "alice"),
        ]),
    )
    .await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigned(
            task(2, "mine to do", "IN_PROGRESS", "bob"),
            "alice",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    let err = sync
        .move_task(&CacheKey::Tasks, 1, DropTarget::Column(TaskStatus::InProgress))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(_)));
    assert_eq!(cached_status(&sync, 1), TaskStatus::Todo);

    sync.move_task(&CacheKey::Tasks, 2, DropTarget::Column(TaskStatus::InProgress))
        .await
        .unwrap();
}

#[tokio::test]
async fn move_on_unloaded_board_is_an_error() {
    let server = MockServer::start().await;
    let sync = offline_sync(&server);

    let err = sync
        .move_task(&CacheKey::GroupTasks(3), 1, DropTarget::Column(TaskStatus::Completed))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));
}

// =============================================================================
// Edits and comments
// =============================================================================

#[tokio::test]
async fn assignee_cannot_rename_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks/5"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(assigned(task(5, "Plan", "TO_DO", "bob"), "alice")),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    let current = sync.task(5).await.unwrap();
    let mut draft = TaskDraft::from_task(&current);
    draft.title = "Renamed".into();

    assert!(matches!(sync.update_task(5, &draft).await, Err(ApiError::Forbidden(_))));
    assert!(matches!(sync.delete_task(5).await, Err(ApiError::Forbidden(_))));
}

#[tokio::test]
async fn comments_invalidate_the_thread() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(5, "Plan", "TO_DO", "alice")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tasks/5/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/tasks/5/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 1,
            "text": "on it",
            "createdAt": "2026-03-02T10:00:00",
            "user": user(1, "alice")
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.task_comments(5).await.unwrap();

    assert!(matches!(sync.add_comment(5, "   ").await, Err(ApiError::InvalidState(_))));
    sync.add_comment(5, "on it").await.unwrap();
    assert!(
        sync.cache()
            .get::<Vec<taskflow_proto::model::Comment>>(&CacheKey::TaskComments(5))
            .unwrap()
            .is_stale
    );
}

#[tokio::test]
async fn answered_invitation_cannot_be_answered_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/invitations/8/accept"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/invitations/8/decline"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let sync = offline_sync(&server);
    sync.accept_invitation(8).await.unwrap();
    assert!(matches!(sync.accept_invitation(8).await, Err(ApiError::InvalidState(_))));
    assert!(matches!(sync.decline_invitation(8).await, Err(ApiError::InvalidState(_))));
}

// =============================================================================
// Pushes
// =============================================================================

#[tokio::test]
async fn push_and_update_in_the_same_tick_converge_on_server_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([task(1, "a", "TO_DO", "alice")])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(1, "a", "IN_PROGRESS", "alice")))
        .mount(&server)
        .await;
    // By the time the client refetches, someone else finished the task.
    mount_board(&server, serde_json::json!([task(1, "a (done)", "COMPLETED", "alice")])).await;

    let sync = offline_sync(&server);
    sync.tasks().await.unwrap();

    let push = RealtimeMessage {
        topic: Topic::Tasks,
        body: serde_json::json!({ "id": 1, "status": "COMPLETED" }),
    };
    let (moved, ()) = tokio::join!(
        sync.move_task(&CacheKey::Tasks, 1, DropTarget::Column(TaskStatus::InProgress)),
        async { sync.handle_push(&push) },
    );
    moved.unwrap();

    let tasks = sync.tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "a (done)");
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert!(!sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).unwrap().is_stale);
}

#[tokio::test]
async fn broker_push_refreshes_watched_board() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([task(1, "a", "TO_DO", "alice")])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_board(&server, serde_json::json!([task(1, "a", "COMPLETED", "alice")])).await;

    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = broker::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let sync = sync_for(&server, &format!("ws://{addr}/ws"));
    let interest = sync.watch_topic(Topic::Tasks);
    let mut board = sync.watch_tasks();
    assert_eq!(board.ready().await.unwrap()[0].status, TaskStatus::Todo);

    sync.start();
    eventually("subscription", || async {
        state.subscriber_count("/topic/tasks").await == 1
    })
    .await;

    state.publish("/topic/tasks", br#"{"id":1}"#).await;
    let refreshed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(tasks) = board.changed().await
                && tasks[0].status == TaskStatus::Completed
            {
                return tasks;
            }
        }
    })
    .await
    .expect("board was not refetched");
    assert_eq!(refreshed.len(), 1);

    drop(interest);
    eventually("unsubscribe", || async {
        state.subscriber_count("/topic/tasks").await == 0
    })
    .await;
    sync.stop().await;
}

#[tokio::test]
async fn board_loaded_before_first_read_is_ready_at_once() {
    let server = MockServer::start().await;
    mount_board(&server, serde_json::json!([task(1, "a", "IN_PROGRESS", "alice")])).await;
    let sync = offline_sync(&server);

    let mut board = sync.watch_tasks();
    eventually("board load", || async { board.current().is_some() }).await;

    let tasks = tokio::time::timeout(Duration::from_millis(200), board.ready())
        .await
        .expect("ready() waited for another change")
        .unwrap();
    assert_eq!(tasks[0].status, TaskStatus::InProgress);

    drop(board);
    assert!(sync.cache().get::<Vec<Task>>(&CacheKey::Tasks).is_none());
}

#[tokio::test]
async fn topic_interests_share_one_subscription() {
    let server = MockServer::start().await;
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = broker::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let sync = sync_for(&server, &format!("ws://{addr}/ws"));
    sync.start();

    let first = sync.watch_topic(Topic::GroupTasks(3));
    eventually("subscription", || async {
        state.subscriber_count("/topic/groups/3/tasks").await == 1
    })
    .await;
    let second = sync.watch_topic(Topic::GroupTasks(3));
    assert_eq!(sync.bridge().handler_count(&Topic::GroupTasks(3)), 1);

    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.subscriber_count("/topic/groups/3/tasks").await, 1);

    drop(second);
    eventually("unsubscribe", || async {
        state.subscriber_count("/topic/groups/3/tasks").await == 0
    })
    .await;
    assert!(sync.watched_topics().is_empty());
    sync.stop().await;
}

#[tokio::test]
async fn reconnect_restores_interests() {
    let server = MockServer::start().await;
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = broker::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let sync = sync_for(&server, &format!("ws://{addr}/ws"));
    let _interest = sync.watch_topic(Topic::TaskComments(4));
    sync.start();
    eventually("subscription", || async {
        state.subscriber_count("/topic/tasks/4/comments").await == 1
    })
    .await;

    state.close_all_connections().await;
    eventually("session to drop", || async { state.session_count().await == 0 }).await;
    eventually("resubscription", || async {
        state.subscriber_count("/topic/tasks/4/comments").await == 1
    })
    .await;
    sync.stop().await;
}
