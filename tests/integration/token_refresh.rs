// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for transparent token refresh.
//!
//! A wiremock server plays the REST API. Requests carrying the stale token
//! `old` are rejected with 401; the refresh endpoint hands out `new`.

use std::sync::Arc;
use std::time::Duration;

use taskflow::api::Api;
use taskflow::app::{AppCommand, AppConfig, AppController, AppEvent};
use taskflow::cache::QueryCache;
use taskflow::http::{ApiError, HttpClient, HttpConfig};
use taskflow::realtime::{RealtimeBridge, RealtimeConfig};
use taskflow::session::{FileStorage, SessionState, TokenStore};
use taskflow::sync::SyncCoordinator;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Helpers
// =============================================================================

fn task_list() -> serde_json::Value {
    serde_json::json!([{
        "id": 1,
        "title": "Ship release",
        "status": "TO_DO",
        "priority": "HIGH",
        "createdAt": "2026-03-01T09:00:00",
        "owner": { "id": 1, "username": "alice" }
    }])
}

fn expired_session() -> Arc<TokenStore> {
    let tokens = Arc::new(TokenStore::in_memory());
    tokens.set_credentials("old", "r1", "alice");
    tokens
}

fn api_for(server: &MockServer, tokens: &Arc<TokenStore>) -> Api {
    let http = HttpClient::new(
        HttpConfig::with_base_url(format!("{}/api", server.uri())),
        Arc::clone(tokens),
    )
    .unwrap();
    Api::new(http)
}

async fn mount_tasks(server: &MockServer, stale_hits: u64, fresh_hits: u64) {
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .and(header("authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .expect(stale_hits)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .and(header("authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task_list()))
        .expect(fresh_hits)
        .mount(server)
        .await;
}

async fn mount_refresh(server: &MockServer, response: ResponseTemplate, hits: u64) {
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .and(body_json(serde_json::json!({ "refreshToken": "r1" })))
        .respond_with(response)
        .expect(hits)
        .mount(server)
        .await;
}

fn refreshed() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_json(serde_json::json!({ "accessToken": "new", "refreshToken": "r2" }))
        .set_delay(Duration::from_millis(250))
}

// =============================================================================
// Single request
// =============================================================================

#[tokio::test]
async fn expired_access_token_is_refreshed_transparently() {
    let server = MockServer::start().await;
    mount_tasks(&server, 1, 1).await;
    mount_refresh(&server, refreshed(), 1).await;

    let tokens = expired_session();
    let api = api_for(&server, &tokens);

    let tasks = api.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Ship release");
    assert_eq!(tokens.access_token().as_deref(), Some("new"));
    assert_eq!(tokens.refresh_token().as_deref(), Some("r2"));
    assert_eq!(
        tokens.state(),
        SessionState::Authenticated {
            username: "alice".into()
        }
    );
}

#[tokio::test]
async fn rejected_refresh_ends_the_session() {
    let server = MockServer::start().await;
    mount_tasks(&server, 1, 0).await;
    mount_refresh(&server, ResponseTemplate::new(401), 1).await;

    let tokens = expired_session();
    let mut session = tokens.subscribe();
    let api = api_for(&server, &tokens);

    let err = api.list_tasks().await.unwrap_err();
    assert!(matches!(err, ApiError::SessionExpired));
    assert!(err.requires_login());
    assert!(!tokens.is_authenticated());
    assert!(tokens.refresh_token().is_none());

    session.changed().await.unwrap();
    assert_eq!(*session.borrow(), SessionState::Expired);

    // A later call goes out without a token and does not try to refresh.
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    let again = api.list_tasks().await.unwrap_err();
    assert!(again.requires_login());
}

#[tokio::test]
async fn refreshed_pair_is_persisted() {
    let dir = std::env::temp_dir().join(format!("taskflow-refresh-{}", uuid::Uuid::now_v7()));
    let file = dir.join("session.json");

    let server = MockServer::start().await;
    mount_tasks(&server, 1, 1).await;
    mount_refresh(&server, refreshed(), 1).await;

    let tokens = Arc::new(TokenStore::load(FileStorage::new(&file)));
    tokens.set_credentials("old", "r1", "alice");
    api_for(&server, &tokens).list_tasks().await.unwrap();

    let restored = TokenStore::load(FileStorage::new(&file));
    assert_eq!(restored.access_token().as_deref(), Some("new"));
    assert_eq!(restored.refresh_token().as_deref(), Some("r2"));
    assert_eq!(restored.username().as_deref(), Some("alice"));

    let _ = std::fs::remove_dir_all(dir);
}

// =============================================================================
// Concurrent 401s
// =============================================================================

#[tokio::test]
async fn concurrent_401s_share_one_refresh() {
    const N: u64 = 8;
    let server = MockServer::start().await;
    mount_tasks(&server, N, N).await;
    mount_refresh(&server, refreshed(), 1).await;

    let tokens = expired_session();
    let api = api_for(&server, &tokens);

    let calls = (0..N).map(|_| {
        let api = api.clone();
        tokio::spawn(async move { api.list_tasks().await })
    });
    let results = futures_util::future::join_all(calls).await;

    for result in results {
        let tasks = result.unwrap().unwrap();
        assert_eq!(tasks.len(), 1);
    }
    assert_eq!(tokens.access_token().as_deref(), Some("new"));
    // `expect` counts are verified when the server drops: one refresh, each
    // request retried exactly once.
}

#[tokio::test]
async fn concurrent_401s_fail_once_when_refresh_is_refused() {
    const N: u64 = 5;
    let server = MockServer::start().await;
    mount_tasks(&server, N, 0).await;
    mount_refresh(
        &server,
        ResponseTemplate::new(401).set_delay(Duration::from_millis(100)),
        1,
    )
    .await;

    let tokens = expired_session();
    let api = api_for(&server, &tokens);

    let calls = (0..N).map(|_| {
        let api = api.clone();
        tokio::spawn(async move { api.list_tasks().await })
    });
    for result in futures_util::future::join_all(calls).await {
        assert!(matches!(result.unwrap(), Err(ApiError::SessionExpired)));
    }
    assert_eq!(tokens.state(), SessionState::Expired);
}

// =============================================================================
// Controller reaction
// =============================================================================

#[tokio::test]
async fn controller_asks_for_login_when_session_expires() {
    let server = MockServer::start().await;
    mount_tasks(&server, 1, 0).await;
    mount_refresh(&server, ResponseTemplate::new(401), 1).await;

    let tokens = expired_session();
    let api = api_for(&server, &tokens);
    let bridge = RealtimeBridge::new(
        RealtimeConfig {
            reconnect_delay: Duration::from_secs(60),
            ..RealtimeConfig::with_url("ws://127.0.0.1:9/ws")
        },
        Arc::clone(&tokens),
    );
    let sync = SyncCoordinator::new(api, QueryCache::default(), bridge);

    let (commands, mut events) = AppController::spawn(sync.clone(), &AppConfig::default());
    assert!(sync.tasks().await.unwrap_err().requires_login());

    let login_required = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(AppEvent::LoginRequired) => return true,
                Some(_) => {}
                None => return false,
            }
        }
    })
    .await
    .expect("timed out waiting for LoginRequired");
    assert!(login_required);
    assert!(sync.watched_topics().is_empty());

    commands.send(AppCommand::Shutdown).await.unwrap();
}
