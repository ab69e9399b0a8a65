//! `taskflow`: command-line client for the team task manager.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/taskflow/config.toml`). The session is persisted between
//! runs.
//!
//! ```bash
//! # Log in against a local server
//! TASKFLOW_PASSWORD=secret cargo run --bin taskflow -- login alice
//!
//! # List, move, follow
//! cargo run --bin taskflow -- tasks --status IN_PROGRESS
//! cargo run --bin taskflow -- move 12 COMPLETED
//! cargo run --bin taskflow -- watch --group 3
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use taskflow::api::Api;
use taskflow::app::{AppCommand, AppConfig, AppController, AppEvent, View};
use taskflow::cache::{CacheKey, QueryCache};
use taskflow::config::{CliArgs, CliCommand, ClientConfig};
use taskflow::http::{ApiError, HttpClient};
use taskflow::realtime::RealtimeBridge;
use taskflow::session::{FileStorage, MemoryStorage, TokenStore};
use taskflow::sync::{DropTarget, MoveOutcome, SyncCoordinator};
use taskflow_proto::model::{Task, TaskStatus};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(api = %config.api_base_url, ws = %config.ws_url, "taskflow starting");

    let command = cli.command.clone().unwrap_or(CliCommand::Tasks { status: None });
    match run(command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(err = %e, "command failed");
            eprintln!("Error: {e}");
            if e.requires_login() {
                eprintln!("Run `taskflow login <username>` first.");
            }
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Stdout carries command output, so logs go to a file. Returns a
/// [`WorkerGuard`] that must be held until shutdown to flush buffered
/// entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("taskflow.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn build(config: &ClientConfig) -> Result<SyncCoordinator, ApiError> {
    let tokens = Arc::new(match config.session_path() {
        Some(path) => TokenStore::load(FileStorage::new(path)),
        None => {
            tracing::warn!("no data directory, session will not be persisted");
            TokenStore::load(MemoryStorage::new())
        }
    });
    let http = HttpClient::new(config.to_http_config(), Arc::clone(&tokens))?;
    let bridge = RealtimeBridge::new(config.to_realtime_config(), tokens);
    Ok(SyncCoordinator::new(
        Api::new(http),
        QueryCache::with_gc_time(config.stale_time, config.gc_time),
        bridge,
    ))
}

async fn run(command: CliCommand, config: &ClientConfig) -> Result<(), ApiError> {
    let sync = build(config)?;
    let api = sync.api();

    match command {
        CliCommand::Login { username, password } => {
            let user = api.login(&username, &password).await?;
            println!("Logged in as {user}");
        }
        CliCommand::Register {
            username,
            email,
            password,
        } => {
            api.register(&username, &email, &password).await?;
            println!("Registered {username}; log in to start a session");
        }
        CliCommand::Logout => {
            api.logout().await;
            println!("Logged out");
        }
        CliCommand::Whoami => match api.http().tokens().username() {
            Some(user) => println!("{user}"),
            None => println!("Not logged in"),
        },
        CliCommand::Tasks { status } => {
            let tasks = match status {
                Some(s) => sync.tasks_by_status(s).await?,
                None => sync.tasks().await?,
            };
            print_board(&tasks);
        }
        CliCommand::Move { id, status } => {
            sync.tasks().await?;
            match sync.move_task(&CacheKey::Tasks, id, DropTarget::Column(status)).await? {
                MoveOutcome::Unchanged => println!("Task {id} is already {status}"),
                MoveOutcome::Moved(task) => println!("Moved #{} {} to {}", task.id, task.title, task.status),
            }
        }
        CliCommand::Watch { group } => watch(sync, config, group).await?,
    }
    Ok(())
}

async fn watch(
    sync: SyncCoordinator,
    config: &ClientConfig,
    group: Option<taskflow_proto::model::EntityId>,
) -> Result<(), ApiError> {
    if !sync.api().http().tokens().is_authenticated() {
        return Err(ApiError::Unauthorized);
    }
    let mut board = match group {
        Some(id) => sync.watch_group_tasks(id),
        None => sync.watch_tasks(),
    };
    let app_config = AppConfig {
        activity_poll_interval: config.activity_poll_interval,
        ..AppConfig::default()
    };
    let (commands, mut events) = AppController::spawn(sync, &app_config);
    if let Some(id) = group {
        let _ = commands.send(AppCommand::SwitchView(View::Group(id))).await;
    }

    match board.ready().await {
        Some(tasks) => print_counts(&tasks),
        None => {
            if let Some(e) = board.error() {
                eprintln!("Error: {e}");
            }
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            tasks = board.changed() => {
                match (tasks, board.error()) {
                    (_, Some(e)) => eprintln!("Error: {e}"),
                    (Some(tasks), None) => print_counts(&tasks),
                    (None, None) => break,
                }
            }
            event = events.recv() => match event {
                Some(AppEvent::Connection(state)) => println!("realtime: {state:?}"),
                Some(AppEvent::LoginRequired) => {
                    eprintln!("Session expired. Run `taskflow login <username>`.");
                    break;
                }
                Some(AppEvent::Error(message)) => eprintln!("Error: {message}"),
                Some(_) => {}
                None => break,
            },
        }
    }

    let _ = commands.send(AppCommand::Shutdown).await;
    // Drain until the controller closes its side.
    while events.recv().await.is_some() {}
    Ok(())
}

fn print_board(tasks: &[Task]) {
    for status in TaskStatus::ALL {
        println!("{status}");
        for task in tasks.iter().filter(|t| t.status == status) {
            let assignee = task
                .assigned_user
                .as_ref()
                .map_or_else(String::new, |u| format!(" @{}", u.username));
            println!("  #{:<5} [{:?}] {}{assignee}", task.id, task.priority, task.title);
        }
    }
}

fn print_counts(tasks: &[Task]) {
    let counts: Vec<String> = TaskStatus::ALL
        .iter()
        .map(|s| format!("{s}={}", tasks.iter().filter(|t| t.status == *s).count()))
        .collect();
    println!("{}", counts.join(" "));
}
