//! Application controller: a typed command channel in, an event stream out.
//!
//! Front-ends send [`AppCommand`]s and render [`AppEvent`]s. The controller
//! owns the topic interests of whatever is on screen, keeps the activity
//! feed polled, and reacts to the session signal: when the HTTP client
//! gives up on a session the cache is emptied, the broker connection is
//! closed and [`AppEvent::LoginRequired`] is emitted.

use std::time::Duration;

use taskflow_proto::model::{EntityId, Task};
use taskflow_proto::topic::Topic;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::realtime::ConnectionState;
use crate::session::SessionState;
use crate::sync::{SyncCoordinator, TopicInterest};

/// Which screen is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// All visible tasks as a kanban board.
    Board,
    /// One group's board.
    Group(EntityId),
    /// Groups and invitations.
    Groups,
    /// Activity feed.
    Activity,
}

impl View {
    /// Topic the view needs pushes from.
    #[must_use]
    pub const fn topic(self) -> Option<Topic> {
        match self {
            Self::Board => Some(Topic::Tasks),
            Self::Group(id) => Some(Topic::GroupTasks(id)),
            Self::Groups | Self::Activity => None,
        }
    }
}

/// Commands sent from a front-end to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    /// Show a task's details.
    OpenTask {
        /// Task to open.
        id: EntityId,
    },
    /// Close the task detail pane.
    CloseTask,
    /// Change screen.
    SwitchView(View),
    /// End the session.
    Logout,
    /// Stop the controller.
    Shutdown,
}

/// Events sent from the controller to a front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// A task was loaded for the detail pane.
    TaskOpened(Box<Task>),
    /// The screen changed.
    ViewChanged(View),
    /// Broker connection status.
    Connection(ConnectionState),
    /// The session could not be refreshed; show the login screen.
    LoginRequired,
    /// The user logged out.
    LoggedOut,
    /// A command failed.
    Error(String),
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Activity feed refresh period.
    pub activity_poll_interval: Duration,
    /// Capacity of both channels.
    pub channel_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            activity_poll_interval: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

/// State owned by the controller task.
pub struct AppController {
    sync: SyncCoordinator,
    events: mpsc::Sender<AppEvent>,
    view: View,
    view_interest: Option<TopicInterest>,
    task_interest: Option<TopicInterest>,
    poller: CancellationToken,
}

impl AppController {
    /// Start the broker connection and spawn the controller.
    ///
    /// The controller stops on [`AppCommand::Shutdown`] or when every
    /// command sender is dropped.
    #[must_use]
    pub fn spawn(sync: SyncCoordinator, config: &AppConfig) -> (mpsc::Sender<AppCommand>, mpsc::Receiver<AppEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (evt_tx, evt_rx) = mpsc::channel(config.channel_capacity);

        let session = sync.api().http().tokens().subscribe();
        let connection = sync.bridge().watch_state();
        let poller = CancellationToken::new();
        let _poll_task = sync.spawn_activity_poller(config.activity_poll_interval, poller.clone());
        sync.start();

        let mut controller = Self {
            sync,
            events: evt_tx,
            view: View::Board,
            view_interest: None,
            task_interest: None,
            poller,
        };
        controller.enter_view(View::Board);
        tokio::spawn(async move { controller.run(cmd_rx, session, connection).await });

        (cmd_tx, evt_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<AppCommand>,
        mut session: watch::Receiver<SessionState>,
        mut connection: watch::Receiver<ConnectionState>,
    ) {
        tracing::info!("app controller started");
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                changed = session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = session.borrow_and_update().clone();
                    self.on_session(state).await;
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let state = *connection.borrow_and_update();
                    self.emit(AppEvent::Connection(state)).await;
                }
            }
        }
        self.shutdown().await;
        tracing::info!("app controller stopped");
    }

    /// Returns `false` when the controller should stop.
    async fn handle_command(&mut self, cmd: AppCommand) -> bool {
        tracing::debug!(?cmd, "command");
        match cmd {
            AppCommand::OpenTask { id } => match self.sync.task(id).await {
                Ok(task) => {
                    self.task_interest = Some(self.sync.watch_topic(Topic::TaskComments(id)));
                    self.emit(AppEvent::TaskOpened(Box::new((*task).clone()))).await;
                }
                Err(e) => {
                    tracing::warn!(task_id = id, err = %e, "could not open task");
                    self.emit(AppEvent::Error(e.to_string())).await;
                }
            },
            AppCommand::CloseTask => self.task_interest = None,
            AppCommand::SwitchView(view) => {
                self.enter_view(view);
                self.emit(AppEvent::ViewChanged(view)).await;
            }
            AppCommand::Logout => {
                self.sync.api().logout().await;
                self.reset().await;
                self.emit(AppEvent::LoggedOut).await;
            }
            AppCommand::Shutdown => return false,
        }
        true
    }

    async fn on_session(&mut self, state: SessionState) {
        match state {
            SessionState::Expired => {
                tracing::warn!("session expired, login required");
                self.reset().await;
                self.emit(AppEvent::LoginRequired).await;
            }
            SessionState::Authenticated { username } => {
                tracing::info!(%username, "session started");
                // Watched keys emptied by the previous logout reload now.
                self.sync.cache().invalidate_matching(|_| true);
                self.sync.start();
                self.enter_view(self.view);
            }
            SessionState::LoggedOut => {}
        }
    }

    fn enter_view(&mut self, view: View) {
        self.view = view;
        self.view_interest = view.topic().map(|t| self.sync.watch_topic(t));
    }

    /// Forget everything tied to the ended session.
    async fn reset(&mut self) {
        self.view_interest = None;
        self.task_interest = None;
        self.sync.stop().await;
        self.sync.cache().clear();
    }

    async fn shutdown(&mut self) {
        self.poller.cancel();
        self.view_interest = None;
        self.task_interest = None;
        self.sync.stop().await;
    }

    async fn emit(&self, event: AppEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}
