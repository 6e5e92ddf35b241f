// Chat bot conversation flow: registration, login, contest enrollment and task play.

pub mod state;
pub mod telegram;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use crate::db::{Task, Team};
use crate::files::FileStore;
use crate::metrics;
use crate::workflow::{TeamWorkflow, WorkflowError};

use state::{ConversationSession, ConversationState, SessionStore};

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"(?i)^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").unwrap();
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

// ── Transport types ──────────────────────────────────────────────────

/// An event received from a chat user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text { chat_id: i64, text: String },
    Button { chat_id: i64, data: String },
}

impl Inbound {
    pub fn chat_id(&self) -> i64 {
        match self {
            Self::Text { chat_id, .. } | Self::Button { chat_id, .. } => *chat_id,
        }
    }
}

/// Inline button actions offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    JoinContest,
    SendGeo,
    WaitingApprove,
    GetTask,
    SubmitAnswer,
    Logout,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinContest => "join_contest",
            Self::SendGeo => "send_geo",
            Self::WaitingApprove => "waiting_approve",
            Self::GetTask => "get_task",
            Self::SubmitAnswer => "submit_answer",
            Self::Logout => "logout",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "join_contest" => Some(Self::JoinContest),
            "send_geo" => Some(Self::SendGeo),
            "waiting_approve" => Some(Self::WaitingApprove),
            "get_task" => Some(Self::GetTask),
            "submit_answer" => Some(Self::SubmitAnswer),
            "logout" => Some(Self::Logout),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::JoinContest => "Join contest",
            Self::SendGeo => "Get location",
            Self::WaitingApprove => "Waiting for approval...",
            Self::GetTask => "Get task",
            Self::SubmitAnswer => "Submit answer",
            Self::Logout => "Log out",
        }
    }
}

/// A message sent to a chat user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text {
        text: String,
        buttons: Vec<Action>,
    },
    Document {
        path: PathBuf,
        caption: String,
        buttons: Vec<Action>,
    },
}

impl Outbound {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(text: impl Into<String>, buttons: Vec<Action>) -> Self {
        Self::Text {
            text: text.into(),
            buttons,
        }
    }

    /// Message text, or the caption of a document.
    pub fn body(&self) -> &str {
        match self {
            Self::Text { text, .. } => text,
            Self::Document { caption, .. } => caption,
        }
    }

    pub fn buttons(&self) -> &[Action] {
        match self {
            Self::Text { buttons, .. } | Self::Document { buttons, .. } => buttons,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("chat API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API error: {0}")]
    Api(String),
    #[error("attachment unreadable: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, chat_id: i64, message: Outbound) -> Result<(), TransportError>;
}

// ── Conversation ─────────────────────────────────────────────────────

/// Bounded wait for a company to approve a team.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(2),
        }
    }
}

/// What to do once the reply for an event has been sent.
enum FollowUp {
    None,
    AwaitApproval { team_id: i64 },
    Forget,
}

struct Step {
    reply: Outbound,
    follow_up: FollowUp,
}

impl From<Outbound> for Step {
    fn from(reply: Outbound) -> Self {
        Step {
            reply,
            follow_up: FollowUp::None,
        }
    }
}

const WELCOME: &str =
    "Welcome!\nTo log in, enter your team's email.\nTo register a new team, send /register.";

/// Drives each chat user through the contest flow, one event at a time.
#[derive(Clone)]
pub struct Conversation {
    workflow: Arc<TeamWorkflow>,
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn ChatTransport>,
    files: FileStore,
    approval: ApprovalPolicy,
}

impl Conversation {
    pub fn new(
        workflow: Arc<TeamWorkflow>,
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn ChatTransport>,
        files: FileStore,
        approval: ApprovalPolicy,
    ) -> Self {
        Self {
            workflow,
            store,
            transport,
            files,
            approval,
        }
    }

    /// Handle one inbound event: advance the user's state and send one reply.
    pub async fn handle(&self, event: Inbound) {
        let chat_id = event.chat_id();
        let stored = self.store.get(chat_id).await;
        let read_state = stored.as_ref().map(|s| s.state);
        let mut session = stored.unwrap_or_default();

        let step = match &event {
            Inbound::Text { text, .. } => {
                metrics::BOT_UPDATES_TOTAL.with_label_values(&["text"]).inc();
                self.on_text(chat_id, &mut session, text).await
            }
            Inbound::Button { data, .. } => {
                metrics::BOT_UPDATES_TOTAL
                    .with_label_values(&["button"])
                    .inc();
                self.on_button(&mut session, data).await
            }
        };

        match step.follow_up {
            FollowUp::Forget => self.store.delete(chat_id).await,
            _ => {
                // The approval wait may have moved the chat on meanwhile
                if !self.store.replace(chat_id, read_state, session).await {
                    tracing::debug!(chat_id, "Conversation state changed concurrently, update dropped");
                }
            }
        }
        self.send(chat_id, step.reply).await;

        if let FollowUp::AwaitApproval { team_id } = step.follow_up {
            tokio::spawn(self.clone().await_approval(chat_id, team_id));
        }
    }

    async fn send(&self, chat_id: i64, message: Outbound) {
        if let Err(e) = self.transport.send(chat_id, message).await {
            tracing::warn!(chat_id, "Failed to deliver chat message: {e}");
        }
    }

    // ── Text messages ────────────────────────────────────────────────

    async fn on_text(&self, chat_id: i64, session: &mut ConversationSession, text: &str) -> Step {
        let input = text.trim();
        use ConversationState::*;

        match session.state {
            Start => self.on_start(session, input).await,
            RegisterConfirm => match input.to_lowercase().as_str() {
                "yes" | "y" | "да" => {
                    session.state = RegisterName;
                    Outbound::text("Enter your team name:").into()
                }
                "no" | "n" | "нет" => {
                    session.state = Start;
                    Outbound::text("OK, enter your email again:").into()
                }
                _ => Outbound::text("Please answer 'yes' or 'no'.").into(),
            },
            RegisterName => {
                if input.is_empty() {
                    return Outbound::text("Team name cannot be empty. Enter your team name:").into();
                }
                session.pending_team_name = Some(input.to_string());
                session.state = RegisterEmail;
                Outbound::text("Enter the email to register:").into()
            }
            RegisterEmail => self.on_register_email(session, input).await,
            Password => self.on_password(chat_id, session, input).await,
            Answer => self.on_answer(session, input).await,
            _ => match input {
                "/start" => {
                    *session = ConversationSession::default();
                    Outbound::text(WELCOME).into()
                }
                "/menu" => self.menu(session).await.into(),
                _ => Outbound::text("Unknown command. Use the menu buttons or send /menu.").into(),
            },
        }
    }

    async fn on_start(&self, session: &mut ConversationSession, input: &str) -> Step {
        match input {
            "/start" => Outbound::text(WELCOME).into(),
            "/register" => {
                session.state = ConversationState::RegisterName;
                Outbound::text("Enter your team name:").into()
            }
            email => match self.workflow.get_team_by_email(email).await {
                Ok(Some(_)) => {
                    session.email = Some(email.to_string());
                    session.state = ConversationState::Password;
                    Outbound::text("Enter your password:").into()
                }
                Ok(None) => {
                    session.email = Some(email.to_string());
                    session.state = ConversationState::RegisterConfirm;
                    Outbound::text(format!(
                        "No team found with email {email}.\nDo you want to register? (yes/no)"
                    ))
                    .into()
                }
                Err(e) => error_reply(&e).into(),
            },
        }
    }

    async fn on_register_email(&self, session: &mut ConversationSession, email: &str) -> Step {
        if !is_valid_email(email) {
            return Outbound::text("Invalid email format. Try again:").into();
        }
        let name = session.pending_team_name.take().unwrap_or_default();
        session.state = ConversationState::Start;

        match self.workflow.register(email, &name).await {
            Ok(_) => Outbound::text(format!(
                "Registration successful!\nA temporary password was sent to {email}.\nEnter your email to log in."
            ))
            .into(),
            Err(e) => Outbound::text(format!("Registration failed: {e}")).into(),
        }
    }

    async fn on_password(
        &self,
        chat_id: i64,
        session: &mut ConversationSession,
        password: &str,
    ) -> Step {
        let email = session.email.clone().unwrap_or_default();

        if self.workflow.authenticate(&email, password).await.is_err() {
            session.state = ConversationState::Start;
            return Outbound::text("Invalid email or password. Try again.\nEnter your email:").into();
        }

        match self.workflow.link_external_identity(&email, chat_id).await {
            Ok(team) => {
                session.team_id = Some(team.id);
                session.state = ConversationState::Menu;
                tracing::info!(team_id = team.id, "Team logged in via chat");
                menu_reply(session.state, Some(&team)).into()
            }
            Err(e) => {
                session.state = ConversationState::Start;
                Outbound::text(format!("Could not link this chat to the team: {e}")).into()
            }
        }
    }

    async fn on_answer(&self, session: &mut ConversationSession, answer: &str) -> Step {
        let (Some(team_id), Some(task_id)) = (session.team_id, session.task_id) else {
            session.state = ConversationState::Menu;
            return self.menu(session).await.into();
        };

        match self.workflow.submit(team_id, task_id, answer).await {
            Ok(outcome) if !outcome.finished => {
                session.state = ConversationState::TaskReceived;
                Outbound::with_buttons(
                    format!(
                        "Wrong answer. Attempts left: {}.",
                        outcome.attempts_left
                    ),
                    vec![Action::SubmitAnswer],
                )
                .into()
            }
            Ok(outcome) => {
                let verdict = if outcome.is_correct {
                    "Correct answer!"
                } else {
                    "Wrong answer. No attempts left for this task."
                };
                self.after_task(session, team_id, verdict).await.into()
            }
            Err(WorkflowError::SessionClosed) => {
                if let Err(e) = self.workflow.settle_expired(team_id).await {
                    tracing::warn!(team_id, "Failed to close expired session: {e}");
                }
                self.after_task(session, team_id, "Time is up for this task.")
                    .await
                    .into()
            }
            Err(e) => {
                session.state = ConversationState::Menu;
                let menu = self.menu(session).await;
                Outbound::with_buttons(
                    format!("Failed to submit answer: {e}"),
                    menu.buttons().to_vec(),
                )
                .into()
            }
        }
    }

    /// Route the team onwards after its task session closed.
    async fn after_task(
        &self,
        session: &mut ConversationSession,
        team_id: i64,
        verdict: &str,
    ) -> Outbound {
        session.task_id = None;
        match self.workflow.next_location(team_id).await {
            Ok(None) => {
                session.state = ConversationState::AllTasksComplete;
                Outbound::with_buttons(
                    format!("{verdict}\n\nAll tasks complete!"),
                    vec![Action::Logout],
                )
            }
            Ok(Some(_)) | Err(_) => {
                session.state = ConversationState::Menu;
                let team = self.workflow.get_team(team_id).await.ok();
                let buttons = menu_buttons(session.state, team.as_ref());
                Outbound::with_buttons(format!("{verdict}\n\nMain menu:"), buttons)
            }
        }
    }

    // ── Buttons ──────────────────────────────────────────────────────

    async fn on_button(&self, session: &mut ConversationSession, data: &str) -> Step {
        let Some(action) = Action::from_str_name(data) else {
            return Outbound::text("Unknown action.").into();
        };

        let Some(team_id) = session.team_id.filter(|_| session.state.is_logged_in()) else {
            return Outbound::text(format!("Please log in first.\n{WELCOME}")).into();
        };

        match action {
            Action::Logout => Step {
                reply: Outbound::text("You have logged out. Send /start to begin again."),
                follow_up: FollowUp::Forget,
            },
            Action::JoinContest => match self.workflow.join_contest(team_id).await {
                Ok(contest) => {
                    session.state = ConversationState::WaitingGeo;
                    Outbound::with_buttons(
                        format!("You joined the contest: {}", contest.name),
                        vec![Action::SendGeo],
                    )
                    .into()
                }
                Err(e) => self.error_with_menu(session, &e).await.into(),
            },
            Action::SendGeo => match self.workflow.next_location(team_id).await {
                Ok(Some(company)) => {
                    session.state = ConversationState::WaitingApprove;
                    let location = if company.location.is_empty() {
                        "(no location provided)".to_string()
                    } else {
                        company.location
                    };
                    Step {
                        reply: Outbound::with_buttons(
                            format!(
                                "Next location: {}\n{location}\n\nWaiting for approval...",
                                company.name
                            ),
                            vec![Action::WaitingApprove],
                        ),
                        follow_up: FollowUp::AwaitApproval { team_id },
                    }
                }
                Ok(None) => {
                    session.state = ConversationState::AllTasksComplete;
                    Outbound::with_buttons("All tasks complete!", vec![Action::Logout]).into()
                }
                Err(e) => self.error_with_menu(session, &e).await.into(),
            },
            Action::WaitingApprove => Outbound::text("Still waiting for approval...").into(),
            Action::GetTask => match self.workflow.assign_task(team_id).await {
                Ok(task) => {
                    session.task_id = Some(task.id);
                    session.state = ConversationState::TaskReceived;
                    self.task_message(&task).into()
                }
                Err(WorkflowError::NoAvailableTask) => {
                    session.state = ConversationState::AllTasksComplete;
                    Outbound::with_buttons(
                        "No more tasks available. All tasks complete!",
                        vec![Action::Logout],
                    )
                    .into()
                }
                Err(e) => {
                    session.state = ConversationState::Menu;
                    self.error_with_menu(session, &e).await.into()
                }
            },
            Action::SubmitAnswer => {
                if session.task_id.is_none() {
                    return Outbound::text("You have no task yet.").into();
                }
                session.state = ConversationState::Answer;
                Outbound::text("Enter your answer:").into()
            }
        }
    }

    fn task_message(&self, task: &Task) -> Outbound {
        let mut text = format!("Task:\n\n{}", task.question);
        if let Some(minutes) = task.time_limit {
            text.push_str(&format!("\n\nTime: {minutes} minutes"));
        }
        let buttons = vec![Action::SubmitAnswer];

        match &task.question_file {
            Some(file) => Outbound::Document {
                path: self.files.path(task.id, file),
                caption: text,
                buttons,
            },
            None => Outbound::Text { text, buttons },
        }
    }

    async fn menu(&self, session: &ConversationSession) -> Outbound {
        let team = match session.team_id {
            Some(id) => self.workflow.get_team(id).await.ok(),
            None => None,
        };
        menu_reply(session.state, team.as_ref())
    }

    async fn error_with_menu(&self, session: &ConversationSession, e: &WorkflowError) -> Outbound {
        let menu = self.menu(session).await;
        Outbound::with_buttons(error_reply(e).body(), menu.buttons().to_vec())
    }

    // ── Approval wait ────────────────────────────────────────────────

    async fn await_approval(self, chat_id: i64, team_id: i64) {
        metrics::APPROVAL_WAITS_ACTIVE.inc();
        let approved = self.poll_approval(team_id).await;
        metrics::APPROVAL_WAITS_ACTIVE.dec();

        let (next, reply) = if approved {
            (
                ConversationState::ReadyForTask,
                Outbound::with_buttons(
                    "Your team was approved by the company!",
                    vec![Action::GetTask],
                ),
            )
        } else {
            let team = self.workflow.get_team(team_id).await.ok();
            (
                ConversationState::Menu,
                Outbound::with_buttons(
                    "Approval timed out. Try again later.",
                    menu_buttons(ConversationState::Menu, team.as_ref()),
                ),
            )
        };

        // The user may have moved on (or logged out) while we were waiting
        if self
            .store
            .transition(chat_id, ConversationState::WaitingApprove, next)
            .await
        {
            self.send(chat_id, reply).await;
        }
    }

    async fn poll_approval(&self, team_id: i64) -> bool {
        for _ in 0..self.approval.attempts {
            tokio::time::sleep(self.approval.interval).await;
            match self.workflow.get_team(team_id).await {
                Ok(team) if team.company_id.is_some() => return true,
                Ok(_) => {}
                Err(e) => tracing::warn!(team_id, "Approval poll failed: {e}"),
            }
        }
        false
    }
}

fn error_reply(e: &WorkflowError) -> Outbound {
    Outbound::text(format!("Error: {e}"))
}

/// Buttons offered in a given state. The main menu depends on how far the team got.
fn menu_buttons(state: ConversationState, team: Option<&Team>) -> Vec<Action> {
    use ConversationState::*;
    match state {
        Menu => match team {
            Some(t) if t.contest_id.is_none() => vec![Action::JoinContest],
            Some(t) if t.company_id.is_some() => vec![Action::GetTask],
            Some(_) => vec![Action::SendGeo],
            None => Vec::new(),
        },
        WaitingGeo => vec![Action::SendGeo],
        WaitingApprove => vec![Action::WaitingApprove],
        ReadyForTask => vec![Action::GetTask],
        TaskReceived => vec![Action::SubmitAnswer],
        AllTasksComplete => vec![Action::Logout],
        _ => Vec::new(),
    }
}

fn menu_reply(state: ConversationState, team: Option<&Team>) -> Outbound {
    let buttons = menu_buttons(state, team);
    if buttons.is_empty() {
        Outbound::text("Welcome! Choose an action.")
    } else {
        Outbound::with_buttons("Main menu:", buttons)
    }
}
