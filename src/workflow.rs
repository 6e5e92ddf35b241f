// Team workflow service: the single entry point shared by the HTTP API and the chat bot.

use std::sync::Arc;

use crate::auth;
use crate::clock::Clock;
use crate::db::{self, Company, Contest, Database, Task, Team, TeamTaskSession};
use crate::engine::{AnswerOutcome, TaskEngine};
use crate::mailer::{self, Mailer};
use crate::metrics;

pub const TEAM_PASSWORD_LEN: usize = 10;
pub const COMPANY_PASSWORD_LEN: usize = 12;

/// Broad classes of failure, used to pick an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    Unauthorized,
    ExternalDependencyFailure,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("team is not enrolled in a contest or not approved by a company")]
    NotInContest,
    #[error("no more tasks available")]
    NoAvailableTask,
    #[error("this is not the team's current task")]
    TaskMismatch,
    #[error("no session exists for this task")]
    SessionNotFound,
    #[error("the session for this task is closed")]
    SessionClosed,
    #[error("a record with this email or name already exists")]
    AlreadyExists,
    #[error("failed to deliver the temporary password")]
    DeliveryFailed,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("this chat is already linked to another team")]
    AlreadyLinked,
    #[error("no active contest")]
    NoActiveContest,
    #[error("contest is already active")]
    ContestAlreadyActive,
    #[error("contest is not active")]
    ContestNotActive,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("file storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::SessionNotFound => ErrorKind::NotFound,
            Self::AlreadyExists | Self::AlreadyLinked => ErrorKind::Conflict,
            Self::NotInContest
            | Self::NoAvailableTask
            | Self::TaskMismatch
            | Self::SessionClosed
            | Self::NoActiveContest
            | Self::ContestAlreadyActive
            | Self::ContestNotActive => ErrorKind::InvalidState,
            Self::InvalidCredentials => ErrorKind::Unauthorized,
            Self::DeliveryFailed | Self::Storage(_) => ErrorKind::ExternalDependencyFailure,
            Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub struct TeamWorkflow {
    db: Arc<Database>,
    engine: TaskEngine,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
}

impl TeamWorkflow {
    pub fn new(db: Arc<Database>, mailer: Arc<dyn Mailer>, clock: Arc<dyn Clock>) -> Self {
        let engine = TaskEngine::new(db.clone(), clock.clone());
        Self {
            db,
            engine,
            mailer,
            clock,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    async fn send_temporary_password(&self, email: &str, password: &str) -> Result<(), WorkflowError> {
        let (subject, body) = mailer::temporary_password_message(password);
        self.mailer
            .send(email, &subject, &body)
            .await
            .map_err(|e| {
                tracing::warn!(to = email, "Temporary password delivery failed: {e}");
                WorkflowError::DeliveryFailed
            })
    }

    // ── Teams ─────────────────────────────────────────────────────────

    /// Create a team and mail it a temporary password. The team is removed
    /// again if the mail cannot be delivered.
    pub async fn register(&self, email: &str, name: &str) -> Result<Team, WorkflowError> {
        if self.db.get_team_by_email(email).await?.is_some() {
            return Err(WorkflowError::AlreadyExists);
        }

        let password = auth::generate_temporary_password(TEAM_PASSWORD_LEN);
        let hash = auth::hash_password(&password).map_err(WorkflowError::Internal)?;
        let team = match self.db.create_team(name, email, &hash).await {
            Ok(team) => team,
            Err(e) if db::is_unique_violation(&e) => return Err(WorkflowError::AlreadyExists),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.send_temporary_password(email, &password).await {
            if let Err(del) = self.db.delete_team(team.id).await {
                tracing::error!(team_id = team.id, "Failed to remove undelivered registration: {del}");
            }
            metrics::REGISTRATION_DELIVERY_FAILURES_TOTAL.inc();
            return Err(e);
        }

        metrics::TEAMS_REGISTERED_TOTAL.inc();
        tracing::info!(team_id = team.id, "Team registered");
        Ok(team)
    }

    /// Check a team's credentials. Unknown email and wrong password are not
    /// told apart.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Team, WorkflowError> {
        let team = self
            .db
            .get_team_by_email(email)
            .await?
            .ok_or(WorkflowError::InvalidCredentials)?;

        match auth::verify_password(password, &team.password_hash) {
            Ok(true) => Ok(team),
            Ok(false) => Err(WorkflowError::InvalidCredentials),
            Err(e) => {
                tracing::error!(team_id = team.id, "Stored password hash unreadable: {e}");
                Err(WorkflowError::InvalidCredentials)
            }
        }
    }

    /// Attach a chat identity to the team with the given email.
    pub async fn link_external_identity(
        &self,
        email: &str,
        external_id: i64,
    ) -> Result<Team, WorkflowError> {
        let team = self
            .db
            .get_team_by_email(email)
            .await?
            .ok_or(WorkflowError::NotFound("team"))?;

        if let Some(owner) = self.db.get_team_by_chat_id(external_id).await? {
            if owner.id != team.id {
                return Err(WorkflowError::AlreadyLinked);
            }
            return Ok(owner);
        }

        match self.db.set_team_chat_id(team.id, external_id).await {
            Ok(_) => {}
            Err(e) if db::is_unique_violation(&e) => return Err(WorkflowError::AlreadyLinked),
            Err(e) => return Err(e.into()),
        }
        tracing::info!(team_id = team.id, "Chat identity linked");
        self.get_team(team.id).await
    }

    /// Enroll the team in the currently active contest.
    pub async fn join_contest(&self, team_id: i64) -> Result<Contest, WorkflowError> {
        let team = self.get_team(team_id).await?;
        let contest = self
            .db
            .get_active_contest()
            .await?
            .ok_or(WorkflowError::NoActiveContest)?;

        if team.contest_id != Some(contest.id) {
            if self.engine.abandon_open_session(team.id).await? {
                tracing::info!(team_id, "Open session from previous contest closed");
            }
            self.db.set_team_contest(team.id, contest.id).await?;
            tracing::info!(team_id, contest_id = contest.id, "Team joined contest");
        }
        Ok(contest)
    }

    /// Assign the team to a company. Company capacity is not checked.
    pub async fn approve_team(&self, team_id: i64, company_id: i64) -> Result<(), WorkflowError> {
        self.get_team(team_id).await?;
        self.get_company(company_id).await?;
        if !self.db.approve_team(team_id, company_id).await? {
            return Err(WorkflowError::NotFound("team"));
        }
        tracing::info!(team_id, company_id, "Team approved");
        Ok(())
    }

    /// The next company the team should visit, or `None` once every task of
    /// its contest has been attempted.
    pub async fn next_location(&self, team_id: i64) -> Result<Option<Company>, WorkflowError> {
        let team = self.get_team(team_id).await?;
        let contest_id = team.contest_id.ok_or(WorkflowError::NotInContest)?;
        Ok(self.db.next_company_for_team(contest_id, team.id).await?)
    }

    pub async fn get_team(&self, team_id: i64) -> Result<Team, WorkflowError> {
        self.db
            .get_team(team_id)
            .await?
            .ok_or(WorkflowError::NotFound("team"))
    }

    pub async fn get_team_by_email(&self, email: &str) -> Result<Option<Team>, WorkflowError> {
        Ok(self.db.get_team_by_email(email).await?)
    }

    pub async fn get_team_by_chat_id(&self, chat_id: i64) -> Result<Option<Team>, WorkflowError> {
        Ok(self.db.get_team_by_chat_id(chat_id).await?)
    }

    pub async fn list_unassigned_teams(&self) -> Result<Vec<Team>, WorkflowError> {
        Ok(self.db.list_unassigned_teams().await?)
    }

    // ── Task sessions ─────────────────────────────────────────────────

    pub async fn assign_task(&self, team_id: i64) -> Result<Task, WorkflowError> {
        self.engine.assign_task(team_id).await
    }

    pub async fn submit_answer(
        &self,
        team_id: i64,
        task_id: i64,
        answer: &str,
    ) -> Result<bool, WorkflowError> {
        self.engine.submit_answer(team_id, task_id, answer).await
    }

    pub async fn submit(
        &self,
        team_id: i64,
        task_id: i64,
        answer: &str,
    ) -> Result<AnswerOutcome, WorkflowError> {
        self.engine.submit(team_id, task_id, answer).await
    }

    pub async fn current_task(
        &self,
        team_id: i64,
    ) -> Result<Option<(Task, TeamTaskSession)>, WorkflowError> {
        self.engine.current_task(team_id).await
    }

    /// Close the team's open session if it ran out of time.
    pub async fn settle_expired(&self, team_id: i64) -> Result<bool, WorkflowError> {
        self.engine.settle_expired(team_id).await
    }

    // ── Contests ──────────────────────────────────────────────────────

    pub async fn get_contest(&self, contest_id: i64) -> Result<Contest, WorkflowError> {
        self.db
            .get_contest(contest_id)
            .await?
            .ok_or(WorkflowError::NotFound("contest"))
    }

    /// Activate a contest. Refused while this or any other contest is active.
    pub async fn start_contest(&self, contest_id: i64) -> Result<Contest, WorkflowError> {
        let contest = self.get_contest(contest_id).await?;
        if contest.is_active() {
            return Err(WorkflowError::ContestAlreadyActive);
        }
        let started = match self.db.start_contest(contest_id, self.clock.now()).await {
            Ok(started) => started,
            Err(e) if db::is_unique_violation(&e) => false,
            Err(e) => return Err(e.into()),
        };
        if !started {
            return Err(WorkflowError::ContestAlreadyActive);
        }
        tracing::info!(contest_id, "Contest started");
        self.get_contest(contest_id).await
    }

    pub async fn end_contest(&self, contest_id: i64) -> Result<Contest, WorkflowError> {
        self.get_contest(contest_id).await?;
        if !self.db.end_contest(contest_id, self.clock.now()).await? {
            return Err(WorkflowError::ContestNotActive);
        }
        tracing::info!(contest_id, "Contest ended");
        self.get_contest(contest_id).await
    }

    // ── Companies ─────────────────────────────────────────────────────

    pub async fn get_company(&self, company_id: i64) -> Result<Company, WorkflowError> {
        self.db
            .get_company(company_id)
            .await?
            .ok_or(WorkflowError::NotFound("company"))
    }

    /// Create a company with a mailed temporary password. The company is
    /// removed again if the mail cannot be delivered.
    pub async fn create_company(
        &self,
        name: &str,
        email: &str,
        location: &str,
    ) -> Result<Company, WorkflowError> {
        let password = auth::generate_temporary_password(COMPANY_PASSWORD_LEN);
        let hash = auth::hash_password(&password).map_err(WorkflowError::Internal)?;
        let company = match self.db.create_company(name, email, &hash, location).await {
            Ok(company) => company,
            Err(e) if db::is_unique_violation(&e) => return Err(WorkflowError::AlreadyExists),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.send_temporary_password(email, &password).await {
            if let Err(del) = self.db.delete_company(company.id).await {
                tracing::error!(company_id = company.id, "Failed to remove undelivered company: {del}");
            }
            return Err(e);
        }

        tracing::info!(company_id = company.id, "Company created");
        Ok(company)
    }

    /// Replace a company's password with a new mailed temporary one.
    /// The stored password is only replaced once the mail went out.
    pub async fn reset_company_password(&self, company_id: i64) -> Result<(), WorkflowError> {
        let company = self.get_company(company_id).await?;
        let password = auth::generate_temporary_password(COMPANY_PASSWORD_LEN);
        let hash = auth::hash_password(&password).map_err(WorkflowError::Internal)?;
        self.send_temporary_password(&company.email, &password).await?;
        self.db.set_company_password(company.id, &hash, true).await?;
        tracing::info!(company_id, "Company password reset");
        Ok(())
    }

    pub async fn authenticate_company(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Company, WorkflowError> {
        let company = self
            .db
            .get_company_by_email(email)
            .await?
            .ok_or(WorkflowError::InvalidCredentials)?;
        match auth::verify_password(password, &company.password_hash) {
            Ok(true) => Ok(company),
            Ok(false) => Err(WorkflowError::InvalidCredentials),
            Err(e) => {
                tracing::error!(company_id = company.id, "Stored password hash unreadable: {e}");
                Err(WorkflowError::InvalidCredentials)
            }
        }
    }

    /// Replace a company's password after checking the current one.
    pub async fn change_company_password(
        &self,
        company_id: i64,
        old_password: &str,
        new_password: &str,
    ) -> Result<Company, WorkflowError> {
        let company = self.get_company(company_id).await?;
        if !auth::verify_password(old_password, &company.password_hash).unwrap_or(false) {
            return Err(WorkflowError::InvalidCredentials);
        }
        let hash = auth::hash_password(new_password).map_err(WorkflowError::Internal)?;
        self.db.set_company_password(company.id, &hash, false).await?;
        self.get_company(company_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mailer::MailError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, _subject: &str, body: &str) -> Result<(), MailError> {
            self.sent.lock().unwrap().push((to.to_string(), body.to_string()));
            Ok(())
        }
    }

    async fn setup() -> (TeamWorkflow, Arc<RecordingMailer>) {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let mailer = Arc::new(RecordingMailer::default());
        let wf = TeamWorkflow::new(db, mailer.clone(), Arc::new(ManualClock::default()));
        (wf, mailer)
    }

    fn mailed_password(mailer: &RecordingMailer) -> String {
        let sent = mailer.sent.lock().unwrap();
        let body = &sent.last().unwrap().1;
        body.lines()
            .next()
            .unwrap()
            .rsplit(' ')
            .next()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(WorkflowError::NotFound("team").kind(), ErrorKind::NotFound);
        assert_eq!(WorkflowError::AlreadyLinked.kind(), ErrorKind::Conflict);
        assert_eq!(WorkflowError::SessionClosed.kind(), ErrorKind::InvalidState);
        assert_eq!(WorkflowError::InvalidCredentials.kind(), ErrorKind::Unauthorized);
        assert_eq!(
            WorkflowError::DeliveryFailed.kind(),
            ErrorKind::ExternalDependencyFailure
        );
        assert_eq!(WorkflowError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_register_then_authenticate_with_mailed_password() {
        let (wf, mailer) = setup().await;
        let team = wf.register("owls@example.com", "Owls").await.unwrap();
        let password = mailed_password(&mailer);
        assert_eq!(password.len(), TEAM_PASSWORD_LEN);

        let authed = wf.authenticate("owls@example.com", &password).await.unwrap();
        assert_eq!(authed.id, team.id);

        let err = wf.register("owls@example.com", "Owls again").await.unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyExists));
    }

    #[tokio::test]
    async fn test_authenticate_does_not_distinguish_failures() {
        let (wf, _) = setup().await;
        wf.register("owls@example.com", "Owls").await.unwrap();

        let unknown = wf.authenticate("nobody@example.com", "x").await.unwrap_err();
        let wrong = wf.authenticate("owls@example.com", "x").await.unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(matches!(unknown, WorkflowError::InvalidCredentials));
        assert!(matches!(wrong, WorkflowError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_link_external_identity() {
        let (wf, _) = setup().await;
        let owls = wf.register("owls@example.com", "Owls").await.unwrap();
        wf.register("hawks@example.com", "Hawks").await.unwrap();

        let linked = wf.link_external_identity("owls@example.com", 100).await.unwrap();
        assert_eq!(linked.chat_id, Some(100));
        // Idempotent for the same team
        wf.link_external_identity("owls@example.com", 100).await.unwrap();

        let err = wf
            .link_external_identity("hawks@example.com", 100)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyLinked));

        let by_chat = wf.get_team_by_chat_id(100).await.unwrap().unwrap();
        assert_eq!(by_chat.id, owls.id);
    }

    #[tokio::test]
    async fn test_contest_start_and_end() {
        let (wf, _) = setup().await;
        let a = wf.db().create_contest("A").await.unwrap();
        let b = wf.db().create_contest("B").await.unwrap();

        let started = wf.start_contest(a.id).await.unwrap();
        assert!(started.is_active());

        assert!(matches!(
            wf.start_contest(a.id).await.unwrap_err(),
            WorkflowError::ContestAlreadyActive
        ));
        assert!(matches!(
            wf.start_contest(b.id).await.unwrap_err(),
            WorkflowError::ContestAlreadyActive
        ));
        assert!(matches!(
            wf.end_contest(b.id).await.unwrap_err(),
            WorkflowError::ContestNotActive
        ));

        let ended = wf.end_contest(a.id).await.unwrap();
        assert!(!ended.is_active());
        assert!(ended.end_date.is_some());

        assert!(matches!(
            wf.start_contest(999).await.unwrap_err(),
            WorkflowError::NotFound("contest")
        ));
    }

    #[tokio::test]
    async fn test_company_password_lifecycle() {
        let (wf, mailer) = setup().await;
        let company = wf
            .create_company("Acme", "acme@example.com", "https://maps/acme")
            .await
            .unwrap();
        assert!(company.reset_required);
        let temp = mailed_password(&mailer);
        assert_eq!(temp.len(), COMPANY_PASSWORD_LEN);

        wf.authenticate_company("acme@example.com", &temp).await.unwrap();

        let err = wf
            .change_company_password(company.id, "wrong", "newpassword1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidCredentials));

        let changed = wf
            .change_company_password(company.id, &temp, "newpassword1")
            .await
            .unwrap();
        assert!(!changed.reset_required);
        wf.authenticate_company("acme@example.com", "newpassword1")
            .await
            .unwrap();

        wf.reset_company_password(company.id).await.unwrap();
        let reset = wf.get_company(company.id).await.unwrap();
        assert!(reset.reset_required);
        let fresh = mailed_password(&mailer);
        wf.authenticate_company("acme@example.com", &fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_next_location_requires_contest() {
        let (wf, _) = setup().await;
        let team = wf.register("owls@example.com", "Owls").await.unwrap();
        let err = wf.next_location(team.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotInContest));
    }
}
