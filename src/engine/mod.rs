// Task session engine: hands tasks to teams and judges their answers.

pub mod config;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::db::{self, Database, Finalization, SessionCommit, Task, Team, TeamTaskSession};
use crate::metrics;
use crate::workflow::WorkflowError;

use config::{MAX_ATTEMPTS, POINTS_PER_CORRECT, SESSION_TIME_LIMIT_SECS};

/// Result of a recorded answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnswerOutcome {
    pub is_correct: bool,
    /// The session was closed by this answer.
    pub finished: bool,
    pub attempts: i64,
    pub attempts_left: i64,
}

/// Seconds a session contributes to its team's total, capped at the session limit.
pub fn accrued_secs(elapsed: Duration) -> i64 {
    elapsed.num_seconds().clamp(0, SESSION_TIME_LIMIT_SECS)
}

/// Whether a session has run past its time budget.
pub fn is_expired(session: &TeamTaskSession, now: DateTime<Utc>) -> bool {
    now - session.started_at > config::session_time_limit()
}

pub struct TaskEngine {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl TaskEngine {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    async fn load_team(&self, team_id: i64) -> Result<Team, WorkflowError> {
        self.db
            .get_team(team_id)
            .await?
            .ok_or(WorkflowError::NotFound("team"))
    }

    /// Give the team its next task at the company it is approved at.
    ///
    /// A team that still holds an open session within its time budget gets the
    /// same task back. An open session past its budget is closed first.
    pub async fn assign_task(&self, team_id: i64) -> Result<Task, WorkflowError> {
        let mut team = self.load_team(team_id).await?;
        let now = self.clock.now();

        if let Some(session) = self.open_session_of(&team).await? {
            if !is_expired(&session, now) {
                return self
                    .db
                    .get_task(session.task_id)
                    .await?
                    .ok_or(WorkflowError::NotFound("task"));
            }
            self.expire_session(&session, now, "timeout").await?;
            team = self.load_team(team_id).await?;
        }

        let (Some(contest_id), Some(company_id)) = (team.contest_id, team.company_id) else {
            return Err(WorkflowError::NotInContest);
        };

        let attempted = self.db.attempted_task_ids(team.id).await?;
        let task = self
            .db
            .find_task_excluding(contest_id, company_id, &attempted)
            .await?
            .ok_or(WorkflowError::NoAvailableTask)?;

        match self.db.open_session(team.id, task.id, now).await {
            Ok(_) => {}
            // A concurrent call opened the same session first
            Err(e) if db::is_unique_violation(&e) => return Ok(task),
            Err(e) => return Err(e.into()),
        }

        metrics::TASKS_ASSIGNED_TOTAL.inc();
        tracing::info!(team_id = team.id, task_id = task.id, company_id, "Task assigned");
        Ok(task)
    }

    /// Judge an answer and report only its correctness.
    pub async fn submit_answer(
        &self,
        team_id: i64,
        task_id: i64,
        answer: &str,
    ) -> Result<bool, WorkflowError> {
        self.submit(team_id, task_id, answer)
            .await
            .map(|outcome| outcome.is_correct)
    }

    /// Judge an answer against the task's correct answer (exact, case-sensitive).
    ///
    /// Rejected calls record nothing. An accepted answer counts as an attempt,
    /// and closes the session when it is correct, uses the last attempt, or
    /// arrives at the time limit.
    pub async fn submit(
        &self,
        team_id: i64,
        task_id: i64,
        answer: &str,
    ) -> Result<AnswerOutcome, WorkflowError> {
        let team = self.load_team(team_id).await?;
        let session = self.db.get_session(team_id, task_id).await?;

        if team.current_task_id != Some(task_id) {
            return match session {
                Some(s) if s.finished => Err(WorkflowError::SessionClosed),
                _ => Err(WorkflowError::TaskMismatch),
            };
        }
        let session = session.ok_or(WorkflowError::SessionNotFound)?;

        let now = self.clock.now();
        if session.finished || session.attempts >= MAX_ATTEMPTS || is_expired(&session, now) {
            return Err(WorkflowError::SessionClosed);
        }

        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(WorkflowError::NotFound("task"))?;

        let elapsed = now - session.started_at;
        let attempts = session.attempts + 1;
        let is_correct = answer == task.correct_answer;
        let timed_out = elapsed >= config::session_time_limit();
        let finished = is_correct || attempts >= MAX_ATTEMPTS || timed_out;

        let finalize = finished.then(|| Finalization {
            finished_at: now,
            accrued_secs: accrued_secs(elapsed),
            points: if is_correct { POINTS_PER_CORRECT } else { 0 },
        });
        let accrued = finalize.as_ref().map(|f| f.accrued_secs);

        let commit = SessionCommit {
            session_id: session.id,
            team_id,
            expected_attempts: session.attempts,
            attempts,
            is_correct,
            finalize,
        };
        if !self.db.commit_session(&commit).await? {
            return Err(WorkflowError::SessionClosed);
        }

        metrics::ANSWERS_TOTAL
            .with_label_values(&[if is_correct { "correct" } else { "wrong" }])
            .inc();

        if let Some(secs) = accrued {
            let reason = if is_correct {
                "correct"
            } else if attempts >= MAX_ATTEMPTS {
                "attempts"
            } else {
                "timeout"
            };
            metrics::SESSIONS_FINALIZED_TOTAL
                .with_label_values(&[reason])
                .inc();
            metrics::SESSION_DURATION_SECONDS.observe(secs as f64);
            tracing::info!(team_id, task_id, attempts, is_correct, secs, reason, "Session finalized");
        }

        if let Err(e) = self
            .db
            .append_answer(team_id, task_id, answer, is_correct)
            .await
        {
            tracing::warn!(team_id, task_id, "Failed to append answer audit record: {e}");
        }

        Ok(AnswerOutcome {
            is_correct,
            finished,
            attempts,
            attempts_left: (MAX_ATTEMPTS - attempts).max(0),
        })
    }

    /// The team's current task and its session, if it holds one.
    pub async fn current_task(
        &self,
        team_id: i64,
    ) -> Result<Option<(Task, TeamTaskSession)>, WorkflowError> {
        let team = self.load_team(team_id).await?;
        let Some(task_id) = team.current_task_id else {
            return Ok(None);
        };
        let task = self.db.get_task(task_id).await?;
        let session = self.db.get_session(team_id, task_id).await?;
        Ok(task.zip(session))
    }

    /// Close the team's open session if it ran past its time budget.
    /// Returns whether a session was closed.
    pub async fn settle_expired(&self, team_id: i64) -> Result<bool, WorkflowError> {
        let team = self.load_team(team_id).await?;
        let now = self.clock.now();
        match self.open_session_of(&team).await? {
            Some(session) if is_expired(&session, now) => {
                self.expire_session(&session, now, "timeout").await
            }
            _ => Ok(false),
        }
    }

    /// Close the team's open session without a point, whatever its age.
    /// Elapsed time still counts, capped at the session budget.
    pub async fn abandon_open_session(&self, team_id: i64) -> Result<bool, WorkflowError> {
        let team = self.load_team(team_id).await?;
        match self.open_session_of(&team).await? {
            Some(session) => self.expire_session(&session, self.clock.now(), "abandoned").await,
            None => Ok(false),
        }
    }

    async fn open_session_of(&self, team: &Team) -> Result<Option<TeamTaskSession>, WorkflowError> {
        let Some(task_id) = team.current_task_id else {
            return Ok(None);
        };
        let session = self.db.get_session(team.id, task_id).await?;
        Ok(session.filter(|s| !s.finished))
    }

    /// Close a session without an answer.
    async fn expire_session(
        &self,
        session: &TeamTaskSession,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, WorkflowError> {
        let secs = accrued_secs(now - session.started_at);
        let commit = SessionCommit {
            session_id: session.id,
            team_id: session.team_id,
            expected_attempts: session.attempts,
            attempts: session.attempts,
            is_correct: false,
            finalize: Some(Finalization {
                finished_at: now,
                accrued_secs: secs,
                points: 0,
            }),
        };
        // Losing the race means someone else already closed it
        let closed = self.db.commit_session(&commit).await?;
        if closed {
            metrics::SESSIONS_FINALIZED_TOTAL
                .with_label_values(&[reason])
                .inc();
            metrics::SESSION_DURATION_SECONDS.observe(secs as f64);
            tracing::info!(
                team_id = session.team_id,
                task_id = session.task_id,
                secs,
                reason,
                "Open session closed"
            );
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::NewTask;

    struct Fixture {
        db: Arc<Database>,
        clock: Arc<ManualClock>,
        engine: TaskEngine,
        team_id: i64,
        task_ids: Vec<i64>,
    }

    async fn fixture(task_count: usize) -> Fixture {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let clock = Arc::new(ManualClock::default());
        let engine = TaskEngine::new(db.clone(), clock.clone());

        let contest = db.create_contest("Chase").await.unwrap();
        let company = db
            .create_company("Acme", "acme@example.com", "h", "")
            .await
            .unwrap();
        let mut task_ids = Vec::new();
        for i in 0..task_count {
            let answer = format!("answer-{i}");
            let task = db
                .create_task(&NewTask {
                    contest_id: contest.id,
                    company_id: company.id,
                    question: "?",
                    question_file: None,
                    correct_answer: &answer,
                    time_limit: None,
                })
                .await
                .unwrap();
            task_ids.push(task.id);
        }

        let team = db.create_team("Owls", "owls@example.com", "h").await.unwrap();
        db.set_team_contest(team.id, contest.id).await.unwrap();
        db.approve_team(team.id, company.id).await.unwrap();

        Fixture {
            db,
            clock,
            engine,
            team_id: team.id,
            task_ids,
        }
    }

    #[test]
    fn test_accrued_secs_clamps() {
        assert_eq!(accrued_secs(Duration::seconds(42)), 42);
        assert_eq!(accrued_secs(Duration::minutes(11)), SESSION_TIME_LIMIT_SECS);
        assert_eq!(accrued_secs(Duration::seconds(-5)), 0);
    }

    #[tokio::test]
    async fn test_assign_requires_company() {
        let f = fixture(1).await;
        let lone = f.db.create_team("Solo", "solo@example.com", "h").await.unwrap();
        let err = f.engine.assign_task(lone.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotInContest));
    }

    #[tokio::test]
    async fn test_assign_is_idempotent_while_open() {
        let f = fixture(2).await;
        let first = f.engine.assign_task(f.team_id).await.unwrap();
        let again = f.engine.assign_task(f.team_id).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(f.db.list_sessions_for_team(f.team_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_closed_on_next_assign() {
        let f = fixture(2).await;
        let first = f.engine.assign_task(f.team_id).await.unwrap();

        f.clock.advance(Duration::minutes(15));
        let second = f.engine.assign_task(f.team_id).await.unwrap();
        assert_ne!(first.id, second.id);

        let closed = f.db.get_session(f.team_id, first.id).await.unwrap().unwrap();
        assert!(closed.finished);
        assert_eq!(closed.attempts, 0);

        let team = f.db.get_team(f.team_id).await.unwrap().unwrap();
        assert_eq!(team.total_duration_secs, SESSION_TIME_LIMIT_SECS);
        assert_eq!(team.points, 0);
        assert_eq!(team.current_task_id, Some(second.id));
    }

    #[tokio::test]
    async fn test_settle_expired_only_after_limit() {
        let f = fixture(1).await;
        let task = f.engine.assign_task(f.team_id).await.unwrap();

        f.clock.advance(Duration::minutes(5));
        assert!(!f.engine.settle_expired(f.team_id).await.unwrap());

        f.clock.advance(Duration::minutes(6));
        assert!(f.engine.settle_expired(f.team_id).await.unwrap());
        let session = f.db.get_session(f.team_id, task.id).await.unwrap().unwrap();
        assert!(session.finished);

        // Nothing left to settle
        assert!(!f.engine.settle_expired(f.team_id).await.unwrap());
        let err = f.engine.assign_task(f.team_id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotInContest));
    }

    #[tokio::test]
    async fn test_wrong_answer_reports_remaining_attempts() {
        let f = fixture(1).await;
        let task = f.engine.assign_task(f.team_id).await.unwrap();

        let outcome = f.engine.submit(f.team_id, task.id, "nope").await.unwrap();
        assert!(!outcome.is_correct);
        assert!(!outcome.finished);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.attempts_left, 2);
    }

    #[tokio::test]
    async fn test_answer_at_exact_limit_is_accepted_and_closes() {
        let f = fixture(1).await;
        let task = f.engine.assign_task(f.team_id).await.unwrap();

        f.clock.advance(config::session_time_limit());
        let outcome = f.engine.submit(f.team_id, task.id, "wrong").await.unwrap();
        assert!(outcome.finished);

        let team = f.db.get_team(f.team_id).await.unwrap().unwrap();
        assert_eq!(team.total_duration_secs, SESSION_TIME_LIMIT_SECS);
    }

    #[tokio::test]
    async fn test_submit_for_other_task_is_mismatch() {
        let f = fixture(2).await;
        let task = f.engine.assign_task(f.team_id).await.unwrap();
        let other = f.task_ids.iter().copied().find(|id| *id != task.id).unwrap();

        let err = f.engine.submit_answer(f.team_id, other, "x").await.unwrap_err();
        assert!(matches!(err, WorkflowError::TaskMismatch));
    }

    #[tokio::test]
    async fn test_current_task_tracks_session() {
        let f = fixture(1).await;
        assert!(f.engine.current_task(f.team_id).await.unwrap().is_none());

        let task = f.engine.assign_task(f.team_id).await.unwrap();
        let (current, session) = f.engine.current_task(f.team_id).await.unwrap().unwrap();
        assert_eq!(current.id, task.id);
        assert_eq!(session.attempts, 0);

        f.engine
            .submit_answer(f.team_id, task.id, "answer-0")
            .await
            .unwrap();
        assert!(f.engine.current_task(f.team_id).await.unwrap().is_none());
    }
}
