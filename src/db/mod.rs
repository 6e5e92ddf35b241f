// Database access layer (SQLite via sqlx).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContestStatus {
    Pending,
    Active,
    Completed,
}

impl ContestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contest {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: String,
}

impl Contest {
    pub fn status(&self) -> Option<ContestStatus> {
        ContestStatus::from_str_name(&self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status() == Some(ContestStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// True while the company still logs in with a temporary password.
    pub reset_required: bool,
    /// Opaque location descriptor, usually a map link.
    pub location: String,
    pub current_team_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub contest_id: i64,
    pub company_id: i64,
    pub question: String,
    pub question_file: Option<String>,
    pub correct_answer: String,
    /// Minutes. Informational only; the session policy does not read it.
    pub time_limit: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub contest_id: i64,
    pub company_id: i64,
    pub question: &'a str,
    pub question_file: Option<&'a str>,
    pub correct_answer: &'a str,
    pub time_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// External chat identity linked to this team, at most one team per id.
    pub chat_id: Option<i64>,
    pub contest_id: Option<i64>,
    pub current_task_id: Option<i64>,
    /// Company the team is currently approved at.
    pub company_id: Option<i64>,
    pub total_duration_secs: i64,
    pub points: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TeamTaskSession {
    pub id: i64,
    pub team_id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub attempts: i64,
    pub finished: bool,
    pub is_correct: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TeamAnswer {
    pub id: i64,
    pub team_id: i64,
    pub task_id: i64,
    pub answer: String,
    pub is_correct: bool,
    pub created_at: String,
}

/// A session write produced by the task engine. Applied only if the session
/// is still open and its attempt counter still equals `expected_attempts`.
#[derive(Debug, Clone)]
pub struct SessionCommit {
    pub session_id: i64,
    pub team_id: i64,
    pub expected_attempts: i64,
    pub attempts: i64,
    pub is_correct: bool,
    pub finalize: Option<Finalization>,
}

/// Team-side effects of closing a session.
#[derive(Debug, Clone)]
pub struct Finalization {
    pub finished_at: DateTime<Utc>,
    pub accrued_secs: i64,
    pub points: i64,
}

const CONTEST_COLUMNS: &str = "id, name, status, start_date, end_date, created_at";
const COMPANY_COLUMNS: &str =
    "id, name, email, password_hash, reset_required, location, current_team_id, created_at, updated_at";
const TASK_COLUMNS: &str =
    "id, contest_id, company_id, question, question_file, correct_answer, time_limit, created_at";
const TEAM_COLUMNS: &str = "id, name, email, password_hash, chat_id, contest_id, current_task_id, company_id, total_duration_secs, points, created_at";
const SESSION_COLUMNS: &str =
    "id, team_id, task_id, started_at, attempts, finished, is_correct, finished_at";

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
        // Every connection to `:memory:` is a separate database, so keep exactly one alive.
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                start_date TEXT,
                end_date TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Backstop for the single-active-contest rule enforced in start_contest.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_contests_single_active ON contests(status) WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                reset_required INTEGER NOT NULL DEFAULT 1,
                location TEXT NOT NULL DEFAULT '',
                current_team_id INTEGER REFERENCES teams(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contest_id INTEGER NOT NULL REFERENCES contests(id) ON DELETE CASCADE,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                question TEXT NOT NULL DEFAULT '',
                question_file TEXT,
                correct_answer TEXT NOT NULL,
                time_limit INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS teams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                chat_id INTEGER UNIQUE,
                contest_id INTEGER REFERENCES contests(id) ON DELETE SET NULL,
                current_task_id INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
                company_id INTEGER REFERENCES companies(id) ON DELETE SET NULL,
                total_duration_secs INTEGER NOT NULL DEFAULT 0,
                points INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS team_task_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                started_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                finished INTEGER NOT NULL DEFAULT 0,
                is_correct INTEGER NOT NULL DEFAULT 0,
                finished_at TEXT,
                UNIQUE(team_id, task_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS team_answers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                answer TEXT NOT NULL,
                is_correct INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Contests ──────────────────────────────────────────────────────

    pub async fn create_contest(&self, name: &str) -> Result<Contest, sqlx::Error> {
        let row = sqlx::query_as::<_, Contest>(&format!(
            "INSERT INTO contests (name) VALUES (?) RETURNING {CONTEST_COLUMNS}"
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_contests(&self) -> Result<Vec<Contest>, sqlx::Error> {
        sqlx::query_as::<_, Contest>(&format!(
            "SELECT {CONTEST_COLUMNS} FROM contests ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_contest(&self, id: i64) -> Result<Option<Contest>, sqlx::Error> {
        sqlx::query_as::<_, Contest>(&format!(
            "SELECT {CONTEST_COLUMNS} FROM contests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_active_contest(&self) -> Result<Option<Contest>, sqlx::Error> {
        sqlx::query_as::<_, Contest>(&format!(
            "SELECT {CONTEST_COLUMNS} FROM contests WHERE status = 'active' ORDER BY id LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn rename_contest(&self, id: i64, name: &str) -> Result<Option<Contest>, sqlx::Error> {
        let result = sqlx::query("UPDATE contests SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_contest(id).await
    }

    pub async fn delete_contest(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM contests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Activate a contest in a single statement: succeeds only when the
    /// contest is not active and no other contest is active either.
    pub async fn start_contest(&self, id: i64, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE contests SET status = 'active', start_date = ?
            WHERE id = ? AND status != 'active'
              AND NOT EXISTS (SELECT 1 FROM contests WHERE status = 'active')
        "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn end_contest(&self, id: i64, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE contests SET status = 'completed', end_date = ? WHERE id = ? AND status = 'active'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Companies ─────────────────────────────────────────────────────

    pub async fn create_company(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
        location: &str,
    ) -> Result<Company, sqlx::Error> {
        sqlx::query_as::<_, Company>(&format!(
            "INSERT INTO companies (name, email, password_hash, location) VALUES (?, ?, ?, ?) RETURNING {COMPANY_COLUMNS}"
        ))
        .bind(name)
        .bind(email)
        .bind(password_hash)
        .bind(location)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_companies(&self) -> Result<Vec<Company>, sqlx::Error> {
        sqlx::query_as::<_, Company>(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_company(&self, id: i64) -> Result<Option<Company>, sqlx::Error> {
        sqlx::query_as::<_, Company>(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_company_by_email(&self, email: &str) -> Result<Option<Company>, sqlx::Error> {
        sqlx::query_as::<_, Company>(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE email = ?"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// Update the descriptive fields of a company. `None` leaves a field as is.
    pub async fn update_company(
        &self,
        id: i64,
        name: Option<&str>,
        email: Option<&str>,
        location: Option<&str>,
    ) -> Result<Option<Company>, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE companies SET
                name = COALESCE(?, name),
                email = COALESCE(?, email),
                location = COALESCE(?, location),
                updated_at = datetime('now')
            WHERE id = ?
        "#,
        )
        .bind(name)
        .bind(email)
        .bind(location)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_company(id).await
    }

    pub async fn set_company_password(
        &self,
        id: i64,
        password_hash: &str,
        reset_required: bool,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE companies SET password_hash = ?, reset_required = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(password_hash)
        .bind(reset_required)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_company(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM companies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// First company (by id) in the contest that still hosts a task the team
    /// has no session for.
    pub async fn next_company_for_team(
        &self,
        contest_id: i64,
        team_id: i64,
    ) -> Result<Option<Company>, sqlx::Error> {
        sqlx::query_as::<_, Company>(&format!(
            r#"
            SELECT {COMPANY_COLUMNS} FROM companies c
            WHERE EXISTS (
                SELECT 1 FROM tasks t
                WHERE t.company_id = c.id AND t.contest_id = ?
                  AND t.id NOT IN (SELECT task_id FROM team_task_sessions WHERE team_id = ?)
            )
            ORDER BY c.id LIMIT 1
        "#
        ))
        .bind(contest_id)
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub async fn create_task(&self, task: &NewTask<'_>) -> Result<Task, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "INSERT INTO tasks (contest_id, company_id, question, question_file, correct_answer, time_limit) VALUES (?, ?, ?, ?, ?, ?) RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.contest_id)
        .bind(task.company_id)
        .bind(task.question)
        .bind(task.question_file)
        .bind(task.correct_answer)
        .bind(task.time_limit)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_tasks_by_company(&self, company_id: i64) -> Result<Vec<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE company_id = ? ORDER BY id"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_tasks_by_contest(&self, contest_id: i64) -> Result<Vec<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE contest_id = ? ORDER BY id"
        ))
        .bind(contest_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Overwrite the editable fields of a task.
    pub async fn update_task(&self, task: &Task) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET question = ?, question_file = ?, correct_answer = ?, time_limit = ? WHERE id = ?",
        )
        .bind(&task.question)
        .bind(&task.question_file)
        .bind(&task.correct_answer)
        .bind(task.time_limit)
        .bind(task.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lowest-id task of the given contest and company whose id is not in `exclude`.
    pub async fn find_task_excluding(
        &self,
        contest_id: i64,
        company_id: i64,
        exclude: &[i64],
    ) -> Result<Option<Task>, sqlx::Error> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE contest_id = "
        ));
        qb.push_bind(contest_id);
        qb.push(" AND company_id = ");
        qb.push_bind(company_id);
        if !exclude.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut ids = qb.separated(", ");
            for id in exclude {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
        }
        qb.push(" ORDER BY id LIMIT 1");
        qb.build_query_as::<Task>()
            .fetch_optional(&self.pool)
            .await
    }

    // ── Teams ─────────────────────────────────────────────────────────

    pub async fn create_team(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<Team, sqlx::Error> {
        sqlx::query_as::<_, Team>(&format!(
            "INSERT INTO teams (name, email, password_hash) VALUES (?, ?, ?) RETURNING {TEAM_COLUMNS}"
        ))
        .bind(name)
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_team(&self, id: i64) -> Result<Option<Team>, sqlx::Error> {
        sqlx::query_as::<_, Team>(&format!("SELECT {TEAM_COLUMNS} FROM teams WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_team_by_email(&self, email: &str) -> Result<Option<Team>, sqlx::Error> {
        sqlx::query_as::<_, Team>(&format!(
            "SELECT {TEAM_COLUMNS} FROM teams WHERE email = ?"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_team_by_chat_id(&self, chat_id: i64) -> Result<Option<Team>, sqlx::Error> {
        sqlx::query_as::<_, Team>(&format!(
            "SELECT {TEAM_COLUMNS} FROM teams WHERE chat_id = ?"
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Teams enrolled in a contest and not yet approved by any company.
    pub async fn list_unassigned_teams(&self) -> Result<Vec<Team>, sqlx::Error> {
        sqlx::query_as::<_, Team>(&format!(
            "SELECT {TEAM_COLUMNS} FROM teams WHERE company_id IS NULL AND contest_id IS NOT NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_team(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM teams WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_team_chat_id(&self, id: i64, chat_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE teams SET chat_id = ? WHERE id = ?")
            .bind(chat_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enroll the team in a contest. Any company assignment and current task
    /// from a previous contest are dropped.
    pub async fn set_team_contest(&self, id: i64, contest_id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE teams SET contest_id = ?, company_id = NULL, current_task_id = NULL WHERE id = ?",
        )
        .bind(contest_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE companies SET current_team_id = NULL, updated_at = datetime('now') WHERE current_team_id = ?",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Point the team at a company, and the company back at the team.
    pub async fn approve_team(&self, team_id: i64, company_id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE teams SET company_id = ? WHERE id = ?")
            .bind(company_id)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE companies SET current_team_id = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(team_id)
        .bind(company_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    // ── Task sessions ─────────────────────────────────────────────────

    /// Hand a task to a team: set its current task and open a fresh session.
    pub async fn open_session(
        &self,
        team_id: i64,
        task_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<TeamTaskSession, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE teams SET current_task_id = ? WHERE id = ?")
            .bind(task_id)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;

        let session = sqlx::query_as::<_, TeamTaskSession>(&format!(
            "INSERT INTO team_task_sessions (team_id, task_id, started_at) VALUES (?, ?, ?) RETURNING {SESSION_COLUMNS}"
        ))
        .bind(team_id)
        .bind(task_id)
        .bind(started_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    pub async fn get_session(
        &self,
        team_id: i64,
        task_id: i64,
    ) -> Result<Option<TeamTaskSession>, sqlx::Error> {
        sqlx::query_as::<_, TeamTaskSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM team_task_sessions WHERE team_id = ? AND task_id = ?"
        ))
        .bind(team_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_sessions_for_team(
        &self,
        team_id: i64,
    ) -> Result<Vec<TeamTaskSession>, sqlx::Error> {
        sqlx::query_as::<_, TeamTaskSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM team_task_sessions WHERE team_id = ? ORDER BY id"
        ))
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn attempted_task_ids(&self, team_id: i64) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT task_id FROM team_task_sessions WHERE team_id = ? ORDER BY id")
            .bind(team_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Apply a session write and, when it finalizes the session, the team's
    /// duration and points, all in one transaction.
    ///
    /// Returns `false` without writing anything if the session was already
    /// finished or its attempt counter moved since it was read.
    ///
    /// On finalization the team's current task is cleared, and its company
    /// assignment is released once that company hosts no further task the team
    /// has not attempted.
    pub async fn commit_session(&self, commit: &SessionCommit) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let finished_at = commit.finalize.as_ref().map(|f| f.finished_at);
        let result = sqlx::query(
            r#"
            UPDATE team_task_sessions
            SET attempts = ?, is_correct = ?, finished = ?, finished_at = ?
            WHERE id = ? AND finished = 0 AND attempts = ?
        "#,
        )
        .bind(commit.attempts)
        .bind(commit.is_correct)
        .bind(commit.finalize.is_some())
        .bind(finished_at)
        .bind(commit.session_id)
        .bind(commit.expected_attempts)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if let Some(fin) = &commit.finalize {
            sqlx::query(
                r#"
                UPDATE teams SET
                    current_task_id = NULL,
                    total_duration_secs = total_duration_secs + ?,
                    points = points + ?
                WHERE id = ?
            "#,
            )
            .bind(fin.accrued_secs)
            .bind(fin.points)
            .bind(commit.team_id)
            .execute(&mut *tx)
            .await?;

            let remaining: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM tasks t JOIN teams tm ON tm.id = ?
                WHERE t.company_id = tm.company_id AND t.contest_id = tm.contest_id
                  AND t.id NOT IN (SELECT task_id FROM team_task_sessions WHERE team_id = tm.id)
            "#,
            )
            .bind(commit.team_id)
            .fetch_one(&mut *tx)
            .await?;

            if remaining == 0 {
                sqlx::query("UPDATE companies SET current_team_id = NULL WHERE current_team_id = ?")
                    .bind(commit.team_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE teams SET company_id = NULL WHERE id = ?")
                    .bind(commit.team_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    // ── Answer audit trail ────────────────────────────────────────────

    pub async fn append_answer(
        &self,
        team_id: i64,
        task_id: i64,
        answer: &str,
        is_correct: bool,
    ) -> Result<TeamAnswer, sqlx::Error> {
        sqlx::query_as::<_, TeamAnswer>(
            "INSERT INTO team_answers (team_id, task_id, answer, is_correct) VALUES (?, ?, ?, ?) RETURNING id, team_id, task_id, answer, is_correct, created_at",
        )
        .bind(team_id)
        .bind(task_id)
        .bind(answer)
        .bind(is_correct)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_answers_for_team(&self, team_id: i64) -> Result<Vec<TeamAnswer>, sqlx::Error> {
        sqlx::query_as::<_, TeamAnswer>(
            "SELECT id, team_id, task_id, answer, is_correct, created_at FROM team_answers WHERE team_id = ? ORDER BY id",
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
    }
}

/// True when the error is a UNIQUE constraint violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    async fn seed_task(db: &Database) -> (Contest, Company, Task) {
        let contest = db.create_contest("Spring Chase").await.unwrap();
        let company = db
            .create_company("Acme", "acme@example.com", "hash", "https://maps/acme")
            .await
            .unwrap();
        let task = db
            .create_task(&NewTask {
                contest_id: contest.id,
                company_id: company.id,
                question: "2+2?",
                question_file: None,
                correct_answer: "4",
                time_limit: Some(5),
            })
            .await
            .unwrap();
        (contest, company, task)
    }

    #[tokio::test]
    async fn test_contest_crud() {
        let db = test_db().await;

        let c = db.create_contest("Autumn").await.unwrap();
        assert_eq!(c.name, "Autumn");
        assert_eq!(c.status, "pending");
        assert!(c.start_date.is_none());

        let renamed = db.rename_contest(c.id, "Winter").await.unwrap().unwrap();
        assert_eq!(renamed.name, "Winter");
        assert!(db.rename_contest(999, "X").await.unwrap().is_none());

        assert_eq!(db.list_contests().await.unwrap().len(), 1);
        assert!(db.delete_contest(c.id).await.unwrap());
        assert!(!db.delete_contest(c.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_only_one_contest_can_be_active() {
        let db = test_db().await;
        let now = Utc::now();

        let a = db.create_contest("A").await.unwrap();
        let b = db.create_contest("B").await.unwrap();

        assert!(db.start_contest(a.id, now).await.unwrap());
        // Already active
        assert!(!db.start_contest(a.id, now).await.unwrap());
        // Another contest is active
        assert!(!db.start_contest(b.id, now).await.unwrap());

        let active = db.get_active_contest().await.unwrap().unwrap();
        assert_eq!(active.id, a.id);
        assert!(active.start_date.is_some());

        assert!(db.end_contest(a.id, now).await.unwrap());
        assert!(!db.end_contest(a.id, now).await.unwrap());
        let ended = db.get_contest(a.id).await.unwrap().unwrap();
        assert_eq!(ended.status(), Some(ContestStatus::Completed));

        assert!(db.start_contest(b.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_company_update_and_password() {
        let db = test_db().await;
        let company = db
            .create_company("Initech", "i@example.com", "h1", "")
            .await
            .unwrap();
        assert!(company.reset_required);

        let updated = db
            .update_company(company.id, None, None, Some("https://maps/initech"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Initech");
        assert_eq!(updated.location, "https://maps/initech");

        assert!(db.set_company_password(company.id, "h2", false).await.unwrap());
        let reloaded = db.get_company_by_email("i@example.com").await.unwrap().unwrap();
        assert_eq!(reloaded.password_hash, "h2");
        assert!(!reloaded.reset_required);

        let dup = db.create_company("Initech", "other@example.com", "h", "").await;
        assert!(is_unique_violation(&dup.unwrap_err()));
    }

    #[tokio::test]
    async fn test_find_task_excluding() {
        let db = test_db().await;
        let (contest, company, first) = seed_task(&db).await;
        let second = db
            .create_task(&NewTask {
                contest_id: contest.id,
                company_id: company.id,
                question: "3+3?",
                question_file: None,
                correct_answer: "6",
                time_limit: None,
            })
            .await
            .unwrap();

        let found = db
            .find_task_excluding(contest.id, company.id, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);

        let found = db
            .find_task_excluding(contest.id, company.id, &[first.id])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, second.id);

        assert!(db
            .find_task_excluding(contest.id, company.id, &[first.id, second.id])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_team_lookup_and_chat_link() {
        let db = test_db().await;
        let team = db.create_team("Owls", "owls@example.com", "h").await.unwrap();
        assert_eq!(team.points, 0);
        assert_eq!(team.total_duration_secs, 0);

        assert!(db.set_team_chat_id(team.id, 4242).await.unwrap());
        let by_chat = db.get_team_by_chat_id(4242).await.unwrap().unwrap();
        assert_eq!(by_chat.id, team.id);

        let other = db.create_team("Hawks", "hawks@example.com", "h").await.unwrap();
        let err = db.set_team_chat_id(other.id, 4242).await.unwrap_err();
        assert!(is_unique_violation(&err));

        let dup = db.create_team("Owls 2", "owls@example.com", "h").await;
        assert!(is_unique_violation(&dup.unwrap_err()));
    }

    #[tokio::test]
    async fn test_commit_session_rejects_stale_write() {
        let db = test_db().await;
        let (contest, company, task) = seed_task(&db).await;
        let team = db.create_team("Owls", "owls@example.com", "h").await.unwrap();
        db.set_team_contest(team.id, contest.id).await.unwrap();
        db.approve_team(team.id, company.id).await.unwrap();

        let session = db.open_session(team.id, task.id, Utc::now()).await.unwrap();
        let commit = SessionCommit {
            session_id: session.id,
            team_id: team.id,
            expected_attempts: 0,
            attempts: 1,
            is_correct: false,
            finalize: None,
        };
        assert!(db.commit_session(&commit).await.unwrap());
        // Same expected count again: somebody else already moved the counter
        assert!(!db.commit_session(&commit).await.unwrap());

        let stored = db.get_session(team.id, task.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(!stored.finished);
    }

    #[tokio::test]
    async fn test_finalization_releases_company_when_exhausted() {
        let db = test_db().await;
        let (contest, company, task) = seed_task(&db).await;
        let team = db.create_team("Owls", "owls@example.com", "h").await.unwrap();
        db.set_team_contest(team.id, contest.id).await.unwrap();
        assert!(db.approve_team(team.id, company.id).await.unwrap());
        assert_eq!(
            db.get_company(company.id).await.unwrap().unwrap().current_team_id,
            Some(team.id)
        );

        let now = Utc::now();
        let session = db.open_session(team.id, task.id, now).await.unwrap();
        let team_mid = db.get_team(team.id).await.unwrap().unwrap();
        assert_eq!(team_mid.current_task_id, Some(task.id));

        let commit = SessionCommit {
            session_id: session.id,
            team_id: team.id,
            expected_attempts: 0,
            attempts: 1,
            is_correct: true,
            finalize: Some(Finalization {
                finished_at: now,
                accrued_secs: 42,
                points: 1,
            }),
        };
        assert!(db.commit_session(&commit).await.unwrap());

        let team = db.get_team(team.id).await.unwrap().unwrap();
        assert_eq!(team.points, 1);
        assert_eq!(team.total_duration_secs, 42);
        assert!(team.current_task_id.is_none());
        assert!(team.company_id.is_none());
        assert!(db
            .get_company(company.id)
            .await
            .unwrap()
            .unwrap()
            .current_team_id
            .is_none());

        let session = db.get_session(team.id, task.id).await.unwrap().unwrap();
        assert!(session.finished);
        assert!(session.is_correct);
        assert!(session.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_next_company_for_team() {
        let db = test_db().await;
        let (contest, company, task) = seed_task(&db).await;
        let team = db.create_team("Owls", "owls@example.com", "h").await.unwrap();

        let next = db.next_company_for_team(contest.id, team.id).await.unwrap();
        assert_eq!(next.unwrap().id, company.id);

        db.open_session(team.id, task.id, Utc::now()).await.unwrap();
        assert!(db
            .next_company_for_team(contest.id, team.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_answers_are_appended() {
        let db = test_db().await;
        let (_, _, task) = seed_task(&db).await;
        let team = db.create_team("Owls", "owls@example.com", "h").await.unwrap();

        db.append_answer(team.id, task.id, "5", false).await.unwrap();
        db.append_answer(team.id, task.id, "4", true).await.unwrap();

        let answers = db.list_answers_for_team(team.id).await.unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].answer, "5");
        assert!(!answers[0].is_correct);
        assert!(answers[1].is_correct);
    }
}
