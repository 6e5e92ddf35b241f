// HTTP API routes (admin, company and team surfaces).

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::auth::{
    self, AdminUser, AnyCompanyUser, CompanyUser, JwtKeys, TeamUser, ROLE_ADMIN, ROLE_COMPANY,
    ROLE_TEAM,
};
use crate::bot::is_valid_email;
use crate::db::{self, Contest, Database, NewTask, Task, TeamTaskSession};
use crate::files::FileStore;
use crate::metrics;
use crate::workflow::{ErrorKind, TeamWorkflow, WorkflowError};

/// Largest accepted request body, sized for task attachments.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const MIN_PASSWORD_LEN: usize = 8;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct CreateCompanyRequest {
    pub name: String,
    pub email: String,
    pub location: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateCompanyRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub location: Option<String>,
}

#[derive(Deserialize)]
pub struct ContestRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct RegisterTeamRequest {
    pub email: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct AnswerRequest {
    pub task_id: i64,
    pub answer: String,
}

// ── Response types ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ContestWithTasks {
    #[serde(flatten)]
    pub contest: Contest,
    pub tasks: Vec<Task>,
}

/// A task as shown to a team: no answer, only whether a file is attached.
#[derive(Serialize)]
pub struct TaskView {
    pub id: i64,
    pub contest_id: i64,
    pub company_id: i64,
    pub question: String,
    pub has_file: bool,
    pub time_limit: Option<i64>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            contest_id: task.contest_id,
            company_id: task.company_id,
            question: task.question.clone(),
            has_file: task.question_file.is_some(),
            time_limit: task.time_limit,
        }
    }
}

#[derive(Serialize)]
pub struct SessionView {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub attempts: i64,
    pub finished: bool,
    pub is_correct: bool,
}

impl From<&TeamTaskSession> for SessionView {
    fn from(s: &TeamTaskSession) -> Self {
        Self {
            started_at: s.started_at,
            attempts: s.attempts,
            finished: s.finished,
            is_correct: s.is_correct,
        }
    }
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub workflow: Arc<TeamWorkflow>,
    pub files: FileStore,
    pub keys: Arc<JwtKeys>,
    pub admin_username: String,
    pub admin_password: String,
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn internal_error(e: sqlx::Error) -> impl IntoResponse {
    tracing::error!("Database error: {e}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn workflow_error(e: WorkflowError) -> Response {
    let status = match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidState => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::ExternalDependencyFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => {
            tracing::error!("Request failed: {e}");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                .into_response();
        }
    };
    json_error(status, &e.to_string()).into_response()
}

fn issue_token(
    keys: &JwtKeys,
    subject: i64,
    role: &str,
    ttl: chrono::Duration,
    reset_required: bool,
) -> Result<String, Response> {
    auth::create_token(keys, subject, role, ttl, reset_required).map_err(|e| {
        tracing::error!("Token creation error: {e}");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
    })
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let keys = state.keys.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        // Public
        .route("/api/v1/admin/login", post(admin_login))
        .route("/api/v1/company/login", post(company_login))
        .route("/api/v1/team/register", post(team_register))
        .route("/api/v1/team/login", post(team_login))
        // Admin
        .route(
            "/api/v1/admin/companies",
            get(list_companies).post(create_company),
        )
        .route(
            "/api/v1/admin/companies/{id}",
            get(get_company).put(update_company).delete(delete_company),
        )
        .route(
            "/api/v1/admin/companies/{id}/reset-password",
            post(reset_company_password),
        )
        .route(
            "/api/v1/admin/contests",
            get(list_contests).post(create_contest),
        )
        .route(
            "/api/v1/admin/contests/{id}",
            get(get_contest).put(update_contest).delete(delete_contest),
        )
        .route("/api/v1/admin/contests/{id}/start", post(start_contest))
        .route("/api/v1/admin/contests/{id}/end", post(end_contest))
        // Company
        .route("/api/v1/company/change-password", post(change_password))
        .route("/api/v1/company/location", get(company_location))
        .route(
            "/api/v1/company/tasks",
            get(list_company_tasks).post(create_task),
        )
        .route(
            "/api/v1/company/tasks/{id}",
            get(get_company_task).put(update_task).delete(delete_task),
        )
        .route("/api/v1/company/tasks/{id}/file", get(download_task_file))
        .route("/api/v1/company/teams", get(list_unassigned_teams))
        .route("/api/v1/company/teams/{id}/approve", post(approve_team))
        // Team
        .route("/api/v1/team/me", get(team_me))
        .route("/api/v1/team/contest/join", post(join_contest))
        .route("/api/v1/team/location", get(team_location))
        .route("/api/v1/team/task", get(current_task).post(assign_task))
        .route("/api/v1/team/task/file", get(current_task_file))
        .route("/api/v1/team/answer", post(submit_answer))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(Extension(keys))
        .layer(middleware::from_fn(track_metrics))
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let start = Instant::now();

    let response = next.run(req).await;

    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(start.elapsed().as_secs_f64());
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    response
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "cyberchase-backend" }))
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── Admin handlers ────────────────────────────────────────────────────

async fn admin_login(
    State(state): State<AppState>,
    Json(req): Json<AdminLoginRequest>,
) -> impl IntoResponse {
    if req.username != state.admin_username || req.password != state.admin_password {
        return json_error(StatusCode::UNAUTHORIZED, "Invalid credentials").into_response();
    }
    match issue_token(&state.keys, 0, ROLE_ADMIN, chrono::Duration::hours(8), false) {
        Ok(token) => (StatusCode::OK, Json(json!({ "token": token }))).into_response(),
        Err(resp) => resp,
    }
}

async fn list_companies(_admin: AdminUser, State(state): State<AppState>) -> impl IntoResponse {
    match state.db.list_companies().await {
        Ok(companies) => (StatusCode::OK, Json(json!(companies))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn create_company(
    _admin: AdminUser,
    State(state): State<AppState>,
    Json(req): Json<CreateCompanyRequest>,
) -> impl IntoResponse {
    let name = req.name.trim();
    let email = req.email.trim();
    if name.is_empty() || email.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name and email are required").into_response();
    }
    let location = req.location.unwrap_or_default();
    match state.workflow.create_company(name, email, &location).await {
        Ok(company) => (StatusCode::CREATED, Json(json!(company))).into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn get_company(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.db.get_company(id).await {
        Ok(Some(company)) => (StatusCode::OK, Json(json!(company))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Company not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn update_company(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateCompanyRequest>,
) -> impl IntoResponse {
    match state
        .db
        .update_company(
            id,
            req.name.as_deref(),
            req.email.as_deref(),
            req.location.as_deref(),
        )
        .await
    {
        Ok(Some(company)) => (StatusCode::OK, Json(json!(company))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Company not found").into_response(),
        Err(e) if db::is_unique_violation(&e) => {
            json_error(StatusCode::CONFLICT, "Company name or email already taken").into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_company(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.db.delete_company(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Company not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn reset_company_password(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.workflow.reset_company_password(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "message": "Temporary password sent" })),
        )
            .into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn list_contests(_admin: AdminUser, State(state): State<AppState>) -> impl IntoResponse {
    let contests = match state.db.list_contests().await {
        Ok(c) => c,
        Err(e) => return internal_error(e).into_response(),
    };
    let mut out = Vec::with_capacity(contests.len());
    for contest in contests {
        match state.db.list_tasks_by_contest(contest.id).await {
            Ok(tasks) => out.push(ContestWithTasks { contest, tasks }),
            Err(e) => return internal_error(e).into_response(),
        }
    }
    (StatusCode::OK, Json(json!(out))).into_response()
}

async fn create_contest(
    _admin: AdminUser,
    State(state): State<AppState>,
    Json(req): Json<ContestRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name is required").into_response();
    }
    match state.db.create_contest(req.name.trim()).await {
        Ok(contest) => (StatusCode::CREATED, Json(json!(contest))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_contest(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let contest = match state.db.get_contest(id).await {
        Ok(Some(c)) => c,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Contest not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    };
    match state.db.list_tasks_by_contest(id).await {
        Ok(tasks) => (
            StatusCode::OK,
            Json(json!(ContestWithTasks { contest, tasks })),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn update_contest(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ContestRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name is required").into_response();
    }
    match state.db.rename_contest(id, req.name.trim()).await {
        Ok(Some(contest)) => (StatusCode::OK, Json(json!(contest))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Contest not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_contest(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.db.delete_contest(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Contest not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn start_contest(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.workflow.start_contest(id).await {
        Ok(contest) => (StatusCode::OK, Json(json!(contest))).into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn end_contest(
    _admin: AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.workflow.end_contest(id).await {
        Ok(contest) => (StatusCode::OK, Json(json!(contest))).into_response(),
        Err(e) => workflow_error(e),
    }
}

// ── Company handlers ──────────────────────────────────────────────────

async fn company_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let company = match state
        .workflow
        .authenticate_company(req.email.trim(), &req.password)
        .await
    {
        Ok(c) => c,
        Err(e) => return workflow_error(e),
    };
    match issue_token(
        &state.keys,
        company.id,
        ROLE_COMPANY,
        chrono::Duration::hours(24),
        company.reset_required,
    ) {
        Ok(token) => (
            StatusCode::OK,
            Json(json!({ "token": token, "reset_required": company.reset_required })),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

async fn change_password(
    AnyCompanyUser(claims): AnyCompanyUser,
    State(state): State<AppState>,
    Json(req): Json<ChangePasswordRequest>,
) -> impl IntoResponse {
    if req.new_password.len() < MIN_PASSWORD_LEN {
        return json_error(
            StatusCode::BAD_REQUEST,
            "new password must be at least 8 characters",
        )
        .into_response();
    }
    let company = match state
        .workflow
        .change_company_password(claims.sub, &req.old_password, &req.new_password)
        .await
    {
        Ok(c) => c,
        Err(e) => return workflow_error(e),
    };
    match issue_token(
        &state.keys,
        company.id,
        ROLE_COMPANY,
        chrono::Duration::hours(24),
        false,
    ) {
        Ok(token) => (StatusCode::OK, Json(json!({ "token": token }))).into_response(),
        Err(resp) => resp,
    }
}

async fn company_location(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.db.get_company(claims.sub).await {
        Ok(Some(company)) if !company.location.is_empty() => (
            StatusCode::OK,
            Json(json!({ "map_link": company.location })),
        )
            .into_response(),
        Ok(Some(_)) => json_error(StatusCode::NOT_FOUND, "Location not set").into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Company not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn list_company_tasks(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.db.list_tasks_by_company(claims.sub).await {
        Ok(tasks) => (StatusCode::OK, Json(json!(tasks))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

/// Fields of a multipart task form. Absent fields stay `None`.
#[derive(Default)]
struct TaskForm {
    contest_id: Option<i64>,
    question: Option<String>,
    correct_answer: Option<String>,
    time_limit: Option<i64>,
    file: Option<(String, Vec<u8>)>,
}

async fn read_task_form(mut multipart: Multipart) -> Result<TaskForm, Response> {
    let bad = |msg: String| json_error(StatusCode::BAD_REQUEST, &msg).into_response();
    let mut form = TaskForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad(format!("Invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "question_file" {
            let filename = field.file_name().unwrap_or("attachment").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad(format!("Failed to read file: {e}")))?;
            if !bytes.is_empty() {
                form.file = Some((filename, bytes.to_vec()));
            }
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| bad(format!("Invalid field {name}: {e}")))?;
        let value = value.trim().to_string();
        match name.as_str() {
            "contest_id" => {
                form.contest_id = Some(
                    value
                        .parse()
                        .map_err(|_| bad("contest_id must be a number".into()))?,
                )
            }
            "time_limit" if value.is_empty() => form.time_limit = None,
            "time_limit" => {
                form.time_limit = Some(
                    value
                        .parse()
                        .map_err(|_| bad("time_limit must be a number of minutes".into()))?,
                )
            }
            "question" => form.question = Some(value),
            "correct_answer" => form.correct_answer = Some(value),
            _ => {}
        }
    }
    Ok(form)
}

/// Load a task and check that it belongs to the company.
async fn owned_task(state: &AppState, company_id: i64, task_id: i64) -> Result<Task, Response> {
    match state.db.get_task(task_id).await {
        Ok(Some(task)) if task.company_id == company_id => Ok(task),
        Ok(Some(_)) => Err(json_error(
            StatusCode::FORBIDDEN,
            "Not authorized to access this task",
        )
        .into_response()),
        Ok(None) => Err(json_error(StatusCode::NOT_FOUND, "Task not found").into_response()),
        Err(e) => Err(internal_error(e).into_response()),
    }
}

async fn create_task(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
    multipart: Multipart,
) -> impl IntoResponse {
    let form = match read_task_form(multipart).await {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    let Some(contest_id) = form.contest_id else {
        return json_error(StatusCode::BAD_REQUEST, "contest_id is required").into_response();
    };
    let correct_answer = form.correct_answer.unwrap_or_default();
    if correct_answer.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "correct_answer is required").into_response();
    }
    let question = form.question.unwrap_or_default();
    if question.is_empty() && form.file.is_none() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "either question or question_file is required",
        )
        .into_response();
    }

    match state.db.get_contest(contest_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Contest not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    }

    let mut task = match state
        .db
        .create_task(&NewTask {
            contest_id,
            company_id: claims.sub,
            question: &question,
            question_file: None,
            correct_answer: &correct_answer,
            time_limit: form.time_limit,
        })
        .await
    {
        Ok(t) => t,
        Err(e) => return internal_error(e).into_response(),
    };

    if let Some((filename, bytes)) = form.file {
        let stored = match state.files.save(task.id, &filename, &bytes).await {
            Ok(name) => name,
            Err(e) => {
                discard_task(&state, task.id).await;
                return workflow_error(WorkflowError::Storage(e));
            }
        };
        task.question_file = Some(stored);
        if let Err(e) = state.db.update_task(&task).await {
            discard_task(&state, task.id).await;
            return internal_error(e).into_response();
        }
    }

    tracing::info!(task_id = task.id, company_id = claims.sub, "Task created");
    (StatusCode::CREATED, Json(json!(task))).into_response()
}

/// Undo a partially created task.
async fn discard_task(state: &AppState, task_id: i64) {
    if let Err(e) = state.files.delete(task_id).await {
        tracing::warn!(task_id, "Failed to remove task files: {e}");
    }
    if let Err(e) = state.db.delete_task(task_id).await {
        tracing::error!(task_id, "Failed to remove task: {e}");
    }
}

async fn get_company_task(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match owned_task(&state, claims.sub, id).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))).into_response(),
        Err(resp) => resp,
    }
}

async fn update_task(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    multipart: Multipart,
) -> impl IntoResponse {
    let mut task = match owned_task(&state, claims.sub, id).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let form = match read_task_form(multipart).await {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    if let Some(question) = form.question {
        task.question = question;
    }
    if let Some(answer) = form.correct_answer.filter(|a| !a.is_empty()) {
        task.correct_answer = answer;
    }
    if form.time_limit.is_some() {
        task.time_limit = form.time_limit;
    }
    if task.question.is_empty() && task.question_file.is_none() && form.file.is_none() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "either question or question_file is required",
        )
        .into_response();
    }

    if let Some((filename, bytes)) = form.file {
        if let Err(e) = state.files.delete(task.id).await {
            return workflow_error(WorkflowError::Storage(e));
        }
        match state.files.save(task.id, &filename, &bytes).await {
            Ok(stored) => task.question_file = Some(stored),
            Err(e) => {
                task.question_file = None;
                if let Err(db_err) = state.db.update_task(&task).await {
                    tracing::error!(task_id = task.id, "Failed to clear task file: {db_err}");
                }
                return workflow_error(WorkflowError::Storage(e));
            }
        }
    }

    match state.db.update_task(&task).await {
        Ok(true) => (StatusCode::OK, Json(json!(task))).into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Task not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_task(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(resp) = owned_task(&state, claims.sub, id).await {
        return resp;
    }
    match state.db.delete_task(id).await {
        Ok(true) => {
            if let Err(e) = state.files.delete(id).await {
                tracing::warn!(task_id = id, "Failed to remove task files: {e}");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Task not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn serve_task_file(state: &AppState, task: &Task) -> Response {
    let Some(filename) = &task.question_file else {
        return json_error(StatusCode::NOT_FOUND, "Task has no file").into_response();
    };
    match tokio::fs::read(state.files.path(task.id, filename)).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (
                    header::CONTENT_TYPE,
                    "application/octet-stream".to_string(),
                ),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            json_error(StatusCode::NOT_FOUND, "File not found").into_response()
        }
        Err(e) => workflow_error(WorkflowError::Storage(e)),
    }
}

async fn download_task_file(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match owned_task(&state, claims.sub, id).await {
        Ok(task) => serve_task_file(&state, &task).await,
        Err(resp) => resp,
    }
}

async fn list_unassigned_teams(
    _company: CompanyUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.workflow.list_unassigned_teams().await {
        Ok(teams) => (StatusCode::OK, Json(json!(teams))).into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn approve_team(
    CompanyUser(claims): CompanyUser,
    State(state): State<AppState>,
    Path(team_id): Path<i64>,
) -> impl IntoResponse {
    match state.workflow.approve_team(team_id, claims.sub).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "message": "Team approved", "team_id": team_id })),
        )
            .into_response(),
        Err(e) => workflow_error(e),
    }
}

// ── Team handlers ─────────────────────────────────────────────────────

async fn team_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterTeamRequest>,
) -> impl IntoResponse {
    let email = req.email.trim();
    let name = req.name.trim();
    if name.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name is required").into_response();
    }
    if !is_valid_email(email) {
        return json_error(StatusCode::BAD_REQUEST, "invalid email").into_response();
    }
    match state.workflow.register(email, name).await {
        Ok(team) => (StatusCode::CREATED, Json(json!(team))).into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn team_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let team = match state
        .workflow
        .authenticate(req.email.trim(), &req.password)
        .await
    {
        Ok(t) => t,
        Err(e) => return workflow_error(e),
    };
    match issue_token(
        &state.keys,
        team.id,
        ROLE_TEAM,
        chrono::Duration::hours(24),
        false,
    ) {
        Ok(token) => (
            StatusCode::OK,
            Json(json!({ "token": token, "team": team })),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

async fn team_me(TeamUser(claims): TeamUser, State(state): State<AppState>) -> impl IntoResponse {
    match state.workflow.get_team(claims.sub).await {
        Ok(team) => (StatusCode::OK, Json(json!(team))).into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn join_contest(
    TeamUser(claims): TeamUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.workflow.join_contest(claims.sub).await {
        Ok(contest) => (StatusCode::OK, Json(json!(contest))).into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn team_location(
    TeamUser(claims): TeamUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.workflow.next_location(claims.sub).await {
        Ok(Some(company)) => (
            StatusCode::OK,
            Json(json!({
                "company_id": company.id,
                "name": company.name,
                "map_link": company.location,
            })),
        )
            .into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "All tasks complete").into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn assign_task(
    TeamUser(claims): TeamUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.workflow.assign_task(claims.sub).await {
        Ok(task) => (StatusCode::OK, Json(json!(TaskView::from(&task)))).into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn current_task(
    TeamUser(claims): TeamUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.workflow.current_task(claims.sub).await {
        Ok(Some((task, session))) => (
            StatusCode::OK,
            Json(json!({
                "task": TaskView::from(&task),
                "session": SessionView::from(&session),
            })),
        )
            .into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "No current task").into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn current_task_file(
    TeamUser(claims): TeamUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.workflow.current_task(claims.sub).await {
        Ok(Some((task, _))) => serve_task_file(&state, &task).await,
        Ok(None) => json_error(StatusCode::NOT_FOUND, "No current task").into_response(),
        Err(e) => workflow_error(e),
    }
}

async fn submit_answer(
    TeamUser(claims): TeamUser,
    State(state): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> impl IntoResponse {
    match state
        .workflow
        .submit(claims.sub, req.task_id, &req.answer)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))).into_response(),
        Err(e) => workflow_error(e),
    }
}
