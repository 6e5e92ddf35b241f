// Integration tests for task sessions: scoring, attempt limits and the time budget.

use std::sync::Arc;

use chrono::Duration;
use cyberchase_backend::clock::ManualClock;
use cyberchase_backend::db::{Database, NewTask};
use cyberchase_backend::mailer::LogMailer;
use cyberchase_backend::workflow::{TeamWorkflow, WorkflowError};

struct Contest {
    db: Arc<Database>,
    clock: Arc<ManualClock>,
    workflow: Arc<TeamWorkflow>,
    team_id: i64,
}

/// One active contest, one company with `tasks` tasks, one approved team.
async fn contest_with_tasks(tasks: usize) -> Contest {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let clock = Arc::new(ManualClock::default());
    let workflow = Arc::new(TeamWorkflow::new(
        db.clone(),
        Arc::new(LogMailer),
        clock.clone(),
    ));

    let contest = db.create_contest("Night Run").await.unwrap();
    workflow.start_contest(contest.id).await.unwrap();
    let company = db
        .create_company("Harbor Labs", "labs@example.com", "h", "https://maps.example/1")
        .await
        .unwrap();
    for i in 0..tasks {
        let answer = format!("FLAG{{{i}}}");
        db.create_task(&NewTask {
            contest_id: contest.id,
            company_id: company.id,
            question: "Find the flag",
            question_file: None,
            correct_answer: &answer,
            time_limit: Some(10),
        })
        .await
        .unwrap();
    }

    let team = db
        .create_team("Night Owls", "owls@example.com", "h")
        .await
        .unwrap();
    workflow.join_contest(team.id).await.unwrap();
    workflow.approve_team(team.id, company.id).await.unwrap();

    Contest {
        db,
        clock,
        workflow,
        team_id: team.id,
    }
}

#[tokio::test]
async fn test_correct_first_answer_scores_and_records_elapsed_time() {
    let c = contest_with_tasks(2).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();

    c.clock.advance(Duration::seconds(95));
    let outcome = c
        .workflow
        .submit(c.team_id, task.id, &task.correct_answer)
        .await
        .unwrap();
    assert!(outcome.is_correct);
    assert!(outcome.finished);
    assert_eq!(outcome.attempts, 1);

    let session = c.db.get_session(c.team_id, task.id).await.unwrap().unwrap();
    assert!(session.finished);
    assert!(session.is_correct);

    let team = c.db.get_team(c.team_id).await.unwrap().unwrap();
    assert_eq!(team.points, 1);
    assert_eq!(team.total_duration_secs, 95);
    assert_eq!(team.current_task_id, None);
}

#[tokio::test]
async fn test_three_wrong_answers_close_the_session_without_points() {
    let c = contest_with_tasks(2).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();

    c.clock.advance(Duration::seconds(20));
    let first = c.workflow.submit(c.team_id, task.id, "nope").await.unwrap();
    assert!(!first.finished);
    assert_eq!(first.attempts_left, 2);

    c.clock.advance(Duration::seconds(20));
    let second = c.workflow.submit(c.team_id, task.id, "still no").await.unwrap();
    assert!(!second.finished);
    assert_eq!(second.attempts_left, 1);

    c.clock.advance(Duration::seconds(20));
    let third = c.workflow.submit(c.team_id, task.id, "give up").await.unwrap();
    assert!(third.finished);
    assert!(!third.is_correct);
    assert_eq!(third.attempts, 3);
    assert_eq!(third.attempts_left, 0);

    let team = c.db.get_team(c.team_id).await.unwrap().unwrap();
    assert_eq!(team.points, 0);
    assert_eq!(team.total_duration_secs, 60);

    let answers = c.db.list_answers_for_team(c.team_id).await.unwrap();
    assert_eq!(answers.len(), 3);
    assert!(answers.iter().all(|a| !a.is_correct));
}

#[tokio::test]
async fn test_late_answer_is_rejected_and_not_recorded() {
    let c = contest_with_tasks(1).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();

    c.clock.advance(Duration::minutes(11));
    let err = c
        .workflow
        .submit(c.team_id, task.id, &task.correct_answer)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::SessionClosed));

    let session = c.db.get_session(c.team_id, task.id).await.unwrap().unwrap();
    assert_eq!(session.attempts, 0);
    assert!(c.db.list_answers_for_team(c.team_id).await.unwrap().is_empty());

    let team = c.db.get_team(c.team_id).await.unwrap().unwrap();
    assert_eq!(team.points, 0);
}

#[tokio::test]
async fn test_expired_session_counts_the_full_budget_once_settled() {
    let c = contest_with_tasks(2).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();

    c.clock.advance(Duration::minutes(15));
    assert!(c.workflow.settle_expired(c.team_id).await.unwrap());
    assert!(!c.workflow.settle_expired(c.team_id).await.unwrap());

    let team = c.db.get_team(c.team_id).await.unwrap().unwrap();
    assert_eq!(team.total_duration_secs, 600);
    assert_eq!(team.current_task_id, None);

    let next = c.workflow.assign_task(c.team_id).await.unwrap();
    assert_ne!(next.id, task.id);
}

#[tokio::test]
async fn test_answers_match_exactly() {
    let c = contest_with_tasks(1).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();

    let padded = format!(" {} ", task.correct_answer);
    assert!(!c.workflow.submit_answer(c.team_id, task.id, &padded).await.unwrap());
    let lower = task.correct_answer.to_lowercase();
    assert!(!c.workflow.submit_answer(c.team_id, task.id, &lower).await.unwrap());
    assert!(c
        .workflow
        .submit_answer(c.team_id, task.id, &task.correct_answer)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_finished_session_rejects_further_answers() {
    let c = contest_with_tasks(2).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();
    c.workflow
        .submit(c.team_id, task.id, &task.correct_answer)
        .await
        .unwrap();
    let before = c.db.get_team(c.team_id).await.unwrap().unwrap();

    let err = c
        .workflow
        .submit(c.team_id, task.id, &task.correct_answer)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::SessionClosed));

    let after = c.db.get_team(c.team_id).await.unwrap().unwrap();
    assert_eq!(before.points, after.points);
    assert_eq!(before.total_duration_secs, after.total_duration_secs);
    assert_eq!(c.db.list_answers_for_team(c.team_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_answers_never_exceed_attempt_limit() {
    let c = contest_with_tasks(2).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();

    let mut set = tokio::task::JoinSet::new();
    for i in 0..8 {
        let workflow = c.workflow.clone();
        let (team_id, task_id) = (c.team_id, task.id);
        set.spawn(async move { workflow.submit(team_id, task_id, &format!("guess-{i}")).await });
    }
    let mut accepted = 0;
    while let Some(result) = set.join_next().await {
        match result.unwrap() {
            Ok(_) => accepted += 1,
            Err(WorkflowError::SessionClosed) | Err(WorkflowError::TaskMismatch) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let session = c.db.get_session(c.team_id, task.id).await.unwrap().unwrap();
    assert!(accepted <= 3);
    assert!(session.attempts <= 3);
    assert_eq!(session.attempts, accepted);
}

#[tokio::test]
async fn test_tasks_run_out_and_company_is_released() {
    let c = contest_with_tasks(1).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();
    c.workflow
        .submit(c.team_id, task.id, &task.correct_answer)
        .await
        .unwrap();

    let team = c.db.get_team(c.team_id).await.unwrap().unwrap();
    assert_eq!(team.company_id, None);
    assert!(c.workflow.next_location(c.team_id).await.unwrap().is_none());
    assert!(matches!(
        c.workflow.assign_task(c.team_id).await.unwrap_err(),
        WorkflowError::NotInContest
    ));
}

#[tokio::test]
async fn test_no_task_left_at_company_is_reported() {
    let c = contest_with_tasks(1).await;
    let task = c.workflow.assign_task(c.team_id).await.unwrap();
    c.workflow.submit(c.team_id, task.id, "wrong").await.unwrap();
    c.workflow.submit(c.team_id, task.id, "wrong").await.unwrap();
    c.workflow.submit(c.team_id, task.id, "wrong").await.unwrap();

    // Approved again at a company whose only task was already attempted
    let company_id = c.db.list_companies().await.unwrap()[0].id;
    c.workflow.approve_team(c.team_id, company_id).await.unwrap();

    let err = c.workflow.assign_task(c.team_id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::NoAvailableTask));
    let team = c.db.get_team(c.team_id).await.unwrap().unwrap();
    assert_eq!(team.current_task_id, None);
    assert_eq!(c.db.list_sessions_for_team(c.team_id).await.unwrap().len(), 1);
}
