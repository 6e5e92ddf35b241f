// Fixed task session policy

/// Answers accepted per session before it is closed.
pub const MAX_ATTEMPTS: i64 = 3;

/// Wall-clock budget of a session, in seconds. Also the ceiling on the
/// duration a single session can add to a team's total.
pub const SESSION_TIME_LIMIT_SECS: i64 = 10 * 60;

/// Points awarded for a correct answer.
pub const POINTS_PER_CORRECT: i64 = 1;

pub fn session_time_limit() -> chrono::Duration {
    chrono::Duration::seconds(SESSION_TIME_LIMIT_SECS)
}
