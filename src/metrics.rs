// Prometheus metrics definitions for the contest backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Chat users with a live conversational session.
    pub static ref CONVERSATIONS_ACTIVE: IntGauge =
        IntGauge::new("cyberchase_conversations_active", "Chat users with a live conversation").unwrap();

    /// Approval waits currently polling.
    pub static ref APPROVAL_WAITS_ACTIVE: IntGauge =
        IntGauge::new("cyberchase_approval_waits_active", "Approval waits currently polling").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Teams successfully registered.
    pub static ref TEAMS_REGISTERED_TOTAL: IntCounter = IntCounter::new(
        "cyberchase_teams_registered_total",
        "Teams successfully registered",
    )
    .unwrap();

    /// Registrations rolled back because the credential mail failed.
    pub static ref REGISTRATION_DELIVERY_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "cyberchase_registration_delivery_failures_total",
        "Registrations rolled back after a mail delivery failure",
    )
    .unwrap();

    /// Tasks handed to teams.
    pub static ref TASKS_ASSIGNED_TOTAL: IntCounter = IntCounter::new(
        "cyberchase_tasks_assigned_total",
        "Tasks handed to teams",
    )
    .unwrap();

    /// Recorded answers, by outcome (correct, wrong).
    pub static ref ANSWERS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cyberchase_answers_total", "Recorded answers"),
        &["outcome"],
    )
    .unwrap();

    /// Sessions finalized, by reason (correct, attempts, timeout).
    pub static ref SESSIONS_FINALIZED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cyberchase_sessions_finalized_total", "Task sessions finalized"),
        &["reason"],
    )
    .unwrap();

    /// Inbound chat updates handled, by kind (text, button).
    pub static ref BOT_UPDATES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cyberchase_bot_updates_total", "Inbound chat updates handled"),
        &["kind"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cyberchase_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Seconds a finalized session added to its team's total.
    pub static ref SESSION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("cyberchase_session_duration_seconds", "Accrued session duration in seconds")
            .buckets(vec![15.0, 30.0, 60.0, 120.0, 180.0, 300.0, 450.0, 600.0]),
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "cyberchase_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CONVERSATIONS_ACTIVE.clone()),
        Box::new(APPROVAL_WAITS_ACTIVE.clone()),
        Box::new(TEAMS_REGISTERED_TOTAL.clone()),
        Box::new(REGISTRATION_DELIVERY_FAILURES_TOTAL.clone()),
        Box::new(TASKS_ASSIGNED_TOTAL.clone()),
        Box::new(ANSWERS_TOTAL.clone()),
        Box::new(SESSIONS_FINALIZED_TOTAL.clone()),
        Box::new(BOT_UPDATES_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(SESSION_DURATION_SECONDS.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("Metric registration skipped: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_no_ids() {
        assert_eq!(normalize_path("/api/v1/team/task"), "/api/v1/team/task");
        assert_eq!(normalize_path("/health"), "/health");
    }

    #[test]
    fn test_normalize_path_with_ids() {
        assert_eq!(
            normalize_path("/api/v1/company/tasks/42"),
            "/api/v1/company/tasks/:id"
        );
        assert_eq!(
            normalize_path("/api/v1/admin/contests/7/start"),
            "/api/v1/admin/contests/:id/start"
        );
    }

    #[test]
    fn test_register_twice_and_gather() {
        register_metrics();
        register_metrics();
        TASKS_ASSIGNED_TOTAL.inc();
        let output = gather_metrics();
        assert!(output.contains("cyberchase_tasks_assigned_total"));
    }

    #[test]
    fn test_metric_increments() {
        CONVERSATIONS_ACTIVE.set(2);
        assert_eq!(CONVERSATIONS_ACTIVE.get(), 2);
        CONVERSATIONS_ACTIVE.set(0);

        APPROVAL_WAITS_ACTIVE.inc();
        APPROVAL_WAITS_ACTIVE.dec();

        ANSWERS_TOTAL.with_label_values(&["correct"]).inc();
        SESSIONS_FINALIZED_TOTAL.with_label_values(&["timeout"]).inc();
        BOT_UPDATES_TOTAL.with_label_values(&["text"]).inc();
        SESSION_DURATION_SECONDS.observe(42.0);
        API_REQUEST_DURATION_SECONDS
            .with_label_values(&["/api/v1/team/task"])
            .observe(0.05);
        API_REQUESTS_TOTAL
            .with_label_values(&["GET", "/api/v1/team/task", "200"])
            .inc();
    }
}
