use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cyberchase_backend::api::{self, AppState};
use cyberchase_backend::auth::JwtKeys;
use cyberchase_backend::bot::state::InMemorySessionStore;
use cyberchase_backend::bot::telegram::{self, TelegramApi};
use cyberchase_backend::bot::{ApprovalPolicy, Conversation};
use cyberchase_backend::clock::SystemClock;
use cyberchase_backend::config::Config;
use cyberchase_backend::db::Database;
use cyberchase_backend::files::FileStore;
use cyberchase_backend::mailer::{HttpMailer, LogMailer, Mailer};
use cyberchase_backend::metrics;
use cyberchase_backend::workflow::TeamWorkflow;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cyberchase_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load();
    config.warn_on_insecure_defaults();
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    let files = FileStore::new(config.upload_dir.clone());
    files
        .init()
        .await
        .expect("Failed to create upload directory");

    let mailer: Arc<dyn Mailer> = match &config.mail_relay_url {
        Some(url) => Arc::new(HttpMailer::new(
            url.clone(),
            config.mail_relay_token.clone(),
            config.mail_from.clone(),
        )),
        None => {
            tracing::warn!("MAIL_RELAY_URL not set, temporary passwords will not be delivered");
            Arc::new(LogMailer)
        }
    };

    let workflow = Arc::new(TeamWorkflow::new(
        db.clone(),
        mailer,
        Arc::new(SystemClock),
    ));

    match &config.bot_token {
        Some(token) => {
            let api = Arc::new(TelegramApi::new(&config.telegram_api_url, token));
            let conversation = Conversation::new(
                workflow.clone(),
                Arc::new(InMemorySessionStore::new()),
                api.clone(),
                files.clone(),
                ApprovalPolicy {
                    attempts: config.approval_poll_attempts,
                    interval: config.approval_poll_interval,
                },
            );
            tokio::spawn(telegram::run(api, conversation));
        }
        None => tracing::warn!("BOT_TOKEN not set, chat bot disabled"),
    }

    let state = AppState {
        db,
        workflow,
        files,
        keys: Arc::new(JwtKeys::new(&config.jwt_secret)),
        admin_username: config.admin_username.clone(),
        admin_password: config.admin_password.clone(),
    };

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Cyber-chase backend listening on {addr}");
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
