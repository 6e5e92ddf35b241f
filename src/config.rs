// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Secret used to sign admin, company and team JWTs.
    pub jwt_secret: String,
    /// Static administrator credentials.
    pub admin_username: String,
    pub admin_password: String,
    /// Directory where task attachments are stored, one subdirectory per task.
    pub upload_dir: PathBuf,
    /// Chat bot token. The bot is not started when this is unset.
    pub bot_token: Option<String>,
    /// Base URL of the chat Bot API.
    pub telegram_api_url: String,
    /// Outbound mail relay. Mail is only logged when this is unset.
    pub mail_relay_url: Option<String>,
    pub mail_relay_token: Option<String>,
    pub mail_from: String,
    /// Bounded wait for a company to approve a team in the bot flow.
    pub approval_poll_attempts: u32,
    pub approval_poll_interval: Duration,
}

const DEFAULT_JWT_SECRET: &str = "cyberchase-dev-secret-change-in-production";
const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "0000";

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// A `.env` file in the working directory is read first when present.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:cyberchase.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 8080)
    /// - `JWT_SECRET` - token signing secret
    /// - `ADMIN_USERNAME` / `ADMIN_PASSWORD` - admin login (default: `admin` / `0000`)
    /// - `UPLOAD_DIR` - task attachment directory (default: `./uploads`)
    /// - `BOT_TOKEN` - chat bot token; the bot is disabled without it
    /// - `TELEGRAM_API_URL` - Bot API base URL (default: `https://api.telegram.org`)
    /// - `MAIL_RELAY_URL` / `MAIL_RELAY_TOKEN` / `MAIL_FROM` - outbound mail relay
    /// - `APPROVAL_POLL_ATTEMPTS` (default 30) / `APPROVAL_POLL_INTERVAL_SECS` (default 2)
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !matches!(e, dotenvy::Error::Io(_)) {
                eprintln!("Warning: Failed to load .env file: {e}");
            }
        }

        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:cyberchase.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(8080);

        let jwt_secret =
            std::env::var("JWT_SECRET").unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_string());

        let admin_username = std::env::var("ADMIN_USERNAME")
            .unwrap_or_else(|_| DEFAULT_ADMIN_USERNAME.to_string());
        let admin_password = std::env::var("ADMIN_PASSWORD")
            .unwrap_or_else(|_| DEFAULT_ADMIN_PASSWORD.to_string());

        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploads"));

        let bot_token = non_empty_var("BOT_TOKEN");
        let telegram_api_url = std::env::var("TELEGRAM_API_URL")
            .unwrap_or_else(|_| "https://api.telegram.org".to_string());

        let mail_relay_url = non_empty_var("MAIL_RELAY_URL");
        let mail_relay_token = non_empty_var("MAIL_RELAY_TOKEN");
        let mail_from =
            std::env::var("MAIL_FROM").unwrap_or_else(|_| "noreply@cyberchase.local".to_string());

        let approval_poll_attempts = std::env::var("APPROVAL_POLL_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let approval_poll_interval = std::env::var("APPROVAL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(2));

        Config {
            database_url,
            port,
            jwt_secret,
            admin_username,
            admin_password,
            upload_dir,
            bot_token,
            telegram_api_url,
            mail_relay_url,
            mail_relay_token,
            mail_from,
            approval_poll_attempts,
            approval_poll_interval,
        }
    }

    /// Log warnings for settings that are only safe during development.
    pub fn warn_on_insecure_defaults(&self) {
        if self.jwt_secret == DEFAULT_JWT_SECRET {
            tracing::warn!("JWT_SECRET is not set, using the development secret");
        }
        if self.admin_username == DEFAULT_ADMIN_USERNAME
            && self.admin_password == DEFAULT_ADMIN_PASSWORD
        {
            tracing::warn!("Admin credentials are the built-in defaults");
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
