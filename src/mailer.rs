// Outbound mail: temporary credentials for teams and companies.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mail relay rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Subject and body of the mail that carries a temporary password.
pub fn temporary_password_message(password: &str) -> (String, String) {
    (
        "Your temporary password".to_string(),
        format!("Your temporary password: {password}\n\nPlease keep it private."),
    )
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Delivers mail by POSTing JSON to an HTTP mail relay.
pub struct HttpMailer {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(url: String, token: Option<String>, from: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url,
            token,
            from,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let mut request = self.client.post(&self.url).json(&RelayMessage {
            from: &self.from,
            to,
            subject,
            text: body,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            tracing::info!(to, "Mail delivered to relay");
            return Ok(());
        }

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read response body>".to_string());
        tracing::error!(to, status, "Mail relay rejected message");
        Err(MailError::Rejected { status, body })
    }
}

/// Development mailer: logs the recipient and subject, never the body.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), MailError> {
        tracing::info!(to, subject, "Mail relay not configured, message not sent");
        Ok(())
    }
}
