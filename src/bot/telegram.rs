// Telegram Bot API adapter: long-polls updates and sends replies over HTTPS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Action, ChatTransport, Conversation, Inbound, Outbound, TransportError};

/// Seconds the server holds a getUpdates call open.
const LONG_POLL_SECS: u64 = 50;
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub data: Option<String>,
    pub message: Option<Message>,
}

#[derive(Debug, Serialize)]
struct InlineButton<'a> {
    text: &'a str,
    callback_data: &'a str,
}

/// One button per row, matching the menu layout.
fn reply_markup(buttons: &[Action]) -> Option<serde_json::Value> {
    if buttons.is_empty() {
        return None;
    }
    let rows: Vec<Vec<InlineButton>> = buttons
        .iter()
        .map(|a| {
            vec![InlineButton {
                text: a.label(),
                callback_data: a.as_str(),
            }]
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

/// Turn an update into a conversation event. Also returns the callback query
/// id that must be acknowledged, if any.
pub fn to_inbound(update: Update) -> (Option<Inbound>, Option<String>) {
    if let Some(message) = update.message {
        let event = message.text.map(|text| Inbound::Text {
            chat_id: message.chat.id,
            text,
        });
        return (event, None);
    }
    if let Some(query) = update.callback_query {
        let event = match (query.message, query.data) {
            (Some(message), Some(data)) => Some(Inbound::Button {
                chat_id: message.chat.id,
                data,
            }),
            _ => None,
        };
        return (event, Some(query.id));
    }
    (None, None)
}

pub struct TelegramApi {
    client: reqwest::Client,
    base: String,
}

impl TelegramApi {
    pub fn new(api_url: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 20))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        unpack(method, response)
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": LONG_POLL_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    pub async fn answer_callback_query(&self, id: &str) -> Result<(), TransportError> {
        let _: bool = self
            .call("answerCallbackQuery", json!({ "callback_query_id": id }))
            .await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        path: &std::path::Path,
        caption: &str,
        buttons: &[Action],
    ) -> Result<(), TransportError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        if let Some(markup) = reply_markup(buttons) {
            form = form.text("reply_markup", markup.to_string());
        }

        let response: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/sendDocument", self.base))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;
        unpack("sendDocument", response).map(|_| ())
    }
}

fn unpack<T>(method: &str, response: ApiResponse<T>) -> Result<T, TransportError> {
    match (response.ok, response.result) {
        (true, Some(result)) => Ok(result),
        _ => Err(TransportError::Api(format!(
            "{method}: {}",
            response
                .description
                .unwrap_or_else(|| "no description".to_string())
        ))),
    }
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn send(&self, chat_id: i64, message: Outbound) -> Result<(), TransportError> {
        match message {
            Outbound::Text { text, buttons } => {
                let mut body = json!({ "chat_id": chat_id, "text": text });
                if let Some(markup) = reply_markup(&buttons) {
                    body["reply_markup"] = markup;
                }
                let _: serde_json::Value = self.call("sendMessage", body).await?;
                Ok(())
            }
            Outbound::Document {
                path,
                caption,
                buttons,
            } => self.send_document(chat_id, &path, &caption, &buttons).await,
        }
    }
}

/// Consume updates one at a time until the process exits.
pub async fn run(api: Arc<TelegramApi>, conversation: Conversation) {
    tracing::info!("Chat bot polling for updates");
    let mut offset = 0;
    loop {
        let updates = match api.get_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!("Failed to fetch chat updates: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let (event, callback_id) = to_inbound(update);
            if let Some(id) = callback_id {
                if let Err(e) = api.answer_callback_query(&id).await {
                    tracing::debug!("Failed to acknowledge callback query: {e}");
                }
            }
            if let Some(event) = event {
                conversation.handle(event).await;
            }
        }
    }
}
