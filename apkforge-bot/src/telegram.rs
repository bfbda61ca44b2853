//! Minimal Telegram Bot API client: long polling, messages, documents.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl InlineKeyboardMarkup {
    pub fn is_empty(&self) -> bool {
        self.inline_keyboard.is_empty()
    }
}

pub struct TelegramClient {
    http: reqwest::Client,
    /// `https://api.telegram.org/bot<token>`; never logged.
    endpoint: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self::with_api_base(token, API_BASE)
    }

    /// Point at another Bot API server (self-hosted, or a mock in tests).
    pub fn with_api_base(token: &str, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/bot{token}", api_base.trim_end_matches('/')),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, request: reqwest::RequestBuilder) -> Result<T> {
        let resp = request
            .send()
            .await
            .map_err(|e| e.without_url())
            .with_context(|| format!("Telegram {method} request failed"))?;
        let status = resp.status();
        let body: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| e.without_url())
            .with_context(|| format!("Failed to parse Telegram {method} response"))?;
        match (body.ok, body.result) {
            (true, Some(result)) => Ok(result),
            _ => anyhow::bail!(
                "Telegram {method} error {status}: {}",
                body.description.unwrap_or_default()
            ),
        }
    }

    /// The bot's own account.
    pub async fn get_me(&self) -> Result<User> {
        let request = self.http.post(format!("{}/getMe", self.endpoint));
        self.call("getMe", request).await
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        let request = self
            .http
            .post(format!("{}/getUpdates", self.endpoint))
            .timeout(timeout + Duration::from_secs(10))
            .json(&body);
        self.call("getUpdates", request).await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<()> {
        let mut body = serde_json::json!({ "chat_id": chat_id, "text": text });
        if let Some(kb) = keyboard.filter(|kb| !kb.is_empty()) {
            body["reply_markup"] = serde_json::to_value(kb)?;
        }
        let request = self
            .http
            .post(format!("{}/sendMessage", self.endpoint))
            .json(&body);
        self.call::<serde_json::Value>("sendMessage", request).await?;
        Ok(())
    }

    /// Acknowledge a button press so the client stops its spinner.
    pub async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/answerCallbackQuery", self.endpoint))
            .json(&serde_json::json!({ "callback_query_id": callback_id }));
        self.call::<bool>("answerCallbackQuery", request).await?;
        Ok(())
    }

    /// Upload `bytes` as a file attachment.
    pub async fn send_document(
        &self,
        chat_id: i64,
        filename: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<()> {
        let size = bytes.len();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/vnd.android.package-archive")?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);
        let request = self
            .http
            .post(format!("{}/sendDocument", self.endpoint))
            .multipart(form);
        self.call::<serde_json::Value>("sendDocument", request).await?;
        tracing::info!(chat_id, filename, bytes = size, "Sent document");
        Ok(())
    }
}
