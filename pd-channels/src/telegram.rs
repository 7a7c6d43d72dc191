use crate::source::{SizeLimitExceeded, stream_to_file};
use crate::traits::{ByteSource, ChannelAdapter};
use crate::types::{
    Attachment, Button, ControlSignal, FileMetadata, InboundEvent, InboundEventKind,
    OutboundMessage,
};
use anyhow::Result;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use chrono::Utc;
use reqwest::{StatusCode as HttpStatus, Url};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","callback_query"]"#;
const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const TELEGRAM_CAPTION_MAX_CHARS: usize = 1024;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

/// How updates reach the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramDelivery {
    Polling,
    Webhook { url: String, secret: Option<String> },
}

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    delivery: TelegramDelivery,
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<InboundEvent>>>>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, delivery: TelegramDelivery) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            delivery,
            inbound_tx: Arc::new(RwLock::new(None)),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{TELEGRAM_API_BASE}/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    fn webhook_secret(&self) -> Option<&str> {
        match &self.delivery {
            TelegramDelivery::Webhook { secret, .. } => secret.as_deref(),
            TelegramDelivery::Polling => None,
        }
    }

    /// Router that accepts webhook updates at `path`.
    pub fn webhook_router(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, post(telegram_webhook))
            .with_state(self)
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        read_api_response(method, resp).await
    }

    async fn register_webhook(&self, url: &str, secret: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({
            "url": url,
            "drop_pending_updates": true,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(secret) = secret {
            body["secret_token"] = serde_json::Value::String(secret.to_string());
        }
        self.call("setWebhook", body).await?;
        tracing::info!(webhook_url = %url, "telegram webhook registered");
        Ok(())
    }

    async fn send_text(&self, recipient_id: &str, message: &OutboundMessage) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": recipient_id,
            "text": message.content,
        });
        if let Some(markup) = reply_markup(&message.keyboard) {
            body["reply_markup"] = markup;
        }
        if let Some(reply_to) = &message.reply_to_message_id {
            if let Ok(id) = reply_to.parse::<i64>() {
                body["reply_to_message_id"] = serde_json::json!(id);
            }
        }
        self.call("sendMessage", body).await?;
        Ok(())
    }

    async fn send_document(
        &self,
        recipient_id: &str,
        attachment: &Attachment,
        caption: &str,
        keyboard: &[Vec<Button>],
    ) -> Result<()> {
        let bytes = tokio::fs::read(&attachment.path)
            .await
            .map_err(|e| anyhow::anyhow!("read attachment {}: {e}", attachment.path.display()))?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(attachment.name.clone())
            .mime_str(&attachment.content_type)?;
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", recipient_id.to_string())
            .part("document", part);
        if !caption.is_empty() {
            form = form.text("caption", truncate_chars(caption, TELEGRAM_CAPTION_MAX_CHARS));
        }
        if let Some(markup) = reply_markup(keyboard) {
            form = form.text("reply_markup", markup.to_string());
        }
        let url = self.api_url("sendDocument")?;
        let resp = self.http.post(url).multipart(form).send().await?;
        read_api_response("sendDocument", resp).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) {
        let result = self
            .call(
                "answerCallbackQuery",
                serde_json::json!({ "callback_query_id": callback_id }),
            )
            .await;
        if let Err(error) = result {
            tracing::debug!(%error, "telegram answerCallbackQuery failed");
        }
    }

    async fn ingest_update(
        &self,
        update: &TelegramUpdate,
        tx: &mpsc::Sender<InboundEvent>,
    ) -> Result<()> {
        if let Some(callback) = &update.callback_query {
            self.answer_callback(&callback.id).await;
        }
        for event in self.build_events(update) {
            tx.send(event)
                .await
                .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
        }
        Ok(())
    }

    fn build_events(&self, update: &TelegramUpdate) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        if let Some(event) = update
            .message
            .as_ref()
            .and_then(|message| self.build_message_event(update.update_id, message))
        {
            events.push(event);
        }
        if let Some(event) = update
            .callback_query
            .as_ref()
            .and_then(|callback| build_callback_event(update.update_id, callback))
        {
            events.push(event);
        }
        events
    }

    fn build_message_event(
        &self,
        update_id: i64,
        message: &TelegramMessage,
    ) -> Option<InboundEvent> {
        let chat = message.chat.as_ref()?;
        let kind = if let Some(document) = &message.document {
            self.file_event(
                &document.file_id,
                FileMetadata {
                    file_name: document
                        .file_name
                        .clone()
                        .unwrap_or_else(|| "document".to_string()),
                    mime_type: document.mime_type.clone(),
                    size: document.file_size,
                },
            )
        } else if let Some(photo) = message.photo.iter().max_by_key(|p| p.width * p.height) {
            self.file_event(
                &photo.file_id,
                FileMetadata {
                    file_name: "photo.jpg".to_string(),
                    mime_type: Some("image/jpeg".to_string()),
                    size: photo.file_size,
                },
            )
        } else {
            let text = message.text.as_deref().map(str::trim)?;
            if text.is_empty() {
                return None;
            }
            InboundEventKind::TextReceived(text.to_string())
        };

        Some(InboundEvent {
            message_id: message
                .message_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| format!("update:{update_id}:message"))
                .into(),
            channel_id: TELEGRAM_CHANNEL_ID.into(),
            chat_id: chat.id.to_string().into(),
            kind,
            received_at: Utc::now(),
        })
    }

    fn file_event(&self, file_id: &str, metadata: FileMetadata) -> InboundEventKind {
        InboundEventKind::FileReceived {
            metadata,
            source: Arc::new(TelegramFileSource {
                http: self.http.clone(),
                bot_token: self.bot_token.clone(),
                file_id: file_id.to_string(),
            }),
        }
    }
}

fn build_callback_event(update_id: i64, callback: &TelegramCallbackQuery) -> Option<InboundEvent> {
    let data = callback.data.as_deref()?;
    let chat_id = callback
        .message
        .as_ref()
        .and_then(|message| message.chat.as_ref())
        .map(|chat| chat.id)
        .unwrap_or(callback.from.id);
    Some(InboundEvent {
        message_id: format!("callback:{update_id}").into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        chat_id: chat_id.to_string().into(),
        kind: InboundEventKind::Control(ControlSignal::from_callback_data(data)),
        received_at: Utc::now(),
    })
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        match &self.delivery {
            TelegramDelivery::Webhook { url, secret } => {
                *self.inbound_tx.write().await = Some(tx);
                self.register_webhook(url, secret.as_deref()).await?;
            }
            TelegramDelivery::Polling => {
                // getUpdates is rejected while a webhook is registered.
                self.call(
                    "deleteWebhook",
                    serde_json::json!({ "drop_pending_updates": false }),
                )
                .await?;
                let adapter = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = adapter.run_poll_loop(tx).await {
                        tracing::error!(%e, "telegram poll loop exited");
                    }
                });
            }
        }
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        if message.attachments.is_empty() {
            return self.send_text(recipient_id, &message).await;
        }
        let last = message.attachments.len() - 1;
        for (index, attachment) in message.attachments.iter().enumerate() {
            // Caption and keyboard ride on the last document only.
            let (caption, keyboard) = if index == last {
                (message.content.as_str(), message.keyboard.as_slice())
            } else {
                ("", &[][..])
            };
            self.send_document(recipient_id, attachment, caption, keyboard)
                .await?;
        }
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);
                self.ingest_update(&update, &tx).await?;
            }
        }
    }
}

async fn telegram_webhook(
    State(adapter): State<Arc<TelegramAdapter>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = adapter.webhook_secret() {
        let provided = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !constant_time_eq(secret, provided) {
            tracing::warn!("telegram webhook rejected: secret token mismatch");
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "detail": "bad secret" })),
            )
                .into_response();
        }
    }

    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "detail": format!("invalid telegram update: {error}"),
                })),
            )
                .into_response();
        }
    };

    let Some(tx) = adapter.inbound_tx.read().await.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "detail": "telegram adapter not started" })),
        )
            .into_response();
    };
    if let Err(error) = adapter.ingest_update(&update, &tx).await {
        tracing::warn!(%error, "telegram webhook ingest failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "detail": error.to_string() })),
        )
            .into_response();
    }
    StatusCode::OK.into_response()
}

/// Document content behind a Telegram `file_id`, resolved through `getFile`.
#[derive(Clone)]
pub struct TelegramFileSource {
    http: reqwest::Client,
    bot_token: String,
    file_id: String,
}

impl fmt::Debug for TelegramFileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramFileSource")
            .field("file_id", &self.file_id)
            .finish()
    }
}

#[async_trait::async_trait]
impl ByteSource for TelegramFileSource {
    #[tracing::instrument(level = "debug", skip_all, fields(file_id = %self.file_id))]
    async fn fetch_to(&self, dest: &Path, max_bytes: u64) -> Result<u64> {
        let url = Url::parse(&format!("{TELEGRAM_API_BASE}/bot{}/getFile", self.bot_token))?;
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "file_id": self.file_id }))
            .send()
            .await?;
        let result = read_api_response("getFile", resp).await?;
        let file: TelegramFile = serde_json::from_value(result)?;
        if let Some(size) = file.file_size {
            if size > max_bytes {
                return Err(SizeLimitExceeded {
                    limit: max_bytes,
                    received: size,
                }
                .into());
            }
        }
        let file_path = file
            .file_path
            .ok_or_else(|| anyhow::anyhow!("telegram getFile returned no file_path"))?;
        let url = Url::parse(&format!(
            "{TELEGRAM_API_BASE}/file/bot{}/{}",
            self.bot_token, file_path
        ))?;
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "telegram file download failed: status={}",
                resp.status()
            ));
        }
        stream_to_file(resp.bytes_stream(), dest, max_bytes).await
    }
}

async fn read_api_response(method: &str, resp: reqwest::Response) -> Result<serde_json::Value> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(anyhow::anyhow!(
            "telegram {method} failed: status={status} body={text}"
        ));
    }
    let envelope: TelegramEnvelope = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("telegram {method} returned invalid json: {e}"))?;
    if !envelope.ok {
        return Err(anyhow::anyhow!(
            "telegram {method} failed: {}",
            envelope.description.unwrap_or_default()
        ));
    }
    Ok(envelope.result)
}

fn reply_markup(keyboard: &[Vec<Button>]) -> Option<serde_json::Value> {
    if keyboard.is_empty() {
        return None;
    }
    let rows: Vec<Vec<serde_json::Value>> = keyboard
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| {
                    serde_json::json!({
                        "text": button.label,
                        "callback_data": button.callback_data,
                    })
                })
                .collect()
        })
        .collect();
    Some(serde_json::json!({ "inline_keyboard": rows }))
}

fn truncate_chars(raw: &str, max: usize) -> String {
    raw.chars().take(max).collect()
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let mut diff = left_bytes.len() ^ right_bytes.len();
    let max_len = left_bytes.len().max(right_bytes.len());
    for index in 0..max_len {
        let l = left_bytes.get(index).copied().unwrap_or(0);
        let r = right_bytes.get(index).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: HttpStatus) -> bool {
    status == HttpStatus::TOO_MANY_REQUESTS
        || status == HttpStatus::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    document: Option<TelegramDocument>,
    #[serde(default)]
    photo: Vec<TelegramPhotoSize>,
}

#[derive(Debug, Deserialize)]
struct TelegramDocument {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramPhotoSize {
    file_id: String,
    #[serde(default)]
    width: i64,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn adapter(delivery: TelegramDelivery) -> TelegramAdapter {
        TelegramAdapter::new("123:test", delivery).expect("adapter")
    }

    fn update(value: serde_json::Value) -> TelegramUpdate {
        serde_json::from_value(value).expect("update json")
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn document_message_becomes_file_event_with_metadata() {
        let events = adapter(TelegramDelivery::Polling).build_events(&update(serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 11,
                "chat": { "id": 42 },
                "document": {
                    "file_id": "abc",
                    "file_name": "report.pdf",
                    "mime_type": "application/pdf",
                    "file_size": 2048
                }
            }
        })));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].chat_id.as_str(), "42");
        assert_eq!(events[0].message_id.as_str(), "11");
        match &events[0].kind {
            InboundEventKind::FileReceived { metadata, .. } => {
                assert_eq!(metadata.file_name, "report.pdf");
                assert_eq!(metadata.mime_type.as_deref(), Some("application/pdf"));
                assert_eq!(metadata.size, Some(2048));
            }
            other => panic!("expected file event, got {other:?}"),
        }
    }

    #[test]
    fn photo_message_picks_largest_size() {
        let events = adapter(TelegramDelivery::Polling).build_events(&update(serde_json::json!({
            "update_id": 8,
            "message": {
                "message_id": 12,
                "chat": { "id": 42 },
                "photo": [
                    { "file_id": "small", "width": 90, "height": 90, "file_size": 10 },
                    { "file_id": "large", "width": 900, "height": 900, "file_size": 1000 }
                ]
            }
        })));
        match &events[0].kind {
            InboundEventKind::FileReceived { metadata, source } => {
                assert_eq!(metadata.size, Some(1000));
                assert!(format!("{source:?}").contains("large"));
            }
            other => panic!("expected file event, got {other:?}"),
        }
    }

    #[test]
    fn callback_query_becomes_control_signal_in_message_chat() {
        let events = adapter(TelegramDelivery::Polling).build_events(&update(serde_json::json!({
            "update_id": 9,
            "callback_query": {
                "id": "cb1",
                "from": { "id": 5 },
                "message": { "message_id": 3, "chat": { "id": 42 } },
                "data": "op:compress"
            }
        })));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].chat_id.as_str(), "42");
        match &events[0].kind {
            InboundEventKind::Control(signal) => {
                assert_eq!(signal, &ControlSignal::Select("compress".to_string()));
            }
            other => panic!("expected control event, got {other:?}"),
        }
    }

    #[test]
    fn empty_text_message_is_ignored() {
        let events = adapter(TelegramDelivery::Polling).build_events(&update(serde_json::json!({
            "update_id": 10,
            "message": { "message_id": 1, "chat": { "id": 1 }, "text": "   " }
        })));
        assert!(events.is_empty());
    }

    #[test]
    fn reply_markup_renders_inline_keyboard_rows() {
        let markup = reply_markup(&[vec![
            Button::new("Compress", &ControlSignal::Select("compress".to_string())),
            Button::new("Back", &ControlSignal::Back),
        ]])
        .expect("markup");
        assert_eq!(markup["inline_keyboard"][0][0]["callback_data"], "op:compress");
        assert_eq!(markup["inline_keyboard"][0][1]["text"], "Back");
        assert!(reply_markup(&[]).is_none());
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths_and_values() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("abc", "abx"));
    }

    #[tokio::test]
    async fn webhook_rejects_bad_secret_and_forwards_valid_updates() {
        let adapter = Arc::new(adapter(TelegramDelivery::Webhook {
            url: "https://example.invalid/tg/webhook".to_string(),
            secret: Some("s3cret".to_string()),
        }));
        let (tx, mut rx) = mpsc::channel(4);
        *adapter.inbound_tx.write().await = Some(tx);
        let router = adapter.clone().webhook_router("/tg/webhook");
        let body = serde_json::json!({
            "update_id": 1,
            "message": { "message_id": 2, "chat": { "id": 3 }, "text": "/start" }
        })
        .to_string();

        let rejected = router
            .clone()
            .oneshot(
                Request::post("/tg/webhook")
                    .header(TELEGRAM_SECRET_HEADER, "wrong")
                    .header("content-type", "application/json")
                    .body(Body::from(body.clone()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(rejected.status(), StatusCode::FORBIDDEN);
        assert!(rx.try_recv().is_err());

        let accepted = router
            .oneshot(
                Request::post("/tg/webhook")
                    .header(TELEGRAM_SECRET_HEADER, "s3cret")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(accepted.status(), StatusCode::OK);
        let event = rx.recv().await.expect("event");
        match event.kind {
            InboundEventKind::TextReceived(text) => assert_eq!(text, "/start"),
            other => panic!("expected text event, got {other:?}"),
        }
    }
}
