//! Telegram channel — long-polls the Bot API for updates.
//!
//! Conversations are keyed by chat id. Text, `/start` and `/restart`,
//! photos and documents are forwarded; everything else is dropped.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::channels::{
    Attachment, AttachmentKind, Channel, InboundEvent, InboundKind, MessageStream,
    OutgoingContent, OutgoingMessage,
};
use crate::documents::{AttachmentFetcher, FetchedFile};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: String,
    allowed_users: Vec<String>,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_users,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{file_path}",
            self.bot_token
        )
    }

    /// Check if a username is in the allowed list.
    pub fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == username)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);

        for chunk in &chunks {
            self.send_message_chunk(chat_id, chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(send_failed(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            )));
        }

        Ok(())
    }

    /// Send a document from bytes (in-memory).
    pub async fn send_document_bytes(
        &self,
        chat_id: &str,
        file_bytes: Vec<u8>,
        file_name: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let part = Part::bytes(file_bytes).file_name(file_name.to_string());

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);

        if let Some(cap) = caption {
            form = form.text("caption", cap.to_string());
        }

        let resp = self
            .client
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(send_failed(format!("sendDocument failed: {err}")));
        }

        tracing::info!(chat_id, file_name, "Telegram document sent");
        Ok(())
    }

    /// Resolve a file id to its download path via `getFile`.
    async fn get_file_path(&self, file_id: &str) -> Result<String, ChannelError> {
        let download_failed = |reason: String| ChannelError::DownloadFailed {
            file_id: file_id.to_string(),
            reason,
        };

        let resp = self
            .client
            .post(self.api_url("getFile"))
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        data.pointer("/result/file_path")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| download_failed(format!("getFile returned {status} without file_path")))
    }
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let allowed_users = self.allowed_users.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(event) = parse_update(update, &allowed_users) else {
                        continue;
                    };

                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
        match message.content {
            OutgoingContent::Text(text) => self.send_message(&message.user_id, &text).await,
            OutgoingContent::Document {
                file_name,
                bytes,
                caption,
            } => {
                self.send_document_bytes(&message.user_id, bytes, &file_name, caption.as_deref())
                    .await
            }
        }
    }

    async fn send_typing(&self, user_id: &str) -> Result<(), ChannelError> {
        self.client
            .post(self.api_url("sendChatAction"))
            .json(&serde_json::json!({
                "chat_id": user_id,
                "action": "typing"
            }))
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }
}

#[async_trait]
impl AttachmentFetcher for TelegramChannel {
    async fn fetch(&self, attachment: &Attachment) -> Result<FetchedFile, ChannelError> {
        let file_path = self.get_file_path(&attachment.file_id).await?;
        let download_failed = |reason: String| ChannelError::DownloadFailed {
            file_id: attachment.file_id.clone(),
            reason,
        };

        let resp = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(download_failed(format!("download returned {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| download_failed(e.to_string()))?
            .to_vec();

        let file_name = attachment.file_name.clone().unwrap_or_else(|| {
            file_path
                .rsplit('/')
                .next()
                .unwrap_or("document")
                .to_string()
        });
        let mime_type = attachment
            .mime_type
            .clone()
            .or_else(|| guess_mime(&file_name).map(String::from));

        tracing::debug!(file_id = %attachment.file_id, bytes = bytes.len(), "Attachment downloaded");
        Ok(FetchedFile {
            bytes,
            file_name,
            mime_type,
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason,
    }
}

/// Turn one `getUpdates` entry into an inbound event.
///
/// Returns `None` for unauthorized senders and unsupported message kinds.
fn parse_update(update: &Value, allowed_users: &[String]) -> Option<InboundEvent> {
    let update_id = update.get("update_id").and_then(Value::as_i64)?;
    let message = update.get("message")?;
    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let chat_id = message.pointer("/chat/id").and_then(Value::as_i64)?;

    let username = message
        .pointer("/from/username")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let from_id = message
        .pointer("/from/id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string());

    let mut identities = vec![username];
    if let Some(ref id) = from_id {
        identities.push(id.as_str());
    }
    if !check_user_allowed(allowed_users, identities.iter().copied()) {
        tracing::warn!(
            username,
            user_id = from_id.as_deref().unwrap_or("unknown"),
            "Telegram: ignoring message from unauthorized user"
        );
        return None;
    }

    let id = update_id.to_string();
    let user_id = chat_id.to_string();

    if let Some(photos) = message.get("photo").and_then(Value::as_array) {
        // Sizes are listed smallest first.
        let largest = photos.last()?;
        let file_id = largest.get("file_id").and_then(Value::as_str)?;
        let attachment = Attachment {
            file_id: file_id.to_string(),
            kind: AttachmentKind::Photo,
            message_id,
            file_name: None,
            mime_type: Some("image/jpeg".to_string()),
        };
        return Some(InboundEvent::new(id, user_id, InboundKind::Attachment(attachment)));
    }

    if let Some(document) = message.get("document") {
        let file_id = document.get("file_id").and_then(Value::as_str)?;
        let attachment = Attachment {
            file_id: file_id.to_string(),
            kind: AttachmentKind::Document,
            message_id,
            file_name: document
                .get("file_name")
                .and_then(Value::as_str)
                .map(String::from),
            mime_type: document
                .get("mime_type")
                .and_then(Value::as_str)
                .map(String::from),
        };
        return Some(InboundEvent::new(id, user_id, InboundKind::Attachment(attachment)));
    }

    let text = message.get("text").and_then(Value::as_str)?;
    Some(InboundEvent::text(id, user_id, text))
}

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

fn guess_mime(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        "tif" | "tiff" => Some("image/tiff"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(cut);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { cut } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::channels::Command;

    fn everyone() -> Vec<String> {
        vec!["*".into()]
    }

    // ── Basic channel tests ─────────────────────────────────────────

    #[test]
    fn telegram_channel_name() {
        let ch = TelegramChannel::new("fake-token".into(), vec!["*".into()]);
        assert_eq!(ch.name(), "telegram");
    }

    #[test]
    fn telegram_api_urls() {
        let ch = TelegramChannel::new("123:ABC".into(), vec![]);
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
        assert_eq!(
            ch.file_url("photos/file_1.jpg"),
            "https://api.telegram.org/file/bot123:ABC/photos/file_1.jpg"
        );
    }

    // ── User allowlist tests ────────────────────────────────────────

    #[test]
    fn telegram_user_allowed_wildcard() {
        let ch = TelegramChannel::new("t".into(), vec!["*".into()]);
        assert!(ch.is_user_allowed("anyone"));
    }

    #[test]
    fn telegram_user_allowed_specific() {
        let ch = TelegramChannel::new("t".into(), vec!["alice".into(), "bob".into()]);
        assert!(ch.is_user_allowed("alice"));
        assert!(!ch.is_user_allowed("eve"));
    }

    #[test]
    fn telegram_user_exact_match_not_substring() {
        let ch = TelegramChannel::new("t".into(), vec!["alice".into()]);
        assert!(!ch.is_user_allowed("alice_bot"));
        assert!(!ch.is_user_allowed("malice"));
    }

    #[test]
    fn telegram_user_allowed_by_numeric_id_identity() {
        assert!(check_user_allowed(
            &["123456789".to_string()],
            ["unknown", "123456789"]
        ));
        assert!(!check_user_allowed(
            &["alice".to_string()],
            ["unknown", "123456789"]
        ));
    }

    // ── Update parsing ──────────────────────────────────────────────

    #[test]
    fn parses_text_message_keyed_by_chat() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "from": {"id": 7, "username": "alice"},
                "chat": {"id": 99},
                "text": "I want insurance"
            }
        });
        let event = parse_update(&update, &everyone()).unwrap();
        assert_eq!(event.id, "10");
        assert_eq!(event.user_id, "99");
        assert_eq!(event.kind, InboundKind::Text("I want insurance".into()));
    }

    #[test]
    fn parses_restart_command() {
        let update = json!({
            "update_id": 11,
            "message": {"message_id": 6, "from": {"id": 7}, "chat": {"id": 99}, "text": "/restart"}
        });
        let event = parse_update(&update, &everyone()).unwrap();
        assert_eq!(event.kind, InboundKind::Command(Command::Restart));
    }

    #[test]
    fn photo_uses_largest_size() {
        let update = json!({
            "update_id": 12,
            "message": {
                "message_id": 8,
                "from": {"id": 7},
                "chat": {"id": 99},
                "media_group_id": "g1",
                "photo": [
                    {"file_id": "small", "width": 90},
                    {"file_id": "large", "width": 1280}
                ]
            }
        });
        let event = parse_update(&update, &everyone()).unwrap();
        match event.kind {
            InboundKind::Attachment(a) => {
                assert_eq!(a.file_id, "large");
                assert_eq!(a.kind, AttachmentKind::Photo);
                assert_eq!(a.message_id, 8);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn document_keeps_name_and_mime() {
        let update = json!({
            "update_id": 13,
            "message": {
                "message_id": 9,
                "from": {"id": 7},
                "chat": {"id": 99},
                "document": {"file_id": "doc1", "file_name": "passport.pdf", "mime_type": "application/pdf"}
            }
        });
        let event = parse_update(&update, &everyone()).unwrap();
        let InboundKind::Attachment(a) = event.kind else {
            panic!("expected attachment");
        };
        assert_eq!(a.kind, AttachmentKind::Document);
        assert_eq!(a.file_name.as_deref(), Some("passport.pdf"));
        assert_eq!(a.mime_type.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn unauthorized_and_unsupported_updates_are_dropped() {
        let update = json!({
            "update_id": 14,
            "message": {"message_id": 1, "from": {"id": 7, "username": "eve"}, "chat": {"id": 7}, "text": "hi"}
        });
        assert!(parse_update(&update, &["alice".to_string()]).is_none());

        let sticker = json!({
            "update_id": 15,
            "message": {"message_id": 2, "from": {"id": 7}, "chat": {"id": 7}, "sticker": {"file_id": "s"}}
        });
        assert!(parse_update(&sticker, &everyone()).is_none());

        let edited = json!({"update_id": 16, "edited_message": {}});
        assert!(parse_update(&edited, &everyone()).is_none());
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime("scan.PDF"), Some("application/pdf"));
        assert_eq!(guess_mime("file_3.jpg"), Some("image/jpeg"));
        assert_eq!(guess_mime("noext"), None);
    }

    // ── Network error tests (expected to fail with no server) ───────

    #[tokio::test]
    async fn telegram_send_document_bytes_fails_with_fake_token() {
        let ch = TelegramChannel::new("fake-token".into(), vec!["*".into()]);
        let result = ch
            .send_document_bytes("123456", b"policy".to_vec(), "policy.txt", Some("Policy"))
            .await;
        assert!(matches!(result, Err(ChannelError::SendFailed { .. })));
    }

    // ── Message splitting tests ─────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(3000);
        let chunks = split_message(&msg, 4096);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), msg);
    }
}
