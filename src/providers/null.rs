use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::error::SendError;
use crate::providers::memory::MemoryPayload;
use crate::send::EmailBackend;
use crate::types::{DeliveryStatus, EmailMessage, RecipientStatus};

/// Logs messages instead of sending them. Every recipient is reported `sent`.
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct NullResponse {
    pub recipients: Vec<String>,
}

#[async_trait]
impl EmailBackend for NullBackend {
    type Payload = MemoryPayload;
    type Response = NullResponse;

    fn esp_name(&self) -> &str {
        "Null"
    }

    async fn dispatch(&self, payload: &MemoryPayload, _message: &EmailMessage) -> Result<NullResponse, SendError> {
        let recipients: Vec<String> = payload.recipient_emails().map(str::to_string).collect();

        let body_preview = payload
            .text_body
            .as_deref()
            .or(payload.html_body.as_deref())
            .unwrap_or("")
            .chars()
            .take(200)
            .collect::<String>();

        // Log the email that would have been sent
        info!(
            "NULL EMAIL BACKEND - Would send email:\n\
             From: {}\n\
             To: {}\n\
             Reply-To: {}\n\
             Subject: {}\n\
             Body (first 200 chars): {}{}",
            payload.from_email.as_deref().unwrap_or("(none)"),
            recipients.join(", "),
            if payload.reply_to.is_empty() {
                "(none)".to_string()
            } else {
                payload.reply_to.join(", ")
            },
            payload.subject.as_deref().unwrap_or(""),
            body_preview,
            if body_preview.chars().count() >= 200 { "..." } else { "" }
        );

        tracing::debug!(
            "NULL EMAIL BACKEND - Full payload:\n{}",
            serde_json::to_string_pretty(payload).unwrap_or_else(|e| e.to_string())
        );

        Ok(NullResponse { recipients })
    }

    fn parse_recipient_status(
        &self,
        response: &NullResponse,
        _payload: &MemoryPayload,
        _message: &EmailMessage,
    ) -> Result<BTreeMap<String, RecipientStatus>, SendError> {
        Ok(response
            .recipients
            .iter()
            .map(|email| (email.clone(), RecipientStatus::new(DeliveryStatus::Sent, None)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::{Mailer, SessionOptions};

    #[tokio::test]
    async fn test_null_backend_send() {
        let mut mailer = Mailer::new(NullBackend::new(), SessionOptions::default());
        let mut messages = vec![
            EmailMessage::new("test@example.com", "sender@example.com", "Test Subject")
                .with_text("Test body content")
                .with_reply_to("reply@example.com"),
        ];

        // Should always succeed
        let result = mailer.send_messages(&mut messages).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_null_backend_send_html() {
        let mut mailer = Mailer::new(NullBackend::new(), SessionOptions::default());
        let mut messages = vec![
            EmailMessage::new("test1@example.com", "sender@example.com", "HTML Test")
                .with_to("test2@example.com")
                .with_html("<h1>Test HTML</h1>"),
        ];

        let result = mailer.send_messages(&mut messages).await;
        assert_eq!(result.unwrap(), 1);

        let status = messages[0].status().unwrap();
        assert_eq!(status.recipients.len(), 2);
        assert_eq!(status.message_id, None);
    }

    #[tokio::test]
    async fn test_null_backend_send_both() {
        let mut mailer = Mailer::new(NullBackend::new(), SessionOptions::default());
        let mut messages = vec![
            EmailMessage::new("test@example.com", "sender@example.com", "Multi-part Test")
                .with_both("Plain text version", "<p>HTML version</p>"),
        ];

        let result = mailer.send_messages(&mut messages).await;
        assert_eq!(result.unwrap(), 1);
        let payload = &messages[0].status().unwrap().payload;
        assert_eq!(
            payload.as_ref().and_then(|p| p["html_body"].as_str()),
            Some("<p>HTML version</p>")
        );
    }

    #[test]
    fn test_null_backend_name() {
        let backend = NullBackend::new();
        assert_eq!(backend.esp_name(), "Null");
    }
}
