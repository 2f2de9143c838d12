use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::convert::{Attachment, ParsedEmail};
use crate::defaults::SendDefaults;
use crate::error::SendError;
use crate::payload::{Payload, PayloadContext};
use crate::send::EmailBackend;
use crate::types::{DeliveryStatus, EmailMessage, RecipientStatus, RecipientType, SendAt};

/// A payload that keeps every attribute it is given, supporting all of them.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryPayload {
    #[serde(skip)]
    ctx: PayloadContext,
    pub from_email: Option<String>,
    pub to: Vec<ParsedEmail>,
    pub cc: Vec<ParsedEmail>,
    pub bcc: Vec<ParsedEmail>,
    pub reply_to: Vec<String>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub alternatives: Vec<(String, String)>,
    pub attachments: Vec<Attachment>,
    pub headers: BTreeMap<String, String>,
    pub metadata: Option<Map<String, Value>>,
    pub send_at: Option<SendAt>,
    pub tags: Option<Vec<String>>,
    pub track_clicks: Option<bool>,
    pub track_opens: Option<bool>,
    pub template_id: Option<String>,
    pub merge_data: Option<BTreeMap<String, Map<String, Value>>>,
    pub merge_global_data: Option<Map<String, Value>>,
    pub esp_extra: Option<Map<String, Value>>,
}

impl MemoryPayload {
    /// Every to, cc and bcc addr-spec.
    pub fn recipient_emails(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|email| email.email.as_str())
    }
}

impl Payload for MemoryPayload {
    fn init(_: &EmailMessage, _: &SendDefaults, ctx: PayloadContext) -> Result<Self, SendError> {
        Ok(Self {
            ctx,
            from_email: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: Vec::new(),
            subject: None,
            text_body: None,
            html_body: None,
            alternatives: Vec::new(),
            attachments: Vec::new(),
            headers: BTreeMap::new(),
            metadata: None,
            send_at: None,
            tags: None,
            track_clicks: None,
            track_opens: None,
            template_id: None,
            merge_data: None,
            merge_global_data: None,
            esp_extra: None,
        })
    }

    fn context(&self) -> &PayloadContext {
        &self.ctx
    }

    fn set_from_email(&mut self, email: ParsedEmail) -> Result<(), SendError> {
        self.from_email = Some(email.address());
        Ok(())
    }

    fn add_recipient(&mut self, recipient_type: RecipientType, email: ParsedEmail) -> Result<(), SendError> {
        match recipient_type {
            RecipientType::To => self.to.push(email),
            RecipientType::Cc => self.cc.push(email),
            RecipientType::Bcc => self.bcc.push(email),
        }
        Ok(())
    }

    fn set_subject(&mut self, subject: String) -> Result<(), SendError> {
        self.subject = Some(subject);
        Ok(())
    }

    fn set_reply_to(&mut self, emails: Vec<ParsedEmail>) -> Result<(), SendError> {
        self.reply_to = emails.iter().map(ParsedEmail::address).collect();
        Ok(())
    }

    fn set_extra_headers(&mut self, headers: BTreeMap<String, String>) -> Result<(), SendError> {
        self.headers = headers;
        Ok(())
    }

    fn set_text_body(&mut self, body: String) -> Result<(), SendError> {
        self.text_body = Some(body);
        Ok(())
    }

    fn set_html_body(&mut self, body: String) -> Result<(), SendError> {
        self.html_body = Some(body);
        Ok(())
    }

    fn add_alternative(&mut self, content: String, mimetype: &str) -> Result<(), SendError> {
        self.alternatives.push((content, mimetype.to_string()));
        Ok(())
    }

    fn add_attachment(&mut self, attachment: Attachment) -> Result<(), SendError> {
        self.attachments.push(attachment);
        Ok(())
    }

    fn set_metadata(&mut self, metadata: Map<String, Value>) -> Result<(), SendError> {
        self.metadata = Some(metadata);
        Ok(())
    }

    fn set_send_at(&mut self, send_at: SendAt) -> Result<(), SendError> {
        self.send_at = Some(send_at);
        Ok(())
    }

    fn set_tags(&mut self, tags: Vec<String>) -> Result<(), SendError> {
        self.tags = Some(tags);
        Ok(())
    }

    fn set_track_clicks(&mut self, track_clicks: bool) -> Result<(), SendError> {
        self.track_clicks = Some(track_clicks);
        Ok(())
    }

    fn set_track_opens(&mut self, track_opens: bool) -> Result<(), SendError> {
        self.track_opens = Some(track_opens);
        Ok(())
    }

    fn set_template_id(&mut self, template_id: String) -> Result<(), SendError> {
        self.template_id = Some(template_id);
        Ok(())
    }

    fn set_merge_data(&mut self, merge_data: BTreeMap<String, Map<String, Value>>) -> Result<(), SendError> {
        self.merge_data = Some(merge_data);
        Ok(())
    }

    fn set_merge_global_data(&mut self, merge_global_data: Map<String, Value>) -> Result<(), SendError> {
        self.merge_global_data = Some(merge_global_data);
        Ok(())
    }

    fn set_esp_extra(&mut self, extra: Map<String, Value>) -> Result<(), SendError> {
        self.esp_extra = Some(extra);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryResponse {
    pub message_id: String,
    pub recipients: BTreeMap<String, DeliveryStatus>,
}

#[derive(Debug, Default)]
struct SessionState {
    connected: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Debug, Default)]
struct Script {
    statuses: BTreeMap<String, DeliveryStatus>,
    failing: BTreeSet<String>,
    unparsable: bool,
}

/// Backend that keeps sent payloads in memory instead of calling a provider.
///
/// Clones share the outbox and session counters, so a test can hand one
/// clone to a [`Mailer`](crate::Mailer) and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    outbox: Arc<Mutex<Vec<MemoryPayload>>>,
    session: Arc<SessionState>,
    script: Arc<std::sync::RwLock<Script>>,
    next_id: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `status` for `email` instead of `sent`.
    pub fn with_status(self, email: impl Into<String>, status: DeliveryStatus) -> Self {
        if let Ok(mut script) = self.script.write() {
            script.statuses.insert(email.into(), status);
        }
        self
    }

    /// Fails dispatch for any payload addressed to `email`.
    pub fn failing_for(self, email: impl Into<String>) -> Self {
        if let Ok(mut script) = self.script.write() {
            script.failing.insert(email.into());
        }
        self
    }

    /// Returns a response that the status parser rejects.
    pub fn with_unparsable_response(self) -> Self {
        if let Ok(mut script) = self.script.write() {
            script.unparsable = true;
        }
        self
    }

    /// Drains and returns every payload dispatched so far.
    pub async fn sent_payloads(&self) -> Vec<MemoryPayload> {
        let mut outbox = self.outbox.lock().await;
        std::mem::take(&mut *outbox)
    }

    pub fn sessions_opened(&self) -> usize {
        self.session.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.session.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailBackend for MemoryBackend {
    type Payload = MemoryPayload;
    type Response = MemoryResponse;

    fn esp_name(&self) -> &str {
        "Memory"
    }

    async fn acquire_session(&mut self) -> Result<bool, SendError> {
        if self.session.connected.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.session.opened.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release_session(&mut self) -> Result<(), SendError> {
        self.session.connected.store(false, Ordering::SeqCst);
        self.session.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn dispatch(&self, payload: &MemoryPayload, _message: &EmailMessage) -> Result<MemoryResponse, SendError> {
        let (recipients, unparsable) = {
            let script = self
                .script
                .read()
                .map_err(|_| SendError::api(self.esp_name(), "script lock poisoned"))?;
            if let Some(email) = payload.recipient_emails().find(|e| script.failing.contains(*e)) {
                return Err(SendError::api(
                    self.esp_name(),
                    format!("simulated failure for {}", email),
                ));
            }
            let recipients: BTreeMap<String, DeliveryStatus> = payload
                .recipient_emails()
                .map(|email| {
                    let status = script.statuses.get(email).copied().unwrap_or(DeliveryStatus::Sent);
                    (email.to_string(), status)
                })
                .collect();
            (recipients, script.unparsable)
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.outbox.lock().await.push(payload.clone());
        tracing::info!(subject = ?payload.subject, recipients = recipients.len(), "Message stored in memory outbox");

        Ok(MemoryResponse {
            message_id: if unparsable { String::new() } else { format!("memory-{}", id) },
            recipients,
        })
    }

    fn parse_recipient_status(
        &self,
        response: &MemoryResponse,
        _payload: &MemoryPayload,
        _message: &EmailMessage,
    ) -> Result<BTreeMap<String, RecipientStatus>, SendError> {
        if response.message_id.is_empty() {
            return Err(SendError::parse(self.esp_name(), "response has no message id"));
        }
        Ok(response
            .recipients
            .iter()
            .map(|(email, status)| {
                (
                    email.clone(),
                    RecipientStatus::new(*status, Some(response.message_id.clone())),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::{Mailer, SessionOptions};

    #[tokio::test]
    async fn test_memory_backend_records_payload() {
        let backend = MemoryBackend::new();
        let mut mailer = Mailer::new(backend.clone(), SessionOptions::default());
        let mut messages = vec![
            EmailMessage::new("to@example.com", "from@example.com", "Hello")
                .with_text("Body")
                .with_tag("welcome"),
        ];

        let sent = mailer.send_messages(&mut messages).await.unwrap();
        assert_eq!(sent, 1);

        let payloads = backend.sent_payloads().await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].subject.as_deref(), Some("Hello"));
        assert_eq!(payloads[0].tags, Some(vec!["welcome".to_string()]));

        let status = messages[0].status().unwrap();
        assert_eq!(status.message_id.as_deref(), Some("memory-0"));
        assert!(status.status.contains(&DeliveryStatus::Sent));
    }

    #[tokio::test]
    async fn test_memory_backend_reuses_open_session() {
        let mut backend = MemoryBackend::new();
        assert!(backend.acquire_session().await.unwrap());
        assert!(!backend.acquire_session().await.unwrap());
        backend.release_session().await.unwrap();
        assert_eq!(backend.sessions_opened(), 1);
        assert_eq!(backend.sessions_closed(), 1);
        assert!(!backend.is_connected());
    }
}
