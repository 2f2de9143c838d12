//! Per-message send lifecycle and the batch loop around it.

use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::convert::ConvertContext;
use crate::defaults::SendDefaults;
use crate::error::{EmailError, SendError};
use crate::payload::{Payload, PayloadBuilder, PayloadContext};
use crate::signals::SendSignals;
use crate::types::{EmailMessage, RecipientStatus, SendStatus};

/// The transport side of a provider.
#[async_trait]
pub trait EmailBackend: Send + Sync {
    type Payload: Payload;
    type Response: Serialize + fmt::Debug + Send + Sync;

    fn esp_name(&self) -> &str;

    /// Opens a reusable connection. Returns `true` only if this call created
    /// it, in which case the caller must later call `release_session`.
    async fn acquire_session(&mut self) -> Result<bool, SendError> {
        Ok(false)
    }

    async fn release_session(&mut self) -> Result<(), SendError> {
        Ok(())
    }

    async fn dispatch(
        &self,
        payload: &Self::Payload,
        message: &EmailMessage,
    ) -> Result<Self::Response, SendError>;

    /// Maps every recipient in the response to its delivery status.
    fn parse_recipient_status(
        &self,
        response: &Self::Response,
        payload: &Self::Payload,
        message: &EmailMessage,
    ) -> Result<BTreeMap<String, RecipientStatus>, SendError>;
}

/// Session-wide sending behavior.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub ignore_unsupported_features: bool,
    pub ignore_recipient_status: bool,
    pub fail_silently: bool,
    pub default_charset: String,
    pub time_zone: FixedOffset,
    /// Defaults already layered for this session's provider.
    pub send_defaults: SendDefaults,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ignore_unsupported_features: false,
            ignore_recipient_status: false,
            fail_silently: false,
            default_charset: "utf-8".to_string(),
            time_zone: Utc.fix(),
            send_defaults: SendDefaults::default(),
        }
    }
}

/// Object-safe face of a [`Mailer`], for callers that pick the provider at
/// runtime.
#[async_trait]
pub trait MailSender: Send + Sync {
    fn esp_name(&self) -> &str;

    fn signals_mut(&mut self) -> &mut SendSignals;

    async fn send_messages(&mut self, messages: &mut [EmailMessage]) -> Result<usize, EmailError>;
}

pub type DynMailSender = Box<dyn MailSender>;

pub struct Mailer<B: EmailBackend> {
    backend: B,
    options: SessionOptions,
    builder: PayloadBuilder<B::Payload>,
    signals: SendSignals,
}

impl<B: EmailBackend> Mailer<B> {
    pub fn new(backend: B, options: SessionOptions) -> Self {
        Self {
            backend,
            options,
            builder: PayloadBuilder::new(),
            signals: SendSignals::new(),
        }
    }

    pub fn with_signals(mut self, signals: SendSignals) -> Self {
        self.signals = signals;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn signals_mut(&mut self) -> &mut SendSignals {
        &mut self.signals
    }

    /// Sends each message in order and returns how many were sent.
    ///
    /// The provider session is opened once for the whole batch and released
    /// afterwards if this call opened it, whether or not a send failed. An
    /// error that isn't swallowed by fail-silent mode ends the batch, and the
    /// count of messages already sent is lost with it; their statuses stay
    /// attached to the messages.
    pub async fn send_messages(&mut self, messages: &mut [EmailMessage]) -> Result<usize, EmailError> {
        if messages.is_empty() {
            return Ok(0);
        }

        let created_session = match self.backend.acquire_session().await {
            Ok(created) => created,
            Err(err) if self.options.fail_silently => {
                warn!("Could not open {} session: {}", self.backend.esp_name(), err);
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };

        let result = self.send_each(messages).await;

        if created_session {
            if let Err(err) = self.backend.release_session().await {
                warn!("Could not close {} session: {}", self.backend.esp_name(), err);
                if result.is_ok() && !self.options.fail_silently {
                    return Err(err.into());
                }
            }
        }

        if let Ok(num_sent) = &result {
            info!(
                "{}: sent {} of {} message(s)",
                self.backend.esp_name(),
                num_sent,
                messages.len()
            );
        }
        result
    }

    async fn send_each(&self, messages: &mut [EmailMessage]) -> Result<usize, EmailError> {
        let mut num_sent = 0;
        for message in messages.iter_mut() {
            let sent = match self.send(message).await {
                Ok(sent) => sent,
                Err(err) if self.options.fail_silently && err.is_anticipated() => {
                    warn!("Suppressed send failure: {}", err);
                    false
                }
                Err(err) => return Err(err),
            };
            if sent {
                num_sent += 1;
            }
        }
        Ok(num_sent)
    }

    /// Sends one message. `Ok(false)` means it was skipped without error:
    /// cancelled by a hook, or addressed to nobody.
    ///
    /// A fresh [`SendStatus`] is attached to the message before anything
    /// else happens and filled in as the send progresses.
    pub async fn send(&self, message: &mut EmailMessage) -> Result<bool, EmailError> {
        let esp_name = self.backend.esp_name();
        message.status = Some(SendStatus::default());

        if !self.signals.run_pre_send(message, esp_name)? {
            return Ok(false);
        }

        if !message.has_recipients() {
            debug!("Message has no recipients; not sending");
            return Ok(false);
        }

        let convert_ctx = ConvertContext {
            encoding: message.encoding.clone(),
            default_charset: self.options.default_charset.clone(),
            time_zone: self.options.time_zone,
        };
        let payload = self.builder.build(
            message,
            &self.options.send_defaults,
            PayloadContext::new(esp_name, self.options.ignore_unsupported_features),
            &convert_ctx,
        )?;
        let payload_json = capture_json(&payload, "payload");
        status_mut(message).payload = payload_json.clone();

        let response = match self.backend.dispatch(&payload, message).await {
            Ok(response) => response,
            Err(err) => {
                error!("Failed to send email via {}: {}", esp_name, err);
                return Err(err.into());
            }
        };
        let response_json = capture_json(&response, "response");
        status_mut(message).esp_response = response_json.clone();

        let recipient_status = self
            .backend
            .parse_recipient_status(&response, &payload, message)?;
        status_mut(message).set_recipient_status(recipient_status);

        let status = status_mut(message).clone();
        self.signals.run_post_send(message, &status, esp_name)?;

        if !self.options.ignore_recipient_status && status.all_refused() {
            return Err(SendError::RecipientsRefused {
                esp_name: esp_name.to_string(),
                response: response_json,
                payload: payload_json,
            }
            .into());
        }

        debug!(
            "Sent via {}: message_id={:?} status={:?}",
            esp_name, status.message_id, status.status
        );
        Ok(true)
    }
}

fn status_mut(message: &mut EmailMessage) -> &mut SendStatus {
    message.status.get_or_insert_with(SendStatus::default)
}

/// JSON copy of `value` for diagnostics, or `None` if it can't be represented.
fn capture_json<T: Serialize>(value: &T, what: &str) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Could not capture {} as JSON: {}", what, e);
            None
        }
    }
}

#[async_trait]
impl<B: EmailBackend> MailSender for Mailer<B> {
    fn esp_name(&self) -> &str {
        self.backend.esp_name()
    }

    fn signals_mut(&mut self) -> &mut SendSignals {
        &mut self.signals
    }

    async fn send_messages(&mut self, messages: &mut [EmailMessage]) -> Result<usize, EmailError> {
        Mailer::send_messages(self, messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::MemoryPayload;
    use crate::types::{DeliveryStatus, RecipientStatus};

    /// Answers with a response that has no JSON form.
    struct OpaqueBackend;

    #[derive(Debug, Serialize)]
    struct OpaqueResponse {
        by_pair: BTreeMap<(u8, u8), String>,
    }

    #[async_trait]
    impl EmailBackend for OpaqueBackend {
        type Payload = MemoryPayload;
        type Response = OpaqueResponse;

        fn esp_name(&self) -> &str {
            "Opaque"
        }

        async fn dispatch(&self, _: &MemoryPayload, _: &EmailMessage) -> Result<OpaqueResponse, SendError> {
            Ok(OpaqueResponse {
                by_pair: BTreeMap::from([((1, 2), "queued".to_string())]),
            })
        }

        fn parse_recipient_status(
            &self,
            _: &OpaqueResponse,
            payload: &MemoryPayload,
            _: &EmailMessage,
        ) -> Result<BTreeMap<String, RecipientStatus>, SendError> {
            Ok(payload
                .recipient_emails()
                .map(|email| (email.to_string(), RecipientStatus::new(DeliveryStatus::Queued, None)))
                .collect())
        }
    }

    #[test]
    fn test_capture_json() {
        assert_eq!(capture_json(&vec![1, 2], "list"), Some(serde_json::json!([1, 2])));

        let non_string_keys = BTreeMap::from([((1, 2), 3)]);
        assert_eq!(capture_json(&non_string_keys, "map"), None);
    }

    #[tokio::test]
    async fn test_send_survives_response_without_json_form() {
        let mailer = Mailer::new(OpaqueBackend, SessionOptions::default());
        let mut message = EmailMessage::new("to@example.com", "from@example.com", "Hi").with_text("Body");

        assert!(mailer.send(&mut message).await.unwrap());
        let status = message.status().unwrap();
        assert!(status.payload.is_some());
        assert!(status.esp_response.is_none());
        assert!(status.status.contains(&DeliveryStatus::Queued));
    }
}
