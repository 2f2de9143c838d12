use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sesv2::{
    Client,
    config::{Credentials, Region},
    types::{Body, Content, Destination, EmailContent, Message, MessageTag, Template},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error};

use crate::config::SesConfig;
use crate::convert::{Attachment, ParsedEmail};
use crate::defaults::SendDefaults;
use crate::error::SendError;
use crate::payload::{Payload, PayloadContext};
use crate::send::EmailBackend;
use crate::types::{DeliveryStatus, EmailMessage, RecipientStatus, RecipientType};

const ESP_NAME: &str = "Amazon SES";
const TAG_NAME: &str = "tag";

/// Arguments for a single SES v2 `SendEmail` call.
#[derive(Debug, Serialize)]
pub struct SesPayload {
    #[serde(skip)]
    ctx: PayloadContext,
    pub from_email: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    /// Metadata, sent as SES message tags.
    pub email_tags: Vec<(String, String)>,
    pub template_name: Option<String>,
    pub template_data: Option<Map<String, Value>>,
    pub configuration_set_name: Option<String>,
    pub feedback_forwarding_email_address: Option<String>,
}

impl SesPayload {
    fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    fn content(&self) -> Result<EmailContent, SendError> {
        if let Some(template_name) = &self.template_name {
            let template_data = self
                .template_data
                .as_ref()
                .map(|data| Value::Object(data.clone()).to_string());
            let template = Template::builder()
                .template_name(template_name)
                .set_template_data(template_data)
                .build();
            return Ok(EmailContent::builder().template(template).build());
        }

        let mut body = Body::builder();
        if let Some(text) = &self.text_body {
            body = body.text(utf8_content(text)?);
        }
        if let Some(html) = &self.html_body {
            body = body.html(utf8_content(html)?);
        }
        let subject = utf8_content(self.subject.as_deref().unwrap_or(""))?;
        let message = Message::builder().subject(subject).body(body.build()).build();

        Ok(EmailContent::builder().simple(message).build())
    }

    fn message_tags(&self) -> Result<Vec<MessageTag>, SendError> {
        self.email_tags
            .iter()
            .map(|(name, value)| {
                MessageTag::builder()
                    .name(name)
                    .value(value)
                    .build()
                    .map_err(|e| SendError::api(ESP_NAME, e.to_string()))
            })
            .collect()
    }
}

fn utf8_content(data: &str) -> Result<Content, SendError> {
    Content::builder()
        .data(data)
        .charset("UTF-8")
        .build()
        .map_err(|e| SendError::api(ESP_NAME, e.to_string()))
}

fn tag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Payload for SesPayload {
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
            email_tags: Vec::new(),
            template_name: None,
            template_data: None,
            configuration_set_name: None,
            feedback_forwarding_email_address: None,
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
        let address = email.address();
        match recipient_type {
            RecipientType::To => self.to.push(address),
            RecipientType::Cc => self.cc.push(address),
            RecipientType::Bcc => self.bcc.push(address),
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

    fn set_text_body(&mut self, body: String) -> Result<(), SendError> {
        self.text_body = Some(body);
        Ok(())
    }

    fn set_html_body(&mut self, body: String) -> Result<(), SendError> {
        self.html_body = Some(body);
        Ok(())
    }

    fn add_attachment(&mut self, _attachment: Attachment) -> Result<(), SendError> {
        self.unsupported_feature("attachments")
    }

    fn set_metadata(&mut self, metadata: Map<String, Value>) -> Result<(), SendError> {
        self.email_tags.extend(
            metadata
                .iter()
                .map(|(name, value)| (name.clone(), tag_value(value))),
        );
        Ok(())
    }

    /// SES allows one value per message tag name, so only a single tag fits.
    fn set_tags(&mut self, tags: Vec<String>) -> Result<(), SendError> {
        let mut tags = tags.into_iter();
        if let Some(tag) = tags.next() {
            self.email_tags.push((TAG_NAME.to_string(), tag));
        }
        if tags.next().is_some() {
            self.unsupported_feature("multiple tags")?;
        }
        Ok(())
    }

    fn set_template_id(&mut self, template_id: String) -> Result<(), SendError> {
        self.template_name = Some(template_id);
        Ok(())
    }

    fn set_merge_global_data(&mut self, merge_global_data: Map<String, Value>) -> Result<(), SendError> {
        self.template_data = Some(merge_global_data);
        Ok(())
    }

    fn set_esp_extra(&mut self, extra: Map<String, Value>) -> Result<(), SendError> {
        for (key, value) in extra {
            match (key.as_str(), value) {
                ("configuration_set_name", Value::String(name)) => {
                    self.configuration_set_name = Some(name)
                }
                ("feedback_forwarding_email_address", Value::String(address)) => {
                    self.feedback_forwarding_email_address = Some(address)
                }
                (key, _) => self.unsupported_feature(&format!("esp_extra '{}'", key))?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SesResponse {
    #[serde(rename = "MessageId")]
    pub message_id: Option<String>,
}

pub struct SesBackend {
    config: SesConfig,
    client: Option<Client>,
}

impl SesBackend {
    pub fn new(config: SesConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    async fn connect(config: &SesConfig) -> Client {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        // Set region if provided, otherwise use default from environment
        if let Some(region) = &config.region {
            aws_config_builder = aws_config_builder.region(Region::new(region.clone()));
        }

        // If credentials are provided, use them. Otherwise, use the default provider chain
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "espbridge-ses-backend",
            );
            aws_config_builder = aws_config_builder.credentials_provider(credentials);
        }

        let aws_config = aws_config_builder.load().await;
        Client::new(&aws_config)
    }
}

#[async_trait]
impl EmailBackend for SesBackend {
    type Payload = SesPayload;
    type Response = SesResponse;

    fn esp_name(&self) -> &str {
        ESP_NAME
    }

    async fn acquire_session(&mut self) -> Result<bool, SendError> {
        if self.client.is_some() {
            return Ok(false);
        }
        self.client = Some(Self::connect(&self.config).await);
        Ok(true)
    }

    async fn release_session(&mut self) -> Result<(), SendError> {
        self.client = None;
        Ok(())
    }

    async fn dispatch(&self, payload: &SesPayload, _message: &EmailMessage) -> Result<SesResponse, SendError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SendError::api(ESP_NAME, "no open session"))?;
        debug!("Sending email via SES to: {:?}", payload.to);

        let destination = Destination::builder()
            .set_to_addresses(Some(payload.to.clone()))
            .set_cc_addresses(Some(payload.cc.clone()))
            .set_bcc_addresses(Some(payload.bcc.clone()))
            .build();

        let mut send_email_builder = client
            .send_email()
            .set_from_email_address(payload.from_email.clone())
            .destination(destination)
            .content(payload.content()?)
            .set_configuration_set_name(payload.configuration_set_name.clone())
            .set_feedback_forwarding_email_address(payload.feedback_forwarding_email_address.clone());

        if !payload.reply_to.is_empty() {
            send_email_builder = send_email_builder.set_reply_to_addresses(Some(payload.reply_to.clone()));
        }
        if !payload.email_tags.is_empty() {
            send_email_builder = send_email_builder.set_email_tags(Some(payload.message_tags()?));
        }

        match send_email_builder.send().await {
            Ok(output) => {
                debug!(
                    "Email sent successfully. Message ID: {:?}",
                    output.message_id()
                );
                Ok(SesResponse {
                    message_id: output.message_id().map(str::to_string),
                })
            }
            Err(e) => {
                error!("Failed to send email via SES: {}", e);
                Err(SendError::api(ESP_NAME, e.to_string()))
            }
        }
    }

    fn parse_recipient_status(
        &self,
        response: &SesResponse,
        payload: &SesPayload,
        _message: &EmailMessage,
    ) -> Result<BTreeMap<String, RecipientStatus>, SendError> {
        let message_id = response.message_id.clone().ok_or_else(|| SendError::ResponseParse {
            esp_name: ESP_NAME.to_string(),
            message: "SendEmail response has no MessageId".to_string(),
            response: serde_json::to_value(response).ok(),
        })?;

        payload
            .recipients()
            .map(|address| {
                let email = ParsedEmail::parse(&address.as_str().into(), None)?.email;
                Ok((
                    email,
                    RecipientStatus::new(DeliveryStatus::Queued, Some(message_id.clone())),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ConvertContext;
    use crate::payload::PayloadBuilder;
    use crate::types::{AttachmentContent, AttachmentSpec};
    use chrono::{Offset, Utc};

    fn build(message: &EmailMessage, permissive: bool) -> Result<SesPayload, SendError> {
        PayloadBuilder::<SesPayload>::new().build(
            message,
            &SendDefaults::default(),
            PayloadContext::new(ESP_NAME, permissive),
            &ConvertContext {
                encoding: None,
                default_charset: "utf-8".to_string(),
                time_zone: Utc.fix(),
            },
        )
    }

    fn message() -> EmailMessage {
        EmailMessage::new(("Jo", "jo@example.com"), "from@example.com", "Subject")
            .with_both("text", "<p>html</p>")
            .with_cc("cc@example.com")
    }

    #[test]
    fn test_ses_payload_basic_fields() {
        let payload = build(&message(), false).unwrap();
        assert_eq!(payload.from_email.as_deref(), Some("from@example.com"));
        assert_eq!(payload.to, vec!["Jo <jo@example.com>"]);
        assert_eq!(payload.cc, vec!["cc@example.com"]);
        assert_eq!(payload.text_body.as_deref(), Some("text"));
        assert_eq!(payload.html_body.as_deref(), Some("<p>html</p>"));
    }

    #[test]
    fn test_ses_metadata_becomes_message_tags() {
        let message = message().with_metadata("user_id", 42).with_metadata("plan", "pro");
        let payload = build(&message, false).unwrap();
        assert_eq!(
            payload.email_tags,
            vec![
                ("plan".to_string(), "pro".to_string()),
                ("user_id".to_string(), "42".to_string()),
            ]
        );
    }

    #[test]
    fn test_ses_single_tag() {
        let payload = build(&message().with_tag("welcome"), false).unwrap();
        assert_eq!(payload.email_tags, vec![("tag".to_string(), "welcome".to_string())]);

        let err = build(&message().with_tag("a").with_tag("b"), false).unwrap_err();
        assert_eq!(err.to_string(), "Amazon SES does not support multiple tags");

        let payload = build(&message().with_tag("a").with_tag("b"), true).unwrap();
        assert_eq!(payload.email_tags.len(), 1);
    }

    #[test]
    fn test_ses_rejects_tracking_and_attachments() {
        let mut tracked = message();
        tracked.track_clicks = Some(true);
        let err = build(&tracked, false).unwrap_err();
        assert_eq!(err.to_string(), "Amazon SES does not support track_clicks");

        let attached = message().with_attachment(AttachmentSpec::new(
            "notes.txt",
            AttachmentContent::Bytes(b"hi".to_vec()),
            None,
        ));
        let err = build(&attached, false).unwrap_err();
        assert_eq!(err.to_string(), "Amazon SES does not support attachments");
    }

    #[test]
    fn test_ses_extra_headers_unsupported_only_when_requested() {
        assert!(build(&message(), false).is_ok());

        let err = build(&message().with_header("X-Campaign", "spring"), false).unwrap_err();
        assert_eq!(err.to_string(), "Amazon SES does not support extra_headers");
    }

    #[test]
    fn test_ses_template_and_esp_extra() {
        let message = message()
            .with_template_id("welcome")
            .with_merge_global_data("name", "Jo")
            .with_esp_extra("configuration_set_name", "tracked");
        let payload = build(&message, false).unwrap();
        assert_eq!(payload.template_name.as_deref(), Some("welcome"));
        assert_eq!(payload.configuration_set_name.as_deref(), Some("tracked"));
        assert!(payload.content().is_ok());

        let err = build(&message.with_esp_extra("ip_pool", "x"), false).unwrap_err();
        assert_eq!(err.to_string(), "Amazon SES does not support esp_extra 'ip_pool'");
    }

    #[test]
    fn test_ses_status_parsing() {
        let backend = SesBackend::new(SesConfig::default());
        let payload = build(&message(), false).unwrap();

        let statuses = backend
            .parse_recipient_status(
                &SesResponse {
                    message_id: Some("ses-1".to_string()),
                },
                &payload,
                &message(),
            )
            .unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["jo@example.com"].status, DeliveryStatus::Queued);
        assert_eq!(statuses["cc@example.com"].message_id.as_deref(), Some("ses-1"));

        let err = backend
            .parse_recipient_status(&SesResponse { message_id: None }, &payload, &message())
            .unwrap_err();
        assert!(matches!(err, SendError::ResponseParse { .. }));
    }

    #[tokio::test]
    async fn test_ses_dispatch_requires_session() {
        let backend = SesBackend::new(SesConfig::default());
        let payload = build(&message(), false).unwrap();
        let err = backend.dispatch(&payload, &message()).await.unwrap_err();
        assert!(matches!(err, SendError::Api { .. }));
    }
}
