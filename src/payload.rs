//! The provider extension contract and the builder that drives it.
//!
//! A provider describes its request body as a [`Payload`]. Only the setters
//! every provider can honor are required; the remaining ones default to the
//! unsupported-feature escalation, so a provider opts into a feature simply
//! by overriding its setter.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::convert::{Attachment, ConvertContext, ParsedEmail};
use crate::defaults::SendDefaults;
use crate::error::SendError;
use crate::rules::{self, MergeRule, RuleInput};
use crate::types::{EmailMessage, RecipientType, SendAt};

/// What a payload knows about the session building it.
#[derive(Debug, Clone)]
pub struct PayloadContext {
    pub esp_name: String,
    pub ignore_unsupported_features: bool,
}

impl PayloadContext {
    pub fn new(esp_name: impl Into<String>, ignore_unsupported_features: bool) -> Self {
        Self {
            esp_name: esp_name.into(),
            ignore_unsupported_features,
        }
    }

    /// Fails with [`SendError::UnsupportedFeature`] unless unsupported
    /// features are being ignored, in which case the feature is dropped.
    pub fn unsupported_feature(&self, feature: &str) -> Result<(), SendError> {
        if self.ignore_unsupported_features {
            warn!("{} does not support {}; ignoring it", self.esp_name, feature);
            Ok(())
        } else {
            Err(SendError::unsupported(&self.esp_name, feature))
        }
    }
}

pub trait Payload: fmt::Debug + Serialize + Send + Sync + Sized + 'static {
    fn init(
        message: &EmailMessage,
        defaults: &SendDefaults,
        ctx: PayloadContext,
    ) -> Result<Self, SendError>;

    fn context(&self) -> &PayloadContext;

    /// Provider-specific attributes, processed after the standard ones.
    fn esp_rules() -> Vec<MergeRule<Self>> {
        Vec::new()
    }

    fn unsupported_feature(&self, feature: &str) -> Result<(), SendError> {
        self.context().unsupported_feature(feature)
    }

    fn set_from_email(&mut self, email: ParsedEmail) -> Result<(), SendError>;

    fn set_to(&mut self, emails: Vec<ParsedEmail>) -> Result<(), SendError> {
        self.set_recipients(RecipientType::To, emails)
    }

    fn set_cc(&mut self, emails: Vec<ParsedEmail>) -> Result<(), SendError> {
        self.set_recipients(RecipientType::Cc, emails)
    }

    fn set_bcc(&mut self, emails: Vec<ParsedEmail>) -> Result<(), SendError> {
        self.set_recipients(RecipientType::Bcc, emails)
    }

    fn set_recipients(
        &mut self,
        recipient_type: RecipientType,
        emails: Vec<ParsedEmail>,
    ) -> Result<(), SendError> {
        for email in emails {
            self.add_recipient(recipient_type, email)?;
        }
        Ok(())
    }

    fn add_recipient(
        &mut self,
        recipient_type: RecipientType,
        email: ParsedEmail,
    ) -> Result<(), SendError>;

    fn set_subject(&mut self, subject: String) -> Result<(), SendError>;

    /// Messages always carry a (possibly empty) reply-to list, so only a
    /// non-empty one counts as a request for the feature.
    fn set_reply_to(&mut self, emails: Vec<ParsedEmail>) -> Result<(), SendError> {
        if emails.is_empty() {
            return Ok(());
        }
        self.unsupported_feature("reply_to")
    }

    fn set_extra_headers(&mut self, headers: BTreeMap<String, String>) -> Result<(), SendError> {
        if headers.is_empty() {
            return Ok(());
        }
        self.unsupported_feature("extra_headers")
    }

    fn set_text_body(&mut self, body: String) -> Result<(), SendError>;

    fn set_html_body(&mut self, body: String) -> Result<(), SendError>;

    /// Routes html alternatives to the html body (the last one wins) and
    /// everything else to [`Payload::add_alternative`].
    fn set_alternatives(&mut self, alternatives: Vec<(String, String)>) -> Result<(), SendError> {
        for (content, mimetype) in alternatives {
            if mimetype == "text/html" {
                self.set_html_body(content)?;
            } else {
                self.add_alternative(content, &mimetype)?;
            }
        }
        Ok(())
    }

    fn add_alternative(&mut self, _content: String, mimetype: &str) -> Result<(), SendError> {
        self.unsupported_feature(&format!("alternative part with type '{}'", mimetype))
    }

    fn set_attachments(&mut self, attachments: Vec<Attachment>) -> Result<(), SendError> {
        for attachment in attachments {
            self.add_attachment(attachment)?;
        }
        Ok(())
    }

    fn add_attachment(&mut self, attachment: Attachment) -> Result<(), SendError>;

    fn set_metadata(&mut self, _metadata: Map<String, Value>) -> Result<(), SendError> {
        self.unsupported_feature("metadata")
    }

    fn set_send_at(&mut self, _send_at: SendAt) -> Result<(), SendError> {
        self.unsupported_feature("send_at")
    }

    fn set_tags(&mut self, _tags: Vec<String>) -> Result<(), SendError> {
        self.unsupported_feature("tags")
    }

    fn set_track_clicks(&mut self, _track_clicks: bool) -> Result<(), SendError> {
        self.unsupported_feature("track_clicks")
    }

    fn set_track_opens(&mut self, _track_opens: bool) -> Result<(), SendError> {
        self.unsupported_feature("track_opens")
    }

    fn set_template_id(&mut self, _template_id: String) -> Result<(), SendError> {
        self.unsupported_feature("template_id")
    }

    fn set_merge_data(
        &mut self,
        _merge_data: BTreeMap<String, Map<String, Value>>,
    ) -> Result<(), SendError> {
        self.unsupported_feature("merge_data")
    }

    fn set_merge_global_data(&mut self, _merge_global_data: Map<String, Value>) -> Result<(), SendError> {
        self.unsupported_feature("merge_global_data")
    }

    fn set_esp_extra(&mut self, _extra: Map<String, Value>) -> Result<(), SendError> {
        self.unsupported_feature("esp_extra")
    }
}

/// Applies the attribute rules, in order, to a fresh payload.
pub struct PayloadBuilder<P: Payload> {
    rules: Vec<MergeRule<P>>,
}

impl<P: Payload> PayloadBuilder<P> {
    pub fn new() -> Self {
        let mut rules = rules::message_rules::<P>();
        rules.extend(rules::extension_rules::<P>());
        rules.extend(P::esp_rules());
        Self { rules }
    }

    pub fn rules(&self) -> &[MergeRule<P>] {
        &self.rules
    }

    pub fn build(
        &self,
        message: &EmailMessage,
        defaults: &SendDefaults,
        payload_ctx: PayloadContext,
        convert_ctx: &ConvertContext,
    ) -> Result<P, SendError> {
        let mut payload = P::init(message, defaults, payload_ctx)?;
        let input = RuleInput {
            message,
            defaults,
            convert: convert_ctx,
        };
        for rule in &self.rules {
            rule.apply(&mut payload, &input)?;
        }
        debug!("Built {} payload: {:?}", payload.context().esp_name, payload);
        Ok(payload)
    }
}

impl<P: Payload> Default for PayloadBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
