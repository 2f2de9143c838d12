use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Text that is either already concrete or rendered on demand.
///
/// Deferred text is resolved once, while the payload is built, so callers can
/// hand over content whose rendering depends on state at send time.
#[derive(Clone)]
pub enum Text {
    Plain(String),
    Deferred(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Text {
    pub fn deferred(render: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Text::Deferred(Arc::new(render))
    }

    pub fn resolve(&self) -> String {
        match self {
            Text::Plain(text) => text.clone(),
            Text::Deferred(render) => render(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Text::Deferred(_))
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Text::Plain(text) => fmt::Debug::fmt(text, f),
            Text::Deferred(_) => f.write_str("Text::Deferred(..)"),
        }
    }
}

impl From<&str> for Text {
    fn from(text: &str) -> Self {
        Text::Plain(text.to_string())
    }
}

impl From<String> for Text {
    fn from(text: String) -> Self {
        Text::Plain(text)
    }
}

impl Serialize for Text {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.resolve())
    }
}

impl<'de> Deserialize<'de> for Text {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Text::Plain)
    }
}

/// An address as supplied by the caller: either a raw `Name <addr>` string or
/// a `(display name, address)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    Raw(String),
    Pair(String, String),
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Address::Raw(address.to_string())
    }
}

impl From<String> for Address {
    fn from(address: String) -> Self {
        Address::Raw(address)
    }
}

impl<N: Into<String>, A: Into<String>> From<(N, A)> for Address {
    fn from((name, address): (N, A)) -> Self {
        Address::Pair(name.into(), address.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Raw(raw) => f.write_str(raw),
            Address::Pair(name, address) if name.is_empty() => f.write_str(address),
            Address::Pair(name, address) => write!(f, "{} <{}>", name, address),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSubtype {
    #[default]
    Plain,
    Html,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub content: Text,
    pub mimetype: String,
}

impl Alternative {
    pub fn new(content: impl Into<Text>, mimetype: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            mimetype: mimetype.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttachmentContent {
    Text(Text),
    Bytes(Vec<u8>),
}

/// An attachment as supplied by the caller, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSpec {
    #[serde(default)]
    pub filename: Option<Text>,
    pub content: AttachmentContent,
    #[serde(default)]
    pub mimetype: Option<String>,
    /// Set for inline attachments, referenced from html bodies as `cid:`.
    #[serde(default)]
    pub content_id: Option<String>,
}

impl AttachmentSpec {
    pub fn new(filename: impl Into<Text>, content: AttachmentContent, mimetype: Option<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            content,
            mimetype,
            content_id: None,
        }
    }

    pub fn inline(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }
}

/// Scheduled-send value in any of the forms callers commonly have on hand.
///
/// Deserializes from strings, integers and native TOML date-times alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SendAt {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
    Date(NaiveDate),
    /// POSIX seconds, always UTC.
    Timestamp(i64),
    /// Passed through untouched; providers may reject it.
    Other(String),
}

impl SendAt {
    /// Reads an RFC 3339 date-time, a naive date-time or a bare date, keeping
    /// anything else as [`SendAt::Other`].
    pub fn parse(value: &str) -> Self {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            SendAt::Aware(dt)
        } else if let Ok(dt) = value.parse::<NaiveDateTime>() {
            SendAt::Naive(dt)
        } else if let Ok(date) = value.parse::<NaiveDate>() {
            SendAt::Date(date)
        } else {
            SendAt::Other(value.to_string())
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SendAtRepr {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
    Date(NaiveDate),
    Timestamp(i64),
    Other(String),
    Toml(toml_edit::Datetime),
}

impl<'de> Deserialize<'de> for SendAt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match SendAtRepr::deserialize(deserializer)? {
            SendAtRepr::Aware(dt) => SendAt::Aware(dt),
            SendAtRepr::Naive(dt) => SendAt::Naive(dt),
            SendAtRepr::Date(date) => SendAt::Date(date),
            SendAtRepr::Timestamp(timestamp) => SendAt::Timestamp(timestamp),
            SendAtRepr::Other(value) => SendAt::Other(value),
            SendAtRepr::Toml(dt) => SendAt::parse(&dt.to_string()),
        })
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for SendAt {
    fn from(dt: DateTime<Tz>) -> Self {
        SendAt::Aware(dt.fixed_offset())
    }
}

impl From<NaiveDateTime> for SendAt {
    fn from(dt: NaiveDateTime) -> Self {
        SendAt::Naive(dt)
    }
}

impl From<NaiveDate> for SendAt {
    fn from(date: NaiveDate) -> Self {
        SendAt::Date(date)
    }
}

impl From<i64> for SendAt {
    fn from(timestamp: i64) -> Self {
        SendAt::Timestamp(timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

impl fmt::Display for RecipientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecipientType::To => "to",
            RecipientType::Cc => "cc",
            RecipientType::Bcc => "bcc",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Scheduled,
    Invalid,
    Rejected,
    Unknown,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::Invalid => "invalid",
            DeliveryStatus::Rejected => "rejected",
            DeliveryStatus::Unknown => "unknown",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// The recipient was turned away by the provider.
    pub fn is_refused(&self) -> bool {
        matches!(self, DeliveryStatus::Invalid | DeliveryStatus::Rejected)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub message_id: Option<String>,
    pub status: DeliveryStatus,
}

impl RecipientStatus {
    pub fn new(status: DeliveryStatus, message_id: Option<String>) -> Self {
        Self { message_id, status }
    }
}

/// Outcome of a send attempt, attached to the message it describes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SendStatus {
    /// Provider message id, when every recipient shares the same one.
    pub message_id: Option<String>,
    pub status: BTreeSet<DeliveryStatus>,
    pub recipients: BTreeMap<String, RecipientStatus>,
    pub esp_response: Option<Value>,
    pub payload: Option<Value>,
}

impl SendStatus {
    pub fn set_recipient_status(&mut self, recipients: BTreeMap<String, RecipientStatus>) {
        self.status = recipients.values().map(|r| r.status).collect();
        self.recipients = recipients;
        let ids = self.message_ids();
        self.message_id = if ids.len() == 1 {
            ids.into_iter().next()
        } else {
            None
        };
    }

    pub fn message_ids(&self) -> BTreeSet<String> {
        self.recipients
            .values()
            .filter_map(|r| r.message_id.clone())
            .collect()
    }

    /// True when there is no status other than invalid or rejected.
    pub fn all_refused(&self) -> bool {
        self.status.iter().all(DeliveryStatus::is_refused)
    }
}

/// An outbound message.
///
/// Collections are always present (possibly empty). Scalar attributes and the
/// sending options are `None` until the caller sets them, which is distinct
/// from setting them to an empty value.
#[derive(Debug, Clone, Default)]
pub struct EmailMessage {
    pub from_email: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub subject: Option<Text>,
    pub body: Option<Text>,
    pub content_subtype: ContentSubtype,
    pub alternatives: Vec<Alternative>,
    pub attachments: Vec<AttachmentSpec>,
    pub extra_headers: BTreeMap<String, Text>,
    /// Charset label used to encode text attachments.
    pub encoding: Option<String>,

    pub metadata: Option<Map<String, Value>>,
    pub send_at: Option<SendAt>,
    pub tags: Option<Vec<Text>>,
    pub track_clicks: Option<bool>,
    pub track_opens: Option<bool>,
    pub template_id: Option<Text>,
    pub merge_data: Option<BTreeMap<String, Map<String, Value>>>,
    pub merge_global_data: Option<Map<String, Value>>,
    pub esp_extra: Option<Map<String, Value>>,
    /// Values for provider-specific attributes, keyed by attribute name.
    pub esp_attrs: BTreeMap<String, Value>,

    pub status: Option<SendStatus>,
}

impl EmailMessage {
    pub fn new(to: impl Into<Address>, from: impl Into<Address>, subject: impl Into<Text>) -> Self {
        Self {
            to: vec![to.into()],
            from_email: Some(from.into()),
            subject: Some(subject.into()),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<Text>) -> Self {
        self.body = Some(text.into());
        self.content_subtype = ContentSubtype::Plain;
        self
    }

    pub fn with_html(mut self, html: impl Into<Text>) -> Self {
        self.body = Some(html.into());
        self.content_subtype = ContentSubtype::Html;
        self
    }

    /// Plain text body with an html alternative.
    pub fn with_both(self, text: impl Into<Text>, html: impl Into<Text>) -> Self {
        self.with_text(text).with_alternative(html, "text/html")
    }

    pub fn with_to(mut self, address: impl Into<Address>) -> Self {
        self.to.push(address.into());
        self
    }

    pub fn with_cc(mut self, address: impl Into<Address>) -> Self {
        self.cc.push(address.into());
        self
    }

    pub fn with_bcc(mut self, address: impl Into<Address>) -> Self {
        self.bcc.push(address.into());
        self
    }

    pub fn with_reply_to(mut self, address: impl Into<Address>) -> Self {
        self.reply_to.push(address.into());
        self
    }

    pub fn with_alternative(mut self, content: impl Into<Text>, mimetype: impl Into<String>) -> Self {
        self.alternatives.push(Alternative::new(content, mimetype));
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentSpec) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Text>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<Text>) -> Self {
        self.tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn with_send_at(mut self, send_at: impl Into<SendAt>) -> Self {
        self.send_at = Some(send_at.into());
        self
    }

    pub fn with_template_id(mut self, template_id: impl Into<Text>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_merge_global_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.merge_global_data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_esp_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.esp_extra
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Every to, cc and bcc address, in that order.
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    pub fn has_recipients(&self) -> bool {
        self.recipients().next().is_some()
    }

    pub fn status(&self) -> Option<&SendStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_deferred_text_renders_on_resolve() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let text = Text::deferred(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "rendered".to_string()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(text.resolve(), "rendered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::from("a@example.com").to_string(), "a@example.com");
        assert_eq!(
            Address::from(("Alice", "a@example.com")).to_string(),
            "Alice <a@example.com>"
        );
        assert_eq!(Address::from(("", "a@example.com")).to_string(), "a@example.com");
    }

    #[test]
    fn test_with_both_adds_html_alternative() {
        let message = EmailMessage::new("to@example.com", "from@example.com", "Hi")
            .with_both("text", "<p>html</p>");

        assert_eq!(message.content_subtype, ContentSubtype::Plain);
        assert_eq!(message.alternatives.len(), 1);
        assert_eq!(message.alternatives[0].mimetype, "text/html");
    }

    #[test]
    fn test_recipients_cover_to_cc_bcc() {
        let message = EmailMessage::new("to@example.com", "from@example.com", "Hi")
            .with_cc("cc@example.com")
            .with_bcc("bcc@example.com")
            .with_reply_to("reply@example.com");

        let recipients: Vec<String> = message.recipients().map(|a| a.to_string()).collect();
        assert_eq!(
            recipients,
            vec!["to@example.com", "cc@example.com", "bcc@example.com"]
        );
        assert!(!EmailMessage::default().has_recipients());
    }

    #[test]
    fn test_set_recipient_status_aggregates() {
        let mut status = SendStatus::default();
        let mut recipients = BTreeMap::new();
        recipients.insert(
            "a@example.com".to_string(),
            RecipientStatus::new(DeliveryStatus::Queued, Some("id-1".to_string())),
        );
        recipients.insert(
            "b@example.com".to_string(),
            RecipientStatus::new(DeliveryStatus::Rejected, Some("id-1".to_string())),
        );
        status.set_recipient_status(recipients);

        assert_eq!(status.message_id.as_deref(), Some("id-1"));
        assert_eq!(status.status.len(), 2);
        assert!(!status.all_refused());
    }

    #[test]
    fn test_send_at_parse() {
        assert_eq!(
            SendAt::parse("2024-03-01T10:30:00"),
            SendAt::Naive(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_opt(10, 30, 0)
                    .unwrap()
            )
        );
        assert!(matches!(SendAt::parse("2024-03-01T10:30:00Z"), SendAt::Aware(_)));
        assert_eq!(SendAt::parse("tomorrow"), SendAt::Other("tomorrow".to_string()));
    }

    #[test]
    fn test_send_at_deserializes_from_strings() {
        let date: SendAt = serde_json::from_str("\"2024-03-01\"").unwrap();
        assert_eq!(date, SendAt::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));

        let aware: SendAt = serde_json::from_str("\"2024-03-01T10:00:00+02:00\"").unwrap();
        assert!(matches!(aware, SendAt::Aware(_)));

        let ts: SendAt = serde_json::from_str("1700000000").unwrap();
        assert_eq!(ts, SendAt::Timestamp(1_700_000_000));
    }
}
