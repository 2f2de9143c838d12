//! Normalization of single attribute values into the forms payloads consume.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, FixedOffset, TimeZone};
use mailparse::MailAddr;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::SendError;
use crate::types::{Address, Alternative, AttachmentContent, AttachmentSpec, SendAt, Text};

/// Per-message inputs the converters depend on.
#[derive(Debug, Clone)]
pub struct ConvertContext {
    pub encoding: Option<String>,
    pub default_charset: String,
    pub time_zone: FixedOffset,
}

impl ConvertContext {
    /// The message's charset, or the configured fallback.
    pub fn charset(&self) -> &str {
        self.encoding.as_deref().unwrap_or(&self.default_charset)
    }
}

/// A single address split into display name and addr-spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedEmail {
    pub name: String,
    pub email: String,
    pub encoding: Option<String>,
}

impl ParsedEmail {
    pub fn parse(address: &Address, encoding: Option<&str>) -> Result<Self, SendError> {
        let (name, email) = match address {
            Address::Pair(name, email) => (name.trim().to_string(), email.trim().to_string()),
            Address::Raw(raw) => parse_single(raw)?,
        };

        if email.is_empty() {
            return Err(SendError::InvalidAddress {
                address: address.to_string(),
                reason: "no email address found".to_string(),
            });
        }

        Ok(Self {
            name,
            email,
            encoding: encoding.map(str::to_string),
        })
    }

    /// Display name and email formatted for a header, with non-ASCII names
    /// encoded in the address's charset.
    pub fn address(&self) -> String {
        if self.name.is_empty() {
            return self.email.clone();
        }
        let name = if self.name.is_ascii() {
            quote_display_name(&self.name)
        } else {
            encode_word(&self.name, self.encoding.as_deref().unwrap_or("utf-8"))
        };
        format!("{} <{}>", name, self.email)
    }
}

fn parse_single(raw: &str) -> Result<(String, String), SendError> {
    let invalid = |reason: String| SendError::InvalidAddress {
        address: raw.to_string(),
        reason,
    };

    let parsed = mailparse::addrparse(raw).map_err(|e| invalid(e.to_string()))?;
    if parsed.len() != 1 {
        return Err(invalid(format!(
            "expected a single address, found {}",
            parsed.len()
        )));
    }
    match &parsed[0] {
        MailAddr::Single(info) => Ok((
            info.display_name.clone().unwrap_or_default(),
            info.addr.trim().to_string(),
        )),
        MailAddr::Group(_) => Err(invalid("address groups are not supported".to_string())),
    }
}

fn quote_display_name(name: &str) -> String {
    const SPECIALS: &[char] = &['(', ')', '<', '>', '@', ',', ';', ':', '\\', '"', '.', '[', ']'];
    if name.contains(SPECIALS) {
        format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        name.to_string()
    }
}

fn encode_word(text: &str, charset: &str) -> String {
    let (bytes, label) = encode_text(text, charset);
    format!("=?{}?b?{}?=", label, STANDARD.encode(bytes))
}

/// Encodes `text` in the charset named by `label`, falling back to UTF-8 for
/// labels the encoder does not recognize.
fn encode_text(text: &str, label: &str) -> (Vec<u8>, &'static str) {
    match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) => {
            let (bytes, used, _) = encoding.encode(text);
            (bytes.into_owned(), used.name())
        }
        None => {
            warn!("Unknown charset '{}', encoding as UTF-8", label);
            (text.as_bytes().to_vec(), encoding_rs::UTF_8.name())
        }
    }
}

pub fn parsed_email(address: Address, ctx: &ConvertContext) -> Result<ParsedEmail, SendError> {
    ParsedEmail::parse(&address, ctx.encoding.as_deref())
}

pub fn parsed_emails(addresses: Vec<Address>, ctx: &ConvertContext) -> Result<Vec<ParsedEmail>, SendError> {
    addresses
        .iter()
        .map(|address| ParsedEmail::parse(address, ctx.encoding.as_deref()))
        .collect()
}

/// An attachment with its content resolved to bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub name: Option<String>,
    pub content: Vec<u8>,
    pub mimetype: Option<String>,
    pub inline: bool,
    pub content_id: Option<String>,
}

impl Attachment {
    pub fn prepare(spec: AttachmentSpec, charset: &str) -> Self {
        let name = spec.filename.map(|filename| filename.resolve());
        let content = match spec.content {
            AttachmentContent::Bytes(bytes) => bytes,
            AttachmentContent::Text(text) => encode_text(&text.resolve(), charset).0,
        };
        let mimetype = spec.mimetype.or_else(|| {
            name.as_deref()
                .and_then(|name| mime_guess::from_path(name).first_raw())
                .map(str::to_string)
        });

        Self {
            name,
            content,
            mimetype,
            inline: spec.content_id.is_some(),
            content_id: spec.content_id,
        }
    }

    pub fn b64content(&self) -> String {
        STANDARD.encode(&self.content)
    }

    /// Content id without the surrounding angle brackets.
    pub fn cid(&self) -> Option<&str> {
        self.content_id
            .as_deref()
            .map(|id| id.trim_start_matches('<').trim_end_matches('>'))
    }
}

pub fn prepped_attachments(attachments: Vec<AttachmentSpec>, ctx: &ConvertContext) -> Vec<Attachment> {
    let charset = ctx.charset();
    attachments
        .into_iter()
        .map(|spec| Attachment::prepare(spec, charset))
        .collect()
}

pub fn prepped_alternatives(alternatives: Vec<Alternative>) -> Vec<(String, String)> {
    alternatives
        .into_iter()
        .map(|alt| (alt.content.resolve(), alt.mimetype))
        .collect()
}

/// Converts any supported scheduled-send form into a zone-aware instant.
///
/// Naive values and dates (midnight) are taken to be in `time_zone`; POSIX
/// timestamps are UTC. Aware instants and unrecognized values come back
/// unchanged.
pub fn aware_datetime(value: SendAt, time_zone: FixedOffset) -> SendAt {
    match value {
        SendAt::Naive(naive) => time_zone
            .from_local_datetime(&naive)
            .single()
            .map(SendAt::Aware)
            .unwrap_or(SendAt::Naive(naive)),
        SendAt::Date(date) => match date.and_hms_opt(0, 0, 0) {
            Some(midnight) => aware_datetime(SendAt::Naive(midnight), time_zone),
            None => SendAt::Date(date),
        },
        SendAt::Timestamp(secs) => DateTime::from_timestamp(secs, 0)
            .map(|dt| SendAt::Aware(dt.fixed_offset()))
            .unwrap_or(SendAt::Timestamp(secs)),
        aware_or_other => aware_or_other,
    }
}

pub fn force_text(text: Text) -> String {
    text.resolve()
}

pub fn force_text_list(items: Vec<Text>) -> Vec<String> {
    items.iter().map(Text::resolve).collect()
}

pub fn force_text_map(map: BTreeMap<String, Text>) -> BTreeMap<String, String> {
    map.into_iter().map(|(k, v)| (k, v.resolve())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn ctx() -> ConvertContext {
        ConvertContext {
            encoding: None,
            default_charset: "utf-8".to_string(),
            time_zone: FixedOffset::east_opt(2 * 3600).unwrap(),
        }
    }

    #[test]
    fn test_parse_raw_address_with_name() {
        let parsed = ParsedEmail::parse(&"Alice Example <alice@example.com>".into(), None).unwrap();
        assert_eq!(parsed.name, "Alice Example");
        assert_eq!(parsed.email, "alice@example.com");
        assert_eq!(parsed.address(), "Alice Example <alice@example.com>");
    }

    #[test]
    fn test_parse_bare_address() {
        let parsed = ParsedEmail::parse(&"bob@example.com".into(), None).unwrap();
        assert_eq!(parsed.name, "");
        assert_eq!(parsed.address(), "bob@example.com");
    }

    #[test]
    fn test_parse_pair_quotes_specials() {
        let parsed = ParsedEmail::parse(&("Doe, Jane", "jane@example.com").into(), None).unwrap();
        assert_eq!(parsed.address(), "\"Doe, Jane\" <jane@example.com>");
    }

    #[test]
    fn test_parse_rejects_multiple_addresses() {
        let err = ParsedEmail::parse(&"a@example.com, b@example.com".into(), None).unwrap_err();
        assert!(matches!(err, SendError::InvalidAddress { .. }));
    }

    #[test]
    fn test_parse_rejects_empty_address() {
        let err = ParsedEmail::parse(&("Nobody", "").into(), None).unwrap_err();
        assert!(matches!(err, SendError::InvalidAddress { .. }));
    }

    #[test]
    fn test_non_ascii_name_is_encoded() {
        let parsed = ParsedEmail::parse(&("Zoë", "zoe@example.com").into(), None).unwrap();
        let address = parsed.address();
        assert!(address.starts_with("=?UTF-8?b?"));
        assert!(address.ends_with("?= <zoe@example.com>"));
    }

    #[test]
    fn test_date_becomes_local_midnight() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let converted = aware_datetime(SendAt::Date(date), ctx().time_zone);
        match converted {
            SendAt::Aware(dt) => assert_eq!(dt.to_rfc3339(), "2024-03-01T00:00:00+02:00"),
            other => panic!("expected aware datetime, got {:?}", other),
        }
    }

    #[test]
    fn test_naive_datetime_takes_local_zone() {
        let naive = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let converted = aware_datetime(SendAt::Naive(naive), ctx().time_zone);
        match converted {
            SendAt::Aware(dt) => assert_eq!(dt.to_rfc3339(), "2024-03-01T09:30:00+02:00"),
            other => panic!("expected aware datetime, got {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_is_utc() {
        let converted = aware_datetime(SendAt::Timestamp(0), ctx().time_zone);
        match converted {
            SendAt::Aware(dt) => assert_eq!(dt.to_rfc3339(), "1970-01-01T00:00:00+00:00"),
            other => panic!("expected aware datetime, got {:?}", other),
        }
    }

    #[test]
    fn test_aware_datetime_is_idempotent() {
        let aware = SendAt::from(Utc::now());
        let once = aware_datetime(aware.clone(), ctx().time_zone);
        assert_eq!(once, aware);
        assert_eq!(aware_datetime(once.clone(), ctx().time_zone), once);
    }

    #[test]
    fn test_unrecognized_send_at_passes_through() {
        let other = SendAt::Other("next tuesday".to_string());
        assert_eq!(aware_datetime(other.clone(), ctx().time_zone), other);
    }

    #[test]
    fn test_text_attachment_uses_fallback_charset() {
        let mut ctx = ctx();
        ctx.default_charset = "iso-8859-1".to_string();
        let spec = AttachmentSpec::new("notes.txt", AttachmentContent::Text("café".into()), None);

        let prepared = prepped_attachments(vec![spec], &ctx);
        assert_eq!(prepared[0].content, vec![b'c', b'a', b'f', 0xe9]);
        assert_eq!(prepared[0].mimetype.as_deref(), Some("text/plain"));
        assert!(!prepared[0].inline);
    }

    #[test]
    fn test_message_encoding_beats_fallback() {
        let mut ctx = ctx();
        ctx.encoding = Some("utf-8".to_string());
        ctx.default_charset = "iso-8859-1".to_string();
        assert_eq!(ctx.charset(), "utf-8");
    }

    #[test]
    fn test_inline_attachment_cid() {
        let spec = AttachmentSpec::new("logo.png", AttachmentContent::Bytes(vec![1, 2, 3]), None)
            .inline("<logo@example>");
        let prepared = Attachment::prepare(spec, "utf-8");

        assert!(prepared.inline);
        assert_eq!(prepared.cid(), Some("logo@example"));
        assert_eq!(prepared.mimetype.as_deref(), Some("image/png"));
        assert_eq!(prepared.b64content(), "AQID");
    }

    #[test]
    fn test_force_text_map_resolves_deferred_values() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Campaign".to_string(), Text::deferred(|| "spring".to_string()));
        let forced = force_text_map(headers);
        assert_eq!(forced["X-Campaign"], "spring");
    }
}
