use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::types::{Address, Alternative, AttachmentSpec, SendAt, Text};

/// Configured default for each message attribute, keyed by attribute name.
///
/// Unknown keys are kept in `esp_attrs` so provider-specific attributes can
/// have defaults too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendDefaults {
    pub from_email: Option<Address>,
    pub to: Option<Vec<Address>>,
    pub cc: Option<Vec<Address>>,
    pub bcc: Option<Vec<Address>>,
    pub subject: Option<Text>,
    pub reply_to: Option<Vec<Address>>,
    pub extra_headers: Option<BTreeMap<String, Text>>,
    pub body: Option<Text>,
    pub alternatives: Option<Vec<Alternative>>,
    pub attachments: Option<Vec<AttachmentSpec>>,
    pub metadata: Option<Map<String, Value>>,
    pub send_at: Option<SendAt>,
    pub tags: Option<Vec<Text>>,
    pub track_clicks: Option<bool>,
    pub track_opens: Option<bool>,
    pub template_id: Option<Text>,
    pub merge_data: Option<BTreeMap<String, Map<String, Value>>>,
    pub merge_global_data: Option<Map<String, Value>>,
    pub esp_extra: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub esp_attrs: BTreeMap<String, Value>,
}

impl SendDefaults {
    /// Layers `over` on top of `self`: every attribute `over` sets replaces
    /// the one in `self` wholesale.
    pub fn overlay(self, over: SendDefaults) -> SendDefaults {
        let mut esp_attrs = self.esp_attrs;
        esp_attrs.extend(over.esp_attrs);

        SendDefaults {
            from_email: over.from_email.or(self.from_email),
            to: over.to.or(self.to),
            cc: over.cc.or(self.cc),
            bcc: over.bcc.or(self.bcc),
            subject: over.subject.or(self.subject),
            reply_to: over.reply_to.or(self.reply_to),
            extra_headers: over.extra_headers.or(self.extra_headers),
            body: over.body.or(self.body),
            alternatives: over.alternatives.or(self.alternatives),
            attachments: over.attachments.or(self.attachments),
            metadata: over.metadata.or(self.metadata),
            send_at: over.send_at.or(self.send_at),
            tags: over.tags.or(self.tags),
            track_clicks: over.track_clicks.or(self.track_clicks),
            track_opens: over.track_opens.or(self.track_opens),
            template_id: over.template_id.or(self.template_id),
            merge_data: over.merge_data.or(self.merge_data),
            merge_global_data: over.merge_global_data.or(self.merge_global_data),
            esp_extra: over.esp_extra.or(self.esp_extra),
            esp_attrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_replaces_per_key() {
        let general = SendDefaults {
            tags: Some(vec!["general".into()]),
            track_clicks: Some(true),
            ..Default::default()
        };
        let esp = SendDefaults {
            tags: Some(vec!["esp".into()]),
            ..Default::default()
        };

        let layered = general.overlay(esp);
        let tags: Vec<String> = layered.tags.unwrap().iter().map(Text::resolve).collect();
        assert_eq!(tags, vec!["esp"]);
        assert_eq!(layered.track_clicks, Some(true));
    }

    #[test]
    fn test_unknown_keys_land_in_esp_attrs() {
        let defaults: SendDefaults = serde_json::from_str(
            r#"{"track_opens": false, "merge_field_format": "{{{}}}"}"#,
        )
        .unwrap();
        assert_eq!(defaults.track_opens, Some(false));
        assert_eq!(
            defaults.esp_attrs.get("merge_field_format"),
            Some(&Value::String("{{{}}}".to_string()))
        );
    }
}
