//! The ordered table of message attributes the payload builder walks.
//!
//! Each [`MergeRule`] reads one attribute from the message, combines it with
//! the configured default, converts it, and hands the result to the matching
//! payload setter. An attribute that ends up unset never reaches its setter.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::convert::{self, ConvertContext};
use crate::defaults::SendDefaults;
use crate::error::SendError;
use crate::payload::Payload;
use crate::types::{ContentSubtype, EmailMessage};

/// How a configured default and the message's own value combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    /// The message value wins when present, otherwise the default.
    Override,
    /// Sequences concatenate and mappings union, message value last.
    Merge,
    /// Defaults are not consulted.
    None,
}

/// Values that can be merged with a configured default.
pub trait Mergeable {
    fn merge(default: Self, value: Self) -> Self;
}

impl<T> Mergeable for Vec<T> {
    fn merge(mut default: Self, value: Self) -> Self {
        default.extend(value);
        default
    }
}

impl<K: Ord, V> Mergeable for BTreeMap<K, V> {
    fn merge(mut default: Self, value: Self) -> Self {
        default.extend(value);
        default
    }
}

impl Mergeable for Map<String, Value> {
    fn merge(mut default: Self, value: Self) -> Self {
        default.extend(value);
        default
    }
}

impl Mergeable for Value {
    fn merge(default: Self, value: Self) -> Self {
        match (default, value) {
            (Value::Object(default), Value::Object(value)) => {
                Value::Object(Mergeable::merge(default, value))
            }
            (Value::Array(default), Value::Array(value)) => {
                Value::Array(Mergeable::merge(default, value))
            }
            (_, value) => value,
        }
    }
}

/// Merges when both sides are present, otherwise keeps whichever side is.
pub fn combine<T: Mergeable>(default: Option<T>, value: Option<T>) -> Option<T> {
    match (default, value) {
        (Some(default), Some(value)) => Some(T::merge(default, value)),
        (default, value) => value.or(default),
    }
}

pub fn last<T>(default: Option<T>, value: Option<T>) -> Option<T> {
    value.or(default)
}

/// Everything a rule can look at while resolving its attribute.
pub struct RuleInput<'a> {
    pub message: &'a EmailMessage,
    pub defaults: &'a SendDefaults,
    pub convert: &'a ConvertContext,
}

type ApplyFn<P> = Box<dyn Fn(&mut P, &RuleInput<'_>) -> Result<(), SendError> + Send + Sync>;

pub struct MergeRule<P> {
    attr: &'static str,
    combine: Combine,
    apply: ApplyFn<P>,
}

impl<P> std::fmt::Debug for MergeRule<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeRule")
            .field("attr", &self.attr)
            .field("combine", &self.combine)
            .finish_non_exhaustive()
    }
}

impl<P: 'static> MergeRule<P> {
    pub fn attr(&self) -> &'static str {
        self.attr
    }

    pub fn combine(&self) -> Combine {
        self.combine
    }

    /// Resolves the attribute and calls the setter unless it is unset.
    pub fn apply(&self, payload: &mut P, input: &RuleInput<'_>) -> Result<(), SendError> {
        (self.apply)(payload, input)
    }

    pub fn merged<T, U>(
        attr: &'static str,
        read: impl Fn(&EmailMessage) -> Option<T> + Send + Sync + 'static,
        default: impl Fn(&SendDefaults) -> Option<T> + Send + Sync + 'static,
        convert: impl Fn(T, &ConvertContext) -> Result<U, SendError> + Send + Sync + 'static,
        set: impl Fn(&mut P, U, &EmailMessage) -> Result<(), SendError> + Send + Sync + 'static,
    ) -> Self
    where
        T: Mergeable + 'static,
        U: 'static,
    {
        Self::build(attr, Combine::Merge, read, default, combine::<T>, convert, set)
    }

    pub fn overridden<T, U>(
        attr: &'static str,
        read: impl Fn(&EmailMessage) -> Option<T> + Send + Sync + 'static,
        default: impl Fn(&SendDefaults) -> Option<T> + Send + Sync + 'static,
        convert: impl Fn(T, &ConvertContext) -> Result<U, SendError> + Send + Sync + 'static,
        set: impl Fn(&mut P, U, &EmailMessage) -> Result<(), SendError> + Send + Sync + 'static,
    ) -> Self
    where
        T: 'static,
        U: 'static,
    {
        Self::build(attr, Combine::Override, read, default, last::<T>, convert, set)
    }

    pub fn without_default<T, U>(
        attr: &'static str,
        read: impl Fn(&EmailMessage) -> Option<T> + Send + Sync + 'static,
        convert: impl Fn(T, &ConvertContext) -> Result<U, SendError> + Send + Sync + 'static,
        set: impl Fn(&mut P, U, &EmailMessage) -> Result<(), SendError> + Send + Sync + 'static,
    ) -> Self
    where
        T: 'static,
        U: 'static,
    {
        Self::build(attr, Combine::None, read, |_| None, last::<T>, convert, set)
    }

    /// A provider-specific attribute read from `EmailMessage::esp_attrs` and
    /// `SendDefaults::esp_attrs` under `attr`.
    pub fn esp_attr(
        attr: &'static str,
        combine: Combine,
        set: impl Fn(&mut P, Value) -> Result<(), SendError> + Send + Sync + 'static,
    ) -> Self {
        let read = move |message: &EmailMessage| message.esp_attrs.get(attr).cloned();
        let default = move |defaults: &SendDefaults| defaults.esp_attrs.get(attr).cloned();
        let convert = |value: Value, _: &ConvertContext| -> Result<Value, SendError> { Ok(value) };
        let set = move |payload: &mut P, value: Value, _: &EmailMessage| set(payload, value);
        match combine {
            Combine::Merge => Self::merged(attr, read, default, convert, set),
            Combine::Override => Self::overridden(attr, read, default, convert, set),
            Combine::None => Self::without_default(attr, read, convert, set),
        }
    }

    fn build<T, U>(
        attr: &'static str,
        combine: Combine,
        read: impl Fn(&EmailMessage) -> Option<T> + Send + Sync + 'static,
        default: impl Fn(&SendDefaults) -> Option<T> + Send + Sync + 'static,
        combiner: fn(Option<T>, Option<T>) -> Option<T>,
        convert: impl Fn(T, &ConvertContext) -> Result<U, SendError> + Send + Sync + 'static,
        set: impl Fn(&mut P, U, &EmailMessage) -> Result<(), SendError> + Send + Sync + 'static,
    ) -> Self
    where
        T: 'static,
        U: 'static,
    {
        let apply = move |payload: &mut P, input: &RuleInput<'_>| -> Result<(), SendError> {
            let mut value = read(input.message);
            if combine != Combine::None {
                value = combiner(default(input.defaults), value);
            }
            match value {
                Some(value) => {
                    let value = convert(value, input.convert)?;
                    set(payload, value, input.message)
                }
                None => Ok(()),
            }
        };

        Self {
            attr,
            combine,
            apply: Box::new(apply),
        }
    }
}

fn keep<T>(value: T, _: &ConvertContext) -> Result<T, SendError> {
    Ok(value)
}

/// Standard message attributes: addressing, subject, headers and content.
pub fn message_rules<P: Payload>() -> Vec<MergeRule<P>> {
    vec![
        MergeRule::overridden(
            "from_email",
            |m| m.from_email.clone(),
            |d| d.from_email.clone(),
            convert::parsed_email,
            |p: &mut P, v, _| p.set_from_email(v),
        ),
        MergeRule::merged(
            "to",
            |m| Some(m.to.clone()),
            |d| d.to.clone(),
            convert::parsed_emails,
            |p: &mut P, v, _| p.set_to(v),
        ),
        MergeRule::merged(
            "cc",
            |m| Some(m.cc.clone()),
            |d| d.cc.clone(),
            convert::parsed_emails,
            |p: &mut P, v, _| p.set_cc(v),
        ),
        MergeRule::merged(
            "bcc",
            |m| Some(m.bcc.clone()),
            |d| d.bcc.clone(),
            convert::parsed_emails,
            |p: &mut P, v, _| p.set_bcc(v),
        ),
        MergeRule::overridden(
            "subject",
            |m| m.subject.clone(),
            |d| d.subject.clone(),
            |v, _| Ok(convert::force_text(v)),
            |p: &mut P, v, _| p.set_subject(v),
        ),
        MergeRule::merged(
            "reply_to",
            |m| Some(m.reply_to.clone()),
            |d| d.reply_to.clone(),
            convert::parsed_emails,
            |p: &mut P, v, _| p.set_reply_to(v),
        ),
        MergeRule::merged(
            "extra_headers",
            |m| Some(m.extra_headers.clone()),
            |d| d.extra_headers.clone(),
            |v, _| Ok(convert::force_text_map(v)),
            |p: &mut P, v, _| p.set_extra_headers(v),
        ),
        MergeRule::overridden(
            "body",
            |m| m.body.clone(),
            |d| d.body.clone(),
            |v, _| Ok(convert::force_text(v)),
            |p: &mut P, v, m| match m.content_subtype {
                ContentSubtype::Html => p.set_html_body(v),
                ContentSubtype::Plain => p.set_text_body(v),
            },
        ),
        MergeRule::merged(
            "alternatives",
            |m| Some(m.alternatives.clone()),
            |d| d.alternatives.clone(),
            |v, _| Ok(convert::prepped_alternatives(v)),
            |p: &mut P, v, _| p.set_alternatives(v),
        ),
        MergeRule::merged(
            "attachments",
            |m| Some(m.attachments.clone()),
            |d| d.attachments.clone(),
            |v, ctx| Ok(convert::prepped_attachments(v, ctx)),
            |p: &mut P, v, _| p.set_attachments(v),
        ),
    ]
}

/// Provider-agnostic sending options.
pub fn extension_rules<P: Payload>() -> Vec<MergeRule<P>> {
    vec![
        MergeRule::merged(
            "metadata",
            |m| m.metadata.clone(),
            |d| d.metadata.clone(),
            keep,
            |p: &mut P, v, _| p.set_metadata(v),
        ),
        MergeRule::overridden(
            "send_at",
            |m| m.send_at.clone(),
            |d| d.send_at.clone(),
            |v, ctx| Ok(convert::aware_datetime(v, ctx.time_zone)),
            |p: &mut P, v, _| p.set_send_at(v),
        ),
        MergeRule::merged(
            "tags",
            |m| m.tags.clone(),
            |d| d.tags.clone(),
            |v, _| Ok(convert::force_text_list(v)),
            |p: &mut P, v, _| p.set_tags(v),
        ),
        MergeRule::overridden(
            "track_clicks",
            |m| m.track_clicks,
            |d| d.track_clicks,
            keep,
            |p: &mut P, v, _| p.set_track_clicks(v),
        ),
        MergeRule::overridden(
            "track_opens",
            |m| m.track_opens,
            |d| d.track_opens,
            keep,
            |p: &mut P, v, _| p.set_track_opens(v),
        ),
        MergeRule::overridden(
            "template_id",
            |m| m.template_id.clone(),
            |d| d.template_id.clone(),
            |v, _| Ok(convert::force_text(v)),
            |p: &mut P, v, _| p.set_template_id(v),
        ),
        MergeRule::merged(
            "merge_data",
            |m| m.merge_data.clone(),
            |d| d.merge_data.clone(),
            keep,
            |p: &mut P, v, _| p.set_merge_data(v),
        ),
        MergeRule::merged(
            "merge_global_data",
            |m| m.merge_global_data.clone(),
            |d| d.merge_global_data.clone(),
            keep,
            |p: &mut P, v, _| p.set_merge_global_data(v),
        ),
        MergeRule::merged(
            "esp_extra",
            |m| m.esp_extra.clone(),
            |d| d.esp_extra.clone(),
            keep,
            |p: &mut P, v, _| p.set_esp_extra(v),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_merges_sequences_default_first() {
        let merged = combine(Some(vec!["d1", "d2"]), Some(vec!["v1"]));
        assert_eq!(merged, Some(vec!["d1", "d2", "v1"]));
    }

    #[test]
    fn test_combine_mapping_caller_wins_on_collision() {
        let mut default = BTreeMap::new();
        default.insert("a", 1);
        default.insert("b", 1);
        let mut value = BTreeMap::new();
        value.insert("b", 2);
        value.insert("c", 2);

        let merged = combine(Some(default), Some(value)).unwrap();
        assert_eq!(merged.get("a"), Some(&1));
        assert_eq!(merged.get("b"), Some(&2));
        assert_eq!(merged.get("c"), Some(&2));
    }

    #[test]
    fn test_combine_keeps_present_side() {
        assert_eq!(combine(None, Some(vec![1])), Some(vec![1]));
        assert_eq!(combine(Some(vec![1]), None), Some(vec![1]));
        assert_eq!(combine::<Vec<i32>>(None, None), None);
    }

    #[test]
    fn test_combine_explicit_empty_is_not_unset() {
        assert_eq!(combine(None, Some(Vec::<i32>::new())), Some(vec![]));
    }

    #[test]
    fn test_last_prefers_value() {
        assert_eq!(last(Some(1), Some(2)), Some(2));
        assert_eq!(last(Some(1), None), Some(1));
        assert_eq!(last::<i32>(None, None), None);
    }

    #[test]
    fn test_json_value_merge() {
        let merged = <Value as Mergeable>::merge(
            serde_json::json!({"a": 1, "b": 1}),
            serde_json::json!({"b": 2}),
        );
        assert_eq!(merged, serde_json::json!({"a": 1, "b": 2}));

        let merged = <Value as Mergeable>::merge(serde_json::json!([1]), serde_json::json!([2]));
        assert_eq!(merged, serde_json::json!([1, 2]));

        let merged = <Value as Mergeable>::merge(serde_json::json!("old"), serde_json::json!(3));
        assert_eq!(merged, serde_json::json!(3));
    }
}
