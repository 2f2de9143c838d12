use chrono::{FixedOffset, Local, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::defaults::SendDefaults;
use crate::error::EmailError;
use crate::send::SessionOptions;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub ignore_unsupported_features: bool,
    #[serde(default)]
    pub ignore_recipient_status: bool,
    #[serde(default)]
    pub fail_silently: bool,
    #[serde(default = "default_charset")]
    pub default_charset: String,
    /// Fixed UTC offset such as `+02:00`; the system's local offset if unset.
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub send_defaults: SendDefaults,
    /// Per-provider defaults, keyed like `amazon_ses`.
    #[serde(default)]
    pub esp_send_defaults: BTreeMap<String, SendDefaults>,
    #[serde(flatten)]
    pub provider: EmailProviderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum EmailProviderConfig {
    Ses(SesConfig),
    Null,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SesConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

fn default_charset() -> String {
    "utf-8".to_string()
}

/// `Amazon SES` becomes `amazon_ses`.
pub fn esp_key(esp_name: &str) -> String {
    esp_name
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

impl EmailConfig {
    pub async fn load_from_file(path: &Path) -> Result<Self, EmailError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, EmailError> {
        let config: EmailConfig = toml_edit::de::from_str(contents)?;
        config.parse_time_zone()?;
        Ok(config)
    }

    pub fn parse_time_zone(&self) -> Result<FixedOffset, EmailError> {
        match self.time_zone.as_deref() {
            None => Ok(Local::now().offset().fix()),
            Some("UTC") | Some("utc") | Some("Z") => Ok(Utc.fix()),
            Some(offset) => offset.parse::<FixedOffset>().map_err(|e| {
                EmailError::ConfigError(format!("Invalid time_zone '{}': {}", offset, e))
            }),
        }
    }

    /// General defaults with the provider's own table layered on top.
    pub fn send_defaults_for(&self, esp_name: &str) -> SendDefaults {
        match self.esp_send_defaults.get(&esp_key(esp_name)) {
            Some(esp_defaults) => self.send_defaults.clone().overlay(esp_defaults.clone()),
            None => self.send_defaults.clone(),
        }
    }

    pub fn session_options(&self, esp_name: &str) -> Result<SessionOptions, EmailError> {
        Ok(SessionOptions {
            ignore_unsupported_features: self.ignore_unsupported_features,
            ignore_recipient_status: self.ignore_recipient_status,
            fail_silently: self.fail_silently,
            default_charset: self.default_charset.clone(),
            time_zone: self.parse_time_zone()?,
            send_defaults: self.send_defaults_for(esp_name),
        })
    }
}
