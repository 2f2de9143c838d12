use serde_json::Value;
use thiserror::Error;

/// Anticipated failures while sending a message.
///
/// Everything in here is suppressed per message when the session runs in
/// fail-silent mode. Anything else surfaces through [`EmailError`].
#[derive(Error, Debug)]
pub enum SendError {
    #[error("{esp_name} does not support {feature}")]
    UnsupportedFeature { esp_name: String, feature: String },

    #[error("Invalid email address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{esp_name} API error: {message}")]
    Api {
        esp_name: String,
        message: String,
        status_code: Option<u16>,
        response: Option<Value>,
    },

    #[error("{esp_name} returned a response that could not be parsed: {message}")]
    ResponseParse {
        esp_name: String,
        message: String,
        response: Option<Value>,
    },

    #[error("All message recipients were rejected or invalid")]
    RecipientsRefused {
        esp_name: String,
        response: Option<Value>,
        payload: Option<Value>,
    },
}

impl SendError {
    pub fn unsupported(esp_name: impl Into<String>, feature: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            esp_name: esp_name.into(),
            feature: feature.into(),
        }
    }

    pub fn api(esp_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            esp_name: esp_name.into(),
            message: message.into(),
            status_code: None,
            response: None,
        }
    }

    pub fn parse(esp_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResponseParse {
            esp_name: esp_name.into(),
            message: message.into(),
            response: None,
        }
    }

    #[must_use]
    pub const fn is_recipients_refused(&self) -> bool {
        matches!(self, Self::RecipientsRefused { .. })
    }
}

#[derive(Error, Debug)]
pub enum EmailError {
    #[error(transparent)]
    Send(#[from] SendError),

    #[error("Email configuration error: {0}")]
    ConfigError(String),

    #[error("Send hook failed: {0}")]
    HookError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml_edit::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EmailError {
    /// Whether fail-silent mode may swallow this error.
    #[must_use]
    pub const fn is_anticipated(&self) -> bool {
        matches!(self, Self::Send(_))
    }

    pub fn hook(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::HookError(err.into())
    }
}
