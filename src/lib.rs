pub mod config;
pub mod convert;
pub mod defaults;
pub mod error;
pub mod payload;
pub mod providers;
pub mod rules;
pub mod send;
pub mod signals;
pub mod types;

pub use config::{EmailConfig, EmailProviderConfig, SesConfig};
pub use defaults::SendDefaults;
pub use error::{EmailError, SendError};
pub use payload::{Payload, PayloadBuilder, PayloadContext};
pub use send::{DynMailSender, EmailBackend, MailSender, Mailer, SessionOptions};
pub use signals::{PreSend, SendSignals};
pub use types::*;

use providers::{null::NullBackend, ses::SesBackend};

/// Builds a mailer for the provider named in `config`.
pub fn create_mailer(config: &EmailConfig) -> Result<DynMailSender, EmailError> {
    match &config.provider {
        EmailProviderConfig::Ses(ses_config) => {
            let backend = SesBackend::new(ses_config.clone());
            let options = config.session_options(backend.esp_name())?;
            Ok(Box::new(Mailer::new(backend, options)))
        }
        EmailProviderConfig::Null => {
            let backend = NullBackend::new();
            let options = config.session_options(backend.esp_name())?;
            Ok(Box::new(Mailer::new(backend, options)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_null_mailer() {
        let config = EmailConfig::from_toml_str("provider = \"null\"\n").unwrap();
        let mut mailer = create_mailer(&config).unwrap();
        assert_eq!(mailer.esp_name(), "Null");

        let mut messages = vec![
            EmailMessage::new("user@example.com", "noreply@example.com", "Hello").with_text("Hi"),
        ];
        assert_eq!(mailer.send_messages(&mut messages).await.unwrap(), 1);
    }

    #[test]
    fn test_create_ses_mailer() {
        let config =
            EmailConfig::from_toml_str("provider = \"ses\"\nregion = \"us-east-1\"\n").unwrap();
        let mailer = create_mailer(&config).unwrap();
        assert_eq!(mailer.esp_name(), "Amazon SES");
    }
}
