//! Observer hooks around each send.

use tracing::{debug, warn};

use crate::error::EmailError;
use crate::types::{EmailMessage, SendStatus};

/// What a pre-send hook decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreSend {
    Proceed,
    /// Skip this message without raising an error.
    Cancel,
}

type PreSendHook = Box<dyn Fn(&mut EmailMessage, &str) -> Result<PreSend, EmailError> + Send + Sync>;
type PostSendHook =
    Box<dyn Fn(&EmailMessage, &SendStatus, &str) -> Result<(), EmailError> + Send + Sync>;

/// Hooks run synchronously, in registration order.
#[derive(Default)]
pub struct SendSignals {
    pre_send: Vec<PreSendHook>,
    post_send: Vec<PostSendHook>,
}

impl SendSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook that may edit the message or cancel its send.
    pub fn on_pre_send(
        &mut self,
        hook: impl Fn(&mut EmailMessage, &str) -> Result<PreSend, EmailError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.pre_send.push(Box::new(hook));
        self
    }

    pub fn on_post_send(
        &mut self,
        hook: impl Fn(&EmailMessage, &SendStatus, &str) -> Result<(), EmailError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.post_send.push(Box::new(hook));
        self
    }

    /// Returns `false` once any hook cancels; later hooks don't run.
    pub fn run_pre_send(&self, message: &mut EmailMessage, esp_name: &str) -> Result<bool, EmailError> {
        for hook in &self.pre_send {
            if hook(message, esp_name)? == PreSend::Cancel {
                debug!("Send cancelled by pre_send hook");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs every hook even if some fail, then returns the first failure.
    pub fn run_post_send(
        &self,
        message: &EmailMessage,
        status: &SendStatus,
        esp_name: &str,
    ) -> Result<(), EmailError> {
        let mut errors: Vec<EmailError> = self
            .post_send
            .iter()
            .filter_map(|hook| hook(message, status, esp_name).err())
            .collect();

        if errors.is_empty() {
            return Ok(());
        }
        for extra in &errors[1..] {
            warn!("Additional post_send hook failure: {}", extra);
        }
        Err(errors.swap_remove(0))
    }
}

impl std::fmt::Debug for SendSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendSignals")
            .field("pre_send", &self.pre_send.len())
            .field("post_send", &self.post_send.len())
            .finish()
    }
}
