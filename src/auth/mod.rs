//! Authentication stack
//!
//! [`AuthBackend`] / [`AuthHandle`] abstract a PAM-like stack: one handle
//! per authenticate -> establish credentials -> open session cycle.
//! [`AuthSession`] drives that cycle and tracks its state.

pub mod pam;
mod session;

use anyhow::Result;
use log::{info, warn};
use zeroize::Zeroizing;

pub use pam::PamBackend;
pub use session::{AuthEvent, AuthSession, AuthState};

/// Message styles the stack may send during a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStyle {
    /// Hidden input (password)
    PromptEchoOff,
    /// Visible input
    PromptEchoOn,
    ErrorMsg,
    TextInfo,
}

/// Headless conversation: answers hidden prompts with a pre-supplied secret
pub struct Conversation {
    secret: Zeroizing<String>,
}

impl Conversation {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: Zeroizing::new(secret.unwrap_or_default().to_string()),
        }
    }

    /// Answer one message. None means "no answer" (empty response).
    pub fn respond(&self, style: MessageStyle, message: &str) -> Option<Zeroizing<String>> {
        match style {
            MessageStyle::PromptEchoOff => Some(self.secret.clone()),
            MessageStyle::PromptEchoOn => None,
            MessageStyle::ErrorMsg => {
                warn!("auth: {}", message);
                None
            }
            MessageStyle::TextInfo => {
                info!("auth: {}", message);
                None
            }
        }
    }
}

/// One live authentication transaction
pub trait AuthHandle {
    /// Verify the user's credentials
    fn authenticate(&mut self) -> Result<()>;
    fn establish_credentials(&mut self) -> Result<()>;
    fn open_session(&mut self) -> Result<()>;
    fn close_session(&mut self) -> Result<()>;
    fn putenv(&mut self, key: &str, value: &str) -> Result<()>;

    /// Terminal the session runs on
    fn set_tty(&mut self, _tty: &str) -> Result<()> {
        Ok(())
    }

    /// The stack's environment list in its own order
    fn environment(&self) -> Vec<(String, String)>;
}

/// Factory for [`AuthHandle`]s
pub trait AuthBackend {
    fn begin(
        &self,
        service: &str,
        username: &str,
        conversation: Conversation,
    ) -> Result<Box<dyn AuthHandle>>;
}
