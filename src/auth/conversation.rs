//! Challenge/response conversation with the authentication backend
//!
//! The backend hands over a batch of messages and expects one answer per
//! prompt. Prompts never say which field they want, so the answer is chosen
//! by message kind: a secret prompt gets the password, a text prompt gets the
//! username (the only non-secret field available). Error and info text is
//! forwarded to a [`MessageSink`] and produces no answer.

use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::Credential;

/// Message styles as numbered by Linux-PAM
pub mod style {
    pub const PROMPT_ECHO_OFF: i32 = 1;
    pub const PROMPT_ECHO_ON: i32 = 2;
    pub const ERROR_MSG: i32 = 3;
    pub const TEXT_INFO: i32 = 4;
}

/// One message in a backend conversation batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationMessage {
    /// Prompt whose answer must not be echoed (password)
    SecretPrompt(String),
    /// Prompt whose answer may be echoed (username)
    TextPrompt(String),
    /// Error text for the user
    ErrorText(String),
    /// Informational text for the user
    InfoText(String),
}

impl ConversationMessage {
    /// Decode a backend message by its numeric style
    pub fn from_style(style: i32, text: String) -> Result<Self, ConversationError> {
        match style {
            style::PROMPT_ECHO_OFF => Ok(Self::SecretPrompt(text)),
            style::PROMPT_ECHO_ON => Ok(Self::TextPrompt(text)),
            style::ERROR_MSG => Ok(Self::ErrorText(text)),
            style::TEXT_INFO => Ok(Self::InfoText(text)),
            other => Err(ConversationError::UnknownStyle(other)),
        }
    }

    /// Literal text supplied by the backend
    pub fn text(&self) -> &str {
        match self {
            Self::SecretPrompt(t) | Self::TextPrompt(t) | Self::ErrorText(t) | Self::InfoText(t) => t,
        }
    }

    /// Whether this message takes an answer slot
    pub fn is_prompt(&self) -> bool {
        matches!(self, Self::SecretPrompt(_) | Self::TextPrompt(_))
    }
}

/// Answer to a single prompt. Zeroed when dropped.
pub struct Answer(Zeroizing<String>);

impl Answer {
    fn new(value: &str) -> Self {
        Self(Zeroizing::new(value.to_owned()))
    }

    /// Answer text, to be copied straight into the backend's buffer
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Answer(<redacted>)")
    }
}

/// Conversation failure; aborts the whole batch
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationError {
    /// Backend sent no messages
    #[error("empty conversation batch")]
    EmptyBatch,

    /// Answer storage could not be allocated
    #[error("failed to allocate conversation answers")]
    Allocation,

    /// Backend sent a message kind we do not understand
    #[error("unknown conversation message style: {0}")]
    UnknownStyle(i32),
}

/// Display collaborator for backend error/info text
pub trait MessageSink: Send + Sync {
    /// Show error text from the backend
    fn show_error(&self, text: &str);

    /// Show informational text from the backend
    fn show_info(&self, text: &str);
}

/// Message sink that writes backend text to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessageSink;

impl MessageSink for TracingMessageSink {
    fn show_error(&self, text: &str) {
        warn!("Backend error: {}", text);
    }

    fn show_info(&self, text: &str) {
        info!("Backend info: {}", text);
    }
}

/// Answers backend prompts from the credential of the current transaction
///
/// Holds only borrows; it lives on the authenticator's stack for exactly one
/// transaction and keeps nothing between batches.
pub struct ConversationBridge<'a> {
    credential: &'a Credential,
    sink: &'a dyn MessageSink,
}

impl<'a> ConversationBridge<'a> {
    pub fn new(credential: &'a Credential, sink: &'a dyn MessageSink) -> Self {
        Self { credential, sink }
    }

    /// Answer one batch, in message order
    ///
    /// The returned vector holds one answer per prompt; text messages are
    /// forwarded to the sink and take no slot.
    pub fn respond(&self, batch: &[ConversationMessage]) -> Result<Vec<Answer>, ConversationError> {
        if batch.is_empty() {
            return Err(ConversationError::EmptyBatch);
        }

        let prompts = batch.iter().filter(|m| m.is_prompt()).count();
        let mut answers = Vec::new();
        answers
            .try_reserve_exact(prompts)
            .map_err(|_| ConversationError::Allocation)?;

        for message in batch {
            match message {
                ConversationMessage::SecretPrompt(_) => {
                    answers.push(Answer::new(self.credential.secret()));
                }
                ConversationMessage::TextPrompt(prompt) => {
                    debug!("Answering text prompt {:?} with username", prompt);
                    answers.push(Answer::new(self.credential.username()));
                }
                ConversationMessage::ErrorText(text) => self.sink.show_error(text),
                ConversationMessage::InfoText(text) => self.sink.show_info(text),
            }
        }

        Ok(answers)
    }
}
