use thiserror::Error;

pub type StoryResult<T> = std::result::Result<T, StoryError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoryError {
    /// A timeline operation was attempted from a state that does not allow it.
    #[error("Invalid timeline transition: {0}")]
    InvalidTransition(String),

    #[error("Chapter index {index} out of range (timeline has {len} chapters)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Generated content failed validation.
    #[error("Malformed content: {0}")]
    MalformedContent(String),

    /// Transport or remote failure while generating content.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The backend refused to produce the requested text or image.
    #[error("Content blocked: {0}")]
    ContentBlocked(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Another mutating operation is already in flight for this session.
    #[error("Another operation is already in progress")]
    Busy,

    #[error("No active novel")]
    NoActiveNovel,

    #[error("Novel not found: {0}")]
    NotFound(String),

    /// The operation needs a signed-in reader.
    #[error("Sign-in required")]
    SignInRequired,

    /// Identity or billing collaborator failure.
    #[error("Account service failed: {0}")]
    Account(String),
}

impl StoryError {
    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedContent(msg.into())
    }

    /// Wraps an infrastructure error, keeping the full context chain.
    pub fn generation(err: anyhow::Error) -> Self {
        Self::Generation(format!("{:#}", err))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{:#}", err))
    }

    pub fn account(err: anyhow::Error) -> Self {
        Self::Account(format!("{:#}", err))
    }

    /// Contract violations (`InvalidTransition`, `IndexOutOfRange`) are not
    /// recoverable by retrying; everything else is.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StoryError::InvalidTransition(_) | StoryError::IndexOutOfRange { .. }
        )
    }

    /// The single message surfaced to the reader.
    pub fn user_message(&self) -> String {
        match self {
            StoryError::MalformedContent(_) | StoryError::Generation(_) => {
                "The story could not be continued right now. Please try again.".to_string()
            }
            StoryError::ContentBlocked(what) => {
                format!("That request was blocked: {}. Please try again.", what)
            }
            StoryError::Persistence(_) => {
                "Your progress could not be saved. Your current chapter is kept; retry saving."
                    .to_string()
            }
            StoryError::Busy => "Please wait for the current step to finish.".to_string(),
            StoryError::NoActiveNovel => "Start a story first.".to_string(),
            StoryError::NotFound(_) => "That story could not be found.".to_string(),
            StoryError::SignInRequired => "Please sign in to continue.".to_string(),
            StoryError::Account(_) => {
                "Your account data could not be synced. Please try again.".to_string()
            }
            StoryError::InvalidTransition(_) | StoryError::IndexOutOfRange { .. } => {
                format!("Internal error: {}", self)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_recoverable_split() {
        assert!(!StoryError::invalid_transition("x").is_recoverable());
        assert!(!StoryError::IndexOutOfRange { index: 3, len: 1 }.is_recoverable());
        assert!(StoryError::malformed("x").is_recoverable());
        assert!(StoryError::Persistence("disk".into()).is_recoverable());
    }

    #[test]
    fn test_generation_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = err.context("Gemini request failed").unwrap_err();
        let story_err = StoryError::generation(err);
        assert_eq!(
            story_err,
            StoryError::Generation("Gemini request failed: connection reset".to_string())
        );
    }
}
