use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("`{topic}` event rejected: {message}")]
    InvalidEvent {
        topic: &'static str,
        message: String,
    },
}

impl DomainError {
    pub fn invalid_event(topic: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidEvent {
            topic,
            message: message.into(),
        }
    }
}
