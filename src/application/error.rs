use thiserror::Error;

use crate::application::feed::FeedError;
use crate::application::repos::RepoError;
use crate::application::stream::StreamError;
use crate::domain::error::DomainError;
use crate::infra::error::InfraError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// The error and its sources, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = std::error::Error::source(self);
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::UserId;

    #[test]
    fn chain_walks_sources() {
        let viewer = UserId::new();
        let error = AppError::from(FeedError::Relationships {
            viewer,
            source: RepoError::Timeout,
        });

        let chain = error.chain();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].contains(&viewer.to_string()));
        assert_eq!(chain[1], "store timeout");
    }
}
