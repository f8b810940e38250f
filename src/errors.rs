use thiserror::Error;

use crate::messaging::source::SourceError;
use crate::storage::store::TokenStoreError;

/// Failure raised by a user-supplied event validator or batch processor.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Cause attached to a work package abort.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("token store operation failed: {0}")]
    TokenStore(#[from] TokenStoreError),
    #[error("event handler failed: {0}")]
    Handler(#[from] HandlerError),
    #[error("event stream failed: {0}")]
    Source(#[from] SourceError),
}
