//! Error types for mail delivery.

use stream_worker::ErrorCategory;
use thiserror::Error;

/// Attachment rejected by the whitelist gate
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),

    #[error("invalid attachment url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Failure while downloading attachment bytes
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("attachment host answered {0}")]
    Status(u16),

    #[error("attachment exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

/// Errors surfaced by the delivery service.
///
/// Every variant is either transient (worth a retry through the queue) or
/// permanent (retrying cannot succeed); see [`DeliveryError::category`].
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid {field} address {address:?}")]
    InvalidAddress { field: &'static str, address: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("smtp server rejected the message: {0}")]
    Rejected(String),

    #[error("smtp transport error: {0}")]
    Transport(String),

    #[error("none of the {failed} attachments could be fetched")]
    AttachmentsUnavailable { failed: usize },
}

impl DeliveryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidAddress { .. } | Self::Build(_) | Self::Rejected(_) => {
                ErrorCategory::Permanent
            }
            Self::Transport(_) | Self::AttachmentsUnavailable { .. } => ErrorCategory::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.category() == ErrorCategory::Permanent
    }
}

impl From<lettre::error::Error> for DeliveryError {
    fn from(err: lettre::error::Error) -> Self {
        Self::Build(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let invalid = DeliveryError::InvalidAddress {
            field: "recipient",
            address: "nope".into(),
        };
        assert!(invalid.is_permanent());
        assert!(DeliveryError::Rejected("550 no such user".into()).is_permanent());
        assert!(!DeliveryError::Transport("connection refused".into()).is_permanent());
        assert_eq!(
            DeliveryError::AttachmentsUnavailable { failed: 2 }.category(),
            ErrorCategory::Transient
        );
    }
}
