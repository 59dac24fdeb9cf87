//! Mail transports

pub mod mock;
pub mod smtp;

pub use mock::{MockTransport, SentMessage};
pub use smtp::SmtpTransport;

use crate::error::DeliveryError;
use async_trait::async_trait;
use lettre::Message;

/// Hands a fully built message to a mail server
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send one message. Errors must say whether a retry can help
    /// (`DeliveryError::Transport`) or not (`DeliveryError::Rejected`).
    async fn send(&self, message: Message) -> Result<(), DeliveryError>;

    /// Transport name for logging
    fn name(&self) -> &'static str;
}
