//! Mock transport for testing

use super::MailTransport;
use crate::error::DeliveryError;
use async_trait::async_trait;
use lettre::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A message captured by [`MockTransport`]
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub from: Option<String>,
    pub to: Vec<String>,
    /// Full RFC 5322 text as it would go on the wire
    pub raw: String,
}

impl SentMessage {
    pub fn contains(&self, needle: &str) -> bool {
        self.raw.contains(needle)
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Unreachable,
    Rejecting,
}

/// Transport that captures messages instead of sending them
#[derive(Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    attempts: Arc<AtomicUsize>,
    failure: Option<Failure>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails with a transient connection error
    pub fn unreachable() -> Self {
        Self {
            failure: Some(Failure::Unreachable),
            ..Self::default()
        }
    }

    /// Every send is refused with a permanent 5xx reply
    pub fn rejecting() -> Self {
        Self {
            failure: Some(Failure::Rejecting),
            ..Self::default()
        }
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Number of send calls, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn send(&self, message: Message) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match self.failure {
            Some(Failure::Unreachable) => {
                return Err(DeliveryError::Transport("connection refused".to_string()))
            }
            Some(Failure::Rejecting) => {
                return Err(DeliveryError::Rejected("550 mailbox unavailable".to_string()))
            }
            None => {}
        }

        let envelope = message.envelope();
        let sent = SentMessage {
            from: envelope.from().map(ToString::to_string),
            to: envelope.to().iter().map(ToString::to_string).collect(),
            raw: String::from_utf8_lossy(&message.formatted()).into_owned(),
        };
        self.sent.lock().await.push(sent);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lettre::message::Mailbox;

    fn message() -> Message {
        Message::builder()
            .from("alice@example.com".parse::<Mailbox>().unwrap())
            .to("bob@example.com".parse::<Mailbox>().unwrap())
            .subject("Test Subject")
            .body(String::from("Test body"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_mock_captures_message() {
        let transport = MockTransport::new();
        transport.send(message()).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from.as_deref(), Some("alice@example.com"));
        assert_eq!(sent[0].to, vec!["bob@example.com"]);
        assert!(sent[0].contains("Subject: Test Subject"));
    }

    #[tokio::test]
    async fn test_mock_failure_modes() {
        let unreachable = MockTransport::unreachable();
        assert!(!unreachable.send(message()).await.unwrap_err().is_permanent());
        assert_eq!(unreachable.attempts(), 1);
        assert_eq!(unreachable.sent_count().await, 0);

        let rejecting = MockTransport::rejecting();
        assert!(rejecting.send(message()).await.unwrap_err().is_permanent());
    }
}
