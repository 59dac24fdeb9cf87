//! `MailProcessor` - turns queue records into deliveries
//!
//! Implements `stream_worker::RecordProcessor`: decodes the record value
//! into a [`MailEvent`], delivers it and maps the result to an [`Outcome`].

use crate::attachment::AttachmentSource;
use crate::delivery::DeliveryService;
use crate::models::MailEvent;
use crate::transport::MailTransport;
use async_trait::async_trait;
use std::sync::Arc;
use stream_worker::{DeliveryRecord, ErrorCategory, MetricsSink, Outcome, RecordProcessor};
use tracing::{debug, warn};

/// Counter of attachments left out of delivered mails
pub const ATTACHMENTS_SKIPPED: &str = "attachments_skipped_total";

/// Record processor that delivers mail events
pub struct MailProcessor<T: MailTransport, S: AttachmentSource> {
    delivery: DeliveryService<T, S>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T: MailTransport, S: AttachmentSource> MailProcessor<T, S> {
    pub fn new(delivery: DeliveryService<T, S>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { delivery, metrics }
    }

    pub fn delivery(&self) -> &DeliveryService<T, S> {
        &self.delivery
    }
}

#[async_trait]
impl<T, S> RecordProcessor for MailProcessor<T, S>
where
    T: MailTransport + 'static,
    S: AttachmentSource + 'static,
{
    async fn process(&self, record: &DeliveryRecord) -> Outcome {
        let event = match MailEvent::decode(&record.value) {
            Ok(event) => event,
            Err(e) => {
                warn!(key = %record.key, error = %e, "Undecodable mail event");
                return Outcome::dropped(format!("decode error: {e}"));
            }
        };

        match self.delivery.deliver(&event).await {
            Ok(report) => {
                for _ in &report.skipped {
                    self.metrics.incr(ATTACHMENTS_SKIPPED);
                }
                debug!(key = %record.key, attempt = record.attempt, "Record delivered");
                Outcome::Delivered
            }
            Err(e) => {
                warn!(
                    key = %record.key,
                    trace_id = event.trace_id.as_deref().unwrap_or_default(),
                    attempt = record.attempt,
                    error = %e,
                    "Delivery failed"
                );
                match e.category() {
                    ErrorCategory::Permanent => Outcome::dropped(e.to_string()),
                    ErrorCategory::Transient => Outcome::requeue(e.to_string()),
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "mail"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{DomainWhitelist, HttpAttachmentSource};
    use crate::config::{AttachmentConfig, SmtpConfig};
    use crate::models::{Attachment, Contact};
    use crate::transport::MockTransport;
    use stream_worker::RecordingSink;

    fn processor(
        transport: MockTransport,
        whitelist: DomainWhitelist,
    ) -> (MailProcessor<MockTransport, HttpAttachmentSource>, Arc<RecordingSink>) {
        let source = HttpAttachmentSource::new(&AttachmentConfig::default()).unwrap();
        let delivery = DeliveryService::new(&SmtpConfig::default(), transport, source, whitelist);
        let metrics = Arc::new(RecordingSink::new());
        (MailProcessor::new(delivery, metrics.clone()), metrics)
    }

    fn record(event: &MailEvent) -> DeliveryRecord {
        DeliveryRecord::new("key-1", event.encode().unwrap())
    }

    fn event() -> MailEvent {
        MailEvent::new(
            Contact::new("Alice", "alice@example.com"),
            Contact::new("Bob", "bob@example.com"),
            "Hi",
        )
        .with_html("<p>Hi</p>")
    }

    #[tokio::test]
    async fn test_delivered() {
        let transport = MockTransport::new();
        let (processor, _) = processor(transport.clone(), DomainWhitelist::disabled());

        assert_eq!(processor.process(&record(&event())).await, Outcome::Delivered);
        assert_eq!(transport.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_dropped() {
        let transport = MockTransport::new();
        let (processor, _) = processor(transport.clone(), DomainWhitelist::disabled());

        let outcome = processor
            .process(&DeliveryRecord::new("key-1", b"{not json".to_vec()))
            .await;

        assert!(matches!(outcome, Outcome::Dropped { .. }));
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues() {
        let (processor, _) = processor(MockTransport::unreachable(), DomainWhitelist::disabled());
        assert!(matches!(
            processor.process(&record(&event())).await,
            Outcome::Requeue { .. }
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_drops() {
        let (processor, _) = processor(MockTransport::rejecting(), DomainWhitelist::disabled());
        assert!(matches!(
            processor.process(&record(&event())).await,
            Outcome::Dropped { .. }
        ));
    }

    #[tokio::test]
    async fn test_skipped_attachments_are_counted() {
        let transport = MockTransport::new();
        let (processor, metrics) = processor(
            transport.clone(),
            DomainWhitelist::new(true, vec!["files.example.com".to_string()]),
        );

        let event = event()
            .with_attachment(Attachment::new("a.pdf", "https://evil.example.org/a.pdf"))
            .with_attachment(Attachment::new("b.pdf", "https://evil.example.org/b.pdf"));

        assert_eq!(processor.process(&record(&event)).await, Outcome::Delivered);
        assert_eq!(metrics.count(ATTACHMENTS_SKIPPED), 2);
    }
}
