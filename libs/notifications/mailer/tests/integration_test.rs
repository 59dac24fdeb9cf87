//! Integration tests: HTTP ingestion through the queue to the transport

use axum::body::Body;
use axum::http::{Request, StatusCode};
use mailer::{
    ingest, Attachment, AttachmentConfig, Contact, DeliveryService, DomainWhitelist,
    HttpAttachmentSource, IngestState, MailEvent, MailProcessor, MockTransport, SmtpConfig,
};
use std::sync::Arc;
use std::time::Duration;
use stream_worker::metrics::names;
use stream_worker::{BatchProcessor, InMemoryQueue, QueueClient, RecordingSink, WorkerConfig};
use tokio::sync::watch;
use tower::ServiceExt;

fn worker_config() -> WorkerConfig {
    WorkerConfig::new("mail", "mail-processor")
        .with_retry_topic("mail-worker-queue")
        .with_dead_letter_topic("mail-dead-letter")
        .with_max_attempts(3)
        .with_retry_delay(Duration::from_millis(20), Duration::from_millis(100))
}

fn mail_processor(
    transport: MockTransport,
    smtp: SmtpConfig,
    metrics: Arc<RecordingSink>,
) -> MailProcessor<MockTransport, HttpAttachmentSource> {
    let attachments = AttachmentConfig::new().with_whitelist(["files.example.com"]);
    let source = HttpAttachmentSource::new(&attachments).unwrap();
    let delivery = DeliveryService::new(
        &smtp,
        transport,
        source,
        DomainWhitelist::from_config(&attachments),
    );
    MailProcessor::new(delivery, metrics)
}

async fn post(queue: &InMemoryQueue, body: Vec<u8>) -> StatusCode {
    ingest::router(IngestState::new(Arc::new(queue.clone()), "mail"))
        .oneshot(
            Request::post("/mail")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

async fn wait_for(metrics: &RecordingSink, name: &str, expected: u64) {
    for _ in 0..300 {
        if metrics.count(name) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{name} never reached {expected}");
}

fn event() -> MailEvent {
    MailEvent::new(
        Contact::new("Alice", "alice@example.com"),
        Contact::new("Bob", "bob@example.com").with_tracking_id("trk-1"),
        "Welcome",
    )
    .with_trace_id("trace-1")
    .with_html("<p>Welcome aboard</p>")
}

#[tokio::test]
async fn test_ingested_mail_is_delivered() {
    let queue = InMemoryQueue::with_partitions(2);
    let transport = MockTransport::new();
    let metrics = Arc::new(RecordingSink::new());
    let worker = BatchProcessor::new(
        Arc::new(queue.clone()),
        mail_processor(transport.clone(), SmtpConfig::default(), metrics.clone()),
        metrics.clone(),
        worker_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    // The blocked attachment is skipped, the mail still goes out
    let event = event().with_attachment(Attachment::new("x.exe", "https://evil.example.org/x.exe"));
    assert_eq!(post(&queue, event.encode().unwrap()).await, StatusCode::NO_CONTENT);

    wait_for(&metrics, names::PROCESSED, 1).await;

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["bob@example.com"]);
    assert!(sent[0].contains("Welcome aboard"));
    assert_eq!(metrics.count(names::ERRORS), 0);
    assert_eq!(metrics.count(mailer::processor::ATTACHMENTS_SKIPPED), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_smtp_retries_then_dead_letters() {
    let queue = InMemoryQueue::with_partitions(1);
    let transport = MockTransport::unreachable();
    let metrics = Arc::new(RecordingSink::new());
    let worker = BatchProcessor::new(
        Arc::new(queue.clone()),
        mail_processor(transport.clone(), SmtpConfig::default(), metrics.clone()),
        metrics.clone(),
        worker_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let encoded = event().encode().unwrap();
    assert_eq!(post(&queue, encoded.clone()).await, StatusCode::NO_CONTENT);

    wait_for(&metrics, names::DEAD_LETTERED, 1).await;

    assert_eq!(transport.attempts(), 3);
    let retried = queue.records("mail-worker-queue").await;
    assert_eq!(retried.len(), 2);
    assert!(retried.iter().all(|r| r.value == encoded));
    // 20ms then 40ms of backoff
    let due: Vec<u64> = retried.iter().map(|r| r.not_before.unwrap()).collect();
    assert!(due[1] >= due[0] + 40);

    let dead = queue.records("mail-dead-letter").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 3);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("connection refused"));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_undecodable_record_does_not_block_others() {
    let queue = InMemoryQueue::with_partitions(1);
    let transport = MockTransport::new();
    let metrics = Arc::new(RecordingSink::new());

    queue
        .publish("mail", &stream_worker::DeliveryRecord::new("bad", b"garbage".to_vec()))
        .await
        .unwrap();
    assert_eq!(post(&queue, event().encode().unwrap()).await, StatusCode::NO_CONTENT);

    let worker = BatchProcessor::new(
        Arc::new(queue.clone()),
        mail_processor(transport.clone(), SmtpConfig::default(), metrics.clone()),
        metrics.clone(),
        worker_config(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    wait_for(&metrics, names::PROCESSED, 2).await;

    assert_eq!(transport.sent_count().await, 1);
    assert_eq!(metrics.count(names::DROPPED), 1);
    assert_eq!(queue.records("mail-dead-letter").await[0].key, "bad");
    assert!(queue.records("mail-worker-queue").await.is_empty());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_disabled_delivery_commits_without_sending() {
    let queue = InMemoryQueue::with_partitions(1);
    let transport = MockTransport::new();
    let metrics = Arc::new(RecordingSink::new());
    let worker = BatchProcessor::new(
        Arc::new(queue.clone()),
        mail_processor(
            transport.clone(),
            SmtpConfig::default().with_enabled(false),
            metrics.clone(),
        ),
        metrics.clone(),
        worker_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    assert_eq!(post(&queue, event().encode().unwrap()).await, StatusCode::NO_CONTENT);
    wait_for(&metrics, names::PROCESSED, 1).await;

    assert_eq!(transport.attempts(), 0);
    assert_eq!(metrics.count(names::ERRORS), 0);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
