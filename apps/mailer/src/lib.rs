//! Mailer Service
//!
//! Accepts mail events over HTTP and delivers them over SMTP, with a
//! partitioned queue in between.
//!
//! ## Architecture
//!
//! ```text
//! POST /mail
//!   ↓ (publish, fresh key)
//! Queue topic "mail" (Redis Streams, N partitions)
//!   ↓ (consumer group "mail-processor", one loop per partition)
//! BatchProcessor<MailProcessor>
//!   ↓ (whitelist gate, attachment fetch)
//! DeliveryService → SMTP
//!   ↓ on failure
//! "mail-worker-queue" (retry) or "mail-dead-letter"
//! ```
//!
//! The process runs the ingestion endpoint, the workers, or both
//! (`--role` / `MAILER_ROLE`). Health and metrics are always served.

pub mod config;

use axum::Router;
use clap::Parser;
use config::{Config, QueueBackend, Role};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use mailer::{
    ingest, DeliveryService, DomainWhitelist, HttpAttachmentSource, IngestState, MailProcessor,
    SmtpTransport,
};
use std::sync::Arc;
use stream_worker::{
    health_router, BatchProcessor, HealthState, InMemoryQueue, MetricsSink, PrometheusSink,
    QueueClient, RecordProcessor, RedisQueue,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "mailer")]
#[command(about = "Queue-backed mail delivery service", version)]
pub struct Cli {
    /// Which part of the pipeline to run
    #[arg(long, env = "MAILER_ROLE", value_enum, default_value_t = Role::All)]
    pub role: Role,
}

/// HTTP surface: health and metrics, plus `POST /mail` when `ingest` is set
pub fn app(health: HealthState, ingest: Option<IngestState>) -> Router {
    let mut router = health_router(health);
    if let Some(state) = ingest {
        router = router.merge(ingest::router(state));
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    )
}

async fn connect_queue(config: &Config) -> Result<Arc<dyn QueueClient>> {
    match config.backend {
        QueueBackend::Redis => {
            info!(url = %config.redis.url, "Connecting to Redis...");
            let queue = RedisQueue::connect(&config.redis.url, config.queue.clone())
                .await
                .wrap_err("Failed to connect to Redis")?;
            info!("Connected to Redis successfully");
            Ok(Arc::new(queue))
        }
        QueueBackend::Memory => {
            warn!("Using the in-memory queue, queued mail is lost on restart");
            Ok(Arc::new(InMemoryQueue::new(&config.queue)))
        }
    }
}

fn build_processor(
    config: &Config,
    metrics: Arc<dyn MetricsSink>,
) -> Result<MailProcessor<SmtpTransport, HttpAttachmentSource>> {
    let transport =
        SmtpTransport::new(&config.smtp).wrap_err("Failed to configure SMTP transport")?;
    let source = HttpAttachmentSource::new(&config.attachments)
        .wrap_err("Failed to build attachment client")?;
    let whitelist = DomainWhitelist::from_config(&config.attachments);

    if !config.smtp.enabled {
        warn!("SMTP delivery disabled, consumed mail is acknowledged without sending");
    } else if config.smtp.uses_placeholder_sender() {
        warn!(
            from = %config.smtp.from_address,
            "EMAIL_FROM_ADDRESS not set, mail without a sender goes out from a placeholder address most relays reject"
        );
    }

    let delivery = DeliveryService::new(&config.smtp, transport, source, whitelist);
    Ok(MailProcessor::new(delivery, metrics))
}

/// Run the mailer service
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Installs the Prometheus recorder
/// 3. Connects the queue backend
/// 4. Starts the HTTP server and, depending on the role, the workers
/// 5. On SIGINT/SIGTERM stops accepting requests, closes the queue and
///    waits up to the grace window for in-flight batches
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    info!(role = ?cli.role, environment = ?environment, "Starting mailer service");

    let queue = connect_queue(&config).await?;

    let metrics = Arc::new(
        PrometheusSink::install("mailer", "mail")
            .wrap_err("Failed to install Prometheus recorder")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handle = None;

    if cli.role.runs_worker() {
        let processor = build_processor(&config, metrics.clone())?;
        info!(
            processor = processor.name(),
            topics = ?config.worker.consumed_topics(),
            group = %config.worker.consumer_group,
            partitions = config.queue.partitions,
            max_attempts = config.worker.max_attempts,
            "Starting delivery workers"
        );

        let worker = BatchProcessor::new(
            queue.clone(),
            processor,
            metrics.clone(),
            config.worker.clone(),
        );
        let rx = shutdown_rx.clone();
        worker_handle = Some(tokio::spawn(async move { worker.run(rx).await }));
    }

    let health = HealthState::new(queue.clone(), config::app_name(), env!("CARGO_PKG_VERSION"))
        .with_metrics(metrics.handle().clone());
    let ingest = cli
        .role
        .accepts_mail()
        .then(|| IngestState::new(queue.clone(), config.worker.inbound_topic.clone()));

    let address = config.server.address();
    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP server to {}", address))?;
    info!(address = %address, ingest = cli.role.accepts_mail(), "HTTP server listening");

    let mut server_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app(health, ingest))
            .with_graceful_shutdown(async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    shutdown_signal().await;

    shutdown_tx.send_replace(true);
    queue.close();

    let drain = async {
        match server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }
        if let Some(handle) = worker_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    };

    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "Grace period elapsed, forcing shutdown"
        );
    }

    info!("Mailer service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
