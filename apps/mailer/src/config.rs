//! Configuration for the mailer service

use clap::ValueEnum;
use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::{env_or_default, env_parse, ConfigError, FromEnv};
use mailer::{AttachmentConfig, SmtpConfig};
use std::str::FromStr;
use std::time::Duration;
use stream_worker::{QueueConfig, WorkerConfig};

/// Which halves of the pipeline this process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Ingestion endpoint and delivery workers
    #[default]
    All,
    /// Only `POST /mail`
    Ingest,
    /// Only the delivery workers
    Worker,
}

impl Role {
    pub fn accepts_mail(&self) -> bool {
        matches!(self, Role::All | Role::Ingest)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueBackend {
    #[default]
    Redis,
    /// In-process queue, nothing survives a restart
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown queue backend '{other}', expected redis|memory")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: QueueBackend,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub smtp: SmtpConfig,
    pub attachments: AttachmentConfig,
    /// How long in-flight batches may take to finish after a shutdown signal
    pub shutdown_grace: Duration,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env()?,
            backend: env_parse("QUEUE_BACKEND", QueueBackend::Redis)?,
            redis: RedisConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
            smtp: SmtpConfig::from_env()?,
            attachments: AttachmentConfig::from_env()?,
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30)?),
        })
    }
}

/// Service name reported by `/health`
pub fn app_name() -> String {
    env_or_default("APP_NAME", env!("CARGO_PKG_NAME"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_capabilities() {
        assert!(Role::All.accepts_mail() && Role::All.runs_worker());
        assert!(Role::Ingest.accepts_mail() && !Role::Ingest.runs_worker());
        assert!(!Role::Worker.accepts_mail() && Role::Worker.runs_worker());
    }

    #[test]
    fn test_queue_backend_parse() {
        assert_eq!("redis".parse::<QueueBackend>(), Ok(QueueBackend::Redis));
        assert_eq!("Memory".parse::<QueueBackend>(), Ok(QueueBackend::Memory));
        assert!("kafka".parse::<QueueBackend>().is_err());
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("QUEUE_BACKEND", Some("memory")),
                ("PORT", Some("8080")),
                ("SHUTDOWN_GRACE_SECS", Some("5")),
                ("QUEUE_INBOUND_TOPIC", None),
                ("SMTP_HOST", None),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.backend, QueueBackend::Memory);
                assert_eq!(config.server.port, 8080);
                assert_eq!(config.shutdown_grace, Duration::from_secs(5));
                assert_eq!(config.worker.inbound_topic, "mail");
                assert_eq!(config.smtp.host, "mailcatcher");
            },
        );
    }

    #[test]
    fn test_invalid_backend_names_key() {
        temp_env::with_var("QUEUE_BACKEND", Some("kafka"), || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_BACKEND"));
        });
    }
}
