//! SMTP transport using lettre

use super::MailTransport;
use crate::config::{SmtpConfig, TlsMode};
use crate::error::DeliveryError;
use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::Error as SmtpError;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

/// SMTP transport. Every send dials a fresh connection.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, SmtpError> {
        let builder = match config.tls {
            // Plain connection for local catchers (mailcatcher, Mailpit)
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?,
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
        };

        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        if config.has_credentials() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        info!(
            host = %config.host,
            port = config.port,
            tls = %config.tls,
            auth = config.has_credentials(),
            "SMTP transport configured"
        );

        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn classify(err: SmtpError) -> DeliveryError {
    if err.is_permanent() {
        DeliveryError::Rejected(err.to_string())
    } else {
        DeliveryError::Transport(err.to_string())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, message: Message) -> Result<(), DeliveryError> {
        let response = self.transport.send(message).await.map_err(classify)?;

        debug!(
            code = %response.code(),
            reply = %response.message().collect::<Vec<_>>().join(" "),
            "SMTP server accepted message"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}
