//! Delivery service: formats one mail event and hands it to the transport.
//!
//! The service never retries on its own. A failure is returned to the
//! caller, which decides (via [`DeliveryError::category`]) whether the
//! event goes back on the queue.

use crate::attachment::{AttachmentSource, DomainWhitelist};
use crate::config::SmtpConfig;
use crate::error::DeliveryError;
use crate::models::{Contact, MailEvent};
use crate::transport::MailTransport;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as AttachmentPart, Mailbox, MultiPart, SinglePart};
use lettre::{Address, Message};
use tracing::{debug, info, warn};

const OCTET_STREAM: &str = "application/octet-stream";

/// What happened to one delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// False when delivery is disabled
    pub sent: bool,
    /// Names of the attachments included in the message
    pub attached: Vec<String>,
    /// Names of the attachments left out (rejected or unreachable)
    pub skipped: Vec<String>,
}

/// Build a mailbox from a display name and an address.
///
/// The address must be valid. A display name that breaks the
/// `"Name <email>"` form degrades to the bare address.
pub fn format_mailbox(
    field: &'static str,
    name: &str,
    email: &str,
) -> Result<Mailbox, DeliveryError> {
    let address: Address = email
        .trim()
        .parse()
        .map_err(|_| DeliveryError::InvalidAddress {
            field,
            address: email.to_string(),
        })?;

    if name.trim().is_empty() {
        return Ok(Mailbox::new(None, address));
    }

    match format!("{} <{}>", name, address).parse::<Mailbox>() {
        Ok(mailbox) => Ok(mailbox),
        Err(e) => {
            debug!(field, name = %name, error = %e, "Display name unusable, sending to bare address");
            Ok(Mailbox::new(None, address))
        }
    }
}

fn content_type(served: Option<&str>) -> Result<ContentType, DeliveryError> {
    match served.and_then(|raw| ContentType::parse(raw).ok()) {
        Some(content_type) => Ok(content_type),
        None => ContentType::parse(OCTET_STREAM).map_err(|e| DeliveryError::Build(e.to_string())),
    }
}

/// Sends mail events through a [`MailTransport`], fetching attachments
/// from an [`AttachmentSource`] behind a [`DomainWhitelist`].
pub struct DeliveryService<T: MailTransport, S: AttachmentSource> {
    transport: T,
    source: S,
    whitelist: DomainWhitelist,
    enabled: bool,
    default_sender: Contact,
}

impl<T: MailTransport, S: AttachmentSource> DeliveryService<T, S> {
    pub fn new(config: &SmtpConfig, transport: T, source: S, whitelist: DomainWhitelist) -> Self {
        Self {
            transport,
            source,
            whitelist,
            enabled: config.enabled,
            default_sender: Contact::new(&config.from_name, &config.from_address),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Deliver one event.
    ///
    /// Rejected or unreachable attachments are skipped. If every attachment
    /// that passed the whitelist failed to download, the delivery fails
    /// transiently instead of sending a mail without them.
    pub async fn deliver(&self, event: &MailEvent) -> Result<DeliveryReport, DeliveryError> {
        let trace_id = event.trace_id.as_deref().unwrap_or_default();

        if !self.enabled {
            debug!(trace_id, "Delivery disabled, skipping event");
            return Ok(DeliveryReport::default());
        }

        let sender = if event.sender.email.trim().is_empty() {
            &self.default_sender
        } else {
            &event.sender
        };
        let from = format_mailbox("sender", &sender.name, &sender.email)?;
        let to = format_mailbox("recipient", &event.recipient.name, &event.recipient.email)?;

        let mut report = DeliveryReport::default();
        let mut parts = Vec::new();
        let mut failed = 0;

        for attachment in &event.attachments {
            if let Err(e) = self.whitelist.check(&attachment.url) {
                warn!(
                    trace_id,
                    attachment = %attachment.name,
                    url = %attachment.url,
                    error = %e,
                    "Attachment rejected by whitelist"
                );
                report.skipped.push(attachment.name.clone());
                continue;
            }

            match self.source.fetch(&attachment.url).await {
                Ok(fetched) => {
                    let content_type = content_type(fetched.content_type.as_deref())?;
                    parts.push(
                        AttachmentPart::new(attachment.name.clone()).body(fetched.bytes, content_type),
                    );
                    report.attached.push(attachment.name.clone());
                }
                Err(e) => {
                    warn!(
                        trace_id,
                        attachment = %attachment.name,
                        url = %attachment.url,
                        error = %e,
                        "Failed to fetch attachment"
                    );
                    failed += 1;
                    report.skipped.push(attachment.name.clone());
                }
            }
        }

        if failed > 0 && parts.is_empty() {
            return Err(DeliveryError::AttachmentsUnavailable { failed });
        }

        let html = SinglePart::html(String::from_utf8_lossy(&event.payload).into_owned());
        let builder = Message::builder()
            .from(from)
            .to(to)
            .subject(event.subject.as_str());

        let message = if parts.is_empty() {
            builder.singlepart(html)?
        } else {
            let body = parts
                .into_iter()
                .fold(MultiPart::mixed().singlepart(html), |body, part| body.singlepart(part));
            builder.multipart(body)?
        };

        self.transport.send(message).await?;

        info!(
            trace_id,
            transport = self.transport.name(),
            recipient = %event.recipient.email,
            tracking_id = %event.recipient.tracking_id,
            attached = report.attached.len(),
            skipped = report.skipped.len(),
            "Mail delivered"
        );

        report.sent = true;
        Ok(report)
    }
}
