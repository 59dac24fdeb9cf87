//! Mail delivery library
//!
//! Everything between "an event arrived over HTTP" and "an SMTP server
//! accepted the message", on top of the `stream-worker` queue plumbing.
//!
//! ## Components
//!
//! - **Model**: `MailEvent`, `Contact`, `Attachment` and their JSON wire form
//! - **Attachments**: `DomainWhitelist` gate and `HttpAttachmentSource` fetcher
//! - **Delivery**: `DeliveryService` over a `MailTransport` (SMTP via lettre, or mock)
//! - **Processing**: `MailProcessor`, the `RecordProcessor` run by `BatchProcessor`
//! - **Ingestion**: `POST /mail` router
//!
//! ## Usage
//!
//! ```ignore
//! use mailer::{DeliveryService, DomainWhitelist, HttpAttachmentSource, MailProcessor, SmtpTransport};
//!
//! let transport = SmtpTransport::new(&smtp)?;
//! let source = HttpAttachmentSource::new(&attachments)?;
//! let delivery = DeliveryService::new(&smtp, transport, source, DomainWhitelist::from_config(&attachments));
//! let worker = BatchProcessor::new(queue, MailProcessor::new(delivery, metrics.clone()), metrics, worker_config);
//! worker.run(shutdown_rx).await;
//! ```

pub mod attachment;
pub mod config;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod models;
pub mod processor;
pub mod transport;

pub use attachment::{AttachmentSource, DomainWhitelist, FetchedAttachment, HttpAttachmentSource};
pub use config::{AttachmentConfig, SmtpConfig, TlsMode};
pub use delivery::{format_mailbox, DeliveryReport, DeliveryService};
pub use error::{AttachmentError, DeliveryError, FetchError};
pub use ingest::{IngestError, IngestState};
pub use models::{Attachment, Contact, MailEvent};
pub use processor::MailProcessor;
pub use transport::{MailTransport, MockTransport, SmtpTransport};
