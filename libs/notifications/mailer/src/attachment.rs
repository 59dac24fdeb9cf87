//! Attachment whitelist gate and HTTP fetcher

use crate::config::AttachmentConfig;
use crate::error::{AttachmentError, FetchError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use tracing::debug;

/// Exact host-name allow-list for attachment URLs
#[derive(Debug, Clone, Default)]
pub struct DomainWhitelist {
    enabled: bool,
    domains: Vec<String>,
}

impl DomainWhitelist {
    pub fn new(enabled: bool, domains: Vec<String>) -> Self {
        Self { enabled, domains }
    }

    /// A whitelist that lets everything through
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AttachmentConfig) -> Self {
        Self::new(config.whitelist_enabled, config.whitelist.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Case-sensitive exact match of the URL host. Ports are ignored.
    pub fn check(&self, url: &str) -> Result<(), AttachmentError> {
        if !self.enabled {
            return Ok(());
        }

        let parsed = Url::parse(url).map_err(|e| AttachmentError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().ok_or_else(|| AttachmentError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;

        if self.domains.iter().any(|d| d == host) {
            Ok(())
        } else {
            Err(AttachmentError::DomainNotAllowed(host.to_string()))
        }
    }
}

/// Downloaded attachment body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAttachment {
    pub bytes: Vec<u8>,
    /// `Content-Type` served by the host, if any
    pub content_type: Option<String>,
}

/// Source of attachment bytes
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, FetchError>;
}

/// Fetches attachments with HTTP GET
#[derive(Clone)]
pub struct HttpAttachmentSource {
    client: Client,
    max_bytes: Option<u64>,
}

impl HttpAttachmentSource {
    pub fn new(config: &AttachmentConfig) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(config.fetch_timeout).build()?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    fn check_size(&self, size: u64) -> Result<(), FetchError> {
        match self.max_bytes {
            Some(limit) if size > limit => Err(FetchError::TooLarge { limit }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl AttachmentSource for HttpAttachmentSource {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, FetchError> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // The declared length can lie, count while reading
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            self.check_size((bytes.len() + chunk.len()) as u64)?;
            bytes.extend_from_slice(&chunk);
        }

        debug!(url = %url, size = bytes.len(), "Attachment fetched");

        Ok(FetchedAttachment {
            bytes,
            content_type,
        })
    }
}
