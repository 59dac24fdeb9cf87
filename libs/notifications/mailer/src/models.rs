//! Mail event carried end-to-end through the queue

use serde::{Deserialize, Serialize};

/// A party of the mail, either sender or recipient
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    pub name: String,
    pub email: String,
    /// Opaque identifier used by upstream systems to correlate opens and clicks
    pub tracking_id: String,
}

impl Contact {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            tracking_id: String::new(),
        }
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = tracking_id.into();
        self
    }
}

/// Reference to a file served over HTTP; the bytes are fetched at delivery time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

impl Attachment {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// The unit of work. Immutable once published.
///
/// Addresses are validated when the message is formatted, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub recipient: Contact,
    pub sender: Contact,
    pub subject: String,
    /// HTML body, standard base64 on the wire
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub attachments: Vec<Attachment>,
}

impl MailEvent {
    pub fn new(sender: Contact, recipient: Contact, subject: impl Into<String>) -> Self {
        Self {
            sender,
            recipient,
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<Vec<u8>>) -> Self {
        self.payload = html.into();
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the JSON wire form.
    ///
    /// Missing fields decode to empty values; malformed JSON and wrong
    /// field types are errors.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
