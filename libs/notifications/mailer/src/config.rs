//! SMTP and attachment configuration loaded from the environment

use core_config::{env_bool, env_list, env_or_default, env_parse, ConfigError, FromEnv};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SMTP_HOST: &str = "mailcatcher";
pub const DEFAULT_SMTP_PORT: u16 = 25;
pub const DEFAULT_FROM_ADDRESS: &str = "noreply@localhost";
pub const DEFAULT_FROM_NAME: &str = "Mailer";
/// 25 MiB
pub const DEFAULT_ATTACHMENT_MAX_BYTES: u64 = 25 * 1024 * 1024;

/// How the SMTP connection is secured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain text, for local catchers such as mailcatcher
    #[default]
    None,
    /// Upgrade with STARTTLS
    StartTls,
    /// Implicit TLS from the first byte
    Tls,
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "starttls" => Ok(Self::StartTls),
            "tls" => Ok(Self::Tls),
            other => Err(format!("unknown tls mode '{other}', expected none|starttls|tls")),
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::StartTls => write!(f, "starttls"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

/// SMTP delivery configuration
#[derive(Clone)]
pub struct SmtpConfig {
    /// A disabled service accepts every event and sends nothing
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: TlsMode,
    pub timeout: Duration,
    /// Default sender used when an event carries no sender address
    pub from_address: String,
    pub from_name: String,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            enabled: true,
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            tls: TlsMode::None,
            timeout: Duration::from_secs(30),
            from_address: DEFAULT_FROM_ADDRESS.to_string(),
            from_name: DEFAULT_FROM_NAME.to_string(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_from(mut self, address: impl Into<String>, name: impl Into<String>) -> Self {
        self.from_address = address.into();
        self.from_name = name.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Still sending as `noreply@localhost`, which most relays refuse
    pub fn uses_placeholder_sender(&self) -> bool {
        self.from_address == DEFAULT_FROM_ADDRESS
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SMTP_HOST, DEFAULT_SMTP_PORT)
    }
}

// Keeps the password out of logs
impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .field("from_address", &self.from_address)
            .field("from_name", &self.from_name)
            .finish()
    }
}

impl FromEnv for SmtpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: env_bool("SMTP_ENABLED", true)?,
            host: env_or_default("SMTP_HOST", DEFAULT_SMTP_HOST),
            port: env_parse("SMTP_PORT", DEFAULT_SMTP_PORT)?,
            username: env_or_default("SMTP_USERNAME", ""),
            password: env_or_default("SMTP_PASSWORD", ""),
            tls: env_parse("SMTP_TLS", TlsMode::None)?,
            timeout: Duration::from_secs(env_parse("SMTP_TIMEOUT_SECS", 30)?),
            from_address: env_or_default("EMAIL_FROM_ADDRESS", DEFAULT_FROM_ADDRESS),
            from_name: env_or_default("EMAIL_FROM_NAME", DEFAULT_FROM_NAME),
        })
    }
}

/// Attachment gate and fetcher configuration
#[derive(Debug, Clone)]
pub struct AttachmentConfig {
    pub whitelist_enabled: bool,
    /// Exact host names, no wildcards
    pub whitelist: Vec<String>,
    /// `None` disables the size cap
    pub max_bytes: Option<u64>,
    pub fetch_timeout: Duration,
}

impl AttachmentConfig {
    pub fn new() -> Self {
        Self {
            whitelist_enabled: false,
            whitelist: Vec::new(),
            max_bytes: Some(DEFAULT_ATTACHMENT_MAX_BYTES),
            fetch_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_whitelist<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist_enabled = true;
        self.whitelist = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes.filter(|n| *n > 0);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FromEnv for AttachmentConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let max_bytes: u64 = env_parse("ATTACHMENT_MAX_BYTES", DEFAULT_ATTACHMENT_MAX_BYTES)?;
        Ok(Self {
            whitelist_enabled: env_bool("ATTACHMENT_WHITELIST_ENABLED", false)?,
            whitelist: env_list("ATTACHMENT_WHITELIST"),
            max_bytes: (max_bytes > 0).then_some(max_bytes),
            fetch_timeout: Duration::from_secs(env_parse("ATTACHMENT_FETCH_TIMEOUT_SECS", 30)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMTP_VARS: [&str; 9] = [
        "SMTP_ENABLED",
        "SMTP_HOST",
        "SMTP_PORT",
        "SMTP_USERNAME",
        "SMTP_PASSWORD",
        "SMTP_TLS",
        "SMTP_TIMEOUT_SECS",
        "EMAIL_FROM_ADDRESS",
        "EMAIL_FROM_NAME",
    ];

    #[test]
    fn test_smtp_defaults() {
        let unset: Vec<(&str, Option<&str>)> = SMTP_VARS.iter().map(|k| (*k, None)).collect();
        temp_env::with_vars(unset, || {
            let config = SmtpConfig::from_env().unwrap();
            assert!(config.enabled);
            assert_eq!(config.host, "mailcatcher");
            assert_eq!(config.port, 25);
            assert_eq!(config.tls, TlsMode::None);
            assert!(!config.has_credentials());
            assert_eq!(config.from_address, "noreply@localhost");
            assert!(config.uses_placeholder_sender());
            assert_eq!(config.timeout, Duration::from_secs(30));
        });
    }

    #[test]
    fn test_configured_sender_is_not_placeholder() {
        temp_env::with_var("EMAIL_FROM_ADDRESS", Some("billing@example.com"), || {
            let config = SmtpConfig::from_env().unwrap();
            assert!(!config.uses_placeholder_sender());
        });
        assert!(!SmtpConfig::default()
            .with_from("robot@example.com", "Robot")
            .uses_placeholder_sender());
    }

    #[test]
    fn test_smtp_from_env() {
        temp_env::with_vars(
            [
                ("SMTP_ENABLED", Some("false")),
                ("SMTP_HOST", Some("smtp.example.com")),
                ("SMTP_PORT", Some("587")),
                ("SMTP_USERNAME", Some("mailer")),
                ("SMTP_PASSWORD", Some("secret")),
                ("SMTP_TLS", Some("STARTTLS")),
            ],
            || {
                let config = SmtpConfig::from_env().unwrap();
                assert!(!config.enabled);
                assert_eq!(config.host, "smtp.example.com");
                assert_eq!(config.port, 587);
                assert_eq!(config.tls, TlsMode::StartTls);
                assert!(config.has_credentials());
                assert!(!format!("{config:?}").contains("secret"));
            },
        );
    }

    #[test]
    fn test_smtp_invalid_tls_names_key() {
        temp_env::with_var("SMTP_TLS", Some("ssl3"), || {
            let err = SmtpConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("SMTP_TLS"));
        });
    }

    #[test]
    fn test_attachment_config_from_env() {
        temp_env::with_vars(
            [
                ("ATTACHMENT_WHITELIST_ENABLED", Some("true")),
                ("ATTACHMENT_WHITELIST", Some("files.example.com, cdn.example.com")),
                ("ATTACHMENT_MAX_BYTES", Some("0")),
                ("ATTACHMENT_FETCH_TIMEOUT_SECS", Some("5")),
            ],
            || {
                let config = AttachmentConfig::from_env().unwrap();
                assert!(config.whitelist_enabled);
                assert_eq!(config.whitelist, vec!["files.example.com", "cdn.example.com"]);
                assert_eq!(config.max_bytes, None);
                assert_eq!(config.fetch_timeout, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn test_attachment_defaults() {
        temp_env::with_vars(
            [
                ("ATTACHMENT_WHITELIST_ENABLED", None::<&str>),
                ("ATTACHMENT_WHITELIST", None),
                ("ATTACHMENT_MAX_BYTES", None),
                ("ATTACHMENT_FETCH_TIMEOUT_SECS", None),
            ],
            || {
                let config = AttachmentConfig::from_env().unwrap();
                assert!(!config.whitelist_enabled);
                assert!(config.whitelist.is_empty());
                assert_eq!(config.max_bytes, Some(26_214_400));
            },
        );
    }
}
