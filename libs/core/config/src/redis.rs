use crate::{env_or_default, ConfigError, FromEnv};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FromEnv for RedisConfig {
    /// REDIS_URL, defaulting to a local instance
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_or_default("REDIS_URL", DEFAULT_REDIS_URL),
        })
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_URL)
    }
}
