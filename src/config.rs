//! Runtime configuration for the storage client.
//!
//! Defaults suit AWS S3; every knob can be overridden from the environment
//! with a `BUCKETLENS_*` variable.

use std::time::Duration;

use tracing::warn;
use url::Url;

/// Server-side cap on keys returned by a single listing call.
pub const MAX_PAGE_SIZE: i32 = 1000;

/// Longest lifetime S3 accepts for a SigV4 pre-signed URL.
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 604_800;

pub const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3600;

const ENV_MAX_ATTEMPTS: &str = "BUCKETLENS_MAX_ATTEMPTS";
const ENV_OPERATION_TIMEOUT: &str = "BUCKETLENS_OPERATION_TIMEOUT_SECS";
const ENV_CONNECT_TIMEOUT: &str = "BUCKETLENS_CONNECT_TIMEOUT_SECS";
const ENV_PAGE_SIZE: &str = "BUCKETLENS_PAGE_SIZE";
const ENV_UPLOAD_CONCURRENCY: &str = "BUCKETLENS_UPLOAD_CONCURRENCY";
const ENV_ENDPOINT: &str = "BUCKETLENS_ENDPOINT";
const ENV_FORCE_PATH_STYLE: &str = "BUCKETLENS_FORCE_PATH_STYLE";

pub(crate) fn env_var_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Configuration applied once when a catalog handle is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Total attempts per remote call, first try included.
    pub max_attempts: u32,
    pub operation_timeout: Duration,
    pub connect_timeout: Duration,
    /// Keys requested per listing page, clamped to `1..=MAX_PAGE_SIZE`.
    pub page_size: i32,
    /// Uploads in flight at once during a batch upload.
    pub upload_concurrency: usize,
    /// Custom S3-compatible endpoint.
    pub endpoint: Option<Url>,
    pub force_path_style: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            operation_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            page_size: MAX_PAGE_SIZE,
            upload_concurrency: 4,
            endpoint: None,
            force_path_style: false,
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with any `BUCKETLENS_*` environment variables.
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_parse::<u32>(ENV_MAX_ATTEMPTS) {
            config = config.with_max_attempts(value);
        }
        if let Some(value) = env_parse::<u64>(ENV_OPERATION_TIMEOUT) {
            config.operation_timeout = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u64>(ENV_CONNECT_TIMEOUT) {
            config.connect_timeout = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<i32>(ENV_PAGE_SIZE) {
            config = config.with_page_size(value);
        }
        if let Some(value) = env_parse::<usize>(ENV_UPLOAD_CONCURRENCY) {
            config = config.with_upload_concurrency(value);
        }
        if let Some(raw) = env_var_non_empty(ENV_ENDPOINT) {
            match Url::parse(&raw) {
                Ok(endpoint) => config = config.with_endpoint(endpoint),
                Err(err) => warn!("Ignoring invalid {ENV_ENDPOINT} ({raw}): {err}"),
            }
        }
        if let Some(raw) = env_var_non_empty(ENV_FORCE_PATH_STYLE) {
            config.force_path_style = matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency.max(1);
        self
    }

    /// Point the client at an S3-compatible endpoint. Such services usually
    /// need path-style addressing, so this enables it too.
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self.force_path_style = true;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env_var_non_empty(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Ignoring invalid {key} ({raw}): {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.page_size, 1000);
        assert_eq!(config.max_attempts, 3);
        assert!(config.endpoint.is_none());
        assert!(!config.force_path_style);
    }

    #[test]
    fn test_builder_clamps_values() {
        let config = AppConfig::default()
            .with_page_size(5000)
            .with_max_attempts(0)
            .with_upload_concurrency(0);

        assert_eq!(config.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.upload_concurrency, 1);

        assert_eq!(AppConfig::default().with_page_size(-3).page_size, 1);
    }

    #[test]
    fn test_custom_endpoint_forces_path_style() {
        let endpoint = Url::parse("http://localhost:9000").unwrap();
        let config = AppConfig::default().with_endpoint(endpoint.clone());

        assert_eq!(config.endpoint, Some(endpoint));
        assert!(config.force_path_style);
    }
}
