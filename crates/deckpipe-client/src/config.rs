use deckpipe_core::DEFAULT_MAX_LINE_BYTES;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid base url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Connection and timing settings shared by the orchestrator and transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: Url,
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub resume_delay: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub request_timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            poll_interval: Duration::from_secs(5),
            resume_delay: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            request_timeout: Duration::from_secs(30),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// On-disk shape. Every key is optional and overrides the default it names.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    base_url: Option<String>,
    token: Option<String>,
    poll_secs: Option<u64>,
    resume_delay_ms: Option<u64>,
    heartbeat_secs: Option<u64>,
    reconnect_base_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    request_timeout_secs: Option<u64>,
    max_line_bytes: Option<usize>,
}

impl ClientConfig {
    /// Defaults, then the optional TOML file, then `DECKPIPE_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.merge_file(path)?;
        }
        config.merge_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_toml(&contents).map_err(|err| match err {
            MergeError::Parse(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            MergeError::Config(err) => err,
        })
    }

    fn merge_toml(&mut self, contents: &str) -> Result<(), MergeError> {
        let file: FileConfig = toml::from_str(contents).map_err(MergeError::Parse)?;
        if let Some(base_url) = file.base_url {
            self.base_url = parse_base_url(&base_url)?;
        }
        if let Some(token) = file.token {
            self.token = non_empty(token);
        }
        if let Some(secs) = file.poll_secs {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = file.resume_delay_ms {
            self.resume_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = file.heartbeat_secs {
            self.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = file.reconnect_base_ms {
            self.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = file.max_reconnect_attempts {
            self.max_reconnect_attempts = attempts;
        }
        if let Some(secs) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = file.max_line_bytes {
            self.max_line_bytes = bytes;
        }
        Ok(())
    }

    /// Applies `DECKPIPE_*` overrides read through `lookup`. Blank values are
    /// treated as unset.
    pub fn merge_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("DECKPIPE_BASE_URL") {
            self.base_url = parse_base_url(&value)?;
        }
        if let Some(value) = get("DECKPIPE_TOKEN") {
            self.token = Some(value);
        }
        if let Some(value) = get("DECKPIPE_POLL_SECS") {
            self.poll_interval = Duration::from_secs(parse_num("DECKPIPE_POLL_SECS", &value)?);
        }
        if let Some(value) = get("DECKPIPE_RESUME_DELAY_MS") {
            self.resume_delay =
                Duration::from_millis(parse_num("DECKPIPE_RESUME_DELAY_MS", &value)?);
        }
        if let Some(value) = get("DECKPIPE_HEARTBEAT_SECS") {
            self.heartbeat_timeout =
                Duration::from_secs(parse_num("DECKPIPE_HEARTBEAT_SECS", &value)?);
        }
        if let Some(value) = get("DECKPIPE_RECONNECT_BASE_MS") {
            self.reconnect_base_delay =
                Duration::from_millis(parse_num("DECKPIPE_RECONNECT_BASE_MS", &value)?);
        }
        if let Some(value) = get("DECKPIPE_MAX_RECONNECTS") {
            self.max_reconnect_attempts = parse_num("DECKPIPE_MAX_RECONNECTS", &value)?;
        }
        if let Some(value) = get("DECKPIPE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout =
                Duration::from_secs(parse_num("DECKPIPE_REQUEST_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = get("DECKPIPE_MAX_LINE_BYTES") {
            self.max_line_bytes = parse_num("DECKPIPE_MAX_LINE_BYTES", &value)?;
        }
        Ok(())
    }

    pub fn set_base_url(&mut self, value: &str) -> Result<(), ConfigError> {
        self.base_url = parse_base_url(value)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |key: &'static str| ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
        };
        if self.poll_interval.is_zero() {
            return Err(zero("poll_interval"));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(zero("heartbeat_timeout"));
        }
        if self.request_timeout.is_zero() {
            return Err(zero("request_timeout"));
        }
        if self.max_line_bytes == 0 {
            return Err(zero("max_line_bytes"));
        }
        Ok(())
    }

    /// `base_url` with `segments` appended as path components.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

enum MergeError {
    Parse(toml::de::Error),
    Config(ConfigError),
}

impl From<ConfigError> for MergeError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("valid default base url")
}

fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|err| ConfigError::InvalidUrl {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            value: value.to_string(),
            reason: "expected an http(s) base url".to_string(),
        });
    }
    Ok(url)
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
