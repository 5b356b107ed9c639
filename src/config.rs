//! Configuration loading and management

use std::time::Duration;

use thiserror::Error;

pub const ENV_API_URL: &str = "SECOND_BRAIN_API_URL";
pub const ENV_API_KEY: &str = "SECOND_BRAIN_API_KEY";
pub const ENV_PROTOCOL: &str = "SECOND_BRAIN_PROTOCOL";
pub const ENV_CLARIFICATION: &str = "SECOND_BRAIN_CLARIFICATION";
pub const ENV_FOLLOW_UP_LIMIT: &str = "SECOND_BRAIN_FOLLOW_UP_LIMIT";
pub const ENV_BUCKETS: &str = "SECOND_BRAIN_BUCKETS";
pub const ENV_CONNECT_TIMEOUT: &str = "SECOND_BRAIN_CONNECT_TIMEOUT_SECS";
pub const ENV_READ_TIMEOUT: &str = "SECOND_BRAIN_READ_TIMEOUT_SECS";

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_BUCKETS: [&str; 4] = ["People", "Projects", "Ideas", "Admin"];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Backend protocol revision, selects endpoint paths and capture body shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// `/api/capture` family with flat events
    #[default]
    V2,
    /// `/api/ag-ui` family with CUSTOM-wrapped events
    Legacy,
}

/// How a bucket pick is sent back for a low-confidence item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClarificationMode {
    /// `PATCH /api/inbox/{id}/recategorize`, falling back to `Respond` when
    /// the item id is unknown
    #[default]
    Recategorize,
    /// Streamed `POST /api/ag-ui/respond`
    Respond,
}

/// Whether the second follow-up round is the last one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowUpLimit {
    /// Keep prompting; the round counter only saturates for display
    #[default]
    Advisory,
    /// A misunderstood reply at the last round ends as unresolved
    HardCap,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL, without trailing slash
    pub api_url: String,

    /// Bearer token for every request
    pub api_key: String,

    pub protocol: Protocol,

    pub clarification: ClarificationMode,

    pub follow_up_limit: FollowUpLimit,

    /// Buckets a capture can be filed under, in display order
    pub buckets: Vec<String>,

    pub connect_timeout: Duration,

    /// Maximum silence between two chunks of a stream
    pub read_timeout: Duration,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get(ENV_API_KEY).ok_or(ConfigError::Missing(ENV_API_KEY))?;
        let api_url = get(ENV_API_URL)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let protocol = match get(ENV_PROTOCOL).as_deref() {
            None | Some("v2") => Protocol::V2,
            Some("legacy") => Protocol::Legacy,
            Some(other) => return Err(invalid(ENV_PROTOCOL, other)),
        };

        let clarification = match get(ENV_CLARIFICATION).as_deref() {
            None | Some("recategorize") => ClarificationMode::Recategorize,
            Some("respond") => ClarificationMode::Respond,
            Some(other) => return Err(invalid(ENV_CLARIFICATION, other)),
        };

        let follow_up_limit = match get(ENV_FOLLOW_UP_LIMIT).as_deref() {
            None | Some("advisory") => FollowUpLimit::Advisory,
            Some("hard") => FollowUpLimit::HardCap,
            Some(other) => return Err(invalid(ENV_FOLLOW_UP_LIMIT, other)),
        };

        let buckets = match get(ENV_BUCKETS) {
            Some(raw) => {
                let buckets: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(str::to_string)
                    .collect();
                if buckets.is_empty() {
                    return Err(invalid(ENV_BUCKETS, &raw));
                }
                buckets
            }
            None => DEFAULT_BUCKETS.iter().map(|b| b.to_string()).collect(),
        };

        let seconds = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match get(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
                    .ok_or_else(|| invalid(key, &raw)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        Ok(Self {
            api_url,
            api_key,
            protocol,
            clarification,
            follow_up_limit,
            buckets,
            connect_timeout: seconds(ENV_CONNECT_TIMEOUT, 10)?,
            read_timeout: seconds(ENV_READ_TIMEOUT, 90)?,
        })
    }

    /// Defaults pointed at `api_url`, mostly for tests and embedding
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            protocol: Protocol::default(),
            clarification: ClarificationMode::default(),
            follow_up_limit: FollowUpLimit::default(),
            buckets: DEFAULT_BUCKETS.iter().map(|b| b.to_string()).collect(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(90),
        }
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = load(&[(ENV_API_KEY, "secret")]).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.protocol, Protocol::V2);
        assert_eq!(config.clarification, ClarificationMode::Recategorize);
        assert_eq!(config.follow_up_limit, FollowUpLimit::Advisory);
        assert_eq!(config.buckets, vec!["People", "Projects", "Ideas", "Admin"]);
        assert_eq!(config.read_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_config_requires_api_key() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing(ENV_API_KEY));
        assert_eq!(load(&[(ENV_API_KEY, "  ")]).unwrap_err(), ConfigError::Missing(ENV_API_KEY));
    }

    #[test]
    fn test_config_overrides() {
        let config = load(&[
            (ENV_API_KEY, "secret"),
            (ENV_API_URL, "https://brain.example.com/"),
            (ENV_PROTOCOL, "legacy"),
            (ENV_CLARIFICATION, "respond"),
            (ENV_FOLLOW_UP_LIMIT, "hard"),
            (ENV_BUCKETS, "Work, Home ,"),
            (ENV_CONNECT_TIMEOUT, "3"),
        ])
        .unwrap();
        assert_eq!(config.api_url, "https://brain.example.com");
        assert_eq!(config.protocol, Protocol::Legacy);
        assert_eq!(config.clarification, ClarificationMode::Respond);
        assert_eq!(config.follow_up_limit, FollowUpLimit::HardCap);
        assert_eq!(config.buckets, vec!["Work", "Home"]);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(
            load(&[(ENV_API_KEY, "k"), (ENV_PROTOCOL, "v3")]),
            Err(ConfigError::Invalid { key: ENV_PROTOCOL, .. })
        ));
        assert!(matches!(
            load(&[(ENV_API_KEY, "k"), (ENV_READ_TIMEOUT, "0")]),
            Err(ConfigError::Invalid { key: ENV_READ_TIMEOUT, .. })
        ));
    }
}
