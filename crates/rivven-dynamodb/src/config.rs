//! Configuration for the DynamoDB source
//!
//! Loaded from a YAML (or JSON) file with `${VAR}` / `${VAR:-default}`
//! environment references expanded before parsing. Credential fields are only
//! read by the host when it builds the store clients.

use crate::error::{DynamoError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Request timeout used when none (or zero) is configured
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Endpoint of a locally running store
pub const LOCAL_ENDPOINT: &str = "http://localhost:8000";

/// Source configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct TapConfig {
    /// AWS region (e.g., us-east-1)
    #[validate(length(min = 1, max = 25))]
    pub region_name: String,

    /// Account that owns the role to assume
    #[serde(default)]
    pub account_id: Option<String>,

    /// Role to assume in `account_id`
    #[serde(default)]
    pub role_name: Option<String>,

    /// External ID for role assumption
    #[serde(default)]
    pub external_id: Option<String>,

    /// Talk to a local store at http://localhost:8000
    #[serde(default)]
    pub use_local_dynamo: bool,

    /// Endpoint URL override
    #[serde(default)]
    #[validate(url)]
    pub endpoint_url: Option<String>,

    /// Connect/read timeout in seconds, as a number or a numeric string.
    /// Zero, empty or absent means 300 seconds.
    #[serde(default)]
    pub request_timeout: Option<serde_json::Value>,

    /// Backoff policy for store and change-log calls
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,

    /// Items per scan page
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub scan_page_size: u32,

    /// Records per change-log read
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub stream_batch_size: u32,

    /// Emit a state message every this many change records
    #[serde(default = "default_state_flush_interval")]
    #[validate(range(min = 1))]
    pub state_flush_interval: u64,
}

/// Retry settings as written in the config file
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct RetrySettings {
    /// Attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after every retry
    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,

    /// Delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_page_size() -> u32 {
    1000
}

fn default_state_flush_interval() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            region_name: "us-east-1".to_string(),
            account_id: None,
            role_name: None,
            external_id: None,
            use_local_dynamo: false,
            endpoint_url: None,
            request_timeout: None,
            retry: RetrySettings::default(),
            scan_page_size: default_page_size(),
            stream_batch_size: default_page_size(),
            state_flush_interval: default_state_flush_interval(),
        }
    }
}

impl TapConfig {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DynamoError::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse configuration text, expanding environment references first
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| DynamoError::config(format!("failed to parse config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate field ranges and the request timeout
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| DynamoError::config(format!("config validation failed: {e}")))?;
        self.request_timeout()?;
        if self.role_name.is_some() && self.account_id.is_none() {
            return Err(DynamoError::config("role_name requires account_id"));
        }
        Ok(())
    }

    /// Effective request timeout
    pub fn request_timeout(&self) -> Result<Duration> {
        let invalid = |shown: String| {
            DynamoError::config(format!(
                "request_timeout must be a non-negative number of seconds, got {shown}"
            ))
        };

        let seconds = match &self.request_timeout {
            None | Some(serde_json::Value::Null) => return Ok(DEFAULT_REQUEST_TIMEOUT),
            Some(serde_json::Value::Number(n)) => {
                n.as_f64().ok_or_else(|| invalid(n.to_string()))?
            }
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                return Ok(DEFAULT_REQUEST_TIMEOUT)
            }
            Some(serde_json::Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid(format!("'{s}'")))?,
            Some(other) => return Err(invalid(other.to_string())),
        };

        if !seconds.is_finite() || seconds < 0.0 {
            return Err(invalid(seconds.to_string()));
        }
        if seconds == 0.0 {
            return Ok(DEFAULT_REQUEST_TIMEOUT);
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    /// Endpoint override for client construction
    pub fn endpoint(&self) -> Option<&str> {
        if self.use_local_dynamo {
            Some(LOCAL_ENDPOINT)
        } else {
            self.endpoint_url.as_deref()
        }
    }

    /// Role to assume, if one is configured
    pub fn role_arn(&self) -> Option<String> {
        match (&self.account_id, &self.role_name) {
            (Some(account), Some(role)) => Some(format!(
                "arn:aws:iam::{}:role/{}",
                account.replace('-', ""),
                role
            )),
            _ => None,
        }
    }
}
