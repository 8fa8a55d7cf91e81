use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

/// Runtime configuration loaded from environment variables.
///
/// Provider credentials are not here; they live in the durable config store.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub config_path: PathBuf,

    // HTTP
    pub http_timeout: Duration,
    pub user_agent: String,
    pub graph_api_version: String,

    // Token lifecycle
    pub token_lifetime_days: i64,
    pub refresh_window_days: i64,

    // Cache
    pub stale_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("socialfeed.json"),
            http_timeout: Duration::from_secs(10),
            user_agent: format!("socialfeed/{}", env!("CARGO_PKG_VERSION")),
            graph_api_version: "v15.0".to_string(),
            token_lifetime_days: 60,
            refresh_window_days: 50,
            stale_grace: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    /// Load configuration from `SOCIALFEED_*` variables. Unset or unparsable
    /// values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: env::var("SOCIALFEED_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            http_timeout: parsed_env("SOCIALFEED_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            user_agent: env::var("SOCIALFEED_USER_AGENT").unwrap_or(defaults.user_agent),
            graph_api_version: env::var("SOCIALFEED_GRAPH_API_VERSION")
                .unwrap_or(defaults.graph_api_version),
            token_lifetime_days: parsed_env("SOCIALFEED_TOKEN_LIFETIME_DAYS")
                .unwrap_or(defaults.token_lifetime_days),
            refresh_window_days: parsed_env("SOCIALFEED_REFRESH_WINDOW_DAYS")
                .unwrap_or(defaults.refresh_window_days),
            stale_grace: parsed_env("SOCIALFEED_STALE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_grace),
        }
    }

    /// Log the effective configuration, config file by name only.
    pub fn log_redacted(&self) {
        let file = self
            .config_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            config_file = file.as_str(),
            http_timeout_secs = self.http_timeout.as_secs(),
            graph_api_version = self.graph_api_version.as_str(),
            token_lifetime_days = self.token_lifetime_days,
            refresh_window_days = self.refresh_window_days,
            stale_grace_secs = self.stale_grace.as_secs(),
            "Config loaded"
        );
    }
}

fn parsed_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw.as_str(), "Ignoring unparsable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_token_policy() {
        let config = Config::default();
        assert_eq!(config.token_lifetime_days, 60);
        assert_eq!(config.refresh_window_days, 50);
        assert_eq!(config.graph_api_version, "v15.0");
        assert_eq!(config.http_timeout, Duration::from_secs(10));
    }

    #[test]
    fn unparsable_values_fall_back() {
        env::set_var("SOCIALFEED_TEST_PARSED_ENV", "not-a-number");
        assert_eq!(parsed_env::<u64>("SOCIALFEED_TEST_PARSED_ENV"), None);
        env::set_var("SOCIALFEED_TEST_PARSED_ENV", " 42 ");
        assert_eq!(parsed_env::<u64>("SOCIALFEED_TEST_PARSED_ENV"), Some(42));
        env::remove_var("SOCIALFEED_TEST_PARSED_ENV");
    }
}
