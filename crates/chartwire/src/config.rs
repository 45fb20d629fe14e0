//! Session configuration
//!
//! Loaded from YAML, optionally overlaid with environment variables:
//! - `TV_TOKEN`: auth token (switches to the pro endpoint)
//! - `TV_URL`: endpoint override
//! - `TV_REQUEST_TIMEOUT_SECS`: timeout applied to every suspend point

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::message::ANONYMOUS_TOKEN;

pub const DEFAULT_URL: &str = "wss://data.tradingview.com/socket.io/websocket?&type=chart";
pub const DEFAULT_PRO_URL: &str = "wss://prodata.tradingview.com/socket.io/websocket?&type=chart";
pub const DEFAULT_ORIGIN: &str = "https://www.tradingview.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Endpoint for anonymous sessions
    pub url: String,
    /// Endpoint used when an auth token is set
    pub pro_url: String,
    /// `Origin` header sent on the upgrade request
    pub origin: String,
    pub auth_token: Option<String>,
    pub language: String,
    pub region: String,
    /// Price adjustment requested when resolving symbols
    pub symbol_adjustment: String,
    /// Bound on the wait for the protocol descriptor. `None` waits forever.
    pub handshake_timeout_secs: Option<u64>,
    /// Bound on symbol resolution and batch waits. `None` waits forever.
    pub request_timeout_secs: Option<u64>,
    /// Close the session once its last listener is gone
    pub idle_close: bool,
    /// Send remove/delete commands to the remote when resources close
    pub remote_teardown: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            pro_url: DEFAULT_PRO_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            auth_token: None,
            language: "en".to_string(),
            region: "US".to_string(),
            symbol_adjustment: "splits".to_string(),
            handshake_timeout_secs: None,
            request_timeout_secs: None,
            idle_close: true,
            remote_teardown: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `TV_TOKEN`, `TV_URL` and `TV_REQUEST_TIMEOUT_SECS` when set.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(token) = env::var("TV_TOKEN") {
            if !token.is_empty() {
                self.auth_token = Some(token);
            }
        }
        if let Ok(url) = env::var("TV_URL") {
            if !url.is_empty() {
                self.url = url.clone();
                self.pro_url = url;
            }
        }
        if let Ok(secs) = env::var("TV_REQUEST_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("TV_REQUEST_TIMEOUT_SECS is not a number: {secs}"))
            })?;
            self.request_timeout_secs = Some(secs);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() || self.pro_url.is_empty() {
            return Err(ConfigError::Invalid("endpoint url must not be empty".into()));
        }
        if self.language.is_empty() || self.region.is_empty() {
            return Err(ConfigError::Invalid("locale must not be empty".into()));
        }
        if self.request_timeout_secs == Some(0) || self.handshake_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("timeouts must be at least one second".into()));
        }
        Ok(())
    }

    /// Endpoint for this session: the pro host when a token is set
    pub fn endpoint(&self) -> &str {
        if self.auth_token.is_some() {
            &self.pro_url
        } else {
            &self.url
        }
    }

    /// Token announced during the handshake
    pub fn token(&self) -> &str {
        self.auth_token.as_deref().unwrap_or(ANONYMOUS_TOKEN)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoint(), DEFAULT_URL);
        assert_eq!(config.token(), ANONYMOUS_TOKEN);
        assert!(config.idle_close);
        assert!(!config.remote_teardown);
        assert!(config.request_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_selects_pro_endpoint() {
        let config = SessionConfig::default().with_token("abc");
        assert_eq!(config.endpoint(), DEFAULT_PRO_URL);
        assert_eq!(config.token(), "abc");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SessionConfig::from_yaml(
            "language: de\nregion: DE\nrequest_timeout_secs: 15\nremote_teardown: true\n",
        )
        .unwrap();
        assert_eq!(config.language, "de");
        assert_eq!(config.region, "DE");
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(15)));
        assert!(config.remote_teardown);
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.symbol_adjustment, "splits");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SessionConfig::from_yaml("request_timeout_secs: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SessionConfig::from_yaml("url: ''\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SessionConfig::from_yaml("idle_close: [1, 2]\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "auth_token: secret").unwrap();
        writeln!(file, "idle_close: false").unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.token(), "secret");
        assert!(!config.idle_close);
        assert_eq!(config.endpoint(), DEFAULT_PRO_URL);
    }

    #[test]
    fn test_load_missing_file() {
        let result = SessionConfig::load(Path::new("/nonexistent/chartwire.yaml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_apply_env() {
        env::set_var("TV_TOKEN", "env-token");
        env::set_var("TV_REQUEST_TIMEOUT_SECS", "7");
        env::remove_var("TV_URL");

        let config = SessionConfig::default().apply_env().unwrap();
        assert_eq!(config.token(), "env-token");
        assert_eq!(config.request_timeout_secs, Some(7));

        env::set_var("TV_REQUEST_TIMEOUT_SECS", "soon");
        assert!(matches!(
            SessionConfig::default().apply_env(),
            Err(ConfigError::Invalid(_))
        ));

        env::remove_var("TV_TOKEN");
        env::remove_var("TV_REQUEST_TIMEOUT_SECS");
    }
}
