use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use backon::ExponentialBuilder;

/// Variables available to the config template, taken from the process
/// environment (after `.env` has been loaded).
#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    inner: HashMap<String, String>,
}

impl TemplateVars {
    pub fn from_env() -> Self {
        Self {
            inner: std::env::vars().collect(),
        }
    }
}

impl FromIterator<(String, String)> for TemplateVars {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl Serialize for TemplateVars {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0:?}")]
    Template((PathBuf, minijinja::Error)),
    #[error("Invalid URL in config: {0}")]
    Url(#[from] url::ParseError),
}

pub fn render_template(template_str: &str, vars: &TemplateVars) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()
        .expect("This really should not fail. If this fail something has gone horribly wrong.");

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StatusPageConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub view: ViewConfig,
}

/// The REST backend that owns services and incidents.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    /// Sent as a bearer token on every request when set.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Address the hub binds to when running `serve`.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Where viewers and publishers reach the hub.
    #[serde(default = "default_channel_url")]
    pub base_url: String,
    /// Messages buffered per organization before slow subscribers are cut off.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Required bearer token for `POST /channel/:org/publish` when set.
    #[serde(default)]
    pub publish_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReconnectConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ViewConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4000))
}

fn default_channel_url() -> String {
    "http://localhost:4000".to_string()
}

fn default_capacity() -> usize {
    1024
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_min_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            base_url: default_channel_url(),
            capacity: default_capacity(),
            keep_alive_secs: default_keep_alive_secs(),
            publish_token: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ChannelConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

impl StatusPageConfig {
    fn try_init_from_string(
        config: &str,
        path: &Path,
        vars: &TemplateVars,
    ) -> Result<Self, ConfigError> {
        let rendered = render_template(config, vars)
            .map_err(|e| ConfigError::Template((path.to_path_buf(), e)))?;
        let config: Self = toml::from_str(&rendered)?;
        // Fail at startup rather than on the first request.
        url::Url::parse(&config.api.base_url)?;
        url::Url::parse(&config.channel.base_url)?;
        Ok(config)
    }

    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(path)?;
        Self::try_init_from_string(&config, path, &TemplateVars::from_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let input = r#"
            [api]
            base_url = "http://localhost:8080/api"
        "#;
        let config =
            StatusPageConfig::try_init_from_string(input, Path::new("test.toml"), &vars(&[]))
                .expect("Failed to parse config");

        assert_eq!(config.api.token, None);
        assert_eq!(config.api.timeout(), Duration::from_secs(10));
        assert_eq!(config.channel, ChannelConfig::default());
        assert_eq!(config.reconnect.max_retries, 10);
        assert_eq!(config.view.queue_capacity, 256);
    }

    #[test]
    fn test_config_loading_with_templates() {
        let input = r#"
            [api]
            base_url = "${ API_URL }"
            token = "${ API_TOKEN }"

            [channel]
            listen = "127.0.0.1:4100"
            base_url = "http://127.0.0.1:4100"
            capacity = 64

            [reconnect]
            min_delay_ms = 10
            max_retries = 3
        "#;
        let config = StatusPageConfig::try_init_from_string(
            input,
            Path::new("test.toml"),
            &vars(&[("API_URL", "https://status.example.com/api"), ("API_TOKEN", "s3cret")]),
        )
        .expect("Failed to parse config");

        assert_eq!(config.api.base_url, "https://status.example.com/api");
        assert_eq!(config.api.token.as_deref(), Some("s3cret"));
        assert_eq!(config.channel.listen.port(), 4100);
        assert_eq!(config.channel.capacity, 64);
        assert_eq!(config.reconnect.min_delay_ms, 10);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
    }

    #[test]
    fn test_template_failure() {
        let input = r#"
            [api]
            base_url = "${ NOT_SET }"
        "#;
        let res = StatusPageConfig::try_init_from_string(input, Path::new("test.toml"), &vars(&[]));
        assert!(matches!(res, Err(ConfigError::Template(_))), "{:?}", res);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let input = r#"
            [api]
            base_url = "not a url"
        "#;
        let res = StatusPageConfig::try_init_from_string(input, Path::new("test.toml"), &vars(&[]));
        assert!(matches!(res, Err(ConfigError::Url(_))), "{:?}", res);
    }
}
