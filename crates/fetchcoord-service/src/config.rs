use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// One mebibyte, the unit cache capacities are usually thought in.
pub const MEBIBYTE: u64 = 1024 * 1024;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for fetchcoord.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "fetchcoord".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Various timeouts for the HTTP transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one fetch, including reading the body.
    pub max_download: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        let config = Config::default();
        Self::from_config(&config)
    }
}

impl FetchTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

/// Configuration of a [`Coordinator`](crate::coordinator::Coordinator) and its HTTP transport.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity (in bytes) of the in-memory object cache.
    ///
    /// Objects are weighted by their decoder-reported cost, which defaults to the size of
    /// the fetched bytes. An object costing more than the whole capacity is never cached.
    ///
    /// Defaults to `40 MiB (= 41_943_040)`.
    pub in_memory_capacity: u64,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time a single fetch may take.
    ///
    /// There is no timeout in the coordinator itself, this is enforced by the transport.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The `User-Agent` header sent with every request.
    pub user_agent: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            in_memory_capacity: 40 * MEBIBYTE,
            connect_timeout: Duration::from_secs(1),
            max_download_timeout: Duration::from_secs(60),
            user_agent: concat!("fetchcoord/", env!("CARGO_PKG_VERSION")).to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    /// Loads the configuration from the YAML file at `path`, or the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    fn from_yaml(yaml: &str) -> Result<Self> {
        // reject empty files instead of falling back to the defaults
        if yaml.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(yaml).context("failed to parse config YAML")
    }

    /// The timeouts the HTTP transport should apply.
    pub fn timeouts(&self) -> FetchTimeouts {
        FetchTimeouts::from_config(self)
    }
}

/// Accepts the level names understood by `RUST_LOG`, in any case.
fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::invalid_value(
            de::Unexpected::Str(&level),
            &"a log level like \"info\" or \"off\"",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.in_memory_capacity, 41_943_040);
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
        assert_eq!(cfg.metrics.prefix, "fetchcoord");
        assert!(cfg.user_agent.starts_with("fetchcoord/"));
    }

    #[test]
    fn test_partial_config() {
        let yaml = r#"
            in_memory_capacity: 1024
            connect_timeout: 250ms
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_yaml(yaml).unwrap();
        let default_cfg = Config::default();
        assert_eq!(cfg.in_memory_capacity, 1024);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(250));
        assert_eq!(cfg.max_download_timeout, default_cfg.max_download_timeout);
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);
    }

    #[test]
    fn test_timeouts() {
        let yaml = r#"
            connect_timeout: 2s
            max_download_timeout: 5m
        "#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            cfg.timeouts(),
            FetchTimeouts {
                connect: Duration::from_secs(2),
                max_download: Duration::from_secs(300),
            }
        );
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        let yaml = r#"
            symbol_server:
              enabled: true
        "#;
        let cfg = Config::from_yaml(yaml);
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        let yaml = "\n  \n";
        let result = Config::from_yaml(yaml);
        assert!(result.is_err());
    }
}
