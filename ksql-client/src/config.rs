use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Environment variables with this prefix override the defaults, e.g.
/// `KSQL_DISPATCH_ENDPOINT=http://ksql:8088`.
pub const ENV_PREFIX: &str = "KSQL_DISPATCH";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Base URL of the ksqlDB REST server.
    pub endpoint: String,
    /// Calls slower than this are logged at `warn`.
    pub slow_call_threshold_ms: u64,
    /// Optional per-call limit for administrative statements.
    pub admin_timeout_ms: Option<u64>,
    /// Capacity of the hand-off channel between the streaming producer and
    /// consumer.
    pub stream_buffer: usize,
    /// TCP connect timeout for new handles.
    pub connect_timeout_ms: u64,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8088".to_string(),
            slow_call_threshold_ms: 500,
            admin_timeout_ms: None,
            stream_buffer: 1,
            connect_timeout_ms: 10_000,
            log_format: "compact".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: DispatchConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            bail!("endpoint must not be empty");
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!("endpoint {endpoint} must start with http:// or https://");
        }
        if self.stream_buffer == 0 {
            bail!("stream_buffer must be greater than 0");
        }
        if !matches!(self.log_format.as_str(), "compact" | "json") {
            bail!(
                "log_format must be \"compact\" or \"json\", got {:?}",
                self.log_format
            );
        }
        Ok(())
    }

    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }

    pub fn admin_timeout(&self) -> Option<Duration> {
        self.admin_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = DispatchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.slow_call_threshold(), Duration::from_millis(500));
        assert!(cfg.admin_timeout().is_none());
    }

    #[test]
    fn rejects_endpoint_without_scheme() {
        let cfg = DispatchConfig {
            endpoint: "localhost:8088".to_string(),
            ..DispatchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_stream_buffer() {
        let cfg = DispatchConfig {
            stream_buffer: 0,
            ..DispatchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_format() {
        let cfg = DispatchConfig {
            log_format: "pretty".to_string(),
            ..DispatchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
