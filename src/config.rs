//! Pool configuration structures.

use std::{fmt, time::Duration};

use humantime_serde::re::humantime::format_duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Connection pool configuration.
///
/// All durations are (de)serialized in human-readable form, like `"5m"` or `"30s"`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Pool name, used as a label in logs and metrics.
    #[serde(default = "PoolConfig::default_name")]
    pub name: String,
    /// Minimum number of connections kept in the pool.
    ///
    /// Default is 1.
    #[serde(default = "PoolConfig::default_min_size")]
    pub min_size: usize,
    /// Maximum number of connections in the pool.
    ///
    /// Default is 10.
    #[serde(default = "PoolConfig::default_max_size")]
    pub max_size: usize,
    /// Maximum time to wait for a connection to become available.
    ///
    /// Default is 5 minutes.
    #[serde(default = "PoolConfig::default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
    /// Maximum time a connection may stay lent out before being forcibly reclaimed.
    ///
    /// Default is 30 minutes.
    #[serde(
        default = "PoolConfig::default_assigned_timeout",
        with = "humantime_serde"
    )]
    pub assigned_timeout: Duration,
    /// Idle time after which surplus connections (above [`Self::min_size`]) are closed.
    ///
    /// Default is 30 minutes.
    #[serde(
        default = "PoolConfig::default_retire_after_idle",
        with = "humantime_serde"
    )]
    pub retire_after_idle: Duration,
    /// Idle time after which a connection is probed with [`Self::keep_alive_statement`].
    ///
    /// Default is 5 minutes.
    #[serde(
        default = "PoolConfig::default_keep_alive_after",
        with = "humantime_serde"
    )]
    pub keep_alive_after: Duration,
    /// Maximum age of an available connection, regardless of usage.
    ///
    /// Default is 8 hours.
    #[serde(
        default = "PoolConfig::default_retire_after_stale",
        with = "humantime_serde"
    )]
    pub retire_after_stale: Duration,
    /// Interval between maintenance sweeps.
    ///
    /// Default is 60 seconds.
    #[serde(
        default = "PoolConfig::default_sweep_interval",
        with = "humantime_serde"
    )]
    pub sweep_interval: Duration,
    /// Statement executed to keep idle connections alive.
    ///
    /// Default is `SELECT 1`.
    #[serde(default = "PoolConfig::default_keep_alive_statement")]
    pub keep_alive_statement: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            min_size: Self::default_min_size(),
            max_size: Self::default_max_size(),
            max_wait: Self::default_max_wait(),
            assigned_timeout: Self::default_assigned_timeout(),
            retire_after_idle: Self::default_retire_after_idle(),
            keep_alive_after: Self::default_keep_alive_after(),
            retire_after_stale: Self::default_retire_after_stale(),
            sweep_interval: Self::default_sweep_interval(),
            keep_alive_statement: Self::default_keep_alive_statement(),
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::name`].
    #[must_use]
    #[inline]
    fn default_name() -> String {
        "default".into()
    }

    /// Default value for [`Self::min_size`].
    #[must_use]
    #[inline]
    fn default_min_size() -> usize {
        1
    }

    /// Default value for [`Self::max_size`].
    #[must_use]
    #[inline]
    fn default_max_size() -> usize {
        10
    }

    /// Default value for [`Self::max_wait`].
    #[must_use]
    #[inline]
    fn default_max_wait() -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// Default value for [`Self::assigned_timeout`].
    #[must_use]
    #[inline]
    fn default_assigned_timeout() -> Duration {
        Duration::from_secs(30 * 60)
    }

    /// Default value for [`Self::retire_after_idle`].
    #[must_use]
    #[inline]
    fn default_retire_after_idle() -> Duration {
        Duration::from_secs(30 * 60)
    }

    /// Default value for [`Self::keep_alive_after`].
    #[must_use]
    #[inline]
    fn default_keep_alive_after() -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// Default value for [`Self::retire_after_stale`].
    #[must_use]
    #[inline]
    fn default_retire_after_stale() -> Duration {
        Duration::from_secs(8 * 60 * 60)
    }

    /// Default value for [`Self::sweep_interval`].
    #[must_use]
    #[inline]
    fn default_sweep_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Default value for [`Self::keep_alive_statement`].
    #[must_use]
    #[inline]
    fn default_keep_alive_statement() -> String {
        "SELECT 1".into()
    }

    /// Create builder for pool configuration.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Check configuration values and normalize pool size bounds.
    ///
    /// A minimum size above maximum size raises the maximum size to match.
    ///
    /// # Errors
    ///
    /// Returns `Err` if minimum size is zero, or if sweep interval is zero.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.min_size < 1 {
            return Err(ConfigError::MinSize(self.min_size));
        }
        if self.max_size < self.min_size {
            self.max_size = self.min_size;
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}

impl fmt::Display for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size: {}..={}, max wait: {}, assigned timeout: {}, retire after idle: {}, \
             keep alive after: {}, retire after stale: {}, sweep interval: {}",
            self.min_size,
            self.max_size,
            format_duration(self.max_wait),
            format_duration(self.assigned_timeout),
            format_duration(self.retire_after_idle),
            format_duration(self.keep_alive_after),
            format_duration(self.retire_after_stale),
            format_duration(self.sweep_interval),
        )
    }
}

/// Builder for pool configuration.
#[must_use]
pub struct PoolConfigBuilder {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfigBuilder {
    /// Alternative method to construct a pool configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful, or if loaded values are
    /// invalid.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let mut config: PoolConfig = self.builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Add a custom object implementing [`Source`] trait as a source of pool configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of pool configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of pool configuration.
    ///
    /// Variable `PREFIX_MIN_SIZE` maps to [`PoolConfig::min_size`], and so on.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(config::Environment::with_prefix(prefix.as_ref()).prefix_separator("_"))
    }
}

/// Physical connection parameters.
///
/// Meant to be used by [`Connector`](crate::Connector) implementations.
#[derive(Clone, Default, Deserialize, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct ConnectorConfig {
    /// Driver name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Connection URL.
    pub url: String,
    /// User name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectorConfig {
    /// Create connection parameters for a URL.
    #[must_use]
    pub fn new(url: impl ToString) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Set driver name.
    #[must_use]
    pub fn with_driver(mut self, driver: impl ToString) -> Self {
        self.driver = Some(driver.to_string());
        self
    }

    /// Set user name and password.
    #[must_use]
    pub fn with_credentials(mut self, user: impl ToString, password: impl ToString) -> Self {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};

    use super::*;

    #[test]
    fn defaults() {
        let mut cfg = PoolConfig::default();
        assert_eq!(cfg.min_size, 1);
        assert_eq!(cfg.max_size, 10);
        assert_eq!(cfg.max_wait, Duration::from_secs(300));
        assert_eq!(cfg.keep_alive_statement, "SELECT 1");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialize_partial() {
        let cfg: PoolConfig = serde_json::from_str(
            r#"{
                "min_size": 2,
                "max_wait": "1m",
                "sweep_interval": "10s"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.min_size, 2);
        assert_eq!(cfg.max_size, 10);
        assert_eq!(cfg.max_wait, Duration::from_secs(60));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(10));
        assert_eq!(cfg.retire_after_idle, Duration::from_secs(30 * 60));
    }

    #[test]
    fn validate_raises_max_size() {
        let mut cfg = PoolConfig::default();
        cfg.min_size = 12;
        cfg.validate().unwrap();
        assert_eq!(cfg.max_size, 12);
    }

    #[test]
    fn validate_rejects_zero() {
        let mut cfg = PoolConfig::default();
        cfg.min_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::MinSize(0))));
        let mut cfg = PoolConfig::default();
        cfg.sweep_interval = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroSweepInterval)));
    }

    #[test]
    fn builder_from_yaml() {
        let yaml = "
name: reports
min_size: 2
max_size: 3
retire_after_stale: 4m
keep_alive_statement: SELECT 42
";
        let cfg = PoolConfig::builder()
            .with_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap();
        assert_eq!(cfg.name, "reports");
        assert_eq!(cfg.min_size, 2);
        assert_eq!(cfg.max_size, 3);
        assert_eq!(cfg.retire_after_stale, Duration::from_secs(240));
        assert_eq!(cfg.keep_alive_statement, "SELECT 42");
    }

    #[test]
    fn builder_rejects_invalid() {
        let cfg = PoolConfig::builder()
            .with_source(File::from_str("sweep_interval: 0s", FileFormat::Yaml))
            .build();
        assert!(matches!(cfg, Err(ConfigError::ZeroSweepInterval)));
    }

    #[test]
    fn connector_debug_redacts_password() {
        let cfg = ConnectorConfig::new("mysql://localhost:3306/test")
            .with_driver("mysql")
            .with_credentials("root", "hunter2");
        let debug = format!("{cfg:?}");
        assert!(debug.contains("root"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
