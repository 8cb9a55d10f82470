//! Stats engine configuration.

use std::time::Duration;

use serde::Deserialize;
use vitals_core::error::{Error, Result};

/// Tunables for population, reconciliation and refresh scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsConfig {
    /// How long a populated stats entry stays in the cache.
    pub cache_ttl_secs: u64,
    /// Width of the "this week" window.
    pub weekly_window_secs: u64,
    /// Maximum in-flight store operations in the reconciliation writer.
    pub writer_concurrency: usize,
    /// Period between scheduled reconciliation runs.
    pub reconcile_interval_secs: u64,
    /// Name of the queue refresh tasks are submitted to.
    pub refresh_queue: String,
    /// Path prefix of refresh tasks; the project id is appended.
    pub refresh_path_prefix: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 12 * 60 * 60,
            weekly_window_secs: 7 * 24 * 60 * 60,
            writer_concurrency: 8,
            reconcile_interval_secs: 60 * 60,
            refresh_queue: "default".to_string(),
            refresh_path_prefix: "/task/refresh/".to_string(),
        }
    }
}

impl StatsConfig {
    /// Loads configuration from environment variables over the defaults.
    ///
    /// Supported variables:
    /// - `VITALS_CACHE_TTL_SECS`
    /// - `VITALS_WEEKLY_WINDOW_SECS`
    /// - `VITALS_WRITER_CONCURRENCY`
    /// - `VITALS_RECONCILE_INTERVAL_SECS`
    /// - `VITALS_REFRESH_QUEUE`
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds configuration from variables resolved by `lookup`, over the
    /// defaults. [`StatsConfig::from_env`] passes the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a value cannot be parsed, or
    /// if the resulting configuration is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| non_empty(lookup(name));
        let mut config = Self::default();

        if let Some(ttl) = parse_var("VITALS_CACHE_TTL_SECS", var("VITALS_CACHE_TTL_SECS"))? {
            config.cache_ttl_secs = ttl;
        }
        if let Some(window) =
            parse_var("VITALS_WEEKLY_WINDOW_SECS", var("VITALS_WEEKLY_WINDOW_SECS"))?
        {
            config.weekly_window_secs = window;
        }
        if let Some(concurrency) =
            parse_var("VITALS_WRITER_CONCURRENCY", var("VITALS_WRITER_CONCURRENCY"))?
        {
            config.writer_concurrency = concurrency;
        }
        if let Some(interval) = parse_var(
            "VITALS_RECONCILE_INTERVAL_SECS",
            var("VITALS_RECONCILE_INTERVAL_SECS"),
        )? {
            config.reconcile_interval_secs = interval;
        }
        if let Some(queue) = var("VITALS_REFRESH_QUEUE") {
            config.refresh_queue = queue;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any duration or the writer concurrency is zero, or
    /// the refresh path prefix does not start with `/`.
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl_secs == 0 {
            return Err(Error::InvalidInput("cache_ttl_secs must be > 0".into()));
        }
        if self.weekly_window_secs == 0 {
            return Err(Error::InvalidInput(
                "weekly_window_secs must be > 0".into(),
            ));
        }
        if self.writer_concurrency == 0 {
            return Err(Error::InvalidInput(
                "writer_concurrency must be >= 1".into(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(Error::InvalidInput(
                "reconcile_interval_secs must be > 0".into(),
            ));
        }
        if !self.refresh_path_prefix.starts_with('/') {
            return Err(Error::InvalidInput(
                "refresh_path_prefix must start with '/'".into(),
            ));
        }
        Ok(())
    }

    /// Cache TTL as a duration.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Reconciliation period as a duration.
    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Target path of the refresh task for `project_id`.
    #[must_use]
    pub fn refresh_path(&self, project_id: &str) -> String {
        format!("{}{project_id}", self.refresh_path_prefix)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_var<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(v) = value else {
        return Ok(None);
    };
    v.parse::<T>().map(Some).map_err(|e| {
        Error::InvalidInput(format!(
            "{name} must be a {}: {e}",
            std::any::type_name::<T>()
        ))
    })
}
