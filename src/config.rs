//! Service configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!   "model_path": "schedule.json",
//!   "results_csv": "results.csv",
//!   "retention_days": 2,
//!   "feeds": [
//!     {
//!       "feed_id": "mbta",
//!       "source": { "type": "gtfs_rt", "url": "https://example.org/TripUpdates.pb" },
//!       "polling_period_secs": 15,
//!       "fuzzy_trip_matching": true,
//!       "utc_offset_minutes": -240,
//!       "block_readiness_until_initialized": true,
//!       "auth": { "type": "header", "name": "x-api-key", "key_env": "MBTA_KEY" }
//!     }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::FixedOffset;
use serde::Deserialize;

use crate::fetch::auth::{ApiKey, UrlParam};
use crate::fetch::{BasicClient, HttpClient};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub model_path: PathBuf,
    #[serde(default)]
    pub results_csv: Option<PathBuf>,
    /// Realtime data for service dates this many days before today is
    /// purged. `null` keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: Option<u64>,
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub feed_id: String,
    pub source: SourceConfig,
    #[serde(default = "default_polling_period_secs")]
    pub polling_period_secs: u64,
    #[serde(default)]
    pub fuzzy_trip_matching: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Offset of the feed's local time from UTC, used to turn absolute
    /// event times into service-day seconds.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Service readiness waits for this feed's first complete delivery.
    #[serde(default)]
    pub block_readiness_until_initialized: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    GtfsRt { url: String },
    Files { paths: Vec<PathBuf> },
}

/// API key injection. The key itself is read from the environment variable
/// named by `key_env`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Header { name: String, key_env: String },
    UrlParam { name: String, key_env: String },
}

fn default_polling_period_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retention_days() -> Option<u64> {
    Some(2)
}

impl Config {
    /// Loads and validates the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.feeds.is_empty() {
            bail!("no feeds configured");
        }
        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if !seen.insert(feed.feed_id.as_str()) {
                bail!("duplicate feed id {}", feed.feed_id);
            }
            if feed.polling_period_secs == 0 {
                bail!("feed {}: polling_period_secs must be positive", feed.feed_id);
            }
            if feed.timeout_secs == 0 {
                bail!("feed {}: timeout_secs must be positive", feed.feed_id);
            }
            feed.utc_offset()?;
        }
        Ok(())
    }
}

impl FeedConfig {
    pub fn polling_period(&self) -> Duration {
        Duration::from_secs(self.polling_period_secs)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .with_context(|| format!("feed {}: utc_offset_minutes out of range", self.feed_id))
    }

    /// Builds the HTTP client for this feed, with its timeout and any
    /// configured API key.
    pub fn http_client(&self) -> Result<Box<dyn HttpClient>> {
        let client = BasicClient::with_timeout(Duration::from_secs(self.timeout_secs))?;
        let client: Box<dyn HttpClient> = match &self.auth {
            None => Box::new(client),
            Some(AuthConfig::Header { name, key_env }) => {
                Box::new(ApiKey::new(client, name, &read_key(key_env)?)?)
            }
            Some(AuthConfig::UrlParam { name, key_env }) => {
                Box::new(UrlParam::new(client, name.clone(), read_key(key_env)?))
            }
        };
        Ok(client)
    }
}

fn read_key(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("environment variable {var} must be set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"{
                "model_path": "schedule.json",
                "feeds": [{ "feed_id": "F", "source": { "type": "gtfs_rt", "url": "http://x" } }]
            }"#,
        )
        .unwrap();
        let feed = &config.feeds[0];
        assert_eq!(feed.polling_period(), Duration::from_secs(30));
        assert_eq!(feed.timeout_secs, 30);
        assert!(!feed.fuzzy_trip_matching);
        assert!(feed.auth.is_none());
        assert!(!feed.block_readiness_until_initialized);
        assert!(config.results_csv.is_none());
        assert_eq!(config.retention_days, Some(2));
    }

    #[test]
    fn test_file_source_and_auth() {
        let config = parse(
            r#"{
                "model_path": "schedule.json",
                "feeds": [{
                    "feed_id": "F",
                    "source": { "type": "files", "paths": ["a.pb", "b.pb"] },
                    "auth": { "type": "url_param", "name": "api_key", "key_env": "F_KEY" }
                }]
            }"#,
        )
        .unwrap();
        assert!(matches!(&config.feeds[0].source, SourceConfig::Files { paths } if paths.len() == 2));
        assert!(matches!(&config.feeds[0].auth, Some(AuthConfig::UrlParam { .. })));
    }

    #[test]
    fn test_rejects_duplicate_feed_ids() {
        let err = parse(
            r#"{
                "model_path": "schedule.json",
                "feeds": [
                    { "feed_id": "F", "source": { "type": "gtfs_rt", "url": "http://x" } },
                    { "feed_id": "F", "source": { "type": "gtfs_rt", "url": "http://y" } }
                ]
            }"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "duplicate feed id F");
    }

    #[test]
    fn test_rejects_zero_period() {
        let err = parse(
            r#"{
                "model_path": "schedule.json",
                "feeds": [{
                    "feed_id": "F",
                    "source": { "type": "gtfs_rt", "url": "http://x" },
                    "polling_period_secs": 0
                }]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("polling_period_secs"));
    }

    #[test]
    fn test_missing_key_env_is_an_error() {
        let config = parse(
            r#"{
                "model_path": "schedule.json",
                "feeds": [{
                    "feed_id": "F",
                    "source": { "type": "gtfs_rt", "url": "http://x" },
                    "auth": { "type": "header", "name": "x-api-key", "key_env": "RT_TIMETABLE_UNSET_KEY" }
                }]
            }"#,
        )
        .unwrap();
        assert!(config.feeds[0].http_client().is_err());
    }

    #[test]
    fn test_readiness_blocking_and_retention() {
        let config = parse(
            r#"{
                "model_path": "schedule.json",
                "retention_days": null,
                "feeds": [
                    {
                        "feed_id": "F",
                        "source": { "type": "gtfs_rt", "url": "http://x" },
                        "block_readiness_until_initialized": true
                    },
                    { "feed_id": "G", "source": { "type": "gtfs_rt", "url": "http://y" } }
                ]
            }"#,
        )
        .unwrap();
        assert!(config.feeds[0].block_readiness_until_initialized);
        assert!(!config.feeds[1].block_readiness_until_initialized);
        assert_eq!(config.retention_days, None);
    }
}
