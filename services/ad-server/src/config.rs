//! Configuration for the ad server.
//!
//! The binary reads [`Config`] from `ADSCHED_*` environment variables. The
//! engine itself only sees [`EngineConfig`], which is provided to the
//! context as a service.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use adsched_id::CreativeSetId;
use thiserror::Error;

/// Errors from loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {message}")]
    Invalid {
        key: &'static str,
        value: String,
        message: String,
    },
}

/// Ad server process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub database_path: String,

    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Optional JSON catalog loaded into the store at startup.
    pub catalog_path: Option<String>,

    /// Segments the user is currently classified into.
    pub segments: Vec<String>,

    pub engine: EngineConfig,
}

/// Everything the serving engine is tuned by.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub serving: ServingConfig,
    pub eligibility: EligibilityConfig,
    pub frequency_caps: FrequencyCapConfig,
}

/// Serving loop cadence.
#[derive(Debug, Clone)]
pub struct ServingConfig {
    /// Delay before the first serving attempt when none is scheduled.
    pub initial_delay: Duration,

    /// Delay when a start finds the scheduled attempt already due.
    pub retry_delay: Duration,

    /// Delay after a cycle that did not deliver an ad.
    pub failure_backoff: Duration,

    /// Re-arm the timer after every cycle. When false, cycles are driven
    /// externally through `AdServing::maybe_serve_ad`.
    pub fixed_cadence: bool,

    /// Give up on an eligibility evaluation after this long.
    pub eligibility_timeout: Option<Duration>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2 * 60),
            retry_delay: Duration::from_secs(60),
            failure_backoff: Duration::from_secs(2 * 60),
            fixed_cadence: true,
            eligibility_timeout: None,
        }
    }
}

/// Inputs to eligibility evaluation.
#[derive(Debug, Clone)]
pub struct EligibilityConfig {
    /// Most browsing history entries fetched per cycle.
    pub browsing_history_max_count: usize,

    /// How far back browsing history is fetched.
    pub browsing_history_days_ago: u32,

    /// How long a fetched ad event history may be reused. Zero only
    /// coalesces concurrent fetches.
    pub ad_events_max_age: Duration,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            browsing_history_max_count: 5000,
            browsing_history_days_ago: 180,
            ad_events_max_age: Duration::ZERO,
        }
    }
}

/// Frequency caps and targeting inputs.
#[derive(Debug, Clone)]
pub struct FrequencyCapConfig {
    /// Ad notifications served per rolling hour. Zero disables serving.
    pub ads_per_hour: u32,

    /// Ad notifications served per rolling day.
    pub ads_per_day: u32,

    /// Viewed events per rolling day for ads placed by the embedder (new
    /// tab page, promoted content, inline content).
    pub viewed_ads_per_day: u32,

    /// Viewed events allowed per placement uuid.
    pub ad_uuid_viewed_cap: u32,

    /// User's region as `CC` or `CC-RR`, if known.
    pub user_region: Option<String>,

    /// Sites whose visitors must not see a creative set.
    pub anti_targeting: HashMap<CreativeSetId, Vec<String>>,
}

impl Default for FrequencyCapConfig {
    fn default() -> Self {
        Self {
            ads_per_hour: 2,
            ads_per_day: 20,
            viewed_ads_per_day: 20,
            ad_uuid_viewed_cap: 1,
            user_region: None,
            anti_targeting: HashMap::new(),
        }
    }
}

impl FrequencyCapConfig {
    /// Minimum spacing between served ad notifications.
    pub fn minimum_wait_time(&self) -> Option<Duration> {
        (self.ads_per_hour > 0).then(|| Duration::from_secs(3600 / u64::from(self.ads_per_hour)))
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path =
            lookup("ADSCHED_DATABASE_PATH").unwrap_or_else(|| "/var/lib/adsched/ads.db".to_string());
        let log_level = lookup("ADSCHED_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let catalog_path = lookup("ADSCHED_CATALOG_PATH").filter(|p| !p.trim().is_empty());
        let segments = lookup("ADSCHED_SEGMENTS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let serving_defaults = ServingConfig::default();
        let serving = ServingConfig {
            fixed_cadence: parse(&lookup, "ADSCHED_FIXED_CADENCE")?
                .unwrap_or(serving_defaults.fixed_cadence),
            eligibility_timeout: parse::<u64, _>(&lookup, "ADSCHED_ELIGIBILITY_TIMEOUT_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            ..serving_defaults
        };

        let eligibility_defaults = EligibilityConfig::default();
        let eligibility = EligibilityConfig {
            browsing_history_max_count: parse(&lookup, "ADSCHED_HISTORY_MAX_COUNT")?
                .unwrap_or(eligibility_defaults.browsing_history_max_count),
            browsing_history_days_ago: parse(&lookup, "ADSCHED_HISTORY_DAYS_AGO")?
                .unwrap_or(eligibility_defaults.browsing_history_days_ago),
            ad_events_max_age: parse::<u64, _>(&lookup, "ADSCHED_AD_EVENTS_MAX_AGE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(eligibility_defaults.ad_events_max_age),
        };

        let caps_defaults = FrequencyCapConfig::default();
        let frequency_caps = FrequencyCapConfig {
            ads_per_hour: parse(&lookup, "ADSCHED_ADS_PER_HOUR")?
                .unwrap_or(caps_defaults.ads_per_hour),
            ads_per_day: parse(&lookup, "ADSCHED_ADS_PER_DAY")?
                .unwrap_or(caps_defaults.ads_per_day),
            viewed_ads_per_day: parse(&lookup, "ADSCHED_VIEWED_ADS_PER_DAY")?
                .unwrap_or(caps_defaults.viewed_ads_per_day),
            ad_uuid_viewed_cap: parse(&lookup, "ADSCHED_AD_UUID_VIEWED_CAP")?
                .unwrap_or(caps_defaults.ad_uuid_viewed_cap),
            user_region: lookup("ADSCHED_USER_REGION")
                .map(|r| r.trim().to_ascii_uppercase())
                .filter(|r| !r.is_empty()),
            anti_targeting: HashMap::new(),
        };

        if frequency_caps.ads_per_hour > 3600 {
            return Err(ConfigError::Invalid {
                key: "ADSCHED_ADS_PER_HOUR",
                value: frequency_caps.ads_per_hour.to_string(),
                message: "must be at most 3600".to_string(),
            });
        }

        Ok(Self {
            database_path,
            log_level,
            catalog_path,
            segments,
            engine: EngineConfig {
                serving,
                eligibility,
                frequency_caps,
            },
        })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value,
            message: e.to_string(),
        })
}
