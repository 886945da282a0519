//! Configuration types.
//!
//! Every setting has a default and can be overridden through an
//! `OUTREACH_*` environment variable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;

/// How send slots are spaced within one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingPolicy {
    /// Use each campaign's `pacing_interval_minutes`.
    #[default]
    Fixed,
    /// Uniform random gap between `min` and `max` per job.
    Randomized { min: Duration, max: Duration },
}

/// Where the per-mailbox pacing ledger lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerBackend {
    /// Shared table in the outreach database.
    #[default]
    Database,
    /// Process-local map; only valid with a single scheduler.
    Memory,
}

/// Scheduler (poller) settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the external timer fires a tick.
    pub tick_interval: Duration,
    /// Maximum campaign-lead rows scanned per tick.
    pub batch_size: usize,
    pub pacing: PacingPolicy,
    /// Lifetime of a pacing ledger entry.
    pub ledger_ttl: Duration,
    /// Upper bound of the random delay added to window deferrals.
    pub window_jitter: Duration,
    /// Attempts to win the ledger compare-and-set before giving up on a group.
    pub ledger_cas_attempts: u32,
    pub reply_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            batch_size: 50,
            pacing: PacingPolicy::Fixed,
            ledger_ttl: Duration::from_secs(24 * 3600), // 24 hours
            window_jitter: Duration::from_secs(300),    // 5 minutes
            ledger_cas_attempts: 3,
            reply_poll_interval: Duration::from_secs(120),
        }
    }
}

/// Mailbox warmup ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupPolicy {
    pub base_limit: i64,
    pub ramp_per_day: i64,
    pub max_cap: i64,
}

impl Default for WarmupPolicy {
    fn default() -> Self {
        Self {
            base_limit: 5,
            ramp_per_day: 2,
            max_cap: 50,
        }
    }
}

/// Delivery queue retry settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a claimed job stays invisible before it can be reclaimed.
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(600),
            lease: Duration::from_secs(300),
        }
    }
}

/// Send worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Jobs claimed and run concurrently per poll.
    pub concurrency: usize,
    /// System-wide ceiling on sends.
    pub sends_per_second: u32,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            concurrency: 5,
            sends_per_second: 5,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Open/click tracking endpoints.
#[derive(Debug, Clone, Default)]
pub struct TrackingConfig {
    /// Public base URL of the tracking server. `None` disables instrumentation.
    pub base_url: Option<String>,
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub ledger: LedgerBackend,
    pub scheduler: SchedulerConfig,
    pub warmup: WarmupPolicy,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub tracking: TrackingConfig,
    /// Directory for rolling log files, if any.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/outreach.db"),
            ledger: LedgerBackend::Database,
            scheduler: SchedulerConfig::default(),
            warmup: WarmupPolicy::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            tracking: TrackingConfig::default(),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Build from environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(path) = env.get("OUTREACH_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.log_dir = env.get("OUTREACH_LOG_DIR").map(PathBuf::from);

        config.ledger = match env.get("OUTREACH_LEDGER").as_deref() {
            None | Some("database") => LedgerBackend::Database,
            Some("memory") => LedgerBackend::Memory,
            Some(other) => {
                return Err(invalid("OUTREACH_LEDGER", format!("unknown backend {other:?}")));
            }
        };

        let sched = &mut config.scheduler;
        sched.tick_interval = Duration::from_secs(env.parse("OUTREACH_TICK_SECS", 30u64)?);
        sched.batch_size = env.parse("OUTREACH_BATCH_SIZE", 50usize)?;
        sched.ledger_ttl = Duration::from_secs(env.parse("OUTREACH_LEDGER_TTL_SECS", 86_400u64)?);
        sched.window_jitter =
            Duration::from_secs(env.parse("OUTREACH_WINDOW_JITTER_SECS", 300u64)?);
        sched.reply_poll_interval =
            Duration::from_secs(env.parse("OUTREACH_REPLY_POLL_SECS", 120u64)?);
        sched.pacing = match env.get("OUTREACH_PACING").as_deref() {
            None | Some("fixed") => PacingPolicy::Fixed,
            Some("random") => {
                let min = env.parse("OUTREACH_PACING_MIN_SECS", 120u64)?;
                let max = env.parse("OUTREACH_PACING_MAX_SECS", 300u64)?;
                if min == 0 || min > max {
                    return Err(invalid(
                        "OUTREACH_PACING_MIN_SECS",
                        format!("need 0 < min <= max, got {min}..{max}"),
                    ));
                }
                PacingPolicy::Randomized {
                    min: Duration::from_secs(min),
                    max: Duration::from_secs(max),
                }
            }
            Some(other) => {
                return Err(invalid("OUTREACH_PACING", format!("unknown policy {other:?}")));
            }
        };
        if sched.batch_size == 0 {
            return Err(invalid("OUTREACH_BATCH_SIZE", "must be at least 1"));
        }

        config.warmup = WarmupPolicy {
            base_limit: env.parse("OUTREACH_WARMUP_BASE", 5i64)?,
            ramp_per_day: env.parse("OUTREACH_WARMUP_RAMP", 2i64)?,
            max_cap: env.parse("OUTREACH_WARMUP_CAP", 50i64)?,
        };

        config.queue.max_attempts = env.parse("OUTREACH_QUEUE_MAX_ATTEMPTS", 3u32)?;
        config.queue.backoff_base =
            Duration::from_secs(env.parse("OUTREACH_QUEUE_BACKOFF_SECS", 10u64)?);
        config.queue.lease = Duration::from_secs(env.parse("OUTREACH_QUEUE_LEASE_SECS", 300u64)?);
        if config.queue.max_attempts == 0 {
            return Err(invalid("OUTREACH_QUEUE_MAX_ATTEMPTS", "must be at least 1"));
        }

        if let Some(id) = env.get("OUTREACH_WORKER_ID") {
            config.worker.worker_id = id;
        }
        config.worker.concurrency = env.parse("OUTREACH_WORKER_CONCURRENCY", 5usize)?;
        config.worker.sends_per_second = env.parse("OUTREACH_SENDS_PER_SECOND", 5u32)?;
        config.worker.poll_interval =
            Duration::from_millis(env.parse("OUTREACH_WORKER_POLL_MS", 1000u64)?);
        if config.worker.sends_per_second == 0 {
            return Err(invalid("OUTREACH_SENDS_PER_SECOND", "must be at least 1"));
        }
        if config.worker.concurrency == 0 {
            return Err(invalid("OUTREACH_WORKER_CONCURRENCY", "must be at least 1"));
        }

        config.tracking.base_url = env
            .get("OUTREACH_TRACKING_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string());

        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e| invalid(key, format!("{e}"))),
            None => Ok(default),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.scheduler.pacing, PacingPolicy::Fixed);
        assert_eq!(config.scheduler.ledger_ttl, Duration::from_secs(86_400));
        assert_eq!(config.warmup, WarmupPolicy::default());
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.worker.sends_per_second, 5);
        assert_eq!(config.ledger, LedgerBackend::Database);
        assert!(config.tracking.base_url.is_none());
    }

    #[test]
    fn random_pacing_from_env() {
        let config = from_map(&[
            ("OUTREACH_PACING", "random"),
            ("OUTREACH_PACING_MIN_SECS", "60"),
            ("OUTREACH_PACING_MAX_SECS", "90"),
        ])
        .unwrap();
        assert_eq!(
            config.scheduler.pacing,
            PacingPolicy::Randomized {
                min: Duration::from_secs(60),
                max: Duration::from_secs(90)
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(from_map(&[("OUTREACH_BATCH_SIZE", "lots")]).is_err());
        assert!(from_map(&[("OUTREACH_PACING", "bursty")]).is_err());
        assert!(from_map(&[
            ("OUTREACH_PACING", "random"),
            ("OUTREACH_PACING_MIN_SECS", "400"),
            ("OUTREACH_PACING_MAX_SECS", "300"),
        ])
        .is_err());
        assert!(from_map(&[("OUTREACH_SENDS_PER_SECOND", "0")]).is_err());
    }

    #[test]
    fn tracking_url_trimmed() {
        let config =
            from_map(&[("OUTREACH_TRACKING_BASE_URL", "https://t.example.com/")]).unwrap();
        assert_eq!(
            config.tracking.base_url.as_deref(),
            Some("https://t.example.com")
        );
    }
}
