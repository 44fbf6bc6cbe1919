use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::SchedulingPolicy;

/// Runtime settings for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Journal append attempts per transaction before it aborts.
    pub commit_attempts: u32,
    /// Backoff step between append attempts (grows linearly).
    pub commit_backoff: Duration,
    /// Longest a transaction waits for a calendar or account lock.
    pub lock_timeout: Duration,
    /// Journal appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Used for teachers who never set their own policy.
    pub default_policy: SchedulingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            commit_attempts: 3,
            commit_backoff: Duration::from_millis(20),
            lock_timeout: Duration::from_secs(5),
            compact_threshold: 1000,
            metrics_port: None,
            default_policy: SchedulingPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TUTORCAL_*` environment variables. Unset or
    /// unparsable values fall back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        let policy = SchedulingPolicy {
            booking_lead_time_hours: env_or(
                "TUTORCAL_DEFAULT_LEAD_HOURS",
                d.default_policy.booking_lead_time_hours,
            ),
            cancellation_policy_hours: env_or(
                "TUTORCAL_DEFAULT_CANCEL_HOURS",
                d.default_policy.cancellation_policy_hours,
            ),
            booking_horizon_days: env_or(
                "TUTORCAL_DEFAULT_HORIZON_DAYS",
                d.default_policy.booking_horizon_days,
            ),
            max_occasional_classes_per_day: env_or(
                "TUTORCAL_DEFAULT_DAILY_CAP",
                d.default_policy.max_occasional_classes_per_day,
            ),
        };
        Self {
            data_dir: std::env::var("TUTORCAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            commit_attempts: env_or("TUTORCAL_COMMIT_ATTEMPTS", d.commit_attempts).max(1),
            commit_backoff: Duration::from_millis(env_or("TUTORCAL_COMMIT_BACKOFF_MS", 20)),
            lock_timeout: Duration::from_millis(env_or("TUTORCAL_LOCK_TIMEOUT_MS", 5000)),
            compact_threshold: env_or("TUTORCAL_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: std::env::var("TUTORCAL_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            default_policy: policy,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tutorcal.wal")
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.default_policy, SchedulingPolicy::default());
        assert_eq!(c.wal_path(), PathBuf::from("./data/tutorcal.wal"));
        assert!(c.commit_attempts >= 1);
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        assert_eq!(env_or::<u32>("TUTORCAL_TEST_UNSET_VARIABLE", 7), 7);
    }
}
