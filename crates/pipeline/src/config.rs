//! Pipeline configuration.
//!
//! Every struct has a `Default` suited to a local ComfyUI instance and a
//! `from_env()` loader that overrides individual fields from environment
//! variables. Unset variables keep the default; malformed ones are reported
//! as [`PipelineError::Config`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use genqueue_comfyui::reconnect::ReconnectConfig;
use genqueue_core::reconcile::PollSchedule;

use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Settings for the status reconciler's polling loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Dynamic poll interval parameters.
    pub poll: PollSchedule,
    /// Consecutive `Unknown` ticks before emergency re-checks start.
    pub emergency_threshold: u32,
    /// Direct history checks per emergency burst.
    pub emergency_checks: u32,
    pub emergency_check_interval: Duration,
    /// Hard ceiling on a single wait, independent of the caller's timeout.
    pub absolute_timeout: Duration,
    /// Pause after a tick that raised an unexpected error.
    pub error_backoff: Duration,
    /// Budget for the last history check once the soft timeout has passed.
    pub final_check_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll: PollSchedule::default(),
            emergency_threshold: 5,
            emergency_checks: 3,
            emergency_check_interval: Duration::from_secs(5),
            absolute_timeout: Duration::from_secs(1800),
            error_backoff: Duration::from_secs(5),
            final_check_timeout: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    /// Load monitor settings from environment variables with defaults.
    ///
    /// | Env Var                          | Default |
    /// |----------------------------------|---------|
    /// | `GENQUEUE_POLL_BASE_SECS`        | `2`     |
    /// | `GENQUEUE_POLL_MAX_SECS`         | `10`    |
    /// | `GENQUEUE_EMERGENCY_THRESHOLD`   | `5`     |
    /// | `GENQUEUE_ABSOLUTE_TIMEOUT_SECS` | `1800`  |
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let defaults = Self::default();
        let poll = PollSchedule {
            base: secs_var(&lookup, "GENQUEUE_POLL_BASE_SECS", defaults.poll.base)?,
            max: secs_var(&lookup, "GENQUEUE_POLL_MAX_SECS", defaults.poll.max)?,
            ..defaults.poll
        };

        Ok(Self {
            poll,
            emergency_threshold: parse_var(
                &lookup,
                "GENQUEUE_EMERGENCY_THRESHOLD",
                defaults.emergency_threshold,
            )?,
            absolute_timeout: secs_var(
                &lookup,
                "GENQUEUE_ABSOLUTE_TIMEOUT_SECS",
                defaults.absolute_timeout,
            )?,
            ..defaults
        })
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Settings for job execution and retry backoff.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Soft timeout handed to the reconciler for each attempt.
    pub job_timeout: Duration,
    /// Attempts used by `execute_with_retry` when the caller passes none.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    /// Delay between consecutive jobs of a batch.
    pub batch_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(600),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
            batch_delay: Duration::from_secs(2),
        }
    }
}

impl ExecutorConfig {
    /// Load executor settings from environment variables with defaults.
    ///
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `GENQUEUE_JOB_TIMEOUT_SECS` | `600`   |
    /// | `GENQUEUE_MAX_ATTEMPTS`     | `3`     |
    /// | `GENQUEUE_BATCH_DELAY_SECS` | `2`     |
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let defaults = Self::default();
        let max_attempts: u32 = parse_var(&lookup, "GENQUEUE_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(PipelineError::Config(
                "GENQUEUE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            job_timeout: secs_var(&lookup, "GENQUEUE_JOB_TIMEOUT_SECS", defaults.job_timeout)?,
            max_attempts,
            batch_delay: secs_var(&lookup, "GENQUEUE_BATCH_DELAY_SECS", defaults.batch_delay)?,
            ..defaults
        })
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Capacities of the progress aggregator's bounded buffers.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub snapshot_history_cap: usize,
    pub event_log_cap: usize,
    /// Finished-job durations kept for the moving average.
    pub duration_window_cap: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            snapshot_history_cap: 1000,
            event_log_cap: 500,
            duration_window_cap: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Top-level settings for the orchestration loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long `stop(true)` waits for the loop to exit.
    pub stop_timeout: Duration,
    /// Re-check interval while paused.
    pub pause_poll_interval: Duration,
    /// Resume by itself once an unreachable backend answers again.
    pub auto_resume: bool,
    /// Serve one fresh job after this many retries in a row.
    pub max_consecutive_retries: Option<u32>,
    /// Where the rendering service writes images. Enables the file
    /// detector and output-file discovery.
    pub output_dir: Option<PathBuf>,
    pub reconnect: ReconnectConfig,
    pub monitor: MonitorConfig,
    pub executor: ExecutorConfig,
    pub progress: ProgressConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            pause_poll_interval: Duration::from_secs(1),
            auto_resume: true,
            max_consecutive_retries: None,
            output_dir: None,
            reconnect: ReconnectConfig::default(),
            monitor: MonitorConfig::default(),
            executor: ExecutorConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load the full configuration tree from environment variables.
    ///
    /// | Env Var                            | Default |
    /// |------------------------------------|---------|
    /// | `GENQUEUE_STOP_TIMEOUT_SECS`       | `30`    |
    /// | `GENQUEUE_MAX_CONSECUTIVE_RETRIES` | unset   |
    /// | `GENQUEUE_OUTPUT_DIR`              | unset   |
    ///
    /// Nested configs read their own variables, see
    /// [`MonitorConfig::from_env`] and [`ExecutorConfig::from_env`].
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let defaults = Self::default();

        let max_consecutive_retries = match lookup("GENQUEUE_MAX_CONSECUTIVE_RETRIES") {
            Some(raw) => Some(parse_value::<u32>("GENQUEUE_MAX_CONSECUTIVE_RETRIES", &raw)?),
            None => None,
        };

        let output_dir = lookup("GENQUEUE_OUTPUT_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            stop_timeout: secs_var(&lookup, "GENQUEUE_STOP_TIMEOUT_SECS", defaults.stop_timeout)?,
            max_consecutive_retries,
            output_dir,
            monitor: MonitorConfig::from_lookup(&lookup)?,
            executor: ExecutorConfig::from_lookup(&lookup)?,
            ..defaults
        })
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, PipelineError> {
    raw.trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{name} has an invalid value: {raw:?}")))
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, PipelineError> {
    match lookup(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

/// Fractional seconds, e.g. `1.5`.
fn secs_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, PipelineError> {
    match lookup(name) {
        Some(raw) => {
            let secs: f64 = parse_value(name, &raw)?;
            Duration::try_from_secs_f64(secs).map_err(|_| {
                PipelineError::Config(format!("{name} must be a non-negative number of seconds"))
            })
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.monitor.absolute_timeout, Duration::from_secs(1800));
        assert_eq!(config.monitor.emergency_threshold, 5);
        assert_eq!(config.executor.job_timeout, Duration::from_secs(600));
        assert!(config.max_consecutive_retries.is_none());
        assert!(config.output_dir.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("GENQUEUE_JOB_TIMEOUT_SECS", "120"),
            ("GENQUEUE_POLL_BASE_SECS", "1.5"),
            ("GENQUEUE_EMERGENCY_THRESHOLD", "8"),
            ("GENQUEUE_MAX_CONSECUTIVE_RETRIES", "2"),
            ("GENQUEUE_OUTPUT_DIR", "/tmp/out"),
        ]))
        .unwrap();

        assert_eq!(config.executor.job_timeout, Duration::from_secs(120));
        assert_eq!(config.monitor.poll.base, Duration::from_millis(1500));
        assert_eq!(config.monitor.emergency_threshold, 8);
        assert_eq!(config.max_consecutive_retries, Some(2));
        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn malformed_number_is_config_error() {
        let result = ExecutorConfig::from_lookup(lookup_from(&[("GENQUEUE_MAX_ATTEMPTS", "three")]));
        assert_matches!(result, Err(PipelineError::Config(msg)) if msg.contains("GENQUEUE_MAX_ATTEMPTS"));
    }

    #[test]
    fn zero_attempts_rejected() {
        let result = ExecutorConfig::from_lookup(lookup_from(&[("GENQUEUE_MAX_ATTEMPTS", "0")]));
        assert_matches!(result, Err(PipelineError::Config(_)));
    }

    #[test]
    fn negative_seconds_rejected() {
        let result = MonitorConfig::from_lookup(lookup_from(&[("GENQUEUE_POLL_MAX_SECS", "-1")]));
        assert_matches!(result, Err(PipelineError::Config(_)));
    }
}
