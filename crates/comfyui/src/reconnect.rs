//! Exponential-backoff wait for an unreachable rendering service.
//!
//! When the health gate finds the service down, the orchestrator calls
//! [`wait_until_reachable`] to keep probing with increasing delays until
//! either the service answers again or the [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::accessor::RenderAccessor;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first re-probe.
    pub initial_delay: Duration,
    /// Upper bound on the delay between probes.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failed probe.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Probe the service until it is reachable.
///
/// Returns `true` once a probe succeeds, or `false` if `cancel` is
/// triggered first.
pub async fn wait_until_reachable(
    accessor: &dyn RenderAccessor,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> bool {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Reachability wait cancelled");
                return false;
            }
            reachable = accessor.is_reachable() => {
                if reachable {
                    tracing::info!(attempt, "Rendering service reachable again");
                    return true;
                }
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Rendering service still unreachable",
                );
            }
        }

        // Wait before the next probe, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
