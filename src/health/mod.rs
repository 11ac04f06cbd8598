//! Health poller - retry-with-timeout readiness checks
//!
//! Every stage that waits for a service uses [`poll`]. Attempts run on a fixed
//! cadence from the first probe, are bounded both by `max_attempts` and by the
//! overall `timeout`, and stop immediately when the abort signal fires.

pub mod probe;

pub use probe::{HttpProbe, ProbeError, ReadinessProbe};

use crate::core::{config::HealthConfig, context::AbortSignal, error::PipelineError};
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Polling bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Time between attempt starts
    pub interval: Duration,
    /// Overall limit for the whole poll
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Limit for a single probe
    pub probe_timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            timeout,
            max_attempts,
            probe_timeout: interval.max(Duration::from_secs(1)),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }
}

impl From<&HealthConfig> for PollSettings {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

/// Result of a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Healthy { attempts: u32 },
    Unhealthy { attempts: u32, last_error: String },
    Aborted { attempts: u32 },
}

impl PollOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, PollOutcome::Healthy { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Healthy { attempts }
            | PollOutcome::Unhealthy { attempts, .. }
            | PollOutcome::Aborted { attempts } => *attempts,
        }
    }

    /// Convert into the pipeline error taxonomy
    pub fn into_result(self, url: &str) -> Result<u32, PipelineError> {
        match self {
            PollOutcome::Healthy { attempts } => Ok(attempts),
            PollOutcome::Unhealthy {
                attempts,
                last_error,
            } => Err(PipelineError::HealthCheckTimeout {
                url: url.to_string(),
                attempts,
                last_error,
            }),
            PollOutcome::Aborted { attempts } => Err(PipelineError::Aborted(format!(
                "health check against {} interrupted after {} attempt(s)",
                url, attempts
            ))),
        }
    }
}

/// Poll `url` until it answers healthy, the attempts run out, or the timeout
/// elapses.
pub async fn poll<P>(probe: &P, url: &str, settings: &PollSettings, abort: &AbortSignal) -> PollOutcome
where
    P: ReadinessProbe + ?Sized,
{
    let start = Instant::now();
    let deadline = start + settings.timeout;
    let mut attempts: u32 = 0;

    loop {
        if abort.is_aborted() {
            return PollOutcome::Aborted { attempts };
        }

        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let probe_limit = settings.probe_timeout.min(remaining);

        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                debug!(%url, attempts, "health poll aborted during probe");
                return PollOutcome::Aborted { attempts };
            }
            result = timeout(probe_limit, probe.probe(url)) => result,
        };

        let last_error = match result {
            Ok(Ok(())) => {
                info!(%url, attempts, "service is healthy");
                return PollOutcome::Healthy { attempts };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => ProbeError::Timeout(probe_limit).to_string(),
        };
        debug!(%url, attempts, error = %last_error, "health probe failed");

        if attempts >= settings.max_attempts {
            warn!(%url, attempts, error = %last_error, "health check attempts exhausted");
            return PollOutcome::Unhealthy {
                attempts,
                last_error,
            };
        }

        let next_attempt = start + settings.interval * attempts;
        if next_attempt > deadline || Instant::now() >= deadline {
            warn!(%url, attempts, timeout = ?settings.timeout, "health check timed out");
            return PollOutcome::Unhealthy {
                attempts,
                last_error,
            };
        }

        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                debug!(%url, attempts, "health poll aborted while waiting");
                return PollOutcome::Aborted { attempts };
            }
            _ = sleep_until(next_attempt) => {}
        }
    }
}

/// Single probe, used for preconditions
pub async fn check<P>(probe: &P, url: &str, probe_timeout: Duration) -> Result<(), ProbeError>
where
    P: ReadinessProbe + ?Sized,
{
    match timeout(probe_timeout, probe.probe(url)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(probe_timeout)),
    }
}
