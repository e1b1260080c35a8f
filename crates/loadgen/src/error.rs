//! Error types for the load engine.

use std::time::Duration;
use thiserror::Error;

use crate::metrics::MetricKind;

/// Invalid schedule, threshold or scenario. Detected before a run starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The schedule has no stages.
    #[error("schedule must contain at least one stage")]
    EmptySchedule,

    /// Every stage has zero duration, so the run would never execute.
    #[error("schedule total duration must be > 0")]
    ZeroDuration,

    /// A threshold expression could not be parsed.
    #[error("invalid threshold `{expression}` on metric `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    /// A duration string could not be parsed.
    #[error("invalid duration `{value}`: {reason}")]
    InvalidDuration { value: String, reason: String },

    /// The scenario definition is unusable.
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    /// The configuration file could not be read or decoded.
    #[error("failed to load configuration: {0}")]
    Load(String),
}

impl ConfigError {
    /// Create an InvalidThreshold error.
    pub fn invalid_threshold(
        metric: impl Into<String>,
        expression: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidThreshold {
            metric: metric.into(),
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidScenario error.
    pub fn invalid_scenario(msg: impl Into<String>) -> Self {
        Self::InvalidScenario(msg.into())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Load(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Load(err.to_string())
    }
}

/// Failure reported by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The request could not be sent or the response could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// The request did not complete within the transport timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// A single scenario iteration went wrong. Always converted into samples.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IterationError {
    /// A step's request failed in the transport.
    #[error("step `{step}`: {source}")]
    Transport {
        step: String,
        #[source]
        source: TransportError,
    },

    /// A check failed and the scenario short-circuits on failure.
    #[error("check `{check}` failed in step `{step}`")]
    CheckFailed { step: String, check: String },

    /// The iteration panicked.
    #[error("iteration panicked: {0}")]
    Panicked(String),
}

/// Rejected write to the metric collector.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    /// The collector was frozen at run end.
    #[error("metric collector is frozen; sample for `{0}` rejected")]
    Frozen(String),

    /// The sample's kind does not match the metric's established kind.
    #[error("metric `{metric}` is a {expected} metric, got a {actual} sample")]
    KindMismatch {
        metric: String,
        expected: MetricKind,
        actual: MetricKind,
    },
}

/// Per-threshold evaluation failure. Never aborts the other thresholds.
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize)]
pub enum ThresholdError {
    /// The threshold refers to a metric that recorded no samples.
    #[error("metric `{0}` was not recorded")]
    MissingMetric(String),

    /// The aggregate is not defined for the metric's kind.
    #[error("aggregate `{aggregate}` is not available on {kind} metric `{metric}`")]
    UnsupportedAggregate {
        metric: String,
        aggregate: String,
        kind: MetricKind,
    },
}

/// Why a run ended before its schedule completed.
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize)]
pub enum CancellationError {
    /// The stop signal was raised from outside the runner.
    #[error("run stopped externally after {elapsed:?}")]
    Stopped { elapsed: Duration },

    /// Workers did not drain within the graceful-stop period and were aborted.
    #[error("{abandoned} virtual user(s) did not finish within the {grace:?} graceful stop")]
    DrainTimeout { abandoned: usize, grace: Duration },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
