//! Load generation engine.
//!
//! This crate provides tools to:
//! - Ramp virtual users through a staged schedule
//! - Run scenario iterations against a pluggable transport
//! - Aggregate trend, rate and counter metrics with percentile support
//! - Evaluate pass/fail thresholds and format run summaries

pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod schedule;
pub mod testing;
pub mod threshold;

pub use config::{HumanDuration, TestConfig};
pub use error::{
    CancellationError, ConfigError, IterationError, MetricError, ThresholdError, TransportError,
};
pub use metrics::{MetricCollector, MetricKind, MetricSnapshot, MetricState, MetricValues, Sample, SampleValue};
pub use pool::{DrainReport, VuPool};
pub use report::{Summary, SummaryReporter};
pub use runner::{LoadRunner, RunOptions, RunResult, StopSignal};
pub use scenario::{
    Check, CheckPredicate, RequestDescriptor, Scenario, ScenarioRunner, Step, Transport,
    TransportResponse,
};
pub use schedule::{RampMode, Schedule, ScheduleState, Stage};
pub use threshold::{ThresholdEvaluator, ThresholdOutcome, ThresholdSpec};
