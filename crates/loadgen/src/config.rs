//! Configuration loading and management.
//!
//! A test file declares the stage plan, thresholds and scenario steps. It is
//! loaded from YAML, validated, and turned into the engine's immutable types
//! before any virtual user starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::runner::RunOptions;
use crate::scenario::{Check, CheckPredicate, RequestDescriptor, Scenario, Step};
use crate::schedule::{RampMode, Schedule, Stage};
use crate::threshold::ThresholdSpec;

/// Main test configuration loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    #[serde(default)]
    pub ramp: RampMode,
    #[serde(default)]
    pub iteration_pause: HumanDuration,
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop: HumanDuration,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    pub stages: Vec<StageConfig>,
    /// Metric name to one or more threshold expressions.
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdExprs>,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub short_circuit: bool,
}

fn default_graceful_stop() -> HumanDuration {
    HumanDuration(Duration::from_secs(30))
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration(Duration::from_secs(30))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub duration: HumanDuration,
    pub target: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdExprs {
    One(String),
    Many(Vec<String>),
}

impl ThresholdExprs {
    fn as_slice(&self) -> &[String] {
        match self {
            ThresholdExprs::One(expr) => std::slice::from_ref(expr),
            ThresholdExprs::Many(exprs) => exprs,
        }
    }
}

/// One scenario step as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(flatten)]
    pub request: RequestDescriptor,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default)]
    pub pause_after: HumanDuration,
}

/// A check sets exactly one condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,
}

impl CheckConfig {
    fn to_check(&self, step: &str) -> Result<Check> {
        let predicate = match (&self.status, &self.max_duration, &self.body_contains) {
            (Some(codes), None, None) if !codes.is_empty() => CheckPredicate::StatusIn(codes.clone()),
            (None, Some(limit), None) => CheckPredicate::MaxDuration(limit.0),
            (None, None, Some(needle)) => CheckPredicate::BodyContains(needle.clone()),
            _ => {
                return Err(ConfigError::invalid_scenario(format!(
                    "check `{}` in step `{}` must set exactly one of status, max_duration, body_contains",
                    self.name, step
                )))
            }
        };
        Ok(Check::new(self.name.clone(), predicate))
    }
}

impl TestConfig {
    /// Load configuration from YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate configuration by building every engine type from it.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Load("name must not be empty".to_string()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Load(format!(
                "base_url `{}` must start with http:// or https://",
                self.base_url
            )));
        }
        self.schedule()?;
        self.thresholds()?;
        self.scenario()?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<Schedule> {
        let stages = self
            .stages
            .iter()
            .map(|s| Stage::new(s.duration.0, s.target))
            .collect();
        Schedule::with_mode(stages, self.ramp)
    }

    pub fn thresholds(&self) -> Result<Vec<ThresholdSpec>> {
        let mut specs = Vec::new();
        for (metric, exprs) in &self.thresholds {
            if exprs.as_slice().is_empty() {
                return Err(ConfigError::invalid_threshold(metric, "", "empty list"));
            }
            for expr in exprs.as_slice() {
                specs.push(ThresholdSpec::parse(metric.clone(), expr)?);
            }
        }
        Ok(specs)
    }

    pub fn scenario(&self) -> Result<Scenario> {
        let steps = self
            .steps
            .iter()
            .map(|s| -> Result<Step> {
                let checks = s
                    .checks
                    .iter()
                    .map(|c| c.to_check(&s.name))
                    .collect::<Result<Vec<_>>>()?;
                let mut step =
                    Step::new(s.name.clone(), s.request.clone()).pause_after(s.pause_after.0);
                step.checks = checks;
                Ok(step)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Scenario::new(self.name.clone(), steps)?.short_circuit(self.short_circuit))
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            iteration_pause: self.iteration_pause.0,
            graceful_stop: self.graceful_stop.0,
            ..Default::default()
        }
    }
}

/// Duration written as `1m`, `30s`, `500ms`, or plain seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn parse(value: &str) -> Result<Self> {
        humantime::parse_duration(value.trim())
            .map(HumanDuration)
            .map_err(|e| ConfigError::InvalidDuration {
                value: value.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string (e.g. 1m, 30s, 500ms) or whole seconds")
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(HumanDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(HumanDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E>(self, v: f64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a non-negative, finite number"));
                }
                Ok(HumanDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                HumanDuration::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
