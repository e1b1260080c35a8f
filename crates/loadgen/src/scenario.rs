//! Scenario definition and single-iteration execution.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{ConfigError, IterationError, Result, TransportError};
use crate::metrics::{names, Sample};

/// What to send for one step. Paths are resolved against the transport's base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestDescriptor {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: Some(body.into()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What the transport observed for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub duration: Duration,
    pub body: Bytes,
}

impl TransportResponse {
    /// 4xx/5xx responses count as failed requests.
    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}

/// Sends requests to the system under test.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &RequestDescriptor)
        -> std::result::Result<TransportResponse, TransportError>;
}

/// Success condition evaluated against a response.
#[derive(Clone)]
pub enum CheckPredicate {
    /// Status code is one of the listed codes.
    StatusIn(Vec<u16>),
    /// Request completed in strictly less than the given time.
    MaxDuration(Duration),
    /// Response body contains the given text.
    BodyContains(String),
    Custom(Arc<dyn Fn(&TransportResponse) -> bool + Send + Sync>),
}

impl CheckPredicate {
    pub fn evaluate(&self, response: &TransportResponse) -> bool {
        match self {
            CheckPredicate::StatusIn(codes) => codes.contains(&response.status),
            CheckPredicate::MaxDuration(limit) => response.duration < *limit,
            CheckPredicate::BodyContains(needle) => {
                String::from_utf8_lossy(&response.body).contains(needle.as_str())
            }
            CheckPredicate::Custom(f) => f(response),
        }
    }
}

impl fmt::Debug for CheckPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckPredicate::StatusIn(codes) => f.debug_tuple("StatusIn").field(codes).finish(),
            CheckPredicate::MaxDuration(d) => f.debug_tuple("MaxDuration").field(d).finish(),
            CheckPredicate::BodyContains(s) => f.debug_tuple("BodyContains").field(s).finish(),
            CheckPredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A named pass/fail assertion on a response.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub predicate: CheckPredicate,
}

impl Check {
    pub fn new(name: impl Into<String>, predicate: CheckPredicate) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }

    pub fn status(name: impl Into<String>, codes: &[u16]) -> Self {
        Self::new(name, CheckPredicate::StatusIn(codes.to_vec()))
    }

    pub fn faster_than(name: impl Into<String>, limit: Duration) -> Self {
        Self::new(name, CheckPredicate::MaxDuration(limit))
    }
}

/// One request plus the checks run against its response.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub request: RequestDescriptor,
    pub checks: Vec<Check>,
    /// Pause inside the iteration after this step.
    pub pause_after: Duration,
}

impl Step {
    pub fn new(name: impl Into<String>, request: RequestDescriptor) -> Self {
        Self {
            name: name.into(),
            request,
            checks: Vec::new(),
            pause_after: Duration::ZERO,
        }
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn pause_after(mut self, pause: Duration) -> Self {
        self.pause_after = pause;
        self
    }
}

/// Ordered steps executed once per iteration.
#[derive(Debug, Clone)]
pub struct Scenario {
    name: String,
    steps: Vec<Step>,
    short_circuit: bool,
}

impl Scenario {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self> {
        if steps.is_empty() {
            return Err(ConfigError::invalid_scenario("scenario has no steps"));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &steps {
            if step.name.trim().is_empty() {
                return Err(ConfigError::invalid_scenario("step name must not be empty"));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ConfigError::invalid_scenario(format!(
                    "duplicate step name `{}`",
                    step.name
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            steps,
            short_circuit: false,
        })
    }

    /// Stop the iteration at the first failed check or transport error.
    pub fn short_circuit(mut self, enabled: bool) -> Self {
        self.short_circuit = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Samples buffered during one iteration, committed together at its end.
#[derive(Debug, Default)]
pub struct IterationOutcome {
    pub samples: Vec<Sample>,
    pub error: Option<IterationError>,
}

/// Executes scenario iterations through a transport. Holds no per-iteration state.
pub struct ScenarioRunner {
    scenario: Arc<Scenario>,
    transport: Arc<dyn Transport>,
}

impl ScenarioRunner {
    pub fn new(scenario: Scenario, transport: Arc<dyn Transport>) -> Self {
        Self {
            scenario: Arc::new(scenario),
            transport,
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Run every step once. Samples are returned rather than recorded so that an
    /// iteration cut short never reaches the collector.
    pub async fn run_iteration(&self) -> IterationOutcome {
        let mut outcome = IterationOutcome::default();

        for step in self.scenario.steps() {
            let passed = match self.transport.execute(&step.request).await {
                Ok(response) => self.record_response(step, &response, &mut outcome),
                Err(err) => {
                    debug!(step = %step.name, error = %err, "Request failed");
                    self.record_transport_error(step, &mut outcome);
                    outcome.error.get_or_insert(IterationError::Transport {
                        step: step.name.clone(),
                        source: err,
                    });
                    false
                }
            };

            if !passed && self.scenario.short_circuit {
                break;
            }

            if !step.pause_after.is_zero() {
                tokio::time::sleep(step.pause_after).await;
            }
        }

        outcome
    }

    /// Returns whether every check passed.
    fn record_response(
        &self,
        step: &Step,
        response: &TransportResponse,
        outcome: &mut IterationOutcome,
    ) -> bool {
        let samples = &mut outcome.samples;
        samples.push(Sample::counter(names::HTTP_REQS, 1.0));
        samples.push(Sample::duration(names::HTTP_REQ_DURATION, response.duration));
        samples.push(Sample::duration(
            names::step_duration(&step.name),
            response.duration,
        ));
        samples.push(Sample::rate(names::HTTP_REQ_FAILED, response.is_failure()));
        samples.push(Sample::counter(
            names::DATA_RECEIVED,
            response.body.len() as f64,
        ));

        let mut all_passed = true;
        let mut first_failed: Option<&str> = None;
        for check in &step.checks {
            let passed = check.predicate.evaluate(response);
            samples.push(Sample::rate(names::CHECKS, passed));
            samples.push(Sample::rate(names::check(&check.name), passed));
            if !passed && first_failed.is_none() {
                first_failed = Some(check.name.as_str());
            }
            all_passed &= passed;
        }
        samples.push(Sample::rate(names::ERRORS, !all_passed));

        if let Some(check) = first_failed {
            debug!(step = %step.name, check, status = response.status, "Check failed");
            if self.scenario.short_circuit && outcome.error.is_none() {
                outcome.error = Some(IterationError::CheckFailed {
                    step: step.name.clone(),
                    check: check.to_string(),
                });
            }
        }
        all_passed
    }

    /// A transport failure fails the request and every check of the step.
    fn record_transport_error(&self, step: &Step, outcome: &mut IterationOutcome) {
        let samples = &mut outcome.samples;
        samples.push(Sample::counter(names::HTTP_REQS, 1.0));
        samples.push(Sample::rate(names::HTTP_REQ_FAILED, true));
        for check in &step.checks {
            samples.push(Sample::rate(names::CHECKS, false));
            samples.push(Sample::rate(names::check(&check.name), false));
        }
        samples.push(Sample::rate(names::ERRORS, true));
    }
}
