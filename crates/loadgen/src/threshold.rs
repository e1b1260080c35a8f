//! Pass/fail criteria over aggregated metrics.
//!
//! Expressions follow the familiar `<aggregate><op><bound>` form, e.g.
//! `p(95)<500` or `rate<0.1`.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, Result, ThresholdError};
use crate::metrics::{MetricKind, MetricSnapshot, MetricState};

/// Statistic a threshold reads from a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Avg,
    Min,
    Max,
    Med,
    /// Samples for trend/rate metrics, summed increments for counters.
    Count,
    /// Pass fraction for rate metrics, per-second rate for counters.
    Rate,
    Percentile(f64),
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Avg => f.write_str("avg"),
            Aggregate::Min => f.write_str("min"),
            Aggregate::Max => f.write_str("max"),
            Aggregate::Med => f.write_str("med"),
            Aggregate::Count => f.write_str("count"),
            Aggregate::Rate => f.write_str("rate"),
            Aggregate::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

impl FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Aggregate::Avg),
            "min" => Ok(Aggregate::Min),
            "max" => Ok(Aggregate::Max),
            "med" => Ok(Aggregate::Med),
            "count" => Ok(Aggregate::Count),
            "rate" => Ok(Aggregate::Rate),
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregate `{}`", s))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{}`", inner))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {} out of range 0-100", p));
                }
                Ok(Aggregate::Percentile(p))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// Two-character operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

/// Parsed threshold expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub aggregate: Aggregate,
    pub comparison: Comparison,
    pub bound: f64,
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (position, token, comparison) = Comparison::TOKENS
            .iter()
            .filter_map(|(token, cmp)| s.find(token).map(|pos| (pos, *token, *cmp)))
            .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
            .ok_or_else(|| "missing comparison operator".to_string())?;

        let aggregate = s[..position].trim().parse()?;
        let bound_str = s[position + token.len()..].trim();
        let bound: f64 = bound_str
            .parse()
            .map_err(|_| format!("invalid bound `{}`", bound_str))?;
        if !bound.is_finite() {
            return Err(format!("bound `{}` must be finite", bound_str));
        }

        Ok(Self {
            aggregate,
            comparison,
            bound,
        })
    }
}

impl ThresholdExpr {
    /// Read the aggregate from `state`.
    pub fn observe(
        &self,
        metric: &str,
        state: &MetricState,
        run_duration: Duration,
    ) -> std::result::Result<f64, ThresholdError> {
        let kind = state.kind();
        let observed = match (self.aggregate, kind) {
            (Aggregate::Avg, MetricKind::Trend) => Some(state.avg()),
            (Aggregate::Min, MetricKind::Trend) => Some(state.min()),
            (Aggregate::Max, MetricKind::Trend) => Some(state.max()),
            (Aggregate::Med, MetricKind::Trend) => state.percentile(50.0),
            (Aggregate::Percentile(p), MetricKind::Trend) => state.percentile(p),
            (Aggregate::Count, MetricKind::Counter) => Some(state.sum()),
            (Aggregate::Count, _) => Some(state.count() as f64),
            (Aggregate::Rate, MetricKind::Rate) => state.rate(),
            (Aggregate::Rate, MetricKind::Counter) => state.values(run_duration).rate,
            _ => None,
        };
        observed.ok_or_else(|| ThresholdError::UnsupportedAggregate {
            metric: metric.to_string(),
            aggregate: self.aggregate.to_string(),
            kind,
        })
    }
}

/// How a threshold decides pass/fail.
#[derive(Clone)]
pub enum ThresholdPredicate {
    Expr(ThresholdExpr),
    Custom(Arc<dyn Fn(&MetricState) -> bool + Send + Sync>),
}

impl fmt::Debug for ThresholdPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdPredicate::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            ThresholdPredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A pass/fail criterion on one metric.
#[derive(Debug, Clone)]
pub struct ThresholdSpec {
    pub metric: String,
    pub predicate: ThresholdPredicate,
    pub description: String,
}

impl ThresholdSpec {
    /// Parse an expression such as `p(95)<500`.
    pub fn parse(metric: impl Into<String>, expression: &str) -> Result<Self> {
        let metric = metric.into();
        let expr: ThresholdExpr = expression
            .parse()
            .map_err(|reason: String| ConfigError::invalid_threshold(&metric, expression, reason))?;
        Ok(Self {
            metric,
            predicate: ThresholdPredicate::Expr(expr),
            description: expression.trim().to_string(),
        })
    }

    pub fn custom(
        metric: impl Into<String>,
        description: impl Into<String>,
        predicate: impl Fn(&MetricState) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            metric: metric.into(),
            predicate: ThresholdPredicate::Custom(Arc::new(predicate)),
            description: description.into(),
        }
    }
}

/// Verdict for one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub description: String,
    pub passed: bool,
    /// The value compared against the bound, when the predicate is an expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ThresholdError>,
}

/// Checks thresholds against final metric state.
pub struct ThresholdEvaluator;

impl ThresholdEvaluator {
    /// One outcome per threshold, in the order given. A failing or unevaluable
    /// threshold never prevents the others from being evaluated.
    pub fn evaluate(
        snapshot: &MetricSnapshot,
        specs: &[ThresholdSpec],
        run_duration: Duration,
    ) -> Vec<ThresholdOutcome> {
        specs
            .iter()
            .map(|spec| Self::evaluate_one(snapshot, spec, run_duration))
            .collect()
    }

    fn evaluate_one(
        snapshot: &MetricSnapshot,
        spec: &ThresholdSpec,
        run_duration: Duration,
    ) -> ThresholdOutcome {
        let mut outcome = ThresholdOutcome {
            metric: spec.metric.clone(),
            description: spec.description.clone(),
            passed: false,
            observed: None,
            error: None,
        };

        let Some(state) = snapshot.get(&spec.metric) else {
            outcome.error = Some(ThresholdError::MissingMetric(spec.metric.clone()));
            return outcome;
        };

        match &spec.predicate {
            ThresholdPredicate::Expr(expr) => match expr.observe(&spec.metric, state, run_duration) {
                Ok(observed) => {
                    outcome.observed = Some(observed);
                    outcome.passed = expr.comparison.holds(observed, expr.bound);
                }
                Err(err) => outcome.error = Some(err),
            },
            ThresholdPredicate::Custom(predicate) => outcome.passed = predicate(state),
        }
        outcome
    }

    /// True when every outcome passed.
    pub fn all_passed(outcomes: &[ThresholdOutcome]) -> bool {
        outcomes.iter().all(|o| o.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SampleValue;

    fn snapshot() -> MetricSnapshot {
        let durations: Vec<SampleValue> = [100.0, 150.0, 200.0, 490.0, 510.0]
            .iter()
            .map(|v| SampleValue::Trend(*v))
            .collect();
        let errors: Vec<SampleValue> = (0..20).map(|i| SampleValue::Rate(i == 0)).collect();
        let reqs = [SampleValue::Counter(1.0); 30];
        [
            ("http_req_duration", MetricState::from_samples(&durations)),
            ("errors", MetricState::from_samples(&errors)),
            ("http_reqs", MetricState::from_samples(&reqs)),
        ]
        .into_iter()
        .map(|(name, state)| (name.to_string(), state.unwrap()))
        .collect()
    }

    fn evaluate(specs: &[ThresholdSpec]) -> Vec<ThresholdOutcome> {
        ThresholdEvaluator::evaluate(&snapshot(), specs, Duration::from_secs(10))
    }

    #[test]
    fn test_parse_expressions() {
        let expr: ThresholdExpr = "p(95)<500".parse().unwrap();
        assert_eq!(expr.aggregate, Aggregate::Percentile(95.0));
        assert_eq!(expr.comparison, Comparison::Lt);
        assert_eq!(expr.bound, 500.0);

        let expr: ThresholdExpr = " rate <= 0.1 ".parse().unwrap();
        assert_eq!(expr.aggregate, Aggregate::Rate);
        assert_eq!(expr.comparison, Comparison::Le);

        let expr: ThresholdExpr = "p(99.9)>=2".parse().unwrap();
        assert_eq!(expr.aggregate, Aggregate::Percentile(99.9));
        assert_eq!(expr.comparison, Comparison::Ge);

        assert!("p95<500".parse::<ThresholdExpr>().is_err());
        assert!("avg 500".parse::<ThresholdExpr>().is_err());
        assert!("p(101)<5".parse::<ThresholdExpr>().is_err());
        assert!("avg<fast".parse::<ThresholdExpr>().is_err());
    }

    #[test]
    fn test_invalid_threshold_is_config_error() {
        let err = ThresholdSpec::parse("http_req_duration", "p(95)").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { ref metric, .. } if metric == "http_req_duration"));
    }

    #[test]
    fn test_p95_over_limit_fails() {
        let outcomes = evaluate(&[ThresholdSpec::parse("http_req_duration", "p(95)<500").unwrap()]);
        assert!(!outcomes[0].passed);
        assert_eq!(outcomes[0].observed, Some(510.0));
        assert!(outcomes[0].error.is_none());
    }

    #[test]
    fn test_rate_and_counter_thresholds() {
        let outcomes = evaluate(&[
            ThresholdSpec::parse("errors", "rate<0.1").unwrap(),
            ThresholdSpec::parse("http_reqs", "count>=30").unwrap(),
            ThresholdSpec::parse("http_reqs", "rate>2.5").unwrap(),
        ]);
        assert_eq!(outcomes[0].observed, Some(0.05));
        assert!(outcomes.iter().all(|o| o.passed), "{:?}", outcomes);
        assert!(ThresholdEvaluator::all_passed(&outcomes));
    }

    #[test]
    fn test_missing_metric_fails_only_that_threshold() {
        let outcomes = evaluate(&[
            ThresholdSpec::parse("nonexistent", "avg<1").unwrap(),
            ThresholdSpec::parse("http_req_duration", "max<=510").unwrap(),
        ]);
        assert_eq!(
            outcomes[0].error,
            Some(ThresholdError::MissingMetric("nonexistent".to_string()))
        );
        assert!(!outcomes[0].passed);
        assert!(outcomes[1].passed);
    }

    #[test]
    fn test_unsupported_aggregate() {
        let outcomes = evaluate(&[ThresholdSpec::parse("errors", "p(95)<1").unwrap()]);
        assert!(matches!(
            outcomes[0].error,
            Some(ThresholdError::UnsupportedAggregate { kind: MetricKind::Rate, .. })
        ));
    }

    #[test]
    fn test_custom_predicate() {
        let outcomes = evaluate(&[ThresholdSpec::custom(
            "http_req_duration",
            "at least five samples",
            |state| state.count() >= 5,
        )]);
        assert!(outcomes[0].passed);
        assert_eq!(outcomes[0].observed, None);
    }

    #[test]
    fn test_outcomes_independent_of_order() {
        let specs = vec![
            ThresholdSpec::parse("http_req_duration", "p(95)<500").unwrap(),
            ThresholdSpec::parse("errors", "rate<0.1").unwrap(),
            ThresholdSpec::parse("missing", "count>0").unwrap(),
            ThresholdSpec::parse("http_req_duration", "avg<300").unwrap(),
        ];
        let forward = evaluate(&specs);
        let mut reversed_specs = specs.clone();
        reversed_specs.reverse();
        let mut backward = evaluate(&reversed_specs);
        backward.reverse();
        assert_eq!(forward, backward);
    }
}
