//! Results reporting and formatting.

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::metrics::{names, MetricKind, MetricValues};
use crate::runner::RunResult;
use crate::threshold::ThresholdOutcome;

/// Structured, serializable summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub name: String,
    pub timestamp: String,
    pub state: RunState,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdOutcome>,
    /// All thresholds passed and the run was not aborted.
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub test_run_duration_ms: f64,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub values: MetricValues,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdStatus {
    pub ok: bool,
}

const RULE_WIDTH: usize = 50;

/// Formats run results for output.
pub struct SummaryReporter;

impl SummaryReporter {
    /// Build the structured summary.
    pub fn summary(result: &RunResult) -> Summary {
        let mut metrics: BTreeMap<String, MetricSummary> = result
            .metrics
            .iter()
            .map(|(name, state)| {
                (
                    name.to_string(),
                    MetricSummary {
                        kind: state.kind(),
                        values: state.values(result.duration),
                        thresholds: BTreeMap::new(),
                    },
                )
            })
            .collect();

        for outcome in &result.thresholds {
            if let Some(metric) = metrics.get_mut(&outcome.metric) {
                metric
                    .thresholds
                    .insert(outcome.description.clone(), ThresholdStatus { ok: outcome.passed });
            }
        }

        Summary {
            name: result.name.clone(),
            timestamp: result.started_at.to_rfc3339(),
            state: RunState {
                test_run_duration_ms: result.duration.as_secs_f64() * 1000.0,
                aborted: result.is_aborted(),
                abort_reason: result.aborted.as_ref().map(|e| e.to_string()),
            },
            metrics,
            thresholds: result.thresholds.clone(),
            passed: result.thresholds_passed() && !result.is_aborted(),
        }
    }

    /// Format results as JSON.
    pub fn format_json(result: &RunResult) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&Self::summary(result))
    }

    /// Human-readable summary. Non-empty lines are prefixed with `indent`.
    pub fn format_text(result: &RunResult, indent: &str) -> String {
        let summary = Self::summary(result);
        let rule = "=".repeat(RULE_WIDTH);
        let mut lines: Vec<String> = vec![
            String::new(),
            format!("Load Test Summary: {}", summary.name),
            rule.clone(),
            String::new(),
        ];

        lines.push(match &summary.state.abort_reason {
            Some(reason) => format!("Status: ABORTED ({})", reason),
            None => "Status: completed".to_string(),
        });
        lines.push(format!(
            "Duration: {:.2}s",
            summary.state.test_run_duration_ms / 1000.0
        ));

        if let Some(reqs) = summary.metrics.get(names::HTTP_REQS) {
            lines.push(format!("Total Requests: {}", reqs.values.sum.unwrap_or_default()));
            lines.push(format!("Request Rate: {:.2}/s", reqs.values.rate.unwrap_or_default()));
        }

        if let Some(latency) = summary.metrics.get(names::HTTP_REQ_DURATION) {
            let v = &latency.values;
            lines.push(String::new());
            lines.push("Response Times:".to_string());
            for (label, value) in [
                ("Avg", v.avg),
                ("Min", v.min),
                ("Max", v.max),
                ("P95", v.p95),
                ("P99", v.p99),
            ] {
                lines.push(format!("  {}: {:.2}ms", label, value.unwrap_or_default()));
            }
        }

        if let Some(failed) = summary.metrics.get(names::HTTP_REQ_FAILED) {
            lines.push(String::new());
            lines.push(format!(
                "Failed Requests: {:.2}%",
                failed.values.rate.unwrap_or_default() * 100.0
            ));
        }
        if let Some(errors) = summary.metrics.get(names::ERRORS) {
            lines.push(format!(
                "Error Rate: {:.2}%",
                errors.values.rate.unwrap_or_default() * 100.0
            ));
        }

        lines.push(String::new());
        lines.extend(Self::metrics_table(&summary).lines().map(str::to_string));

        if !summary.thresholds.is_empty() {
            lines.push(String::new());
            lines.push("Thresholds:".to_string());
            for t in &summary.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                let detail = match (&t.observed, &t.error) {
                    (_, Some(err)) => format!(" ({})", err),
                    (Some(observed), None) => format!(" (observed {:.2})", observed),
                    (None, None) => String::new(),
                };
                lines.push(format!("  {} {} {}{}", mark, t.metric, t.description, detail));
            }
        }

        let verdict = if summary.state.aborted {
            "RUN ABORTED: results reflect completed iterations only"
        } else if summary.passed {
            "ALL THRESHOLDS PASSED"
        } else {
            "THRESHOLDS FAILED"
        };
        lines.push(String::new());
        lines.push(verdict.to_string());
        lines.push(String::new());
        lines.push(rule);

        lines
            .iter()
            .map(|line| {
                if line.is_empty() {
                    "\n".to_string()
                } else {
                    format!("{}{}\n", indent, line)
                }
            })
            .collect()
    }

    fn metrics_table(summary: &Summary) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "Metric", "Type", "Count", "Avg", "Min", "Med", "P95", "P99", "Max", "Rate",
            ]);

        for (name, metric) in &summary.metrics {
            let v = &metric.values;
            table.add_row(vec![
                name.clone(),
                metric.kind.to_string(),
                v.count.to_string(),
                fmt_opt(v.avg),
                fmt_opt(v.min),
                fmt_opt(v.med),
                fmt_opt(v.p95),
                fmt_opt(v.p99),
                fmt_opt(v.max),
                match metric.kind {
                    MetricKind::Rate => v.rate.map(|r| format!("{:.2}%", r * 100.0)).unwrap_or_default(),
                    _ => v.rate.map(|r| format!("{:.2}/s", r)).unwrap_or_default(),
                },
            ]);
        }

        table.to_string()
    }

    /// One CSV row per metric.
    pub fn format_csv(result: &RunResult) -> String {
        let summary = Self::summary(result);
        summary
            .metrics
            .iter()
            .map(|(name, metric)| {
                let v = &metric.values;
                format!(
                    "{},{},{},{},{},{},{},{},{},{},{}\n",
                    summary.timestamp,
                    csv_field(&summary.name),
                    csv_field(name),
                    metric.kind,
                    v.count,
                    fmt_opt(v.avg),
                    fmt_opt(v.min),
                    fmt_opt(v.p95),
                    fmt_opt(v.p99),
                    fmt_opt(v.max),
                    v.rate.map(|r| format!("{:.4}", r)).unwrap_or_default()
                )
            })
            .collect()
    }

    /// CSV header row.
    pub fn csv_header() -> &'static str {
        "timestamp,test,metric,type,count,avg,min,p95,p99,max,rate"
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

/// Quote fields containing separators (check names often contain spaces and commas).
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
