//! End-to-end runs of the load engine against a simulated transport.
//!
//! Every test runs on a paused tokio clock, so minute-long schedules finish
//! instantly while the engine still observes realistic timings.

use std::sync::Arc;
use std::time::Duration;

use loadgen::metrics::names;
use loadgen::testing::SimulatedTransport;
use loadgen::{
    CancellationError, Check, LoadRunner, RampMode, RequestDescriptor, RunOptions, RunResult,
    Scenario, ScenarioRunner, Schedule, Stage, Step, SummaryReporter, ThresholdSpec,
};

fn ping_scenario() -> Scenario {
    Scenario::new(
        "ping",
        vec![Step::new("ping", RequestDescriptor::get("/ping"))
            .check(Check::status("ping status is 200", &[200]))],
    )
    .unwrap()
}

fn runner(
    schedule: Schedule,
    thresholds: Vec<ThresholdSpec>,
    scenario: Scenario,
    transport: Arc<SimulatedTransport>,
    options: RunOptions,
) -> LoadRunner {
    LoadRunner::new(
        "integration",
        schedule,
        thresholds,
        ScenarioRunner::new(scenario, transport),
        options,
    )
}

/// Jump straight to `vus` users and hold them.
fn hold(secs: u64, vus: u32) -> Schedule {
    Schedule::with_mode(vec![Stage::new(Duration::from_secs(secs), vus)], RampMode::Step).unwrap()
}

fn iterations(result: &RunResult) -> u64 {
    result
        .metrics
        .get(names::ITERATIONS)
        .map(|m| m.sum() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Complete runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_constant_load_completes_schedule() {
    let transport = Arc::new(SimulatedTransport::new(200).with_latency(Duration::from_millis(500)));
    let schedule = Schedule::new(vec![
        Stage::new(Duration::from_secs(10), 10),
        Stage::new(Duration::from_secs(50), 10),
    ])
    .unwrap();
    let load = runner(
        schedule,
        vec![ThresholdSpec::parse(names::HTTP_REQ_DURATION, "p(95)<600").unwrap()],
        ping_scenario(),
        Arc::clone(&transport),
        RunOptions::default(),
    );

    let result = load.run().await;

    assert!(result.aborted.is_none(), "{:?}", result.aborted);
    assert!(result.duration >= Duration::from_secs(60));
    assert!(iterations(&result) > 0);
    assert_eq!(iterations(&result), transport.requests());

    let latency = result.metrics.get(names::HTTP_REQ_DURATION).unwrap();
    assert!(latency.min() >= 0.0);
    assert!((latency.max() - 500.0).abs() < 1e-6);

    let vus = result.metrics.get(names::VUS).unwrap();
    assert_eq!(vus.max(), 10.0);

    assert_eq!(
        result.metrics.get(names::CHECKS).unwrap().rate(),
        Some(1.0)
    );
    assert!(result.thresholds_passed());
}

#[tokio::test(start_paused = true)]
async fn test_linear_ramp_never_exceeds_peak() {
    let transport = Arc::new(SimulatedTransport::new(200).with_latency(Duration::from_millis(250)));
    let schedule = Schedule::new(vec![
        Stage::new(Duration::from_secs(10), 10),
        Stage::new(Duration::from_secs(10), 0),
    ])
    .unwrap();
    let load = runner(
        schedule,
        Vec::new(),
        ping_scenario(),
        Arc::clone(&transport),
        RunOptions::default(),
    );

    let result = load.run().await;

    let vus = result.metrics.get(names::VUS).unwrap();
    assert_eq!(vus.min(), 0.0);
    assert!(vus.max() <= 10.0);
    assert!(vus.max() >= 9.0);
    assert_eq!(iterations(&result), transport.requests());
}

#[tokio::test(start_paused = true)]
async fn test_step_ramp_holds_zero_stage() {
    let transport = Arc::new(SimulatedTransport::new(200).with_latency(Duration::from_millis(100)));
    let schedule = Schedule::with_mode(
        vec![
            Stage::new(Duration::from_secs(2), 0),
            Stage::new(Duration::from_secs(2), 5),
        ],
        RampMode::Step,
    )
    .unwrap();
    let load = runner(
        schedule,
        Vec::new(),
        ping_scenario(),
        Arc::clone(&transport),
        RunOptions::default(),
    );

    let result = load.run().await;

    let vus = result.metrics.get(names::VUS).unwrap();
    assert_eq!(vus.min(), 0.0);
    assert_eq!(vus.max(), 5.0);
    // Five users for two seconds at ~100ms per iteration.
    let done = iterations(&result);
    assert!((80..=110).contains(&done), "iterations: {}", done);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_signal_ends_run_early() {
    let transport = Arc::new(SimulatedTransport::new(200).with_latency(Duration::from_millis(300)));
    let schedule = hold(60, 5);
    let load = runner(
        schedule,
        Vec::new(),
        ping_scenario(),
        Arc::clone(&transport),
        RunOptions::default(),
    );
    let stop = load.stop_signal();

    let handle = tokio::spawn(async move { load.run().await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    stop.stop();
    assert!(stop.is_stopped());
    let result = handle.await.unwrap();

    match result.aborted {
        Some(CancellationError::Stopped { elapsed }) => {
            assert!(elapsed >= Duration::from_secs(5));
            assert!(elapsed < Duration::from_secs(6));
        }
        ref other => panic!("expected Stopped, got {:?}", other),
    }
    assert!(result.duration < Duration::from_secs(10));
    // Workers finish their in-flight iteration; none is half-recorded.
    assert_eq!(iterations(&result), transport.requests());
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_discards_unfinished_iterations() {
    let transport = Arc::new(SimulatedTransport::new(200).with_latency(Duration::from_secs(60)));
    let schedule = hold(5, 3);
    let load = runner(
        schedule,
        Vec::new(),
        ping_scenario(),
        Arc::clone(&transport),
        RunOptions {
            graceful_stop: Duration::from_secs(2),
            ..Default::default()
        },
    );

    let result = load.run().await;

    assert_eq!(
        result.aborted,
        Some(CancellationError::DrainTimeout {
            abandoned: 3,
            grace: Duration::from_secs(2),
        })
    );
    assert!(result.is_aborted());
    assert!(result.metrics.get(names::ITERATIONS).is_none());
    assert!(result.metrics.get(names::HTTP_REQS).is_none());
    assert_eq!(transport.requests(), 3);
}

// ============================================================================
// Thresholds and reporting
// ============================================================================

fn mixed_scenario() -> Scenario {
    Scenario::new(
        "mixed",
        vec![
            Step::new("persons", RequestDescriptor::get("/public/persons"))
                .check(Check::status("persons status is 200", &[200])),
            Step::new("broken", RequestDescriptor::get("/broken"))
                .check(Check::status("broken status is 200", &[200])),
        ],
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_thresholds_evaluated_after_run() {
    let transport = Arc::new(
        SimulatedTransport::new(200)
            .with_latency(Duration::from_millis(100))
            .with_route("/broken", 500),
    );
    let schedule = hold(10, 2);
    let load = runner(
        schedule,
        vec![
            ThresholdSpec::parse(names::HTTP_REQ_DURATION, "p(95)<500").unwrap(),
            ThresholdSpec::parse(names::ERRORS, "rate<0.1").unwrap(),
            ThresholdSpec::parse("not_recorded", "count>0").unwrap(),
        ],
        mixed_scenario(),
        transport,
        RunOptions::default(),
    );

    let result = load.run().await;

    assert_eq!(result.thresholds.len(), 3);
    assert!(result.thresholds[0].passed);
    assert!(!result.thresholds[1].passed);
    assert_eq!(result.thresholds[1].observed, Some(0.5));
    assert!(!result.thresholds[2].passed);
    assert!(result.thresholds[2].error.is_some());
    assert!(!result.thresholds_passed());

    let failed = result.metrics.get(names::HTTP_REQ_FAILED).unwrap();
    assert_eq!(failed.rate(), Some(0.5));
    assert!(result
        .metrics
        .contains(&names::step_duration("broken")));
}

#[tokio::test(start_paused = true)]
async fn test_summary_of_real_run() {
    let transport = Arc::new(SimulatedTransport::new(200).with_latency(Duration::from_millis(200)));
    let schedule = hold(5, 2);
    let load = runner(
        schedule,
        vec![ThresholdSpec::parse(names::HTTP_REQ_DURATION, "p(95)<500").unwrap()],
        ping_scenario(),
        transport,
        RunOptions::default(),
    );

    let result = load.run().await;

    let json = SummaryReporter::format_json(&result).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["name"], "integration");
    assert_eq!(value["state"]["aborted"], false);
    assert_eq!(value["passed"], true);
    assert_eq!(value["metrics"]["iterations"]["type"], "counter");
    assert_eq!(
        value["metrics"]["http_req_duration"]["thresholds"]["p(95)<500"]["ok"],
        true
    );

    let text = SummaryReporter::format_text(&result, "");
    assert!(text.contains("Load Test Summary: integration"));
    assert!(text.contains("✓ http_req_duration p(95)<500"));
    assert!(text.contains("ALL THRESHOLDS PASSED"));
}
