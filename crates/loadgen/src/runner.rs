//! Load test orchestration.
//!
//! [`LoadRunner::run`] ticks the schedule, resizes the virtual-user pool, and on
//! completion (or stop) drains the pool, freezes the collector and evaluates
//! thresholds.

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::CancellationError;
use crate::metrics::{names, MetricCollector, MetricSnapshot, Sample};
use crate::pool::VuPool;
use crate::scenario::ScenarioRunner;
use crate::schedule::Schedule;
use crate::threshold::{ThresholdEvaluator, ThresholdOutcome, ThresholdSpec};

/// Execution knobs that are not part of the schedule itself.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Delay between a virtual user's iterations.
    pub iteration_pause: Duration,
    /// How long workers may take to finish after the schedule ends.
    pub graceful_stop: Duration,
    /// Draw a progress bar on the terminal.
    pub show_progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            iteration_pause: Duration::ZERO,
            graceful_stop: Duration::from_secs(30),
            show_progress: false,
        }
    }
}

/// Cloneable handle that ends a run early. Workers finish their current
/// iteration before exiting.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Final, immutable outcome of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Wall-clock time from first tick to collector freeze.
    pub duration: Duration,
    pub metrics: MetricSnapshot,
    pub thresholds: Vec<ThresholdOutcome>,
    /// Set when the run did not complete its schedule.
    pub aborted: Option<CancellationError>,
}

impl RunResult {
    pub fn thresholds_passed(&self) -> bool {
        ThresholdEvaluator::all_passed(&self.thresholds)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

/// Executes a scenario according to a schedule.
pub struct LoadRunner {
    name: String,
    schedule: Schedule,
    thresholds: Vec<ThresholdSpec>,
    runner: Arc<ScenarioRunner>,
    options: RunOptions,
    stop: StopSignal,
}

impl LoadRunner {
    pub fn new(
        name: impl Into<String>,
        schedule: Schedule,
        thresholds: Vec<ThresholdSpec>,
        runner: ScenarioRunner,
        options: RunOptions,
    ) -> Self {
        Self {
            name: name.into(),
            schedule,
            thresholds,
            runner: Arc::new(runner),
            options,
            stop: StopSignal::new(),
        }
    }

    /// Handle for stopping this run from elsewhere (e.g. a Ctrl-C handler).
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Run the load test.
    pub async fn run(&self) -> RunResult {
        let collector = Arc::new(MetricCollector::new());
        let mut pool = VuPool::new(
            Arc::clone(&self.runner),
            Arc::clone(&collector),
            self.options.iteration_pause,
        );
        let mut stop_rx = self.stop.subscribe();

        let total = self.schedule.total_duration();
        let tick = self.schedule.tick_interval();
        let pb = self.progress_bar(total);

        info!(
            name = %self.name,
            scenario = %self.runner.scenario().name(),
            stages = self.schedule.stages().len(),
            total_secs = total.as_secs_f64(),
            peak_vus = self.schedule.peak_target(),
            "Starting load test"
        );

        let started_at = Utc::now();
        let start = Instant::now();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stopped = false;

        loop {
            if *stop_rx.borrow() {
                stopped = true;
                break;
            }
            let elapsed = start.elapsed();
            let state = self.schedule.state_at(elapsed);
            if state.completed {
                break;
            }

            pool.adjust(state.target);
            if let Err(err) = collector.append(Sample::trend(names::VUS, pool.live() as f64)) {
                warn!(error = %err, "Failed to record VU count");
            }
            pb.set_position(elapsed.as_secs().min(total.as_secs()));
            pb.set_message(format!("{} VUs", pool.live()));

            tokio::select! {
                _ = interval.tick() => {}
                changed = stop_rx.changed() => {
                    if changed.is_ok() {
                        stopped = true;
                        break;
                    }
                }
            }
        }

        let stop_elapsed = start.elapsed();
        if stopped {
            info!(elapsed_secs = stop_elapsed.as_secs_f64(), "Stop requested; draining virtual users");
        }
        pb.set_message("Waiting for in-flight iterations...");
        let drain = pool.stop(self.options.graceful_stop).await;
        collector.freeze();
        let duration = start.elapsed();

        let aborted = if drain.abandoned > 0 {
            Some(CancellationError::DrainTimeout {
                abandoned: drain.abandoned,
                grace: self.options.graceful_stop,
            })
        } else if stopped {
            Some(CancellationError::Stopped {
                elapsed: stop_elapsed,
            })
        } else {
            None
        };

        match &aborted {
            Some(reason) => pb.abandon_with_message(format!("Aborted: {}", reason)),
            None => pb.finish_with_message("Complete!"),
        }

        let metrics = collector.snapshot();
        let thresholds = ThresholdEvaluator::evaluate(&metrics, &self.thresholds, duration);
        let failed = thresholds.iter().filter(|t| !t.passed).count();

        info!(
            name = %self.name,
            duration_secs = duration.as_secs_f64(),
            drained = drain.drained,
            abandoned = drain.abandoned,
            thresholds = thresholds.len(),
            thresholds_failed = failed,
            aborted = aborted.is_some(),
            "Load test finished"
        );

        RunResult {
            name: self.name.clone(),
            started_at,
            duration,
            metrics,
            thresholds,
            aborted,
        }
    }

    fn progress_bar(&self, total: Duration) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total.as_secs());
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}s {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}
