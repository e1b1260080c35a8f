//! Virtual-user pool.
//!
//! Each virtual user is an independent tokio task looping over scenario
//! iterations. The pool grows and shrinks to the scheduler's target; retired
//! workers finish their in-flight iteration before exiting.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::IterationError;
use crate::metrics::{names, MetricCollector, Sample};
use crate::scenario::{IterationOutcome, ScenarioRunner};

struct Worker {
    id: u32,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn signal_stop(&self) {
        // A closed channel means the worker already exited.
        let _ = self.stop.send(true);
    }
}

/// How a pool shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Workers that finished their iteration and exited.
    pub drained: usize,
    /// Workers aborted after the grace period; their iterations were discarded.
    pub abandoned: usize,
}

/// Keeps the number of live virtual users equal to a target.
pub struct VuPool {
    runner: Arc<ScenarioRunner>,
    collector: Arc<MetricCollector>,
    iteration_pause: Duration,
    active: Vec<Worker>,
    draining: Vec<Worker>,
    next_id: u32,
}

impl VuPool {
    pub fn new(
        runner: Arc<ScenarioRunner>,
        collector: Arc<MetricCollector>,
        iteration_pause: Duration,
    ) -> Self {
        Self {
            runner,
            collector,
            iteration_pause,
            active: Vec::new(),
            draining: Vec::new(),
            next_id: 1,
        }
    }

    /// Workers that are looping and not asked to stop.
    pub fn live(&self) -> usize {
        self.active.len()
    }

    /// Retired workers still finishing an iteration.
    pub fn draining(&self) -> usize {
        self.draining.iter().filter(|w| !w.handle.is_finished()).count()
    }

    /// Spawn or retire workers so that `target` are live.
    ///
    /// Retired workers are the most recently started ones; they stop after
    /// their in-flight iteration.
    pub fn adjust(&mut self, target: u32) {
        self.draining.retain(|w| !w.handle.is_finished());

        let target = target as usize;
        let live = self.active.len();
        if target > live {
            for _ in live..target {
                let worker = self.spawn_worker();
                self.active.push(worker);
            }
            debug!(from = live, to = target, "Scaled up virtual users");
        } else if target < live {
            let retired = self.active.split_off(target);
            for worker in &retired {
                worker.signal_stop();
            }
            self.draining.extend(retired);
            debug!(from = live, to = target, "Scaled down virtual users");
        }
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Workers still running after `grace` are aborted; an aborted iteration's
    /// samples are never committed.
    pub async fn stop(&mut self, grace: Duration) -> DrainReport {
        for worker in &self.active {
            worker.signal_stop();
        }
        let mut workers: Vec<Worker> = self.active.drain(..).collect();
        workers.append(&mut self.draining);

        let deadline = Instant::now() + grace;
        let mut report = DrainReport::default();
        for mut worker in workers {
            match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(_) => report.drained += 1,
                Err(_) => {
                    warn!(vu = worker.id, "Virtual user did not drain in time; aborting");
                    worker.handle.abort();
                    let _ = worker.handle.await;
                    report.abandoned += 1;
                }
            }
        }
        report
    }

    fn spawn_worker(&mut self) -> Worker {
        let id = self.next_id;
        self.next_id += 1;

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            run_worker(
                id,
                Arc::clone(&self.runner),
                Arc::clone(&self.collector),
                self.iteration_pause,
                stop_rx,
            )
            .instrument(info_span!("vu", id)),
        );
        Worker { id, stop, handle }
    }
}

impl Drop for VuPool {
    fn drop(&mut self) {
        for worker in self.active.iter().chain(self.draining.iter()) {
            worker.handle.abort();
        }
    }
}

async fn run_worker(
    id: u32,
    runner: Arc<ScenarioRunner>,
    collector: Arc<MetricCollector>,
    pause: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut iteration: u64 = 0;
    loop {
        if *stop.borrow() {
            break;
        }

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(runner.run_iteration()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => IterationOutcome {
                samples: Vec::new(),
                error: Some(IterationError::Panicked(panic_message(panic.as_ref()))),
            },
        };
        commit_iteration(&collector, outcome, started.elapsed(), id, iteration);
        iteration += 1;

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(vu = id, iterations = iteration, "Virtual user stopped");
}

/// Append an iteration's buffered samples plus its iteration-level metrics.
fn commit_iteration(
    collector: &MetricCollector,
    outcome: IterationOutcome,
    elapsed: Duration,
    vu: u32,
    iteration: u64,
) {
    let IterationOutcome { mut samples, error } = outcome;
    if let Some(ref err) = error {
        warn!(vu, iteration, error = %err, "Iteration failed");
    }
    samples.push(Sample::counter(names::ITERATIONS, 1.0));
    samples.push(Sample::duration(names::ITERATION_DURATION, elapsed));
    samples.push(Sample::rate(names::ITERATION_FAILED, error.is_some()));

    if let Err(err) = collector.append_batch(samples) {
        warn!(vu, iteration, error = %err, "Iteration samples rejected");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
