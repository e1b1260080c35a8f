//! Ramp schedule interpretation.
//!
//! A [`Schedule`] is an ordered list of [`Stage`]s. [`Schedule::state_at`] maps
//! elapsed run time to the number of virtual users that should be live. It is a
//! pure function, so ramp behaviour can be tested without waiting on a clock.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// One time window with a target concurrency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// How concurrency moves between stage targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampMode {
    /// Interpolate linearly from the previous stage's target to this stage's.
    #[default]
    Linear,
    /// Jump to the stage's target at the start of the stage and hold it.
    Step,
}

/// Scheduler output for one instant of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleState {
    pub target: u32,
    pub completed: bool,
}

/// Validated, immutable stage sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    stages: Vec<Stage>,
    mode: RampMode,
    total: Duration,
}

impl Schedule {
    /// Build a linear-ramp schedule.
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        Self::with_mode(stages, RampMode::Linear)
    }

    /// Build a schedule with an explicit ramp mode.
    pub fn with_mode(stages: Vec<Stage>, mode: RampMode) -> Result<Self> {
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        let total: Duration = stages.iter().map(|s| s.duration).sum();
        if total.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        Ok(Self {
            stages,
            mode,
            total,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn mode(&self) -> RampMode {
        self.mode
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest target any stage reaches.
    pub fn peak_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Target concurrency at `elapsed` since run start.
    ///
    /// A boundary instant belongs to the stage that starts there, whose starting
    /// level is the previous stage's target.
    pub fn state_at(&self, elapsed: Duration) -> ScheduleState {
        let mut stage_start = Duration::ZERO;
        let mut from = 0u32;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let target = match self.mode {
                    RampMode::Step => stage.target,
                    RampMode::Linear => {
                        interpolate(from, stage.target, elapsed - stage_start, stage.duration)
                    }
                };
                return ScheduleState {
                    target,
                    completed: false,
                };
            }
            stage_start = stage_end;
            from = stage.target;
        }

        ScheduleState {
            target: 0,
            completed: true,
        }
    }

    /// Interval between scheduler ticks: 1% of the run, clamped to [50ms, 1s].
    pub fn tick_interval(&self) -> Duration {
        (self.total / 100).clamp(Duration::from_millis(50), Duration::from_secs(1))
    }
}

/// Integer interpolation, truncating toward `from`.
fn interpolate(from: u32, to: u32, position: Duration, length: Duration) -> u32 {
    let length = length.as_nanos() as i128;
    if length == 0 {
        return to;
    }
    let delta = to as i128 - from as i128;
    let offset = delta * position.as_nanos() as i128 / length;
    (from as i128 + offset) as u32
}
