//! Staged ramp schedules.
//!
//! A [`Schedule`] is an ordered list of [`Stage`]s. Each stage ramps the
//! target number of virtual users linearly from the previous stage's target
//! to its own over its duration, so the whole sequence describes a
//! piecewise-linear concurrency curve over elapsed run time.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// One window of the load curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// How long the ramp towards `target` takes. Zero means an instantaneous jump.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Concurrency reached at the end of the stage.
    pub target: u32,
}

impl Stage {
    #[must_use]
    pub const fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Lifecycle phase of a run.
///
/// [`Schedule::phase_at`] only ever yields the three load phases; the others
/// are entered by the run driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Setup,
    Ramping,
    Steady,
    RampingDown,
    Teardown,
    Terminal,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Ramping => "ramping",
            Self::Steady => "steady",
            Self::RampingDown => "ramping-down",
            Self::Teardown => "teardown",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Validated, immutable stage sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    stages: Vec<Stage>,
    start_target: u32,
    total: Duration,
}

impl Schedule {
    /// Build a schedule starting from zero virtual users.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidStage`] when the sequence is empty or spans
    /// no time at all.
    pub fn new(stages: Vec<Stage>) -> CoreResult<Self> {
        Self::with_start_target(stages, 0)
    }

    /// Build a schedule whose first stage ramps from `start_target`.
    ///
    /// # Errors
    ///
    /// Same as [`Schedule::new`].
    pub fn with_start_target(stages: Vec<Stage>, start_target: u32) -> CoreResult<Self> {
        if stages.is_empty() {
            return Err(CoreError::invalid_stage("schedule needs at least one stage"));
        }

        let total = stages.iter().map(|s| s.duration).sum::<Duration>();
        if total.is_zero() {
            return Err(CoreError::invalid_stage(
                "schedule must span a positive duration",
            ));
        }

        Ok(Self {
            stages,
            start_target,
            total,
        })
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn start_target(&self) -> u32 {
        self.start_target
    }

    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest concurrency the curve ever reaches.
    #[must_use]
    pub fn max_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_target))
            .max()
            .unwrap_or(0)
    }

    /// The run is complete once elapsed time reaches the end of the last stage.
    #[must_use]
    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.total
    }

    /// Unrounded position on the curve, `None` past the last stage.
    #[must_use]
    pub fn target_exact(&self, elapsed: Duration) -> Option<f64> {
        self.locate(elapsed).map(|pos| pos.value)
    }

    /// Target concurrency at `elapsed`, floored to a whole number of users.
    ///
    /// At the end of every stage this equals the stage's declared target.
    /// Returns `None` once `elapsed` is past the last stage.
    #[must_use]
    pub fn target_at(&self, elapsed: Duration) -> Option<u32> {
        // The curve never leaves [min target, max target], so the cast cannot truncate.
        self.target_exact(elapsed).map(|v| v.floor() as u32)
    }

    /// Which load phase the curve is in at `elapsed`.
    #[must_use]
    pub fn phase_at(&self, elapsed: Duration) -> Option<RunPhase> {
        self.locate(elapsed).map(|pos| {
            let from = pos.from;
            let to = f64::from(self.stages[pos.index].target);
            if to > from {
                RunPhase::Ramping
            } else if to < from {
                RunPhase::RampingDown
            } else {
                RunPhase::Steady
            }
        })
    }

    /// Index of the stage containing `elapsed`.
    #[must_use]
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        self.locate(elapsed).map(|pos| pos.index)
    }

    fn locate(&self, elapsed: Duration) -> Option<CurvePosition> {
        if elapsed > self.total {
            return None;
        }

        let mut from = f64::from(self.start_target);
        let mut stage_start = Duration::ZERO;

        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            let to = f64::from(stage.target);

            // Zero-length stages never satisfy this, which makes them a jump.
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                return Some(CurvePosition {
                    index,
                    from,
                    value: from + (to - from) * progress,
                });
            }

            from = to;
            stage_start = stage_end;
        }

        // elapsed == total: hold the final target.
        let index = self.stages.len() - 1;
        let previous = if index == 0 {
            f64::from(self.start_target)
        } else {
            f64::from(self.stages[index - 1].target)
        };
        Some(CurvePosition {
            index,
            from: previous,
            value: from,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CurvePosition {
    index: usize,
    from: f64,
    value: f64,
}
