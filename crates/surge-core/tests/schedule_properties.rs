// Property-based tests for staged schedules
//
// Properties tested:
// 1. Stage boundaries: the target at the end of every stage is its declared target
// 2. Bounds: the curve never leaves [min target, max target]
// 3. Continuity: the curve moves no faster than the steepest stage allows
// 4. Monotonicity: within a stage the curve only moves towards the stage target
// 5. Completion: no target past the end, `is_complete` from the end on

use std::time::Duration;

use proptest::prelude::*;
use surge_core::{Schedule, Stage};

fn stages_strategy() -> impl Strategy<Value = (u32, Vec<Stage>)> {
    (
        0u32..50,
        prop::collection::vec((1u64..120, 0u32..500), 1..8),
    )
        .prop_map(|(start, raw)| {
            let stages = raw
                .into_iter()
                .map(|(secs, target)| Stage::new(Duration::from_secs(secs), target))
                .collect();
            (start, stages)
        })
}

proptest! {
    #[test]
    fn prop_stage_end_hits_declared_target((start, stages) in stages_strategy()) {
        let schedule = Schedule::with_start_target(stages.clone(), start).unwrap();

        let mut end = Duration::ZERO;
        for stage in &stages {
            end += stage.duration;
            prop_assert_eq!(schedule.target_at(end), Some(stage.target));
        }
        prop_assert_eq!(schedule.target_at(Duration::ZERO), Some(start));
    }

    #[test]
    fn prop_target_within_bounds(
        (start, stages) in stages_strategy(),
        fraction in 0.0f64..=1.0,
    ) {
        let schedule = Schedule::with_start_target(stages.clone(), start).unwrap();
        let at = schedule.total_duration().mul_f64(fraction);

        let min = stages.iter().map(|s| s.target).chain([start]).min().unwrap();
        let max = schedule.max_target();

        let target = schedule.target_at(at).unwrap();
        prop_assert!(target >= min && target <= max, "{target} outside [{min}, {max}]");
    }

    #[test]
    fn prop_curve_is_continuous(
        (start, stages) in stages_strategy(),
        fraction in 0.0f64..1.0,
    ) {
        let schedule = Schedule::with_start_target(stages.clone(), start).unwrap();
        let step = Duration::from_millis(10);
        let t1 = schedule.total_duration().mul_f64(fraction);
        let t2 = (t1 + step).min(schedule.total_duration());

        let mut from = f64::from(start);
        let mut steepest = 0.0f64;
        for stage in &stages {
            let to = f64::from(stage.target);
            steepest = steepest.max((to - from).abs() / stage.duration.as_secs_f64());
            from = to;
        }

        let a = schedule.target_exact(t1).unwrap();
        let b = schedule.target_exact(t2).unwrap();
        prop_assert!((b - a).abs() <= steepest * step.as_secs_f64() + 1e-6);
    }

    #[test]
    fn prop_monotonic_within_stage(
        (start, stages) in stages_strategy(),
        index in any::<prop::sample::Index>(),
        f1 in 0.0f64..1.0,
        f2 in 0.0f64..1.0,
    ) {
        let schedule = Schedule::with_start_target(stages.clone(), start).unwrap();
        let i = index.index(stages.len());

        let stage_start: Duration = stages[..i].iter().map(|s| s.duration).sum();
        let (lo, hi) = if f1 <= f2 { (f1, f2) } else { (f2, f1) };
        let t1 = stage_start + stages[i].duration.mul_f64(lo);
        let t2 = stage_start + stages[i].duration.mul_f64(hi);

        let a = schedule.target_exact(t1).unwrap();
        let b = schedule.target_exact(t2).unwrap();
        let to = f64::from(stages[i].target);

        // Moving towards the target never increases the distance to it.
        prop_assert!((to - b).abs() <= (to - a).abs() + 1e-9);
    }

    #[test]
    fn prop_complete_after_total((start, stages) in stages_strategy(), extra in 1u64..10_000) {
        let schedule = Schedule::with_start_target(stages, start).unwrap();
        let total = schedule.total_duration();

        prop_assert!(!schedule.is_complete(total - Duration::from_millis(1)));
        prop_assert!(schedule.is_complete(total));
        prop_assert!(schedule.target_at(total + Duration::from_millis(extra)).is_none());
        prop_assert!(schedule.phase_at(total + Duration::from_millis(extra)).is_none());
    }
}
