//! Schedule controller: keeps the number of running virtual users on the
//! schedule's curve.
//!
//! VUs live in an arena of slots indexed by [`SlotId`]. Scaling up fills the
//! lowest free slots, scaling down retires the highest occupied ones, so the
//! occupied slots always form a prefix of the arena.

use std::time::Duration;

use surge_core::{RunPhase, Schedule, SlotId, VuId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Starts virtual users on behalf of the controller.
pub trait VuSpawner: Send + Sync {
    /// Spawns a VU that stops once `cancel` fires.
    fn spawn(&self, vu: VuId, slot: SlotId, cancel: CancellationToken) -> JoinHandle<u64>;
}

struct Slot {
    vu: VuId,
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
}

/// Totals reported once the controller has shut down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerSummary {
    pub vus_spawned: u64,
    pub peak_vus: usize,
    /// VUs that did not stop within the graceful stop window and were aborted.
    pub vus_aborted: usize,
}

pub struct ScheduleController<S> {
    schedule: Schedule,
    tick: Duration,
    spawner: S,
    run_cancel: CancellationToken,
    slots: Vec<Option<Slot>>,
    retired: Vec<(VuId, JoinHandle<u64>)>,
    next_vu: u64,
    peak: usize,
}

impl<S: VuSpawner> ScheduleController<S> {
    pub fn new(schedule: Schedule, tick: Duration, spawner: S, run_cancel: CancellationToken) -> Self {
        Self {
            schedule,
            tick,
            spawner,
            run_cancel,
            slots: Vec::new(),
            retired: Vec::new(),
            next_vu: 1,
            peak: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Occupied slot indices, lowest first.
    #[must_use]
    pub fn occupied_slots(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| SlotId::new(i as u64))
            .collect()
    }

    /// Spawns or retires VUs until exactly `target` are running.
    ///
    /// Handles of retired VUs that have already exited are dropped here.
    pub fn reconcile(&mut self, target: u32) {
        self.retired.retain(|(_, handle)| !handle.is_finished());

        let target = target as usize;
        let mut active = self.active();

        while active < target {
            self.spawn_lowest();
            active += 1;
        }
        while active > target {
            self.retire_highest();
            active -= 1;
        }

        self.peak = self.peak.max(active);
    }

    fn spawn_lowest(&mut self) {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        let vu = VuId::new(self.next_vu);
        self.next_vu += 1;
        let slot = SlotId::new(index as u64);
        let cancel = self.run_cancel.child_token();
        let handle = self.spawner.spawn(vu, slot, cancel.clone());

        tracing::trace!(vu = %vu, slot = %slot, "Spawned virtual user");
        self.slots[index] = Some(Slot { vu, cancel, handle });
    }

    fn retire_highest(&mut self) {
        let Some(index) = self.slots.iter().rposition(Option::is_some) else {
            return;
        };
        if let Some(slot) = self.slots[index].take() {
            tracing::trace!(vu = %slot.vu, slot = index, "Retiring virtual user");
            slot.cancel.cancel();
            self.retired.push((slot.vu, slot.handle));
        }
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    /// Follows the schedule until it completes or the run is cancelled.
    ///
    /// Phase changes are published on `phases`. Elapsed time is measured
    /// from `started`.
    pub async fn run(&mut self, started: Instant, phases: &watch::Sender<RunPhase>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.run_cancel.cancelled() => {
                    tracing::info!("Run cancelled, controller stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let elapsed = started.elapsed();
            if self.schedule.is_complete(elapsed) {
                let last = self.schedule.stages().last().map_or(0, |s| s.target);
                self.reconcile(last);
                return;
            }

            if let (Some(target), Some(phase)) =
                (self.schedule.target_at(elapsed), self.schedule.phase_at(elapsed))
            {
                self.reconcile(target);
                publish_phase(phases, phase);
            }
        }
    }

    /// Retires every VU and waits up to `graceful_stop` for them to finish.
    pub async fn shutdown(mut self, graceful_stop: Duration) -> ControllerSummary {
        self.reconcile(0);

        let deadline = Instant::now() + graceful_stop;
        let mut aborted = 0;
        for (vu, mut handle) in self.retired.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(vu = %vu, error = %e, "Virtual user task failed"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "Virtual users exceeded the graceful stop window");
        }

        ControllerSummary {
            vus_spawned: self.next_vu - 1,
            peak_vus: self.peak,
            vus_aborted: aborted,
        }
    }
}

/// Publishes `phase` if it differs from the current one.
pub fn publish_phase(phases: &watch::Sender<RunPhase>, phase: RunPhase) {
    let changed = phases.send_if_modified(|current| {
        if *current == phase {
            false
        } else {
            *current = phase;
            true
        }
    });
    if changed {
        tracing::info!(%phase, "Run phase changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use surge_core::Stage;

    /// Spawns VUs that just wait for cancellation.
    #[derive(Clone, Default)]
    struct IdleSpawner {
        running: Arc<AtomicUsize>,
    }

    impl VuSpawner for IdleSpawner {
        fn spawn(&self, _vu: VuId, _slot: SlotId, cancel: CancellationToken) -> JoinHandle<u64> {
            let running = Arc::clone(&self.running);
            running.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                cancel.cancelled().await;
                running.fetch_sub(1, Ordering::SeqCst);
                0
            })
        }
    }

    fn schedule(stages: &[(u64, u32)]) -> Schedule {
        Schedule::new(
            stages
                .iter()
                .map(|(ms, t)| Stage::new(Duration::from_millis(*ms), *t))
                .collect(),
        )
        .unwrap()
    }

    fn controller(spawner: IdleSpawner) -> ScheduleController<IdleSpawner> {
        ScheduleController::new(
            schedule(&[(1000, 1)]),
            Duration::from_millis(10),
            spawner,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_reconcile_fills_lowest_and_retires_highest() {
        let mut c = controller(IdleSpawner::default());

        c.reconcile(3);
        assert_eq!(
            c.occupied_slots(),
            vec![SlotId::new(0), SlotId::new(1), SlotId::new(2)]
        );

        c.reconcile(1);
        assert_eq!(c.occupied_slots(), vec![SlotId::new(0)]);
        assert_eq!(c.retired.len(), 2);

        c.reconcile(2);
        assert_eq!(c.occupied_slots(), vec![SlotId::new(0), SlotId::new(1)]);
        // VU ids keep increasing; retired ids are never reused.
        assert_eq!(c.slots[1].as_ref().unwrap().vu, VuId::new(4));
    }

    #[tokio::test]
    async fn test_reconcile_drops_exited_vus() {
        let mut c = controller(IdleSpawner::default());
        c.reconcile(4);
        c.reconcile(0);
        assert_eq!(c.retired.len(), 4);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !c.retired.iter().all(|(_, h)| h.is_finished()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("retired VUs did not exit");

        c.reconcile(1);
        assert!(c.retired.is_empty());
        assert_eq!(c.active(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let spawner = IdleSpawner::default();
        let mut c = controller(spawner.clone());
        c.reconcile(5);
        c.reconcile(2);

        let summary = c.shutdown(Duration::from_secs(1)).await;
        assert_eq!(summary.vus_spawned, 5);
        assert_eq!(summary.peak_vus, 5);
        assert_eq!(summary.vus_aborted, 0);
        assert_eq!(spawner.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_follows_schedule_to_completion() {
        let spawner = IdleSpawner::default();
        let (tx, rx) = watch::channel(RunPhase::Setup);
        let mut c = ScheduleController::new(
            schedule(&[(100, 4), (100, 4), (100, 0)]),
            Duration::from_millis(5),
            spawner.clone(),
            CancellationToken::new(),
        );

        let started = Instant::now();
        c.run(started, &tx).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(c.active(), 0);
        assert_eq!(c.peak, 4);
        assert_ne!(*rx.borrow(), RunPhase::Setup);

        c.shutdown(Duration::from_secs(1)).await;
        assert_eq!(spawner.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = watch::channel(RunPhase::Setup);
        let mut c = ScheduleController::new(
            schedule(&[(60_000, 2)]),
            Duration::from_millis(5),
            IdleSpawner::default(),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), c.run(Instant::now(), &tx))
            .await
            .expect("controller ignored cancellation");
    }

    #[test]
    fn test_publish_phase_only_on_change() {
        let (tx, mut rx) = watch::channel(RunPhase::Setup);
        rx.borrow_and_update();

        publish_phase(&tx, RunPhase::Setup);
        assert!(!rx.has_changed().unwrap());

        publish_phase(&tx, RunPhase::Ramping);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), RunPhase::Ramping);
    }
}
