//! Virtual users and the one-off setup phase.

use std::sync::Arc;

use surge_core::{SlotId, VuId};
use tokio_util::sync::CancellationToken;

use crate::action::{ActionExecutor, PreparedStep, SetupData};
use crate::aggregator::MetricsAggregator;

/// VU id used for requests issued during setup.
pub const SETUP_VU: VuId = VuId::new(0);

/// The action sequence plus everything needed to perform it.
pub struct Scenario {
    pub steps: Vec<PreparedStep>,
    pub actions: ActionExecutor,
    pub setup: Arc<SetupData>,
}

/// One simulated client looping over the scenario.
#[derive(Debug)]
pub struct VirtualUser {
    pub id: VuId,
    pub slot: SlotId,
    iteration: u64,
}

impl VirtualUser {
    #[must_use]
    pub fn new(id: VuId, slot: SlotId) -> Self {
        Self {
            id,
            slot,
            iteration: 0,
        }
    }

    /// Runs iterations until `cancel` fires, returning how many completed.
    ///
    /// Cancellation is observed between steps and during pauses; a request
    /// already in flight is always allowed to finish and be recorded.
    pub async fn run(
        mut self,
        scenario: Arc<Scenario>,
        aggregator: Arc<MetricsAggregator>,
        cancel: CancellationToken,
    ) -> u64 {
        aggregator.vu_started();
        tracing::debug!(vu = %self.id, slot = %self.slot, "Virtual user started");

        let last = scenario.steps.len().saturating_sub(1);

        'outer: while !cancel.is_cancelled() {
            for (index, step) in scenario.steps.iter().enumerate() {
                if cancel.is_cancelled() {
                    break 'outer;
                }

                let auth = &scenario.actions.target().auth;
                if let Some(var) = step.missing_requirement(&scenario.setup, auth) {
                    tracing::trace!(vu = %self.id, tag = %step.name, var, "Step skipped");
                    aggregator.record_skip(&step.name);
                } else {
                    let result = scenario
                        .actions
                        .perform(step, self.id, self.iteration, &scenario.setup)
                        .await;
                    aggregator.record(result.outcome);
                }

                if !step.pause.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            // Every step ran; only the trailing pause was cut short.
                            if index == last {
                                self.complete_iteration(&aggregator);
                            }
                            break 'outer;
                        }
                        _ = tokio::time::sleep(step.pause) => {}
                    }
                }
            }

            self.complete_iteration(&aggregator);
            // Sequences made only of skipped, pause-free steps never await.
            tokio::task::yield_now().await;
        }

        aggregator.vu_stopped();
        tracing::debug!(
            vu = %self.id,
            slot = %self.slot,
            iterations = self.iteration,
            "Virtual user stopped"
        );
        self.iteration
    }

    fn complete_iteration(&mut self, aggregator: &MetricsAggregator) {
        self.iteration += 1;
        aggregator.record_iteration();
    }
}

/// Runs the setup steps once, in order, and collects extracted variables.
///
/// Setup never fails the run: a failed step is logged and recorded as an
/// outcome under its own tag, and later steps needing its variables are
/// skipped. Virtual users then run with whatever was collected.
pub async fn run_setup(
    steps: &[PreparedStep],
    actions: &ActionExecutor,
    aggregator: &MetricsAggregator,
    cancel: &CancellationToken,
) -> SetupData {
    let mut data = SetupData::default();

    for step in steps {
        if cancel.is_cancelled() {
            break;
        }

        if let Some(var) = step.missing_requirement(&data, &actions.target().auth) {
            tracing::warn!(tag = %step.name, var, "Setup step skipped, variable missing");
            aggregator.record_skip(&step.name);
            continue;
        }

        let result = actions.perform(step, SETUP_VU, 0, &data).await;
        if let Some(error) = &result.outcome.error {
            tracing::warn!(tag = %step.name, %error, "Setup step failed");
        } else {
            tracing::info!(tag = %step.name, "Setup step succeeded");
        }
        for (var, value) in result.extracted {
            data.insert(var, value);
        }
        aggregator.record(result.outcome);
    }

    data
}
