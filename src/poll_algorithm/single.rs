use rust_decimal::Decimal;

use super::{PollAlgorithm, PollAlgorithmConfig};
use crate::holder_metrics::ClientPriorityHolderMetrics;

/// One client owns the whole channel: it takes every offered slot and never skips.
#[derive(Debug, Clone, Default)]
pub struct SingleClientPollSlotAllocationAlgorithm {
    config: PollAlgorithmConfig,
}

impl SingleClientPollSlotAllocationAlgorithm {
    pub fn new(config: PollAlgorithmConfig) -> Self {
        Self { config }
    }
}

impl PollAlgorithm for SingleClientPollSlotAllocationAlgorithm {
    fn name(&self) -> &'static str {
        "SingleClientPollSlotAllocationAlgorithm"
    }

    fn config(&self) -> &PollAlgorithmConfig {
        &self.config
    }

    fn initialise_metrics(&self, metrics: &mut ClientPriorityHolderMetrics) {
        metrics.capacity_percentage = Decimal::ONE;
        metrics.max_allowed_poll_wait = self.config.max_allowed_poll_wait();
        metrics.min_expected_poll_wait = self.config.min_expected_poll_wait();
        metrics.fabric_poll_wait_time = Some(self.config.fabric_poll_wait_max());
    }

    fn calculate_slots(&self, available: usize, _metrics: &ClientPriorityHolderMetrics) -> usize {
        available
    }

    fn should_skip(&self, _metrics: &mut ClientPriorityHolderMetrics) -> bool {
        false
    }

    fn capacity_percentage_recalculate(&self, metrics: &mut ClientPriorityHolderMetrics) {
        metrics.capacity_percentage = Decimal::ONE;
    }

    fn capacity_reset(&self, metrics: &mut ClientPriorityHolderMetrics) {
        metrics.poll_attempted_batch = 0;
        metrics.poll_achieved_batch = 0;
        metrics.capacity_percentage = Decimal::ONE;
    }

    fn poll_metrics_recalculate(
        &self,
        success: bool,
        has_errored: bool,
        metrics: &mut ClientPriorityHolderMetrics,
    ) {
        // Nothing competes for the channel, so an empty fabric is simply long-polled.
        metrics.fabric_poll_wait_time = if success && !has_errored {
            Some(self.config.fabric_poll_wait_min())
        } else {
            Some(self.config.fabric_poll_wait_max())
        };
    }

    fn priority_recalculate(
        &self,
        queue_length: Option<i64>,
        metrics: &mut ClientPriorityHolderMetrics,
        now: i32,
    ) -> i64 {
        metrics.priority_calculated = Some(1);
        metrics.priority_tick_count = Some(now);
        if queue_length.is_some() {
            metrics.priority_queue_length = queue_length;
        }
        1
    }
}
