use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{PollAlgorithm, PollAlgorithmConfig};
use crate::holder_metrics::ClientPriorityHolderMetrics;
use crate::ticks::calculate_delta;

/// Several priority partitions share one channel.
///
/// Each client takes a share of the offered slots proportional to its
/// capacity percentage, empty clients back off for a number of cycles, and
/// clients that have waited longest (or have the deepest queue) rise in
/// priority. A client that exceeds its allowed wait is past due and is polled
/// regardless of any pending skips.
#[derive(Debug, Clone, Default)]
pub struct MultipleClientPollSlotAllocationAlgorithm {
    config: PollAlgorithmConfig,
}

impl MultipleClientPollSlotAllocationAlgorithm {
    pub fn new(config: PollAlgorithmConfig) -> Self {
        Self { config }
    }

    /// Adaptive poll wait for a given success rate.
    ///
    /// Below the reduce ratio the wait stays at the maximum; from the ratio
    /// upwards it falls linearly to the minimum at a rate of 1.
    pub fn poll_wait_for_rate(&self, rate: Decimal) -> i32 {
        let max = self.config.max_allowed_poll_wait();
        let min = self.config.min_expected_poll_wait();
        let ratio = self.config.poll_time_reduce_ratio;

        if rate < ratio {
            return max;
        }

        let headroom = Decimal::ONE - ratio;
        let fraction = if headroom <= Decimal::ZERO {
            Decimal::ONE
        } else {
            ((rate - ratio) / headroom).min(Decimal::ONE)
        };

        let span = Decimal::from(max - min);
        let wait = Decimal::from(max) - span * fraction;
        wait.round().to_i32().unwrap_or(max).clamp(min, max)
    }
}

impl PollAlgorithm for MultipleClientPollSlotAllocationAlgorithm {
    fn name(&self) -> &'static str {
        "MultipleClientPollSlotAllocationAlgorithm"
    }

    fn config(&self) -> &PollAlgorithmConfig {
        &self.config
    }

    fn initialise_metrics(&self, metrics: &mut ClientPriorityHolderMetrics) {
        metrics.capacity_percentage = self.config.capacity_percentage;
        metrics.max_allowed_poll_wait = self.config.max_allowed_poll_wait();
        metrics.min_expected_poll_wait = self.config.min_expected_poll_wait();
        metrics.fabric_poll_wait_time = Some(self.config.fabric_poll_wait_max());
    }

    fn calculate_slots(&self, available: usize, metrics: &ClientPriorityHolderMetrics) -> usize {
        if available == 0 {
            return 0;
        }

        let share = (metrics.capacity_percentage * Decimal::from(available)).ceil();
        let mut slots = share.to_usize().unwrap_or(available).max(1);

        if let Some(limiter) = metrics.rate_limiter() {
            let adjustment = limiter.adjustment_percentage();
            if adjustment <= Decimal::ZERO {
                return 0;
            }
            if adjustment < Decimal::ONE {
                slots = (Decimal::from(slots) * adjustment)
                    .ceil()
                    .to_usize()
                    .unwrap_or(slots)
                    .max(1);
            }
        }

        (slots + self.config.allowed_overage).min(available)
    }

    fn should_skip(&self, metrics: &mut ClientPriorityHolderMetrics) -> bool {
        if self.past_due_calculate(metrics) {
            metrics.skip_count = 0;
            return false;
        }

        if metrics.skip_count > 0 {
            metrics.skip_count -= 1;
            return true;
        }

        false
    }

    fn capacity_percentage_recalculate(&self, metrics: &mut ClientPriorityHolderMetrics) {
        if metrics.poll_attempted_batch == 0 {
            return;
        }

        let rate = metrics.poll_success_rate();
        let current = metrics.capacity_percentage;
        metrics.capacity_percentage =
            (current + (rate - current) * dec!(0.5)).clamp(Decimal::ZERO, Decimal::ONE);
        metrics.max_allowed_poll_wait = self.poll_wait_for_rate(rate);
    }

    fn capacity_reset(&self, metrics: &mut ClientPriorityHolderMetrics) {
        metrics.poll_attempted_batch = 0;
        metrics.poll_achieved_batch = 0;
        metrics.capacity_percentage = self.config.capacity_percentage;
        metrics.max_allowed_poll_wait = self.config.max_allowed_poll_wait();
    }

    fn poll_metrics_recalculate(
        &self,
        success: bool,
        has_errored: bool,
        metrics: &mut ClientPriorityHolderMetrics,
    ) {
        if success && !has_errored {
            metrics.empty_poll_streak = 0;
            metrics.skip_count = 0;
            metrics.fabric_poll_wait_time = Some(self.config.fabric_poll_wait_min());
        } else {
            metrics.empty_poll_streak = metrics.empty_poll_streak.saturating_add(1);
            metrics.skip_count = metrics.empty_poll_streak.min(self.config.max_skip_cycles);
            metrics.fabric_poll_wait_time = Some(self.config.fabric_poll_wait_max());
        }
    }

    fn priority_recalculate(
        &self,
        queue_length: Option<i64>,
        metrics: &mut ClientPriorityHolderMetrics,
        now: i32,
    ) -> i64 {
        if let (Some(priority), Some(stamped)) =
            (metrics.priority_calculated, metrics.priority_tick_count)
        {
            if calculate_delta(now, stamped) < self.config.priority_recalculate_frequency() {
                return priority;
            }
        }

        if queue_length.is_some() {
            metrics.priority_queue_length = queue_length;
        }

        // Never-polled clients count as having waited the full allowed time.
        let elapsed = metrics
            .last_poll_tick_count
            .map(|last| calculate_delta(now, last))
            .unwrap_or(metrics.max_allowed_poll_wait);

        let raw = (metrics.priority() as i64)
            .saturating_add(elapsed as i64)
            .saturating_add(metrics.priority_queue_length.unwrap_or(0).max(0));

        let priority = (Decimal::from(raw) * metrics.priority_weighting())
            .trunc()
            .to_i64()
            .unwrap_or(i64::MAX);

        metrics.priority_calculated = Some(priority);
        metrics.priority_tick_count = Some(now);
        priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn algorithm() -> MultipleClientPollSlotAllocationAlgorithm {
        MultipleClientPollSlotAllocationAlgorithm::new(PollAlgorithmConfig {
            max_allowed_poll_wait_ms: 1000,
            min_expected_poll_wait_ms: 100,
            poll_time_reduce_ratio: dec!(0.5),
            ..Default::default()
        })
    }

    #[test]
    fn test_poll_wait_stays_at_max_below_ratio() {
        assert_eq!(algorithm().poll_wait_for_rate(dec!(0.2)), 1000);
    }

    #[test]
    fn test_poll_wait_threshold_is_inclusive() {
        assert_eq!(algorithm().poll_wait_for_rate(dec!(0.5)), 1000);
    }

    #[test]
    fn test_poll_wait_interpolates_linearly() {
        let alg = algorithm();
        assert_eq!(alg.poll_wait_for_rate(dec!(0.75)), 550);
        assert_eq!(alg.poll_wait_for_rate(Decimal::ONE), 100);
    }

    #[test]
    fn test_poll_wait_with_full_ratio() {
        let alg = MultipleClientPollSlotAllocationAlgorithm::new(PollAlgorithmConfig {
            poll_time_reduce_ratio: Decimal::ONE,
            ..Default::default()
        });
        assert_eq!(alg.poll_wait_for_rate(Decimal::ONE), 100);
        assert_eq!(alg.poll_wait_for_rate(dec!(0.99)), 1000);
    }
}
