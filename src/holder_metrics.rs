//! Per-client scheduling metrics
//!
//! Pure bookkeeping: counters, capacity and priority state for one holder.
//! Every policy decision is delegated to the injected [`PollAlgorithm`].
//! The owning holder serialises access, so nothing here locks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::poll_algorithm::PollAlgorithm;
use crate::rate_limit::RateLimiter;
use crate::statistics::MetricsStatistics;
use crate::ticks::{calculate_delta, TickSource};

#[derive(Debug)]
pub struct ClientPriorityHolderMetrics {
    algorithm: Arc<dyn PollAlgorithm>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    clock: Arc<dyn TickSource>,
    priority: i32,
    priority_weighting: Decimal,

    pub(crate) poll_in: u64,
    pub(crate) poll_out: u64,
    pub(crate) poll_count: u64,
    pub(crate) poll_success_count: u64,
    pub(crate) poll_exception_count: u64,
    pub(crate) poll_attempted: u64,
    pub(crate) poll_achieved: u64,
    pub(crate) poll_attempted_batch: u64,
    pub(crate) poll_achieved_batch: u64,
    pub(crate) empty_poll_streak: u32,

    pub(crate) capacity_percentage: Decimal,
    pub(crate) skip_count: u32,
    pub(crate) max_allowed_poll_wait: i32,
    pub(crate) min_expected_poll_wait: i32,
    pub(crate) fabric_poll_wait_time: Option<i32>,

    pub(crate) priority_calculated: Option<i64>,
    pub(crate) priority_tick_count: Option<i32>,
    pub(crate) priority_queue_length: Option<i64>,

    pub(crate) last_offered: Option<usize>,
    pub(crate) last_reserved: Option<usize>,
    pub(crate) last_actual: Option<usize>,
    pub(crate) last_actual_time: Option<DateTime<Utc>>,
    pub(crate) last_poll_tick_count: Option<i32>,
}

impl ClientPriorityHolderMetrics {
    pub fn new(
        algorithm: Arc<dyn PollAlgorithm>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        clock: Arc<dyn TickSource>,
        priority: i32,
        priority_weighting: Decimal,
    ) -> Self {
        let mut metrics = Self {
            algorithm: Arc::clone(&algorithm),
            rate_limiter,
            clock,
            priority,
            priority_weighting,
            poll_in: 0,
            poll_out: 0,
            poll_count: 0,
            poll_success_count: 0,
            poll_exception_count: 0,
            poll_attempted: 0,
            poll_achieved: 0,
            poll_attempted_batch: 0,
            poll_achieved_batch: 0,
            empty_poll_streak: 0,
            capacity_percentage: Decimal::ONE,
            skip_count: 0,
            max_allowed_poll_wait: 0,
            min_expected_poll_wait: 0,
            fabric_poll_wait_time: None,
            priority_calculated: None,
            priority_tick_count: None,
            priority_queue_length: None,
            last_offered: None,
            last_reserved: None,
            last_actual: None,
            last_actual_time: None,
            last_poll_tick_count: None,
        };
        algorithm.initialise_metrics(&mut metrics);
        metrics
    }

    /// Size a reservation out of `available` slots
    pub fn reserve(&mut self, available: usize) -> usize {
        self.last_offered = Some(available);
        self.poll_in += 1;
        self.last_poll_tick_count = Some(self.clock.ticks());

        let algorithm = Arc::clone(&self.algorithm);
        let taken = algorithm.calculate_slots(available, self);
        self.last_reserved = Some(taken);
        taken
    }

    /// Close a reservation. A failed poll leaves capacity untouched.
    pub fn release(&mut self, exception: bool) {
        self.poll_out += 1;
        if exception {
            self.poll_exception_count += 1;
        } else {
            let algorithm = Arc::clone(&self.algorithm);
            algorithm.capacity_percentage_recalculate(self);
        }
    }

    /// Record the attempt and return the fabric long-poll hint in milliseconds
    pub fn poll_begin(&mut self, reserved: usize) -> Option<i32> {
        self.poll_attempted += reserved as u64;
        self.poll_attempted_batch += reserved as u64;
        self.poll_count += 1;
        self.fabric_poll_wait_time
    }

    pub fn poll_end(&mut self, payload_count: usize, has_errored: bool) {
        self.poll_achieved += payload_count as u64;
        self.poll_achieved_batch += payload_count as u64;
        self.last_actual = Some(payload_count);
        self.last_actual_time = Some(Utc::now());

        let success = payload_count > 0;
        if success {
            self.poll_success_count += 1;
        }

        let algorithm = Arc::clone(&self.algorithm);
        algorithm.poll_metrics_recalculate(success, has_errored, self);
    }

    pub fn priority_recalculate(&mut self, queue_length: Option<i64>) -> i64 {
        let now = self.clock.ticks();
        let algorithm = Arc::clone(&self.algorithm);
        algorithm.priority_recalculate(queue_length, self, now)
    }

    pub fn should_skip(&mut self) -> bool {
        let algorithm = Arc::clone(&self.algorithm);
        algorithm.should_skip(self)
    }

    pub fn is_poll_past_due(&self) -> bool {
        self.algorithm.past_due_calculate(self)
    }

    pub fn capacity_reset(&mut self) {
        let algorithm = Arc::clone(&self.algorithm);
        algorithm.capacity_reset(self);
    }

    /// Achieved over attempted slots in the current batch, within `[0, 1]`
    pub fn poll_success_rate(&self) -> Decimal {
        if self.poll_attempted_batch == 0 {
            return Decimal::ZERO;
        }
        let rate = Decimal::from(self.poll_achieved_batch) / Decimal::from(self.poll_attempted_batch);
        rate.min(Decimal::ONE)
    }

    /// Ticks elapsed since the last reservation, if there was one
    pub fn ticks_since_last_poll(&self) -> Option<i32> {
        self.last_poll_tick_count
            .map(|last| calculate_delta(self.clock.ticks(), last))
    }

    pub fn status(&self) -> String {
        format!(
            "Ratio: {}/{} Failed:{} Hits:{}/{}",
            self.poll_achieved_batch,
            self.poll_attempted_batch,
            self.poll_exception_count,
            self.poll_in,
            self.poll_out
        )
    }

    pub fn snapshot(&self) -> MetricsStatistics {
        MetricsStatistics {
            priority: self.priority,
            priority_weighting: self.priority_weighting,
            capacity_percentage: self.capacity_percentage,
            poll_success_rate: self.poll_success_rate(),
            skip_count: self.skip_count,
            is_poll_past_due: self.is_poll_past_due(),
            max_allowed_poll_wait_ms: self.max_allowed_poll_wait,
            fabric_poll_wait_ms: self.fabric_poll_wait_time,
            poll_attempted: self.poll_attempted,
            poll_achieved: self.poll_achieved,
            poll_attempted_batch: self.poll_attempted_batch,
            poll_achieved_batch: self.poll_achieved_batch,
            poll_count: self.poll_count,
            poll_success_count: self.poll_success_count,
            poll_exception_count: self.poll_exception_count,
            priority_calculated: self.priority_calculated,
            priority_queue_length: self.priority_queue_length,
            last_offered: self.last_offered,
            last_reserved: self.last_reserved,
            last_actual: self.last_actual,
            last_actual_time: self.last_actual_time,
            status: self.status(),
        }
    }

    pub fn algorithm(&self) -> &Arc<dyn PollAlgorithm> {
        &self.algorithm
    }

    pub fn rate_limiter(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn priority_weighting(&self) -> Decimal {
        self.priority_weighting
    }

    pub fn capacity_percentage(&self) -> Decimal {
        self.capacity_percentage
    }

    pub fn skip_count(&self) -> u32 {
        self.skip_count
    }

    pub fn max_allowed_poll_wait(&self) -> i32 {
        self.max_allowed_poll_wait
    }

    pub fn min_expected_poll_wait(&self) -> i32 {
        self.min_expected_poll_wait
    }

    pub fn fabric_poll_wait_time(&self) -> Option<i32> {
        self.fabric_poll_wait_time
    }

    pub fn poll_attempted_batch(&self) -> u64 {
        self.poll_attempted_batch
    }

    pub fn poll_achieved_batch(&self) -> u64 {
        self.poll_achieved_batch
    }

    pub fn poll_in(&self) -> u64 {
        self.poll_in
    }

    pub fn poll_out(&self) -> u64 {
        self.poll_out
    }

    pub fn poll_exception_count(&self) -> u64 {
        self.poll_exception_count
    }

    pub fn priority_calculated(&self) -> Option<i64> {
        self.priority_calculated
    }

    pub fn priority_tick_count(&self) -> Option<i32> {
        self.priority_tick_count
    }

    pub fn last_offered(&self) -> Option<usize> {
        self.last_offered
    }

    pub fn last_reserved(&self) -> Option<usize> {
        self.last_reserved
    }

    pub fn last_actual(&self) -> Option<usize> {
        self.last_actual
    }

    pub fn last_poll_tick_count(&self) -> Option<i32> {
        self.last_poll_tick_count
    }

    /// Clock the metrics stamp ticks with
    pub fn clock(&self) -> &Arc<dyn TickSource> {
        &self.clock
    }
}
