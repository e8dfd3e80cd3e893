//! Poll slot allocation algorithms
//!
//! An algorithm is a strategy injected into each holder's metrics at
//! construction. It decides how many of the offered slots a client takes,
//! when a client should sit out a cycle, how capacity adapts to the observed
//! hit rate, and how clients are ordered against each other.
//!
//! - [`SingleClientPollSlotAllocationAlgorithm`]: one client owns the channel
//! - [`MultipleClientPollSlotAllocationAlgorithm`]: several priority partitions share it

use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::holder_metrics::ClientPriorityHolderMetrics;
use crate::ticks::duration_to_ticks;

pub mod multiple;
pub mod single;

pub use multiple::MultipleClientPollSlotAllocationAlgorithm;
pub use single::SingleClientPollSlotAllocationAlgorithm;

/// Policy knobs shared by the allocation algorithms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollAlgorithmConfig {
    /// Extra slots a client may take beyond its capacity share
    pub allowed_overage: usize,

    /// Upper bound on the wait between polls of an idle client
    pub max_allowed_poll_wait_ms: u64,

    /// Lower bound the adaptive wait shrinks to for a busy client
    pub min_expected_poll_wait_ms: u64,

    /// Success rate at which the poll wait starts to shrink
    pub poll_time_reduce_ratio: Decimal,

    /// Initial capacity percentage for new clients
    pub capacity_percentage: Decimal,

    /// Minimum age of a cached priority before it is recomputed
    pub priority_recalculate_frequency_ms: u64,

    /// Long-poll hint passed to the fabric after a productive poll
    pub fabric_poll_wait_min_ms: u64,

    /// Long-poll hint passed to the fabric after an empty poll
    pub fabric_poll_wait_max_ms: u64,

    /// Cap on the number of cycles an empty client sits out
    pub max_skip_cycles: u32,
}

impl Default for PollAlgorithmConfig {
    fn default() -> Self {
        Self {
            allowed_overage: 5,
            max_allowed_poll_wait_ms: 1000,
            min_expected_poll_wait_ms: 100,
            poll_time_reduce_ratio: dec!(0.75),
            capacity_percentage: dec!(0.75),
            priority_recalculate_frequency_ms: 600_000,
            fabric_poll_wait_min_ms: 100,
            fabric_poll_wait_max_ms: 1000,
            max_skip_cycles: 10,
        }
    }
}

impl PollAlgorithmConfig {
    pub fn max_allowed_poll_wait(&self) -> i32 {
        duration_to_ticks(Duration::from_millis(self.max_allowed_poll_wait_ms))
    }

    pub fn min_expected_poll_wait(&self) -> i32 {
        duration_to_ticks(Duration::from_millis(self.min_expected_poll_wait_ms))
    }

    pub fn priority_recalculate_frequency(&self) -> i32 {
        duration_to_ticks(Duration::from_millis(self.priority_recalculate_frequency_ms))
    }

    pub fn fabric_poll_wait_min(&self) -> i32 {
        duration_to_ticks(Duration::from_millis(self.fabric_poll_wait_min_ms))
    }

    pub fn fabric_poll_wait_max(&self) -> i32 {
        duration_to_ticks(Duration::from_millis(self.fabric_poll_wait_max_ms))
    }

    /// Check the knobs are internally consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.min_expected_poll_wait_ms > self.max_allowed_poll_wait_ms {
            return Err(format!(
                "min_expected_poll_wait_ms ({}) exceeds max_allowed_poll_wait_ms ({})",
                self.min_expected_poll_wait_ms, self.max_allowed_poll_wait_ms
            ));
        }
        if self.fabric_poll_wait_min_ms > self.fabric_poll_wait_max_ms {
            return Err(format!(
                "fabric_poll_wait_min_ms ({}) exceeds fabric_poll_wait_max_ms ({})",
                self.fabric_poll_wait_min_ms, self.fabric_poll_wait_max_ms
            ));
        }
        if self.poll_time_reduce_ratio < Decimal::ZERO || self.poll_time_reduce_ratio > Decimal::ONE {
            return Err("poll_time_reduce_ratio must be between 0 and 1".to_string());
        }
        if self.capacity_percentage <= Decimal::ZERO || self.capacity_percentage > Decimal::ONE {
            return Err("capacity_percentage must be in (0, 1]".to_string());
        }
        Ok(())
    }
}

/// Strategy deciding reservation size, skipping and priority for a holder
pub trait PollAlgorithm: Send + Sync + fmt::Debug {
    /// Algorithm name reported in statistics
    fn name(&self) -> &'static str;

    fn config(&self) -> &PollAlgorithmConfig;

    /// Seed a freshly created metrics instance
    fn initialise_metrics(&self, metrics: &mut ClientPriorityHolderMetrics);

    /// Number of the `available` slots the holder should take
    fn calculate_slots(&self, available: usize, metrics: &ClientPriorityHolderMetrics) -> usize;

    /// Whether the holder sits out this cycle; may consume a skip
    fn should_skip(&self, metrics: &mut ClientPriorityHolderMetrics) -> bool;

    /// A holder never polled, or not polled within its allowed wait, is past due
    fn past_due_calculate(&self, metrics: &ClientPriorityHolderMetrics) -> bool {
        match metrics.ticks_since_last_poll() {
            Some(elapsed) => elapsed > metrics.max_allowed_poll_wait(),
            None => true,
        }
    }

    /// Adjust capacity after a successful release
    fn capacity_percentage_recalculate(&self, metrics: &mut ClientPriorityHolderMetrics);

    /// Start a new statistics window
    fn capacity_reset(&self, metrics: &mut ClientPriorityHolderMetrics);

    /// Update skip and fabric-wait decisions after a poll completes
    fn poll_metrics_recalculate(
        &self,
        success: bool,
        has_errored: bool,
        metrics: &mut ClientPriorityHolderMetrics,
    );

    /// Compute the scheduling priority; larger polls first
    fn priority_recalculate(
        &self,
        queue_length: Option<i64>,
        metrics: &mut ClientPriorityHolderMetrics,
        now: i32,
    ) -> i64;
}
