//! Client priority collection and the per-cycle scheduling pass
//!
//! Each cycle offers the free concurrency budget to the holders in descending
//! priority order. Past-due holders are reserved first so that a starved
//! client is always polled in the cycle it becomes past due, whatever its
//! priority or pending skips. Reserved holders are then polled concurrently,
//! released, and priorities are refreshed on a fixed cadence.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace};

use crate::client::ServiceMessage;
use crate::collector::{DataCollector, LogLevel};
use crate::holder::ClientPriorityHolder;
use crate::statistics::CollectionStatistics;
use crate::ticks::{calculate_delta, TickSource};

/// Per-holder summary of a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledHolder {
    pub name: String,
    pub reserved: usize,
    pub received: usize,
    pub errored: bool,
}

/// Result of one scheduling cycle
#[derive(Debug, Default)]
pub struct CycleOutcome {
    /// Slots offered to the holders this cycle
    pub available: usize,
    pub polled: Vec<PolledHolder>,
    pub messages: Vec<ServiceMessage>,
    pub errored: usize,
}

impl CycleOutcome {
    pub fn was_polled(&self, name: &str) -> bool {
        self.polled.iter().any(|p| p.name == name)
    }
}

#[derive(Debug)]
pub struct ClientPriorityCollection {
    holders: Vec<Arc<ClientPriorityHolder>>,
    /// Holder indices, highest priority first
    order: RwLock<Vec<usize>>,
    max_concurrent_polls: usize,
    priority_recalculate_frequency: i32,
    last_priority_recalculate: Mutex<Option<i32>>,
    in_flight: AtomicUsize,
    cycles: AtomicU64,
    clock: Arc<dyn TickSource>,
    collector: Arc<dyn DataCollector>,
}

impl ClientPriorityCollection {
    pub fn new(
        holders: Vec<Arc<ClientPriorityHolder>>,
        max_concurrent_polls: usize,
        priority_recalculate_frequency: i32,
        clock: Arc<dyn TickSource>,
        collector: Arc<dyn DataCollector>,
    ) -> Self {
        let order = (0..holders.len()).collect();
        Self {
            holders,
            order: RwLock::new(order),
            max_concurrent_polls,
            priority_recalculate_frequency,
            last_priority_recalculate: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            cycles: AtomicU64::new(0),
            clock,
            collector,
        }
    }

    pub fn holders(&self) -> &[Arc<ClientPriorityHolder>] {
        &self.holders
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Holders in the current scheduling order
    pub fn ordered_holders(&self) -> Vec<Arc<ClientPriorityHolder>> {
        self.order
            .read()
            .iter()
            .map(|&index| Arc::clone(&self.holders[index]))
            .collect()
    }

    /// Free slots: the concurrency budget minus reservations still in flight
    pub fn available_capacity(&self) -> usize {
        self.max_concurrent_polls.saturating_sub(self.in_flight())
    }

    /// Recompute every holder's priority and re-sort the scheduling order
    #[instrument(skip(self))]
    pub async fn priority_recalculate(&self) {
        let priorities = join_all(self.holders.iter().map(|h| h.priority_recalculate())).await;

        let mut order: Vec<usize> = (0..self.holders.len()).collect();
        // Stable sort keeps registration order between equal priorities.
        order.sort_by(|&a, &b| priorities[b].cmp(&priorities[a]));

        trace!(?priorities, ?order, "Priorities recalculated");
        *self.order.write() = order;
        *self.last_priority_recalculate.lock() = Some(self.clock.ticks());
    }

    fn priority_recalculate_due(&self) -> bool {
        match *self.last_priority_recalculate.lock() {
            Some(last) => {
                calculate_delta(self.clock.ticks(), last) >= self.priority_recalculate_frequency
            }
            None => true,
        }
    }

    /// Reserve slots across the holders for one cycle.
    ///
    /// Past-due holders go first and are offered at least one slot even when
    /// the budget is spent; the rest follow in priority order, honouring skips.
    pub fn take_next(&self, available: usize) -> Vec<(Arc<ClientPriorityHolder>, usize)> {
        let ordered = self.ordered_holders();
        let mut remaining = available;
        let mut reservations = Vec::new();

        let (past_due, regular): (Vec<_>, Vec<_>) =
            ordered.into_iter().partition(|holder| holder.is_poll_past_due());

        for holder in past_due {
            if let Some(taken) = holder.reserve(remaining.max(1)) {
                remaining = remaining.saturating_sub(taken);
                reservations.push((holder, taken));
            }
        }

        for holder in regular {
            if remaining == 0 {
                break;
            }
            if holder.should_skip() {
                trace!(holder = %holder.name(), "Skipping holder this cycle");
                continue;
            }
            if let Some(taken) = holder.reserve(remaining) {
                remaining -= taken.min(remaining);
                reservations.push((holder, taken));
            }
        }

        reservations
    }

    /// Run one scheduling cycle and return everything the polls produced
    #[instrument(skip(self), fields(cycle = self.cycles()))]
    pub async fn poll_cycle(&self) -> CycleOutcome {
        self.cycles.fetch_add(1, Ordering::Relaxed);

        if self.priority_recalculate_due() {
            self.priority_recalculate().await;
        }

        let available = self.available_capacity();
        let reservations = self.take_next(available);
        if reservations.is_empty() {
            return CycleOutcome {
                available,
                ..Default::default()
            };
        }

        let reserved_total: usize = reservations.iter().map(|(_, taken)| *taken).sum();
        self.in_flight.fetch_add(reserved_total, Ordering::SeqCst);

        let results = join_all(reservations.iter().map(|(holder, _)| async move {
            let result = holder.poll().await;
            holder.release(result.errored);
            result
        }))
        .await;

        self.in_flight.fetch_sub(reserved_total, Ordering::SeqCst);

        let mut outcome = CycleOutcome {
            available,
            ..Default::default()
        };
        for ((holder, taken), result) in reservations.iter().zip(results) {
            outcome.polled.push(PolledHolder {
                name: holder.name().to_string(),
                reserved: *taken,
                received: result.messages.len(),
                errored: result.errored,
            });
            if result.errored {
                outcome.errored += 1;
            }
            outcome.messages.extend(result.messages);
        }

        if outcome.errored > 0 {
            self.collector.log_message(
                LogLevel::Warning,
                &format!(
                    "{} of {} polls failed this cycle",
                    outcome.errored,
                    outcome.polled.len()
                ),
            );
        }

        debug!(
            available = available,
            polled = outcome.polled.len(),
            received = outcome.messages.len(),
            errored = outcome.errored,
            "Poll cycle completed"
        );

        outcome
    }

    /// Start a new statistics window on every holder
    pub fn capacity_reset(&self) {
        for holder in &self.holders {
            holder.capacity_reset();
        }
        info!(holders = self.holders.len(), "Capacity reset");
    }

    pub fn statistics(&self) -> CollectionStatistics {
        CollectionStatistics {
            cycles: self.cycles(),
            in_flight: self.in_flight(),
            holders: self.ordered_holders().iter().map(|h| h.statistics()).collect(),
        }
    }
}
