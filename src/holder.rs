//! Client priority holder
//!
//! Pairs one listener client with its scheduling metrics. A holder has at
//! most one poll in flight: `reserve` flips a guarded flag and fails fast
//! instead of waiting when the holder is already taken.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::client::{ListenerClient, ServiceMessage};
use crate::collector::DataCollector;
use crate::errors::ClientError;
use crate::holder_metrics::ClientPriorityHolderMetrics;
use crate::poll_algorithm::PollAlgorithm;
use crate::rate_limit::RateLimiter;
use crate::statistics::HolderStatistics;
use crate::ticks::TickSource;

/// Outcome of a single holder poll
#[derive(Debug, Default)]
pub struct PollResult {
    pub messages: Vec<ServiceMessage>,
    pub errored: bool,
}

#[derive(Debug)]
struct HolderState {
    is_reserved: bool,
    reserved: Option<usize>,
    metrics: ClientPriorityHolderMetrics,
    last_exception: Option<ClientError>,
    last_exception_time: Option<DateTime<Utc>>,
    consecutive_exceptions: u32,
    reset_abandoned: bool,
}

#[derive(Debug)]
pub struct ClientPriorityHolder {
    id: Uuid,
    name: String,
    mapping_channel_id: Option<String>,
    client: RwLock<Arc<dyn ListenerClient>>,
    collector: Arc<dyn DataCollector>,
    state: Mutex<HolderState>,
}

impl ClientPriorityHolder {
    pub fn new(
        client: Arc<dyn ListenerClient>,
        mapping_channel_id: Option<String>,
        algorithm: Arc<dyn PollAlgorithm>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        clock: Arc<dyn TickSource>,
        collector: Arc<dyn DataCollector>,
    ) -> Self {
        let name = match &mapping_channel_id {
            Some(mapping) => format!("{}|{}", client.name(), mapping),
            None => client.name().to_string(),
        };

        let metrics = ClientPriorityHolderMetrics::new(
            algorithm,
            rate_limiter,
            clock,
            client.priority(),
            client.weighting(),
        );

        Self {
            id: Uuid::new_v4(),
            name,
            mapping_channel_id,
            client: RwLock::new(client),
            collector,
            state: Mutex::new(HolderState {
                is_reserved: false,
                reserved: None,
                metrics,
                last_exception: None,
                last_exception_time: None,
                consecutive_exceptions: 0,
                reset_abandoned: false,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> Arc<dyn ListenerClient> {
        Arc::clone(&*self.client.read())
    }

    pub fn client_id(&self) -> Uuid {
        self.client.read().id()
    }

    pub fn is_active(&self) -> bool {
        self.client.read().is_active()
    }

    pub fn is_reserved(&self) -> bool {
        self.state.lock().is_reserved
    }

    pub fn reserved(&self) -> Option<usize> {
        self.state.lock().reserved
    }

    pub fn priority(&self) -> i32 {
        self.state.lock().metrics.priority()
    }

    pub fn weighting(&self) -> Decimal {
        self.state.lock().metrics.priority_weighting()
    }

    pub fn priority_calculated(&self) -> Option<i64> {
        self.state.lock().metrics.priority_calculated()
    }

    pub fn last_exception(&self) -> Option<(String, DateTime<Utc>)> {
        let state = self.state.lock();
        state
            .last_exception
            .as_ref()
            .map(|e| e.to_string())
            .zip(state.last_exception_time)
    }

    pub fn consecutive_exceptions(&self) -> u32 {
        self.state.lock().consecutive_exceptions
    }

    /// Whether the client should be recreated.
    ///
    /// Transient failures must reach `threshold` in a row; a non-transient
    /// failure (stopped, panicked, unsupported) qualifies straight away.
    /// Holders whose last reset was abandoned never qualify again.
    pub fn needs_reset(&self, threshold: u32) -> bool {
        let state = self.state.lock();
        if state.reset_abandoned || state.consecutive_exceptions == 0 {
            return false;
        }
        state.consecutive_exceptions >= threshold
            || state
                .last_exception
                .as_ref()
                .is_some_and(|e| !e.is_transient())
    }

    pub fn is_reset_abandoned(&self) -> bool {
        self.state.lock().reset_abandoned
    }

    /// Record that recreating the client failed for good
    pub fn mark_reset_abandoned(&self) {
        self.state.lock().reset_abandoned = true;
    }

    /// Try to claim slots out of `available`.
    ///
    /// Returns `None` without touching the metrics when the client is inactive
    /// or a poll is already reserved. A zero-slot sizing releases immediately.
    pub fn reserve(&self, available: usize) -> Option<usize> {
        if !self.is_active() {
            return None;
        }

        let mut state = self.state.lock();
        if state.is_reserved {
            return None;
        }

        let taken = state.metrics.reserve(available);
        if taken == 0 {
            state.metrics.release(false);
            return None;
        }

        state.is_reserved = true;
        state.reserved = Some(taken);
        Some(taken)
    }

    pub fn release(&self, exception: bool) {
        let mut state = self.state.lock();
        state.metrics.release(exception);
        state.is_reserved = false;
    }

    /// Pull the reserved number of messages from the client.
    ///
    /// Client failures, including panics, are recorded on the holder and
    /// reported through the result; they never propagate.
    #[instrument(skip(self), fields(holder = %self.name))]
    pub async fn poll(&self) -> PollResult {
        let (reserved, wait_ms) = {
            let mut state = self.state.lock();
            if !state.is_reserved {
                debug!("Poll requested without a reservation");
                return PollResult::default();
            }
            let reserved = state.reserved.unwrap_or(0);
            (reserved, state.metrics.poll_begin(reserved))
        };

        let client = self.client();
        let pull = client.messages_pull(Some(reserved), wait_ms, self.mapping_channel_id.as_deref());

        let (messages, error) = match AssertUnwindSafe(pull).catch_unwind().await {
            Ok(Ok(messages)) => (messages, None),
            Ok(Err(err)) => (Vec::new(), Some(err)),
            Err(_) => (
                Vec::new(),
                Some(ClientError::Internal(format!("client {} panicked during poll", self.name))),
            ),
        };

        if let Some(err) = &error {
            warn!(error = %err, reserved = reserved, "Poll failed");
            self.collector
                .log_exception(&format!("ClientPriorityHolder/Poll/{}", self.name), err);
        }

        let errored = error.is_some();
        {
            let mut state = self.state.lock();
            match error {
                Some(err) => {
                    state.last_exception = Some(err);
                    state.last_exception_time = Some(Utc::now());
                    state.consecutive_exceptions += 1;
                }
                None => state.consecutive_exceptions = 0,
            }
            state.metrics.poll_end(messages.len(), errored);
        }

        debug!(
            reserved = reserved,
            received = messages.len(),
            errored = errored,
            "Poll completed"
        );

        PollResult { messages, errored }
    }

    /// Refresh the scheduling priority from the client's queue depth.
    ///
    /// A failing depth query falls back to the last known depth.
    pub async fn priority_recalculate(&self) -> i64 {
        let client = self.client();
        let queue_length = match client.queue_length().await {
            Ok(length) => length,
            Err(err) => {
                debug!(holder = %self.name, error = %err, "Queue length query failed");
                None
            }
        };

        self.state.lock().metrics.priority_recalculate(queue_length)
    }

    pub fn should_skip(&self) -> bool {
        self.state.lock().metrics.should_skip()
    }

    pub fn is_poll_past_due(&self) -> bool {
        self.state.lock().metrics.is_poll_past_due()
    }

    pub fn capacity_reset(&self) {
        self.state.lock().metrics.capacity_reset();
    }

    /// Swap in a recreated client; metrics carry over
    pub fn replace_client(&self, client: Arc<dyn ListenerClient>) {
        *self.client.write() = client;
        let mut state = self.state.lock();
        state.consecutive_exceptions = 0;
        state.reset_abandoned = false;
    }

    /// Inspect the metrics under the holder lock
    pub fn with_metrics<R>(&self, f: impl FnOnce(&ClientPriorityHolderMetrics) -> R) -> R {
        f(&self.state.lock().metrics)
    }

    pub fn statistics(&self) -> HolderStatistics {
        let client_id = self.client_id();
        let is_active = self.is_active();
        let state = self.state.lock();
        HolderStatistics {
            id: self.id,
            client_id,
            name: self.name.clone(),
            algorithm: state.metrics.algorithm().name().to_string(),
            is_active,
            is_reserved: state.is_reserved,
            reserved: state.reserved,
            consecutive_exceptions: state.consecutive_exceptions,
            last_exception: state.last_exception.as_ref().map(|e| e.to_string()),
            reset_abandoned: state.reset_abandoned,
            last_exception_time: state.last_exception_time,
            metrics: state.metrics.snapshot(),
        }
    }
}
