//! Messaging service
//!
//! Owns the listener clients of one channel: creates and starts a client per
//! priority partition, wraps each in a holder, and drives the collection from
//! a background scheduler task. Polled messages are forwarded on an `mpsc`
//! channel. Clients that keep failing are reset (stop, recreate, start) with
//! an exponential standoff between attempts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{ClientFactory, ListenerClient, PriorityPartition, ServiceMessage};
use crate::collection::ClientPriorityCollection;
use crate::collector::{DataCollector, LogLevel, TracingDataCollector};
use crate::config::{ClientResetConfig, MessagingServiceConfig};
use crate::errors::{ClientError, ServiceError};
use crate::holder::ClientPriorityHolder;
use crate::poll_algorithm::{
    MultipleClientPollSlotAllocationAlgorithm, PollAlgorithm,
    SingleClientPollSlotAllocationAlgorithm,
};
use crate::rate_limit::{RateLimiter, ResourceRateLimiter};
use crate::statistics::ServiceStatistics;
use crate::ticks::{SystemTickSource, TickSource};

struct RunningState {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    context: Arc<SchedulerContext>,
}

/// State shared between the service handle and its scheduler task
#[derive(Debug)]
struct SchedulerContext {
    channel_id: String,
    partitions: Vec<PriorityPartition>,
    collection: Arc<ClientPriorityCollection>,
    factory: Arc<dyn ClientFactory>,
    collector: Arc<dyn DataCollector>,
    output: mpsc::Sender<ServiceMessage>,
    limiters: Arc<DashMap<String, Arc<ResourceRateLimiter>>>,
    resetting: DashSet<Uuid>,
    /// In-flight client resets; joined by `stop`
    resets: SyncMutex<JoinSet<()>>,
    client_resets: Arc<AtomicU64>,
    scheduler_alive: Arc<AtomicBool>,
    poll_interval: Duration,
    capacity_reset_interval: Duration,
    reset: ClientResetConfig,
}

pub struct MessagingService {
    config: MessagingServiceConfig,
    factory: Arc<dyn ClientFactory>,
    collector: Arc<dyn DataCollector>,
    clock: Arc<dyn TickSource>,
    output: mpsc::Sender<ServiceMessage>,
    running: Mutex<Option<RunningState>>,
    collection: RwLock<Option<Arc<ClientPriorityCollection>>>,
    limiters: Arc<DashMap<String, Arc<ResourceRateLimiter>>>,
    client_resets: Arc<AtomicU64>,
    scheduler_alive: Arc<AtomicBool>,
}

impl MessagingService {
    /// Create a stopped service and the receiver its messages arrive on
    pub fn new(
        config: MessagingServiceConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> (Self, mpsc::Receiver<ServiceMessage>) {
        let (output, receiver) = mpsc::channel(config.output_buffer.max(1));
        let service = Self {
            config,
            factory,
            collector: Arc::new(TracingDataCollector::default()),
            clock: Arc::new(SystemTickSource::new()),
            output,
            running: Mutex::new(None),
            collection: RwLock::new(None),
            limiters: Arc::new(DashMap::new()),
            client_resets: Arc::new(AtomicU64::new(0)),
            scheduler_alive: Arc::new(AtomicBool::new(false)),
        };
        (service, receiver)
    }

    pub fn with_collector(mut self, collector: Arc<dyn DataCollector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TickSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.config.channel_id
    }

    pub fn config(&self) -> &MessagingServiceConfig {
        &self.config
    }

    /// Started, not yet stopped, and the scheduler is still polling.
    ///
    /// The scheduler exits on its own when the message receiver is dropped.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some() && self.scheduler_alive()
    }

    fn scheduler_alive(&self) -> bool {
        self.scheduler_alive.load(Ordering::SeqCst)
    }

    /// The live collection, while the service is running
    pub fn collection(&self) -> Option<Arc<ClientPriorityCollection>> {
        self.collection.read().clone()
    }

    /// Rate limiter registered for a holder name
    pub fn rate_limiter(&self, holder_name: &str) -> Option<Arc<ResourceRateLimiter>> {
        self.limiters.get(holder_name).map(|l| Arc::clone(l.value()))
    }

    pub fn client_resets(&self) -> u64 {
        self.client_resets.load(Ordering::Relaxed)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        let channel_id = self.config.channel_id.clone();
        if self.config.partitions.is_empty() {
            return Err(ServiceError::NoClientsDefined { channel_id });
        }
        if self.config.max_concurrent_polls == 0 {
            return Err(ServiceError::InvalidConcurrency(0));
        }
        self.config
            .validate()
            .map_err(|e| ServiceError::PartitionConfiguration {
                channel_id,
                reason: e.to_string(),
            })
    }

    fn algorithm(&self) -> Arc<dyn PollAlgorithm> {
        let config = self.config.algorithm.clone();
        if self.config.partitions.len() == 1 {
            Arc::new(SingleClientPollSlotAllocationAlgorithm::new(config))
        } else {
            Arc::new(MultipleClientPollSlotAllocationAlgorithm::new(config))
        }
    }

    async fn create_client(
        &self,
        partition: &PriorityPartition,
    ) -> Result<Arc<dyn ListenerClient>, ServiceError> {
        let client = self
            .factory
            .create(&self.config.channel_id, partition)
            .await?;
        if client.priority() != partition.priority {
            return Err(ServiceError::PriorityNotResolvable {
                channel_id: self.config.channel_id.clone(),
                priority: partition.priority,
            });
        }
        client.start().await?;
        Ok(client)
    }

    fn build_rate_limiter(&self, client_name: &str) -> Option<Arc<ResourceRateLimiter>> {
        let config = self.config.rate_limit.as_ref()?;
        Some(Arc::new(ResourceRateLimiter::new(client_name, config.profiles.clone())))
    }

    /// Create and start the clients and spawn the scheduler.
    ///
    /// Configuration and client start-up failures are returned to the caller;
    /// clients started before the failure are stopped again.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServiceError::AlreadyRunning(self.config.channel_id.clone()));
        }
        self.validate()?;

        let algorithm = self.algorithm();
        let mut holders = Vec::with_capacity(self.config.partitions.len());
        for partition in &self.config.partitions {
            let client = match self.create_client(partition).await {
                Ok(client) => client,
                Err(err) => {
                    stop_clients(&holders, self.collector.as_ref()).await;
                    self.limiters.clear();
                    return Err(err);
                }
            };

            let rate_limiter = self.build_rate_limiter(client.name());
            let holder = Arc::new(ClientPriorityHolder::new(
                client,
                partition.mapping_channel_id.clone(),
                Arc::clone(&algorithm),
                rate_limiter.clone().map(|l| l as Arc<dyn RateLimiter>),
                Arc::clone(&self.clock),
                Arc::clone(&self.collector),
            ));
            // Cycle outcomes report holder names, so limiters are keyed the same way.
            if let Some(limiter) = rate_limiter {
                self.limiters.insert(holder.name().to_string(), limiter);
            }
            holders.push(holder);
        }

        let collection = Arc::new(ClientPriorityCollection::new(
            holders,
            self.config.max_concurrent_polls,
            self.config.algorithm.priority_recalculate_frequency(),
            Arc::clone(&self.clock),
            Arc::clone(&self.collector),
        ));

        let context = Arc::new(SchedulerContext {
            channel_id: self.config.channel_id.clone(),
            partitions: self.config.partitions.clone(),
            collection: Arc::clone(&collection),
            factory: Arc::clone(&self.factory),
            collector: Arc::clone(&self.collector),
            output: self.output.clone(),
            limiters: Arc::clone(&self.limiters),
            resetting: DashSet::new(),
            resets: SyncMutex::new(JoinSet::new()),
            client_resets: Arc::clone(&self.client_resets),
            scheduler_alive: Arc::clone(&self.scheduler_alive),
            poll_interval: self.config.poll_interval(),
            capacity_reset_interval: self.config.capacity_reset_interval(),
            reset: self.config.reset.clone(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.scheduler_alive.store(true, Ordering::SeqCst);
        let task = tokio::spawn(run_scheduler(Arc::clone(&context), shutdown_rx));

        *self.collection.write() = Some(collection);
        *running = Some(RunningState {
            shutdown,
            task,
            context,
        });

        info!(
            channel = %self.config.channel_id,
            partitions = self.config.partitions.len(),
            algorithm = algorithm.name(),
            "Messaging service started"
        );
        self.collector.log_message(
            LogLevel::Info,
            &format!("Messaging service started for {}", self.config.channel_id),
        );
        Ok(())
    }

    /// Stop the scheduler, wait for in-flight client resets, then stop the
    /// clients and drop the holders
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let state = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| ServiceError::NotRunning(self.config.channel_id.clone()))?;

        let _ = state.shutdown.send(true);
        if let Err(e) = state.task.await {
            error!(channel = %self.config.channel_id, error = %e, "Scheduler task ended abnormally");
        }

        let mut resets = std::mem::take(&mut *state.context.resets.lock());
        while let Some(result) = resets.join_next().await {
            if let Err(e) = result {
                error!(channel = %self.config.channel_id, error = %e, "Client reset task ended abnormally");
            }
        }

        let collection = self.collection.write().take();
        if let Some(collection) = collection {
            stop_clients(collection.holders(), self.collector.as_ref()).await;
        }
        self.limiters.clear();

        info!(channel = %self.config.channel_id, "Messaging service stopped");
        Ok(())
    }

    pub fn statistics(&self) -> ServiceStatistics {
        let collection = self.collection();
        ServiceStatistics {
            channel_id: self.config.channel_id.clone(),
            running: collection.is_some() && self.scheduler_alive(),
            client_resets: self.client_resets(),
            collection: collection.map(|c| c.statistics()),
        }
    }
}

async fn stop_clients(holders: &[Arc<ClientPriorityHolder>], collector: &dyn DataCollector) {
    for holder in holders {
        if let Err(e) = holder.client().stop().await {
            collector.log_exception(&format!("MessagingService/Stop/{}", holder.name()), &e);
        }
    }
}

async fn run_scheduler(context: Arc<SchedulerContext>, shutdown: watch::Receiver<bool>) {
    debug!(channel = %context.channel_id, "Scheduler started");
    scheduler_loop(&context, shutdown).await;
    context.scheduler_alive.store(false, Ordering::SeqCst);
    debug!(channel = %context.channel_id, "Scheduler stopped");
}

async fn scheduler_loop(context: &Arc<SchedulerContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(context.poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_capacity_reset = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let outcome = context.collection.poll_cycle().await;

        for polled in &outcome.polled {
            if polled.received == 0 {
                continue;
            }
            if let Some(limiter) = context.limiters.get(&polled.name) {
                limiter.try_consume(polled.received as u32);
            }
        }

        // A full output channel must not hold up shutdown.
        let total = outcome.messages.len();
        for (forwarded, message) in outcome.messages.into_iter().enumerate() {
            tokio::select! {
                _ = shutdown.changed() => {
                    warn!(
                        channel = %context.channel_id,
                        dropped = total - forwarded,
                        "Shutdown while forwarding, polled messages dropped"
                    );
                    return;
                }
                sent = context.output.send(message) => {
                    if sent.is_err() {
                        warn!(channel = %context.channel_id, "Message receiver dropped, stopping scheduler");
                        return;
                    }
                }
            }
        }

        if last_capacity_reset.elapsed() >= context.capacity_reset_interval {
            context.collection.capacity_reset();
            for limiter in context.limiters.iter() {
                limiter.reset_window();
            }
            last_capacity_reset = tokio::time::Instant::now();
        }

        {
            let mut resets = context.resets.lock();
            while resets.try_join_next().is_some() {}

            for holder in context.collection.holders() {
                if !holder.needs_reset(context.reset.exception_threshold) {
                    continue;
                }
                if !context.resetting.insert(holder.id()) {
                    continue;
                }
                resets.spawn(reset_client(
                    Arc::clone(context),
                    Arc::clone(holder),
                    shutdown.clone(),
                ));
            }
        }
    }
}

async fn create_and_start(
    factory: &dyn ClientFactory,
    channel_id: &str,
    partition: &PriorityPartition,
) -> Result<Arc<dyn ListenerClient>, ClientError> {
    let client = factory.create(channel_id, partition).await?;
    client.start().await?;
    Ok(client)
}

/// Stop, recreate and restart a failing client, backing off between attempts.
///
/// Shutdown cancels a pending create. When the backoff is exhausted the
/// holder is marked abandoned and is not reset again.
async fn reset_client(
    context: Arc<SchedulerContext>,
    holder: Arc<ClientPriorityHolder>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = holder.name().to_string();
    warn!(
        holder = %name,
        exceptions = holder.consecutive_exceptions(),
        "Resetting client after poll failures"
    );

    if let Err(e) = holder.client().stop().await {
        context
            .collector
            .log_exception(&format!("MessagingService/Reset/{}", name), &e);
    }

    let priority = holder.priority();
    let Some(partition) = context.partitions.iter().find(|p| p.priority == priority) else {
        error!(holder = %name, priority = priority, "No partition for holder priority");
        holder.mark_reset_abandoned();
        context.resetting.remove(&holder.id());
        return;
    };

    let mut attempt = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = create_and_start(context.factory.as_ref(), &context.channel_id, partition) => result,
        };

        match result {
            Ok(client) => {
                if *shutdown.borrow() {
                    if let Err(e) = client.stop().await {
                        context
                            .collector
                            .log_exception(&format!("MessagingService/Reset/{}", name), &e);
                    }
                    break;
                }
                holder.replace_client(client);
                context.client_resets.fetch_add(1, Ordering::Relaxed);
                info!(holder = %name, attempts = attempt + 1, "Client reset");
                break;
            }
            Err(e) => {
                context
                    .collector
                    .log_exception(&format!("MessagingService/Reset/{}", name), &e);

                let Some(delay) = context.reset.backoff.delay(attempt) else {
                    holder.mark_reset_abandoned();
                    error!(holder = %name, attempts = attempt + 1, "Giving up on client reset");
                    context.collector.log_message(
                        LogLevel::Error,
                        &format!("Client reset abandoned for {}", name),
                    );
                    break;
                };
                attempt += 1;

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    context.resetting.remove(&holder.id());
}
