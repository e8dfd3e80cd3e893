//! In-memory message fabric
//!
//! Backs listener clients with process-local queues, one per priority
//! partition. Used by the binary for local runs and by the tests, which can
//! inject poll and depth-query failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::client::{ClientFactory, ListenerClient, PriorityPartition, ServiceMessage};
use crate::errors::ClientError;

#[derive(Debug, Default)]
struct PartitionQueue {
    messages: Mutex<VecDeque<ServiceMessage>>,
    arrived: Notify,
}

/// Shared set of in-memory partition queues
#[derive(Debug, Default)]
pub struct ManualFabric {
    queues: DashMap<String, Arc<PartitionQueue>>,
    long_poll: bool,
}

impl ManualFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make empty pulls wait for the fabric wait hint before returning
    pub fn with_long_poll() -> Self {
        Self {
            queues: DashMap::new(),
            long_poll: true,
        }
    }

    pub fn partition_key(channel_id: &str, priority: i32) -> String {
        format!("{}/{}", channel_id, priority)
    }

    fn queue(&self, key: &str) -> Arc<PartitionQueue> {
        Arc::clone(self.queues.entry(key.to_string()).or_default().value())
    }

    pub fn enqueue(&self, channel_id: &str, priority: i32, message: ServiceMessage) {
        let queue = self.queue(&Self::partition_key(channel_id, priority));
        queue.messages.lock().push_back(message);
        queue.arrived.notify_one();
    }

    /// Enqueue `count` small messages on a partition
    pub fn enqueue_many(&self, channel_id: &str, priority: i32, count: usize) {
        for i in 0..count {
            let body = Bytes::from(format!("message-{}", i));
            self.enqueue(channel_id, priority, ServiceMessage::new(channel_id, "manual", body));
        }
    }

    pub fn depth(&self, channel_id: &str, priority: i32) -> usize {
        self.queue(&Self::partition_key(channel_id, priority))
            .messages
            .lock()
            .len()
    }
}

/// Listener client over one [`ManualFabric`] partition
#[derive(Debug)]
pub struct ManualListenerClient {
    id: Uuid,
    name: String,
    channel_id: String,
    priority: i32,
    weighting: Decimal,
    fabric: Arc<ManualFabric>,
    active: AtomicBool,
    fail_polls: AtomicU32,
    fail_queue_length: AtomicBool,
    pulls: AtomicUsize,
}

impl ManualListenerClient {
    pub fn new(fabric: Arc<ManualFabric>, channel_id: &str, priority: i32, weighting: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: format!("{}/{}", channel_id, priority),
            channel_id: channel_id.to_string(),
            priority,
            weighting,
            fabric,
            active: AtomicBool::new(false),
            fail_polls: AtomicU32::new(0),
            fail_queue_length: AtomicBool::new(false),
            pulls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` pulls with a transport error
    pub fn fail_next_polls(&self, count: u32) {
        self.fail_polls.store(count, Ordering::SeqCst);
    }

    pub fn set_queue_length_failing(&self, failing: bool) {
        self.fail_queue_length.store(failing, Ordering::SeqCst);
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn drain(&self, queue: &PartitionQueue, count: usize, mapping_channel: Option<&str>) -> Vec<ServiceMessage> {
        let mut messages = queue.messages.lock();
        let take = count.min(messages.len());
        messages
            .drain(..take)
            .map(|mut message| {
                if let Some(mapping) = mapping_channel {
                    message.channel_id = mapping.to_string();
                }
                message
            })
            .collect()
    }
}

#[async_trait]
impl ListenerClient for ManualListenerClient {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn weighting(&self) -> Decimal {
        self.weighting
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn messages_pull(
        &self,
        count: Option<usize>,
        wait_ms: Option<i32>,
        mapping_channel: Option<&str>,
    ) -> Result<Vec<ServiceMessage>, ClientError> {
        if !self.is_active() {
            return Err(ClientError::Stopped(self.name.clone()));
        }
        self.pulls.fetch_add(1, Ordering::SeqCst);

        if self.take_failure() {
            return Err(ClientError::Transport {
                client: self.name.clone(),
                message: "injected poll failure".to_string(),
            });
        }

        let count = count.unwrap_or(1);
        let queue = self
            .fabric
            .queue(&ManualFabric::partition_key(&self.channel_id, self.priority));

        let mut messages = self.drain(&queue, count, mapping_channel);
        if messages.is_empty() && self.fabric.long_poll {
            if let Some(wait) = wait_ms.filter(|w| *w > 0) {
                let wait = Duration::from_millis(wait as u64);
                if tokio::time::timeout(wait, queue.arrived.notified()).await.is_ok() {
                    messages = self.drain(&queue, count, mapping_channel);
                }
            }
        }

        debug!(client = %self.name, requested = count, received = messages.len(), "Manual pull");
        Ok(messages)
    }

    async fn queue_length(&self) -> Result<Option<i64>, ClientError> {
        if self.fail_queue_length.load(Ordering::SeqCst) {
            return Err(ClientError::Transport {
                client: self.name.clone(),
                message: "injected queue length failure".to_string(),
            });
        }
        Ok(Some(self.fabric.depth(&self.channel_id, self.priority) as i64))
    }

    async fn start(&self) -> Result<(), ClientError> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`ManualListenerClient`]s over a shared fabric
#[derive(Debug)]
pub struct ManualClientFactory {
    fabric: Arc<ManualFabric>,
    created: DashMap<i32, Vec<Arc<ManualListenerClient>>>,
    fail_creates: AtomicU32,
}

impl ManualClientFactory {
    pub fn new(fabric: Arc<ManualFabric>) -> Self {
        Self {
            fabric,
            created: DashMap::new(),
            fail_creates: AtomicU32::new(0),
        }
    }

    pub fn fabric(&self) -> &Arc<ManualFabric> {
        &self.fabric
    }

    /// Fail the next `count` client creations
    pub fn fail_next_creates(&self, count: u32) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    /// Most recently created client for a priority
    pub fn latest(&self, priority: i32) -> Option<Arc<ManualListenerClient>> {
        self.created
            .get(&priority)
            .and_then(|clients| clients.last().cloned())
    }

    pub fn created_count(&self, priority: i32) -> usize {
        self.created.get(&priority).map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ClientFactory for ManualClientFactory {
    async fn create(
        &self,
        channel_id: &str,
        partition: &PriorityPartition,
    ) -> Result<Arc<dyn ListenerClient>, ClientError> {
        let failed = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ClientError::Transport {
                client: ManualFabric::partition_key(channel_id, partition.priority),
                message: "injected create failure".to_string(),
            });
        }

        let client = Arc::new(ManualListenerClient::new(
            Arc::clone(&self.fabric),
            channel_id,
            partition.priority,
            partition.weighting,
        ));
        self.created
            .entry(partition.priority)
            .or_default()
            .push(Arc::clone(&client));
        Ok(client)
    }
}
