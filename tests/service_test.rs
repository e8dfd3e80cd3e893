//! Messaging service lifecycle against the in-memory fabric

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use fabric_poller::backoff::ExponentialBackoff;
use fabric_poller::config::RateLimitConfig;
use fabric_poller::manual_fabric::{ManualClientFactory, ManualFabric, ManualListenerClient};
use fabric_poller::{
    ClientError, ClientFactory, ListenerClient, MessagingService, MessagingServiceConfig,
    PriorityPartition, RateLimiter, ResourceProfile, ServiceError, ServiceMessage,
};

const CHANNEL: &str = "orders";

fn partitions(count: i32) -> Vec<PriorityPartition> {
    (0..count)
        .map(|priority| PriorityPartition::new(priority, Decimal::ONE))
        .collect()
}

fn fast_config(partitions: Vec<PriorityPartition>) -> MessagingServiceConfig {
    let mut config = MessagingServiceConfig::new(CHANNEL, partitions);
    config.poll_interval_ms = 5;
    config.algorithm.max_allowed_poll_wait_ms = 50;
    config.algorithm.min_expected_poll_wait_ms = 10;
    config.algorithm.fabric_poll_wait_min_ms = 10;
    config.algorithm.fabric_poll_wait_max_ms = 10;
    config
}

fn build_service(
    config: MessagingServiceConfig,
) -> (MessagingService, mpsc::Receiver<ServiceMessage>, Arc<ManualClientFactory>) {
    let factory = Arc::new(ManualClientFactory::new(Arc::new(ManualFabric::new())));
    let (service, receiver) = MessagingService::new(config, factory.clone());
    (service, receiver, factory)
}

async fn receive(receiver: &mut mpsc::Receiver<ServiceMessage>, count: usize) -> Vec<ServiceMessage> {
    let mut messages = Vec::with_capacity(count);
    while messages.len() < count {
        match tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await {
            Ok(Some(message)) => messages.push(message),
            _ => break,
        }
    }
    messages
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Factory that fails or stalls creations from a given call onwards
#[derive(Debug)]
struct ScriptedFactory {
    inner: ManualClientFactory,
    calls: AtomicUsize,
    fail_from: Option<usize>,
    stall_from: Option<(usize, Duration)>,
}

impl ScriptedFactory {
    fn new(fail_from: Option<usize>, stall_from: Option<(usize, Duration)>) -> Self {
        Self {
            inner: ManualClientFactory::new(Arc::new(ManualFabric::new())),
            calls: AtomicUsize::new(0),
            fail_from,
            stall_from,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for ScriptedFactory {
    async fn create(
        &self,
        channel_id: &str,
        partition: &PriorityPartition,
    ) -> Result<Arc<dyn ListenerClient>, ClientError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|from| call >= from) {
            return Err(ClientError::Transport {
                client: format!("{}/{}", channel_id, partition.priority),
                message: "fabric unreachable".to_string(),
            });
        }

        let client = self.inner.create(channel_id, partition).await?;
        if let Some((from, stall)) = self.stall_from {
            if call >= from {
                tokio::time::sleep(stall).await;
            }
        }
        Ok(client)
    }
}

fn holder_stats(service: &MessagingService, name: &str) -> fabric_poller::statistics::HolderStatistics {
    service
        .statistics()
        .collection
        .unwrap()
        .holders
        .into_iter()
        .find(|h| h.name == name)
        .unwrap()
}

#[tokio::test]
async fn test_service_delivers_from_every_partition() {
    let (service, mut receiver, factory) = build_service(fast_config(partitions(3)));
    for priority in 0..3 {
        factory.fabric().enqueue_many(CHANNEL, priority, 20);
    }

    service.start().await.unwrap();
    assert!(service.is_running().await);

    let messages = receive(&mut receiver, 60).await;
    assert_eq!(messages.len(), 60);
    for priority in 0..3 {
        assert_eq!(factory.fabric().depth(CHANNEL, priority), 0);
    }

    let stats = service.statistics();
    assert!(stats.running);
    let collection = stats.collection.unwrap();
    assert_eq!(collection.holders.len(), 3);
    assert!(collection
        .holders
        .iter()
        .all(|h| h.algorithm == "MultipleClientPollSlotAllocationAlgorithm"));

    service.stop().await.unwrap();
    assert!(!service.is_running().await);
    assert!(service.collection().is_none());
    assert!(!factory.latest(0).unwrap().is_active());
}

#[tokio::test]
async fn test_single_partition_uses_single_algorithm() {
    let (service, mut receiver, factory) = build_service(fast_config(partitions(1)));
    factory.fabric().enqueue_many(CHANNEL, 0, 5);

    service.start().await.unwrap();
    assert_eq!(receive(&mut receiver, 5).await.len(), 5);

    let stats = service.statistics().collection.unwrap();
    assert_eq!(stats.holders[0].algorithm, "SingleClientPollSlotAllocationAlgorithm");
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_mapped_partition_relabels_channel() {
    let partitions = vec![
        PriorityPartition::new(0, Decimal::ONE),
        PriorityPartition::new(1, Decimal::ONE).with_mapping_channel("orders-hot"),
    ];
    let (service, mut receiver, factory) = build_service(fast_config(partitions));
    factory.fabric().enqueue_many(CHANNEL, 1, 2);

    service.start().await.unwrap();
    let messages = receive(&mut receiver, 2).await;
    assert!(messages.iter().all(|m| m.channel_id == "orders-hot"));
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_rejects_invalid_configuration() {
    let (service, _rx, _) = build_service(fast_config(Vec::new()));
    assert!(matches!(
        service.start().await,
        Err(ServiceError::NoClientsDefined { .. })
    ));

    let duplicate = vec![
        PriorityPartition::new(1, Decimal::ONE),
        PriorityPartition::new(1, Decimal::ONE),
    ];
    let (service, _rx, _) = build_service(fast_config(duplicate));
    assert!(matches!(
        service.start().await,
        Err(ServiceError::PartitionConfiguration { .. })
    ));

    let (service, _rx, _) = build_service(fast_config(vec![PriorityPartition::new(0, Decimal::ZERO)]));
    assert!(matches!(
        service.start().await,
        Err(ServiceError::PartitionConfiguration { .. })
    ));

    let mut config = fast_config(partitions(2));
    config.max_concurrent_polls = 0;
    let (service, _rx, _) = build_service(config);
    assert!(matches!(
        service.start().await,
        Err(ServiceError::InvalidConcurrency(0))
    ));
    assert!(!service.is_running().await);
}

#[tokio::test]
async fn test_start_twice_and_stop_twice() {
    let (service, _rx, _) = build_service(fast_config(partitions(2)));

    service.start().await.unwrap();
    assert!(matches!(service.start().await, Err(ServiceError::AlreadyRunning(_))));

    service.stop().await.unwrap();
    assert!(matches!(service.stop().await, Err(ServiceError::NotRunning(_))));

    // A stopped service can be started again
    service.start().await.unwrap();
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_creation_failure_reaches_caller() {
    let (service, _rx, factory) = build_service(fast_config(partitions(2)));
    factory.fail_next_creates(1);

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, ServiceError::Client(ClientError::Transport { .. })));
    assert!(!service.is_running().await);
    assert!(service.statistics().collection.is_none());
}

/// Factory that hands out clients for the wrong partition
#[derive(Debug)]
struct MisroutingFactory {
    fabric: Arc<ManualFabric>,
}

#[async_trait]
impl ClientFactory for MisroutingFactory {
    async fn create(
        &self,
        channel_id: &str,
        partition: &PriorityPartition,
    ) -> Result<Arc<dyn ListenerClient>, ClientError> {
        Ok(Arc::new(ManualListenerClient::new(
            Arc::clone(&self.fabric),
            channel_id,
            partition.priority + 1,
            partition.weighting,
        )))
    }
}

#[tokio::test]
async fn test_unresolvable_priority_is_a_start_error() {
    let factory = Arc::new(MisroutingFactory {
        fabric: Arc::new(ManualFabric::new()),
    });
    let (service, _rx) = MessagingService::new(fast_config(partitions(2)), factory);

    assert!(matches!(
        service.start().await,
        Err(ServiceError::PriorityNotResolvable { priority: 0, .. })
    ));
}

#[tokio::test]
async fn test_failing_client_is_reset() {
    let mut config = fast_config(partitions(2));
    config.reset.exception_threshold = 2;
    config.reset.backoff = ExponentialBackoff::new(5, 20, 5);
    let (service, mut receiver, factory) = build_service(config);

    service.start().await.unwrap();
    factory.latest(1).unwrap().fail_next_polls(1_000);

    assert!(wait_until(|| service.client_resets() >= 1).await);
    assert!(factory.created_count(1) >= 2);
    assert_eq!(factory.created_count(0), 1);

    // The replacement client serves the partition
    factory.fabric().enqueue_many(CHANNEL, 1, 3);
    assert_eq!(receive(&mut receiver, 3).await.len(), 3);

    let stats = service.statistics();
    assert!(stats.client_resets >= 1);
    let holder = stats
        .collection
        .unwrap()
        .holders
        .into_iter()
        .find(|h| h.name == "orders/1")
        .unwrap();
    assert!(holder.metrics.poll_exception_count >= 2);
    assert!(holder.last_exception.is_some());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_rate_limiter_is_registered_per_holder() {
    let mut config = fast_config(partitions(2));
    config.rate_limit = Some(RateLimitConfig {
        profiles: vec![ResourceProfile::new("fabric", 1_000)],
    });
    let (service, mut receiver, factory) = build_service(config);
    factory.fabric().enqueue_many(CHANNEL, 0, 4);

    service.start().await.unwrap();
    assert_eq!(receive(&mut receiver, 4).await.len(), 4);

    let limiter = service.rate_limiter("orders/0").unwrap();
    assert_eq!(limiter.profiles().count(), 1);
    assert!(service.rate_limiter("orders/1").is_some());

    service.stop().await.unwrap();
    assert!(service.rate_limiter("orders/0").is_none());
}

#[tokio::test]
async fn test_statistics_serialize_to_json() {
    let (service, _rx, _) = build_service(fast_config(partitions(2)));
    service.start().await.unwrap();

    let json = service.statistics().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["channel_id"], "orders");
    assert_eq!(value["running"], true);
    assert_eq!(value["collection"]["holders"].as_array().unwrap().len(), 2);

    service.stop().await.unwrap();
    let stopped = service.statistics();
    assert!(!stopped.running);
    assert!(stopped.collection.is_none());
}

#[tokio::test]
async fn test_second_creation_failure_stops_first_client() {
    let factory = Arc::new(ScriptedFactory::new(Some(1), None));
    let (service, _rx) = MessagingService::new(fast_config(partitions(2)), factory.clone());

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, ServiceError::Client(ClientError::Transport { .. })));
    assert_eq!(factory.calls(), 2);

    let first = factory.inner.latest(0).unwrap();
    assert!(!first.is_active());
    assert_eq!(factory.inner.created_count(1), 0);
    assert!(!service.is_running().await);
    assert!(service.rate_limiter("orders/0").is_none());
}

#[tokio::test]
async fn test_reset_gives_up_and_stays_abandoned() {
    let mut config = fast_config(partitions(1));
    config.reset.exception_threshold = 1;
    config.reset.backoff = ExponentialBackoff {
        jitter_factor: 0.0,
        ..ExponentialBackoff::new(5, 5, 1)
    };
    let factory = Arc::new(ScriptedFactory::new(Some(1), None));
    let (service, _rx) = MessagingService::new(config, factory.clone());

    service.start().await.unwrap();
    factory.inner.latest(0).unwrap().fail_next_polls(1_000);

    assert!(wait_until(|| holder_stats(&service, "orders/0").reset_abandoned).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Startup, then one attempt plus one retry
    assert_eq!(factory.calls(), 3);
    assert_eq!(service.client_resets(), 0);
    let holder = holder_stats(&service, "orders/0");
    assert!(holder.reset_abandoned);
    assert!(holder.last_exception.is_some());
    assert!(service.is_running().await);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_reset_in_progress() {
    let mut config = fast_config(partitions(2));
    config.reset.exception_threshold = 1;
    config.reset.backoff = ExponentialBackoff::new(5, 5, 3);
    let factory = Arc::new(ScriptedFactory::new(None, Some((2, Duration::from_millis(200)))));
    let (service, _rx) = MessagingService::new(config, factory.clone());

    service.start().await.unwrap();
    factory.inner.latest(1).unwrap().fail_next_polls(1_000);

    // The replacement is created but still stalled before start
    assert!(wait_until(|| factory.inner.created_count(1) == 2).await);
    tokio::time::timeout(Duration::from_secs(2), service.stop())
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!factory.inner.latest(0).unwrap().is_active());
    assert!(!factory.inner.latest(1).unwrap().is_active());
    assert_eq!(factory.inner.created_count(1), 2);
    assert_eq!(service.client_resets(), 0);
}

#[tokio::test]
async fn test_stop_with_undrained_receiver() {
    let mut config = fast_config(partitions(1));
    config.output_buffer = 1;
    let (service, _receiver, factory) = build_service(config);
    factory.fabric().enqueue_many(CHANNEL, 0, 10);

    service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(2), service.stop()).await;
    assert!(matches!(stopped, Ok(Ok(()))));
    assert!(!factory.latest(0).unwrap().is_active());
}

#[tokio::test]
async fn test_dropped_receiver_ends_running_state() {
    let (service, receiver, factory) = build_service(fast_config(partitions(2)));
    drop(receiver);
    factory.fabric().enqueue_many(CHANNEL, 0, 5);

    service.start().await.unwrap();
    assert!(wait_until(|| !service.statistics().running).await);
    assert!(!service.is_running().await);

    // Still owns its clients until stopped
    service.stop().await.unwrap();
    assert!(!factory.latest(0).unwrap().is_active());
}

fn throttled_config(capacity_reset_interval_ms: u64) -> MessagingServiceConfig {
    let mut config = fast_config(partitions(2));
    config.algorithm.allowed_overage = 0;
    config.capacity_reset_interval_ms = capacity_reset_interval_ms;
    config.rate_limit = Some(RateLimitConfig {
        profiles: vec![ResourceProfile {
            burst: Some(1),
            ..ResourceProfile::new("ledger-db", 1)
        }],
    });
    config
}

#[tokio::test]
async fn test_rate_limit_shrinks_reservations() {
    let (service, mut receiver, factory) = build_service(throttled_config(600_000));
    factory.fabric().enqueue_many(CHANNEL, 0, 20);

    service.start().await.unwrap();
    assert_eq!(receive(&mut receiver, 20).await.len(), 20);

    let limiter = service.rate_limiter("orders/0").unwrap();
    assert!(limiter.adjustment_percentage() < Decimal::ONE);

    factory.fabric().enqueue_many(CHANNEL, 0, 10);
    assert_eq!(receive(&mut receiver, 10).await.len(), 10);

    // Unthrottled, a reservation would be most of the 32 slots
    let holder = holder_stats(&service, "orders/0");
    assert!(holder.metrics.last_reserved <= Some(2));
    assert!(holder.metrics.poll_achieved >= 30);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_capacity_reset_reopens_rate_limit_window() {
    let (service, mut receiver, factory) = build_service(throttled_config(300));
    factory.fabric().enqueue_many(CHANNEL, 0, 20);

    let started = Instant::now();
    service.start().await.unwrap();
    assert_eq!(receive(&mut receiver, 20).await.len(), 20);

    let limiter = service.rate_limiter("orders/0").unwrap();
    assert!(limiter.adjustment_percentage() < Decimal::ONE);

    assert!(wait_until(|| limiter.adjustment_percentage() == Decimal::ONE).await);
    assert!(started.elapsed() >= Duration::from_millis(300));

    service.stop().await.unwrap();
}
