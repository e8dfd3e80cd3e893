//! Fabric Poller - adaptive priority polling over a message fabric
//!
//! A messaging service owns one listener client per priority partition of a
//! channel. Each scheduling cycle hands a shared concurrency budget to the
//! clients in priority order, sizing every reservation from the client's
//! recent hit rate. Starved clients are forced into the cycle once they pass
//! their maximum allowed wait.

pub mod backoff;
pub mod client;
pub mod collection;
pub mod collector;
pub mod config;
pub mod errors;
pub mod holder;
pub mod holder_metrics;
pub mod manual_fabric;
pub mod poll_algorithm;
pub mod rate_limit;
pub mod service;
pub mod statistics;
pub mod telemetry;
pub mod ticks;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use client::{ClientFactory, ListenerClient, PriorityPartition, ServiceMessage};
pub use collection::{ClientPriorityCollection, CycleOutcome, PolledHolder};
pub use collector::{DataCollector, LogLevel, TracingDataCollector};
pub use config::{EngineConfig, MessagingServiceConfig};
pub use errors::{ClientError, ConfigError, ServiceError};
pub use holder::{ClientPriorityHolder, PollResult};
pub use holder_metrics::ClientPriorityHolderMetrics;
pub use poll_algorithm::{
    MultipleClientPollSlotAllocationAlgorithm, PollAlgorithm, PollAlgorithmConfig,
    SingleClientPollSlotAllocationAlgorithm,
};
pub use rate_limit::{RateLimiter, ResourceProfile, ResourceRateLimiter};
pub use service::MessagingService;
pub use statistics::ServiceStatistics;
pub use ticks::{calculate_delta, ManualTickSource, SystemTickSource, TickSource};
