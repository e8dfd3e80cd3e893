//! Listener client contract
//!
//! A listener client reads one priority partition of a channel from the
//! message fabric. The scheduler never owns a client's lifecycle; it only
//! pulls batches and asks for the queue depth.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ClientError;

/// A message pulled from the fabric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub id: Uuid,
    pub channel_id: String,
    pub message_type: String,
    pub body: Bytes,
    pub enqueued_at: DateTime<Utc>,
}

impl ServiceMessage {
    pub fn new(channel_id: impl Into<String>, message_type: impl Into<String>, body: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            message_type: message_type.into(),
            body,
            enqueued_at: Utc::now(),
        }
    }
}

/// A named sub-channel with its own priority and weighting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityPartition {
    pub priority: i32,

    #[serde(default = "default_weighting")]
    pub weighting: Decimal,

    /// Channel the partition's messages are re-labelled to, when mapped
    #[serde(default)]
    pub mapping_channel_id: Option<String>,
}

fn default_weighting() -> Decimal {
    Decimal::ONE
}

impl PriorityPartition {
    pub fn new(priority: i32, weighting: Decimal) -> Self {
        Self {
            priority,
            weighting,
            mapping_channel_id: None,
        }
    }

    pub fn with_mapping_channel(mut self, channel: impl Into<String>) -> Self {
        self.mapping_channel_id = Some(channel.into());
        self
    }
}

/// A reader for one priority partition on the message fabric
#[async_trait]
pub trait ListenerClient: Send + Sync + fmt::Debug {
    fn id(&self) -> Uuid;

    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    fn weighting(&self) -> Decimal;

    fn is_active(&self) -> bool;

    /// Pull up to `count` messages, long-polling the fabric for up to `wait_ms`
    async fn messages_pull(
        &self,
        count: Option<usize>,
        wait_ms: Option<i32>,
        mapping_channel: Option<&str>,
    ) -> Result<Vec<ServiceMessage>, ClientError>;

    /// Best-effort queue depth; `Ok(None)` when the fabric cannot tell
    async fn queue_length(&self) -> Result<Option<i64>, ClientError>;

    async fn start(&self) -> Result<(), ClientError>;

    async fn stop(&self) -> Result<(), ClientError>;
}

/// Creates listener clients for the partitions of a channel
#[async_trait]
pub trait ClientFactory: Send + Sync + fmt::Debug {
    async fn create(
        &self,
        channel_id: &str,
        partition: &PriorityPartition,
    ) -> Result<Arc<dyn ListenerClient>, ClientError>;
}
