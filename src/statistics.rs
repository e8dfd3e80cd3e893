//! Operational snapshots of the scheduler state, serializable to JSON

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsStatistics {
    pub priority: i32,
    pub priority_weighting: Decimal,
    pub capacity_percentage: Decimal,
    pub poll_success_rate: Decimal,
    pub skip_count: u32,
    pub is_poll_past_due: bool,
    pub max_allowed_poll_wait_ms: i32,
    pub fabric_poll_wait_ms: Option<i32>,
    pub poll_attempted: u64,
    pub poll_achieved: u64,
    pub poll_attempted_batch: u64,
    pub poll_achieved_batch: u64,
    pub poll_count: u64,
    pub poll_success_count: u64,
    pub poll_exception_count: u64,
    pub priority_calculated: Option<i64>,
    pub priority_queue_length: Option<i64>,
    pub last_offered: Option<usize>,
    pub last_reserved: Option<usize>,
    pub last_actual: Option<usize>,
    pub last_actual_time: Option<DateTime<Utc>>,
    /// `Ratio: achieved/attempted Failed:N Hits:in/out`
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderStatistics {
    pub id: Uuid,
    pub client_id: Uuid,
    pub name: String,
    pub algorithm: String,
    pub is_active: bool,
    pub is_reserved: bool,
    pub reserved: Option<usize>,
    pub consecutive_exceptions: u32,
    pub last_exception: Option<String>,
    pub last_exception_time: Option<DateTime<Utc>>,
    /// Client recreation gave up; the holder stays idle
    pub reset_abandoned: bool,
    pub metrics: MetricsStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub cycles: u64,
    pub in_flight: usize,
    pub holders: Vec<HolderStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub channel_id: String,
    pub running: bool,
    pub client_resets: u64,
    pub collection: Option<CollectionStatistics>,
}

impl ServiceStatistics {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
