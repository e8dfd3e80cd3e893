//! Data collector: the sink for scheduler log and exception events

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity attached to collector messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Info,
    Warning,
    Error,
}

/// Receives log and exception events. Calls are fire-and-forget.
pub trait DataCollector: Send + Sync + fmt::Debug {
    fn log_message(&self, level: LogLevel, message: &str);

    fn log_exception(&self, location: &str, error: &(dyn Error + 'static));
}

/// Collector that forwards everything to `tracing`
#[derive(Debug, Clone)]
pub struct TracingDataCollector {
    component: String,
}

impl TracingDataCollector {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl Default for TracingDataCollector {
    fn default() -> Self {
        Self::new("fabric-poller")
    }
}

impl DataCollector for TracingDataCollector {
    fn log_message(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(component = %self.component, "{}", message),
            LogLevel::Info => tracing::info!(component = %self.component, "{}", message),
            LogLevel::Warning => tracing::warn!(component = %self.component, "{}", message),
            LogLevel::Error => tracing::error!(component = %self.component, "{}", message),
        }
    }

    fn log_exception(&self, location: &str, error: &(dyn Error + 'static)) {
        tracing::error!(
            component = %self.component,
            location = %location,
            error = %error,
            "Exception recorded"
        );
    }
}
