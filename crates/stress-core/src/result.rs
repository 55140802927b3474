use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RequestError;
use crate::tracer::Phases;

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDetail {
    pub url: String,
    pub method: String,
    pub error: Option<RequestError>,
    /// Zero when no response was received.
    pub status: u16,
    pub content_length: u64,
    /// Step wall time minus both hook durations.
    pub duration: Duration,
    pub phases: Phases,
    pub before_hook: Duration,
    pub after_hook: Duration,
}

impl ResultDetail {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one full transaction iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// One entry per step, in step order.
    pub details: Vec<ResultDetail>,
    /// Iteration wall time, think-time excluded.
    pub duration: Duration,
}

impl TransactionResult {
    pub fn has_errors(&self) -> bool {
        self.details.iter().any(|d| d.error.is_some())
    }
}
