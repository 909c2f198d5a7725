//! Per-request context threaded through resolve, load, dispatch and persist.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use unidrive_common::DrivePath;

/// Identity and deadline of one dispatched request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub source: DrivePath,
    pub target: Option<DrivePath>,
    pub started_at: DateTime<Utc>,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(source: DrivePath, target: Option<DrivePath>, timeout: Option<Duration>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            source,
            target,
            started_at: Utc::now(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Time left before the deadline; `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> String {
        self.request_id.simple().to_string()[..8].to_string()
    }
}
