//! View models returned by the pending-record repository.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

/// Summary of the pending queue, used for operator reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    /// Highest failed-attempt count among queued records.
    pub max_attempt: i32,
    pub oldest: Option<DateTime<Utc>>,
}
