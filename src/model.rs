use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Remote collection names.
pub mod collections {
    pub const SESSIONS: &str = "sessions";
    pub const REPAIR_LOGS: &str = "repair_logs";
    pub const ITEMS: &str = "items";
    pub const BUCKETS: &str = "buckets";
    pub const ACTIVITY_LOG: &str = "activity_log";
}

/// Kind of record that can wait in the pending store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Session,
    RepairLog,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "session",
            RecordKind::RepairLog => "repair_log",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "session" => Some(RecordKind::Session),
            "repair_log" => Some(RecordKind::RepairLog),
            _ => None,
        }
    }

    /// Remote collection the record is written into.
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Session => collections::SESSIONS,
            RecordKind::RepairLog => collections::REPAIR_LOGS,
        }
    }
}

/// A record awaiting remote confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    pub local_id: i64,
    /// Idempotency key: the document id used for every remote write attempt.
    pub remote_id: String,
    pub kind: RecordKind,
    pub payload: Value,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Where a committed record ended up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Confirmed by the remote store.
    Remote,
    /// Buffered locally; the sync coordinator will deliver it.
    Queued,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanCategory {
    Vehicle,
    Battery,
    SparePart,
}

/// A finalized capture session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub codes: Vec<String>,
    pub category: ScanCategory,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepairLogEntry {
    pub item_code: String,
    pub technician: String,
    pub description: String,
    #[serde(default)]
    pub parts_used: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Unassigned,
    Assigned,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Unassigned => "unassigned",
            ItemStatus::Assigned => "assigned",
        }
    }
}

/// One physical unit, keyed by its scanned code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl InventoryItem {
    pub fn is_assigned(&self) -> bool {
        self.status == ItemStatus::Assigned
    }

    /// True when the item claims `bucket_id`.
    pub fn belongs_to(&self, bucket_id: &str) -> bool {
        self.is_assigned() && self.bucket_id.as_deref() == Some(bucket_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Pallet,
    Cell,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Pallet => "pallet",
            BucketKind::Cell => "cell",
        }
    }
}

/// A pallet or storage cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: String,
    pub kind: BucketKind,
    pub display_number: i64,
    #[serde(default)]
    pub manufacturer_tag: Option<String>,
    #[serde(default)]
    pub items: BTreeSet<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    CreateBucket,
    Distribute,
    RemoveItem,
    RestoreItem,
    DeleteBucket,
}

/// Append-only audit record of a distribution-affecting action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub id: String,
    pub actor: String,
    pub action: ActivityAction,
    #[serde(default)]
    pub bucket_id: Option<String>,
    pub item_count: u32,
    #[serde(default)]
    pub duplicate_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DistributionResult {
    pub added_count: usize,
    pub duplicate_count: usize,
}
