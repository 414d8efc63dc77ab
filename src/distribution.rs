//! Assigns scanned items to buckets (pallets and storage cells).
//!
//! Every operation is an optimistic transaction: read the bucket and item
//! documents, decide, then commit one atomic batch in which every write is
//! guarded by the version that was read. A concurrent writer makes the batch
//! fail as a whole with a conflict, and the operation is re-run from the read
//! step under the configured [`RetryPolicy`].

use chrono::Utc;
use futures::future::try_join_all;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::activity::entry_write;
use crate::model::{
    collections, ActivityAction, Bucket, BucketKind, DistributionResult, InventoryItem, ItemStatus,
};
use crate::remote::{DocRef, Document, Precondition, RemoteError, RemoteStore, Write};
use crate::retry::{retry_on_conflict, AsConflict, Exhausted, RetryPolicy};

/// Field of the bucket document holding its member codes.
pub(crate) const ITEMS_FIELD: &str = "items";

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("bucket {0} not found")]
    BucketNotFound(String),
    #[error("bucket {0} already exists")]
    BucketExists(String),
    #[error("item {item} is assigned to bucket {bucket}")]
    ItemAssignedElsewhere { item: String, bucket: String },
    #[error("operation needs {required} writes but one batch allows {limit}; split the codes")]
    BatchTooLarge { required: usize, limit: usize },
    #[error("gave up after {attempts} conflicting attempts; retry later")]
    RetryExhausted { attempts: u32 },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl DistributionError {
    /// Nothing was applied and the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            DistributionError::RetryExhausted { .. } => true,
            DistributionError::Remote(err) => err.is_transient() || err.is_conflict(),
            _ => false,
        }
    }
}

impl From<Exhausted> for DistributionError {
    fn from(e: Exhausted) -> Self {
        DistributionError::RetryExhausted {
            attempts: e.attempts,
        }
    }
}

impl AsConflict for DistributionError {
    fn as_conflict(&self) -> Option<RemoteError> {
        match self {
            DistributionError::Remote(err) if err.is_conflict() => Some(err.clone()),
            _ => None,
        }
    }
}

/// Operator input for [`DistributionEngine::create_bucket`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewBucket {
    /// Generated when absent.
    pub id: Option<String>,
    pub kind: BucketKind,
    pub display_number: i64,
    pub manufacturer_tag: Option<String>,
}

pub(crate) fn bucket_ref(id: &str) -> DocRef {
    DocRef::new(collections::BUCKETS, id)
}

pub(crate) fn item_ref(code: &str) -> DocRef {
    DocRef::new(collections::ITEMS, code)
}

/// Merge fields that move an item to `bucket_id`, or back to unassigned.
pub(crate) fn item_fields(code: &str, bucket_id: Option<&str>) -> Map<String, Value> {
    let status = if bucket_id.is_some() {
        ItemStatus::Assigned
    } else {
        ItemStatus::Unassigned
    };
    let mut fields = Map::new();
    fields.insert("id".into(), json!(code));
    fields.insert("status".into(), json!(status.as_str()));
    fields.insert("bucketId".into(), json!(bucket_id));
    fields.insert("updatedAt".into(), json!(Utc::now()));
    fields
}

pub(crate) fn code_values<'a>(codes: impl IntoIterator<Item = &'a String>) -> Vec<Value> {
    codes.into_iter().map(|c| Value::String(c.clone())).collect()
}

pub(crate) fn decode_item(doc: &Document) -> Result<InventoryItem, RemoteError> {
    doc.decode::<InventoryItem>(collections::ITEMS)
}

/// Fetch item documents for `codes`, one lookup per chunk of the store's
/// key limit. Chunks are requested concurrently and merged by id.
pub(crate) async fn lookup_items(
    remote: &dyn RemoteStore,
    codes: &[String],
) -> Result<HashMap<String, Document>, RemoteError> {
    let limit = remote.max_lookup_keys().max(1);
    let lookups = codes
        .chunks(limit)
        .map(|chunk| remote.lookup(collections::ITEMS, chunk));
    let found = try_join_all(lookups).await?;
    Ok(found
        .into_iter()
        .flatten()
        .map(|doc| (doc.id.clone(), doc))
        .collect())
}

/// Accepted codes (in submission order) and the duplicate count.
#[derive(Debug, Default, PartialEq)]
struct Plan {
    accepted: Vec<String>,
    duplicates: usize,
}

fn classify(codes: &[String], existing: &HashMap<String, Document>) -> Result<Plan, RemoteError> {
    let mut plan = Plan::default();
    let mut seen = HashSet::new();
    for code in codes {
        if !seen.insert(code.as_str()) {
            plan.duplicates += 1;
            continue;
        }
        let assigned = match existing.get(code) {
            Some(doc) => decode_item(doc)?.is_assigned(),
            None => false,
        };
        if assigned {
            plan.duplicates += 1;
        } else {
            plan.accepted.push(code.clone());
        }
    }
    Ok(plan)
}

pub struct DistributionEngine {
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) retry: RetryPolicy,
}

impl DistributionEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self { remote, retry }
    }

    pub async fn bucket(&self, bucket_id: &str) -> Result<Option<Bucket>, DistributionError> {
        match self.remote.get(&bucket_ref(bucket_id)).await? {
            Some(doc) => Ok(Some(doc.decode(collections::BUCKETS)?)),
            None => Ok(None),
        }
    }

    pub async fn item(&self, code: &str) -> Result<Option<InventoryItem>, DistributionError> {
        match self.remote.get(&item_ref(code)).await? {
            Some(doc) => Ok(Some(decode_item(&doc)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn read_bucket(
        &self,
        bucket_id: &str,
    ) -> Result<(Document, Bucket), DistributionError> {
        let doc = self
            .remote
            .get(&bucket_ref(bucket_id))
            .await?
            .ok_or_else(|| DistributionError::BucketNotFound(bucket_id.to_string()))?;
        let bucket = doc.decode::<Bucket>(collections::BUCKETS)?;
        Ok((doc, bucket))
    }

    #[instrument(skip_all, fields(kind = new.kind.as_str(), display_number = new.display_number))]
    pub async fn create_bucket(
        &self,
        new: NewBucket,
        actor: &str,
    ) -> Result<Bucket, DistributionError> {
        let bucket = Bucket {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: new.kind,
            display_number: new.display_number,
            manufacturer_tag: new.manufacturer_tag,
            items: BTreeSet::new(),
            created_by: actor.to_string(),
            created_at: Utc::now(),
        };
        let data = serde_json::to_value(&bucket).map_err(|err| RemoteError::Malformed {
            doc: bucket_ref(&bucket.id).to_string(),
            message: err.to_string(),
        })?;
        let (_, log) = entry_write(actor, ActivityAction::CreateBucket, Some(&bucket.id), 0, 0)?;
        let writes = vec![
            Write::set(bucket_ref(&bucket.id), data).when(Precondition::Missing),
            log,
        ];
        match self.remote.commit(writes).await {
            Ok(()) => {
                info!(bucket_id = %bucket.id, actor, "bucket created");
                Ok(bucket)
            }
            // A conflict only means "exists" if the bucket is really there.
            Err(err) if err.is_conflict() => match self.remote.get(&bucket_ref(&bucket.id)).await? {
                Some(_) => Err(DistributionError::BucketExists(bucket.id)),
                None => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Assign `codes` to `bucket_id`. Codes already assigned to any bucket,
    /// and repeats within `codes`, are counted as duplicates and left alone.
    #[instrument(skip_all, fields(bucket_id = %bucket_id, codes = codes.len()))]
    pub async fn distribute(
        &self,
        bucket_id: &str,
        codes: &[String],
        actor: &str,
    ) -> Result<DistributionResult, DistributionError> {
        if codes.is_empty() {
            return Ok(DistributionResult::default());
        }
        let mut seen = HashSet::new();
        let unique: Vec<String> = codes
            .iter()
            .filter(|c| seen.insert(c.as_str()))
            .cloned()
            .collect();
        let unique = &unique;

        let result = retry_on_conflict(&self.retry, "distribute", move |_| {
            self.try_distribute(bucket_id, codes, unique, actor)
        })
        .await?;
        info!(
            added = result.added_count,
            duplicates = result.duplicate_count,
            actor,
            "distribution applied"
        );
        Ok(result)
    }

    async fn try_distribute(
        &self,
        bucket_id: &str,
        codes: &[String],
        unique: &[String],
        actor: &str,
    ) -> Result<DistributionResult, DistributionError> {
        let ((bucket_doc, _), existing) = futures::try_join!(self.read_bucket(bucket_id), async {
            lookup_items(self.remote.as_ref(), unique)
                .await
                .map_err(DistributionError::from)
        })?;
        let plan = classify(codes, &existing)?;
        let result = DistributionResult {
            added_count: plan.accepted.len(),
            duplicate_count: plan.duplicates,
        };
        if plan.accepted.is_empty() {
            return Ok(result);
        }

        let required = plan.accepted.len() + 2;
        let limit = self.remote.max_batch_writes();
        if required > limit {
            return Err(DistributionError::BatchTooLarge { required, limit });
        }

        let mut writes = Vec::with_capacity(required);
        for code in &plan.accepted {
            writes.push(
                Write::merge(item_ref(code), item_fields(code, Some(bucket_id)))
                    .when(Precondition::matching(existing.get(code))),
            );
        }
        writes.push(
            Write::array_union(bucket_ref(bucket_id), ITEMS_FIELD, code_values(&plan.accepted))
                .when(Precondition::Version(bucket_doc.version)),
        );
        let (_, log) = entry_write(
            actor,
            ActivityAction::Distribute,
            Some(bucket_id),
            result.added_count,
            result.duplicate_count,
        )?;
        writes.push(log);

        self.remote.commit(writes).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, data: Value) -> Document {
        Document {
            id: id.into(),
            version: 1,
            data,
        }
    }

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classify_counts_assigned_and_repeated_codes_as_duplicates() {
        let mut existing = HashMap::new();
        existing.insert(
            "A".to_string(),
            doc("A", json!({ "id": "A", "status": "assigned", "bucketId": "P9" })),
        );
        existing.insert(
            "B".to_string(),
            doc("B", json!({ "id": "B", "status": "unassigned", "bucketId": null })),
        );

        let plan = classify(&codes(&["A", "B", "C", "C"]), &existing).unwrap();
        assert_eq!(plan.accepted, codes(&["B", "C"]));
        assert_eq!(plan.duplicates, 2);
    }

    #[test]
    fn item_fields_clear_bucket_when_unassigning() {
        let fields = item_fields("A", None);
        assert_eq!(fields["status"], "unassigned");
        assert!(fields["bucketId"].is_null());

        let fields = item_fields("A", Some("P1"));
        assert_eq!(fields["status"], "assigned");
        assert_eq!(fields["bucketId"], "P1");
    }

    #[test]
    fn retryable_errors_are_the_ones_with_no_effect() {
        assert!(DistributionError::RetryExhausted { attempts: 3 }.is_retryable());
        assert!(DistributionError::Remote(RemoteError::Unavailable("x".into())).is_retryable());
        assert!(!DistributionError::BucketNotFound("P1".into()).is_retryable());
    }
}
