//! Undo paths for distribution: take an item out of a bucket, put it back,
//! or delete a bucket and release its members.

use tracing::{info, instrument};

use crate::activity::entry_write;
use crate::distribution::{
    bucket_ref, code_values, decode_item, item_fields, item_ref, lookup_items, DistributionEngine,
    DistributionError, ITEMS_FIELD,
};
use crate::model::{collections, ActivityAction, Bucket, InventoryItem};
use crate::remote::{Document, Precondition, Write};
use crate::retry::retry_on_conflict;

/// Progress of one delete-bucket batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteStep {
    /// Some members were released; the bucket still exists.
    Partial(usize),
    /// Members released and bucket removed in the same batch.
    Done(usize),
    Missing,
}

impl DistributionEngine {
    async fn read_item(
        &self,
        code: &str,
    ) -> Result<(Option<Document>, Option<InventoryItem>), DistributionError> {
        let doc = self.remote.get(&item_ref(code)).await?;
        let item = doc.as_ref().map(decode_item).transpose()?;
        Ok((doc, item))
    }

    /// Remove `code` from the bucket and release the item. Returns whether
    /// anything changed. An item claimed by a different bucket keeps its claim.
    #[instrument(skip_all, fields(bucket_id = %bucket_id, code = %code))]
    pub async fn remove_item(
        &self,
        bucket_id: &str,
        code: &str,
        actor: &str,
    ) -> Result<bool, DistributionError> {
        retry_on_conflict(&self.retry, "remove_item", move |_| {
            self.try_remove_item(bucket_id, code, actor)
        })
        .await
    }

    async fn try_remove_item(
        &self,
        bucket_id: &str,
        code: &str,
        actor: &str,
    ) -> Result<bool, DistributionError> {
        let (bucket_doc, bucket) = self.read_bucket(bucket_id).await?;
        let (item_doc, item) = self.read_item(code).await?;

        let listed = bucket.items.contains(code);
        let release = item.as_ref().map_or(false, |i| {
            i.is_assigned() && i.bucket_id.as_deref().map_or(true, |b| b == bucket_id)
        });
        if !listed && !release {
            return Ok(false);
        }

        let mut writes = vec![Write::array_remove(
            bucket_ref(bucket_id),
            ITEMS_FIELD,
            code_values([&code.to_string()]),
        )
        .when(Precondition::Version(bucket_doc.version))];
        if release {
            writes.push(
                Write::merge(item_ref(code), item_fields(code, None))
                    .when(Precondition::matching(item_doc.as_ref())),
            );
        }
        let (_, log) = entry_write(actor, ActivityAction::RemoveItem, Some(bucket_id), 1, 0)?;
        writes.push(log);

        self.remote.commit(writes).await?;
        info!(actor, "item removed from bucket");
        Ok(true)
    }

    /// Put `code` back into the bucket. Refused when another bucket holds it.
    #[instrument(skip_all, fields(bucket_id = %bucket_id, code = %code))]
    pub async fn restore_item(
        &self,
        bucket_id: &str,
        code: &str,
        actor: &str,
    ) -> Result<bool, DistributionError> {
        retry_on_conflict(&self.retry, "restore_item", move |_| {
            self.try_restore_item(bucket_id, code, actor)
        })
        .await
    }

    async fn try_restore_item(
        &self,
        bucket_id: &str,
        code: &str,
        actor: &str,
    ) -> Result<bool, DistributionError> {
        let (bucket_doc, bucket) = self.read_bucket(bucket_id).await?;
        let (item_doc, item) = self.read_item(code).await?;

        if let Some(other) = item
            .as_ref()
            .filter(|i| i.is_assigned())
            .and_then(|i| i.bucket_id.as_deref())
            .filter(|b| *b != bucket_id)
        {
            return Err(DistributionError::ItemAssignedElsewhere {
                item: code.to_string(),
                bucket: other.to_string(),
            });
        }
        let claimed = item.as_ref().map_or(false, |i| i.belongs_to(bucket_id));
        if claimed && bucket.items.contains(code) {
            return Ok(false);
        }

        let (_, log) = entry_write(actor, ActivityAction::RestoreItem, Some(bucket_id), 1, 0)?;
        let writes = vec![
            Write::merge(item_ref(code), item_fields(code, Some(bucket_id)))
                .when(Precondition::matching(item_doc.as_ref())),
            Write::array_union(
                bucket_ref(bucket_id),
                ITEMS_FIELD,
                code_values([&code.to_string()]),
            )
            .when(Precondition::Version(bucket_doc.version)),
            log,
        ];
        self.remote.commit(writes).await?;
        info!(actor, "item restored to bucket");
        Ok(true)
    }

    /// Release every member and delete the bucket. Returns how many items were
    /// reset to unassigned.
    ///
    /// Members are released before (or in the same batch as) the bucket
    /// document's removal, so no item is left pointing at a missing bucket.
    /// Buckets too large for one batch are emptied in steps; each step also
    /// drops the released codes from the bucket's list.
    #[instrument(skip_all, fields(bucket_id = %bucket_id))]
    pub async fn delete_bucket(
        &self,
        bucket_id: &str,
        actor: &str,
    ) -> Result<usize, DistributionError> {
        let mut released = 0;
        let mut first = true;
        loop {
            let step = retry_on_conflict(&self.retry, "delete_bucket", move |_| {
                self.delete_bucket_step(bucket_id, actor, released)
            })
            .await?;
            match step {
                DeleteStep::Missing if first => {
                    return Err(DistributionError::BucketNotFound(bucket_id.to_string()))
                }
                DeleteStep::Missing => return Ok(released),
                DeleteStep::Partial(n) => released += n,
                DeleteStep::Done(n) => {
                    released += n;
                    info!(actor, released, "bucket deleted");
                    return Ok(released);
                }
            }
            first = false;
        }
    }

    /// `released` is what earlier steps already reset; the final step's
    /// activity entry counts those plus the members it still sees.
    async fn delete_bucket_step(
        &self,
        bucket_id: &str,
        actor: &str,
        released: usize,
    ) -> Result<DeleteStep, DistributionError> {
        let Some(bucket_doc) = self.remote.get(&bucket_ref(bucket_id)).await? else {
            return Ok(DeleteStep::Missing);
        };
        let bucket: Bucket = bucket_doc.decode(collections::BUCKETS)?;
        let members: Vec<String> = bucket.items.iter().cloned().collect();
        let existing = lookup_items(self.remote.as_ref(), &members).await?;

        let mut claimed = Vec::new();
        for code in &members {
            if let Some(doc) = existing.get(code) {
                if decode_item(doc)?.belongs_to(bucket_id) {
                    claimed.push(doc);
                }
            }
        }

        let resets = |docs: &[&Document]| -> Vec<Write> {
            docs.iter()
                .map(|d| {
                    Write::merge(item_ref(&d.id), item_fields(&d.id, None))
                        .when(Precondition::Version(d.version))
                })
                .collect()
        };

        // Room left for the bucket write and the activity entry.
        let capacity = self.remote.max_batch_writes().saturating_sub(2).max(1);
        if claimed.len() <= capacity {
            let (_, log) = entry_write(
                actor,
                ActivityAction::DeleteBucket,
                Some(bucket_id),
                released + members.len(),
                0,
            )?;
            let mut writes = resets(&claimed[..]);
            writes.push(
                Write::delete(bucket_ref(bucket_id))
                    .when(Precondition::Version(bucket_doc.version)),
            );
            writes.push(log);
            self.remote.commit(writes).await?;
            return Ok(DeleteStep::Done(claimed.len()));
        }

        let chunk = &claimed[..capacity];
        let mut writes = resets(chunk);
        writes.push(
            Write::array_remove(
                bucket_ref(bucket_id),
                ITEMS_FIELD,
                chunk.iter().map(|d| serde_json::Value::String(d.id.clone())).collect(),
            )
            .when(Precondition::Version(bucket_doc.version)),
        );
        self.remote.commit(writes).await?;
        Ok(DeleteStep::Partial(chunk.len()))
    }
}
