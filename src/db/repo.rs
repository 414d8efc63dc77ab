use super::model::QueueStats;
use super::StoreError;
use crate::model::{PendingRecord, RecordKind};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with FULL sync: a committed enqueue survives power loss.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert a pending record. Re-enqueueing a queued `remote_id` refreshes its
/// payload and returns the original `local_id`.
#[instrument(skip_all, fields(kind = kind.as_str(), remote_id = %remote_id))]
pub async fn enqueue_pending(
    pool: &Pool,
    kind: RecordKind,
    remote_id: &str,
    payload: &Value,
) -> Result<i64, StoreError> {
    let now = Utc::now();
    let payload = serde_json::to_string(payload)?;
    let local_id: i64 = sqlx::query_scalar(
        "INSERT INTO pending_records (remote_id, kind, payload, attempt, created_at, updated_at) \
         VALUES (?, ?, ?, 0, ?, ?) \
         ON CONFLICT(remote_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at \
         RETURNING local_id",
    )
    .bind(remote_id)
    .bind(kind.as_str())
    .bind(payload)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(local_id)
}

fn row_to_record(row: &SqliteRow) -> Result<PendingRecord, StoreError> {
    let local_id: i64 = row.try_get("local_id")?;
    let kind_str: String = row.try_get("kind")?;
    let kind = RecordKind::parse_kind(&kind_str).ok_or_else(|| StoreError::Corrupt {
        local_id,
        reason: format!("unknown kind {}", kind_str),
    })?;
    let payload_str: String = row.try_get("payload")?;
    let payload: Value = serde_json::from_str(&payload_str).map_err(|err| StoreError::Corrupt {
        local_id,
        reason: format!("payload is not JSON: {}", err),
    })?;
    Ok(PendingRecord {
        local_id,
        remote_id: row.try_get("remote_id")?,
        kind,
        payload,
        attempt: row.try_get("attempt")?,
        last_error: row.try_get::<Option<String>, _>("last_error")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[instrument(skip_all)]
pub async fn list_pending(pool: &Pool) -> Result<Vec<PendingRecord>, StoreError> {
    let rows = sqlx::query(
        "SELECT local_id, remote_id, kind, payload, attempt, last_error, created_at \
         FROM pending_records ORDER BY local_id ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_record).collect()
}

#[instrument(skip_all)]
pub async fn get_pending(pool: &Pool, local_id: i64) -> Result<Option<PendingRecord>, StoreError> {
    let row = sqlx::query(
        "SELECT local_id, remote_id, kind, payload, attempt, last_error, created_at \
         FROM pending_records WHERE local_id = ?",
    )
    .bind(local_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_record).transpose()
}

/// Delete a record; returns whether a row was removed.
#[instrument(skip_all)]
pub async fn delete_pending(pool: &Pool, local_id: i64) -> Result<bool, StoreError> {
    let res = sqlx::query("DELETE FROM pending_records WHERE local_id = ?")
        .bind(local_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn record_failure(pool: &Pool, local_id: i64, error: &str) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE pending_records SET attempt = attempt + 1, last_error = ?, updated_at = ? WHERE local_id = ?",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(local_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_records")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn queue_stats(pool: &Pool) -> Result<QueueStats, StoreError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS pending, COALESCE(MAX(attempt), 0) AS max_attempt, MIN(created_at) AS oldest \
         FROM pending_records",
    )
    .fetch_one(pool)
    .await?;
    Ok(QueueStats {
        pending: row.try_get("pending")?,
        max_attempt: row.try_get("max_attempt")?,
        oldest: row.try_get::<Option<DateTime<Utc>>, _>("oldest")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_enqueue_list_remove() {
        let pool = setup_pool().await;
        let a = enqueue_pending(&pool, RecordKind::Session, "r-a", &json!({ "codes": ["A"] }))
            .await
            .unwrap();
        let b = enqueue_pending(&pool, RecordKind::RepairLog, "r-b", &json!({ "itemCode": "B" }))
            .await
            .unwrap();
        assert!(b > a);

        let all = list_pending(&pool).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].remote_id, "r-a");
        assert_eq!(all[0].kind, RecordKind::Session);
        assert_eq!(all[1].kind, RecordKind::RepairLog);
        assert_eq!(all[1].payload["itemCode"], "B");

        assert!(delete_pending(&pool, a).await.unwrap());
        assert!(!delete_pending(&pool, a).await.unwrap());
        assert_eq!(count_pending(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_local_ids_are_never_reused() {
        let pool = setup_pool().await;
        let first = enqueue_pending(&pool, RecordKind::Session, "r-1", &json!({}))
            .await
            .unwrap();
        delete_pending(&pool, first).await.unwrap();
        let second = enqueue_pending(&pool, RecordKind::Session, "r-2", &json!({}))
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_reenqueue_same_remote_id_keeps_one_row() {
        let pool = setup_pool().await;
        let first = enqueue_pending(&pool, RecordKind::Session, "r-1", &json!({ "v": 1 }))
            .await
            .unwrap();
        let again = enqueue_pending(&pool, RecordKind::Session, "r-1", &json!({ "v": 2 }))
            .await
            .unwrap();
        assert_eq!(first, again);
        let all = list_pending(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload["v"], 2);
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let pool = setup_pool().await;
        let id = enqueue_pending(&pool, RecordKind::Session, "r-1", &json!({}))
            .await
            .unwrap();
        record_failure(&pool, id, "offline").await.unwrap();
        record_failure(&pool, id, "timeout").await.unwrap();

        let rec = get_pending(&pool, id).await.unwrap().unwrap();
        assert_eq!(rec.attempt, 2);
        assert_eq!(rec.last_error.as_deref(), Some("timeout"));

        let stats = queue_stats(&pool).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.max_attempt, 2);
        assert!(stats.oldest.is_some());
    }

    #[test]
    fn test_prepare_sqlite_url_passthrough() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        assert_eq!(
            prepare_sqlite_url("sqlite:relative.db?mode=rwc"),
            "sqlite://relative.db?mode=rwc"
        );
    }
}
