//! Database query functions for the `build_queue` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{QueueItem, QueueStatus};

/// How many oldest pending candidates `dequeue_next` considers before giving
/// up. A small window keeps the guarded-update retry loop bounded even when
/// several processors race for the same rows.
const CLAIM_CANDIDATE_WINDOW: i64 = 8;

/// Insert a new pending queue item.
pub async fn enqueue(
    pool: &PgPool,
    build_id: &str,
    job_id: &str,
    payload: serde_json::Value,
    org_id: Option<&str>,
    labels: &[String],
    max_retries: i32,
) -> Result<QueueItem> {
    let item = sqlx::query_as::<_, QueueItem>(
        "INSERT INTO build_queue (build_id, job_id, payload, org_id, labels, status, \
                                   retry_count, max_retries) \
         VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6) \
         RETURNING *",
    )
    .bind(build_id)
    .bind(job_id)
    .bind(payload)
    .bind(org_id)
    .bind(labels)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .context("failed to enqueue build")?;

    Ok(item)
}

/// Atomically claim the oldest eligible pending item.
///
/// Selects up to [`CLAIM_CANDIDATE_WINDOW`] oldest pending candidates whose
/// `next_retry_at` has elapsed, then attempts a guarded
/// `UPDATE ... WHERE id = ? AND status = 'pending'` against each in order,
/// stopping at the first one whose `rows_affected() == 1`. Under replicated
/// processors racing on the same window, at most one guarded update per row
/// can ever succeed, so two concurrent callers never return the same item.
pub async fn dequeue_next(pool: &PgPool) -> Result<Option<QueueItem>> {
    let candidates: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM build_queue \
         WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= NOW()) \
         ORDER BY enqueued_at ASC \
         LIMIT $1",
    )
    .bind(CLAIM_CANDIDATE_WINDOW)
    .fetch_all(pool)
    .await
    .context("failed to list pending queue candidates")?;

    for (id,) in candidates {
        let claimed = sqlx::query_as::<_, QueueItem>(
            "UPDATE build_queue SET status = 'dispatching' \
             WHERE id = $1 AND status = 'pending' \
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to claim queue item")?;

        if let Some(item) = claimed {
            return Ok(Some(item));
        }
        // Guard failed: another processor claimed this row first. Try the
        // next candidate instead of giving up.
    }

    Ok(None)
}

/// Mark a claimed item as dispatched to a specific agent.
pub async fn mark_dispatched(pool: &PgPool, queue_id: Uuid, agent_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE build_queue \
         SET status = 'dispatched', dispatched_at = NOW(), agent_id = $2 \
         WHERE id = $1",
    )
    .bind(queue_id)
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to mark queue item dispatched")?;

    Ok(result.rows_affected())
}

/// Mark a queue item completed by its internal id.
pub async fn mark_completed(pool: &PgPool, queue_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE build_queue SET status = 'completed', completed_at = NOW() WHERE id = $1",
    )
    .bind(queue_id)
    .execute(pool)
    .await
    .context("failed to mark queue item completed")?;

    Ok(result.rows_affected())
}

/// Mark a queue item completed by the build id an agent reported back.
pub async fn mark_completed_by_build_id(pool: &PgPool, build_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE build_queue SET status = 'completed', completed_at = NOW() \
         WHERE build_id = $1 AND status = 'dispatched'",
    )
    .bind(build_id)
    .execute(pool)
    .await
    .context("failed to mark queue item completed by build id")?;

    Ok(result.rows_affected())
}

/// Outcome of a `mark_failed` call, so the caller (the queue processor) can
/// log and report a metric without re-deriving it from the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkFailedOutcome {
    /// Retry budget remains; the item returned to `pending` with backoff.
    Requeued,
    /// Retry budget exhausted; the item moved to `dead_letter`.
    DeadLettered,
    /// The item no longer existed (already completed, or removed).
    NotFound,
}

/// Record a dispatch failure. Increments `retry_count`; if the new count is
/// still under `max_retries` the item returns to `pending` with
/// `next_retry_at = now + backoff_ms * 2^retry_count + jitter` (jitter in
/// `[0, 10%]` of the delay, computed by the caller and passed in as
/// `backoff_ms` already reflecting the full delay for this attempt).
/// Otherwise the item moves to `dead_letter`.
pub async fn mark_failed(
    pool: &PgPool,
    queue_id: Uuid,
    error: &str,
    backoff_ms: i64,
) -> Result<MarkFailedOutcome> {
    let row: Option<(i32, i32)> = sqlx::query_as(
        "SELECT retry_count, max_retries FROM build_queue WHERE id = $1 FOR UPDATE",
    )
    .bind(queue_id)
    .fetch_optional(pool)
    .await
    .context("failed to read queue item for failure accounting")?;

    let Some((retry_count, max_retries)) = row else {
        return Ok(MarkFailedOutcome::NotFound);
    };

    let new_retry_count = retry_count + 1;
    if new_retry_count <= max_retries {
        let next_retry_at = Utc::now() + chrono::Duration::milliseconds(backoff_ms);
        sqlx::query(
            "UPDATE build_queue \
             SET status = 'pending', \
                 retry_count = $2, \
                 next_retry_at = $3, \
                 agent_id = NULL, \
                 error = $4 \
             WHERE id = $1",
        )
        .bind(queue_id)
        .bind(new_retry_count)
        .bind(next_retry_at)
        .bind(error)
        .execute(pool)
        .await
        .context("failed to requeue failed item")?;

        Ok(MarkFailedOutcome::Requeued)
    } else {
        sqlx::query(
            "UPDATE build_queue \
             SET status = 'dead_letter', \
                 retry_count = $2, \
                 completed_at = NOW(), \
                 error = $3 \
             WHERE id = $1",
        )
        .bind(queue_id)
        .bind(new_retry_count)
        .bind(error)
        .execute(pool)
        .await
        .context("failed to dead-letter exhausted item")?;

        Ok(MarkFailedOutcome::DeadLettered)
    }
}

/// For every item dispatched to `agent_id`, either return it to `pending`
/// with an incremented retry count (recorded as `error`) or move it to
/// `dead_letter` when the retry budget is exhausted. Returns the number of
/// items moved to `pending` and the number moved to `dead_letter`.
///
/// The `WHERE status = 'dispatched'` guard means a concurrent completion
/// report from the agent (which also requires `status = 'dispatched'`) can
/// never race with this: whichever update commits first wins, and the loser
/// affects zero rows.
pub async fn requeue_for_agent(
    pool: &PgPool,
    agent_id: Uuid,
    error: &str,
) -> Result<(u64, u64)> {
    let requeued = sqlx::query(
        "UPDATE build_queue \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             agent_id = NULL, \
             error = $2 \
         WHERE agent_id = $1 AND status = 'dispatched' AND retry_count + 1 <= max_retries",
    )
    .bind(agent_id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to requeue dispatched items for agent")?;

    let dead_lettered = sqlx::query(
        "UPDATE build_queue \
         SET status = 'dead_letter', \
             retry_count = retry_count + 1, \
             completed_at = NOW(), \
             error = $2 \
         WHERE agent_id = $1 AND status = 'dispatched' AND retry_count + 1 > max_retries",
    )
    .bind(agent_id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to dead-letter exhausted items for agent")?;

    Ok((requeued.rows_affected(), dead_lettered.rows_affected()))
}

/// Number of items currently pending dispatch.
pub async fn depth_pending(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM build_queue WHERE status = 'pending'")
        .fetch_one(pool)
        .await
        .context("failed to count pending queue depth")?;

    Ok(row.0)
}

/// Age in milliseconds of the oldest pending item, if any.
pub async fn oldest_pending_age_ms(pool: &PgPool) -> Result<Option<i64>> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT enqueued_at FROM build_queue \
         WHERE status = 'pending' \
         ORDER BY enqueued_at ASC \
         LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("failed to find oldest pending queue item")?;

    Ok(row.map(|(enqueued_at,)| (Utc::now() - enqueued_at).num_milliseconds()))
}

/// Look up a queue item by its external build id.
pub async fn by_build_id(pool: &PgPool, build_id: &str) -> Result<Option<QueueItem>> {
    let item = sqlx::query_as::<_, QueueItem>("SELECT * FROM build_queue WHERE build_id = $1")
        .bind(build_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch queue item by build id")?;

    Ok(item)
}

/// List the most recent dead-lettered items, newest first.
pub async fn dead_letter(pool: &PgPool, limit: i64) -> Result<Vec<QueueItem>> {
    let items = sqlx::query_as::<_, QueueItem>(
        "SELECT * FROM build_queue \
         WHERE status = 'dead_letter' \
         ORDER BY completed_at DESC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list dead-lettered queue items")?;

    Ok(items)
}

/// Delete completed and dead-lettered rows older than `hours`.
pub async fn cleanup_completed(pool: &PgPool, hours: i64) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::hours(hours);
    let result = sqlx::query(
        "DELETE FROM build_queue \
         WHERE status IN ('completed', 'dead_letter') AND completed_at <= $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to clean up completed queue items")?;

    Ok(result.rows_affected())
}

/// Reclaim rows stuck in `dispatching` older than `max_age`, returning them
/// to `pending` so a crashed in-master claim does not strand the item
/// forever. Intended to run once at process startup (see design notes on
/// the unspecified sweep policy).
pub async fn sweep_stuck_dispatching(pool: &PgPool, max_age: chrono::Duration) -> Result<u64> {
    let cutoff = Utc::now() - max_age;
    let result = sqlx::query(
        "UPDATE build_queue \
         SET status = 'pending' \
         WHERE status = 'dispatching' AND enqueued_at <= $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to sweep stuck dispatching queue items")?;

    Ok(result.rows_affected())
}
