//! Build Queue (C3): thin business-logic wrapper around
//! [`foreman_db::queries::queue`] that owns the backoff/jitter math the
//! persistence layer deliberately stays ignorant of.

use foreman_db::queries::queue;
use rand::Rng;
use uuid::Uuid;

pub use foreman_db::queries::queue::MarkFailedOutcome;
pub use foreman_db::{QueueItem, QueueStatus};

/// Compute the backoff delay for a failed attempt, in milliseconds.
///
/// `base_ms · 2^retry_count`, plus jitter drawn uniformly from
/// `[0, 10% of delay]`, capped at `max_ms`. `retry_count` is the count
/// *before* this failure is recorded (so the first failure uses
/// `retry_count = 0`).
pub fn backoff_with_jitter(base_ms: i64, retry_count: i32, max_ms: i64) -> i64 {
    let exponent = retry_count.clamp(0, 32) as u32;
    let delay = base_ms.saturating_mul(1i64 << exponent.min(32));
    let delay = delay.min(max_ms).max(0);
    let jitter_ceiling = (delay as f64 * 0.10) as i64;
    let jitter = if jitter_ceiling > 0 {
        rand::rng().random_range(0..=jitter_ceiling)
    } else {
        0
    };
    (delay + jitter).min(max_ms)
}

pub struct BuildQueue {
    pool: sqlx::PgPool,
}

impl BuildQueue {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        build_id: &str,
        job_id: &str,
        payload: serde_json::Value,
        org_id: Option<&str>,
        labels: &[String],
        max_retries: i32,
    ) -> anyhow::Result<QueueItem> {
        if build_id.trim().is_empty() || job_id.trim().is_empty() {
            anyhow::bail!("build_id and job_id must not be empty");
        }
        queue::enqueue(&self.pool, build_id, job_id, payload, org_id, labels, max_retries).await
    }

    pub async fn dequeue_next(&self) -> anyhow::Result<Option<QueueItem>> {
        queue::dequeue_next(&self.pool).await
    }

    pub async fn mark_dispatched(&self, queue_id: Uuid, agent_id: Uuid) -> anyhow::Result<u64> {
        queue::mark_dispatched(&self.pool, queue_id, agent_id).await
    }

    pub async fn mark_completed(&self, queue_id: Uuid) -> anyhow::Result<u64> {
        queue::mark_completed(&self.pool, queue_id).await
    }

    pub async fn mark_completed_by_build_id(&self, build_id: &str) -> anyhow::Result<u64> {
        queue::mark_completed_by_build_id(&self.pool, build_id).await
    }

    /// Record a failure, computing backoff from `retry_count` internally so
    /// callers never hand-roll the jitter math.
    pub async fn mark_failed(
        &self,
        item: &QueueItem,
        error: &str,
        base_backoff_ms: i64,
        max_backoff_ms: i64,
    ) -> anyhow::Result<MarkFailedOutcome> {
        let backoff_ms = backoff_with_jitter(base_backoff_ms, item.retry_count, max_backoff_ms);
        queue::mark_failed(&self.pool, item.id, error, backoff_ms).await
    }

    pub async fn requeue_for_agent(&self, agent_id: Uuid, error: &str) -> anyhow::Result<(u64, u64)> {
        queue::requeue_for_agent(&self.pool, agent_id, error).await
    }

    pub async fn depth_pending(&self) -> anyhow::Result<i64> {
        queue::depth_pending(&self.pool).await
    }

    pub async fn oldest_pending_age_ms(&self) -> anyhow::Result<Option<i64>> {
        queue::oldest_pending_age_ms(&self.pool).await
    }

    pub async fn by_build_id(&self, build_id: &str) -> anyhow::Result<Option<QueueItem>> {
        queue::by_build_id(&self.pool, build_id).await
    }

    pub async fn dead_letter(&self, limit: i64) -> anyhow::Result<Vec<QueueItem>> {
        queue::dead_letter(&self.pool, limit).await
    }

    pub async fn cleanup_completed(&self, hours: i64) -> anyhow::Result<u64> {
        queue::cleanup_completed(&self.pool, hours).await
    }

    /// Run once at startup to reclaim rows stranded in `dispatching` by a
    /// crashed master (§9 open question: resolved here as "sweep everything
    /// older than `max_age` once, at process start").
    pub async fn sweep_stuck_dispatching(&self, max_age: chrono::Duration) -> anyhow::Result<u64> {
        queue::sweep_stuck_dispatching(&self.pool, max_age).await
    }
}
