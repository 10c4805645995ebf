//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Agent, AgentStatus, SystemInfo};

/// Insert a new agent row. The id is always server-generated.
#[allow(clippy::too_many_arguments)]
pub async fn insert_agent(
    pool: &PgPool,
    name: &str,
    url: &str,
    labels: &[String],
    max_builds: i32,
    system_info: Option<SystemInfo>,
    region: Option<&str>,
    org_id: Option<&str>,
) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (name, url, labels, max_builds, current_builds, status, \
                              system_info, region, org_id) \
         VALUES ($1, $2, $3, $4, 0, 'online', $5, $6, $7) \
         RETURNING *",
    )
    .bind(name)
    .bind(url)
    .bind(labels)
    .bind(max_builds)
    .bind(system_info.map(Json))
    .bind(region)
    .bind(org_id)
    .fetch_one(pool)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Fetch a single agent by id.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Record a heartbeat: bump `last_heartbeat`, flip status back to `online`,
/// and optionally refresh `current_builds` / `system_info`. Returns true iff
/// the agent exists.
pub async fn heartbeat(
    pool: &PgPool,
    id: Uuid,
    current_builds: Option<i32>,
    system_info: Option<SystemInfo>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE agents \
         SET last_heartbeat = NOW(), \
             status = 'online', \
             current_builds = COALESCE($2, current_builds), \
             system_info = COALESCE($3, system_info) \
         WHERE id = $1",
    )
    .bind(id)
    .bind(current_builds)
    .bind(system_info.map(Json))
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected() > 0)
}

/// Remove an agent entirely.
pub async fn deregister_agent(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM agents WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to deregister agent")?;

    Ok(result.rows_affected() > 0)
}

/// Mark an agent as draining. Returns true iff the agent exists.
pub async fn set_draining(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("UPDATE agents SET status = 'draining' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set agent draining")?;

    Ok(result.rows_affected() > 0)
}

/// Candidate agent for dispatch, ranked by the caller's scheduling strategy.
///
/// This is the full row plus nothing extra: ranking happens in
/// `foreman-core` once candidates are loaded, since the scoring formula
/// (§4.1) depends on resource-aware feature flags the persistence layer
/// has no business knowing about.
pub async fn find_candidates(
    pool: &PgPool,
    labels: &[String],
    org_id: Option<&str>,
    heartbeat_timeout: chrono::Duration,
) -> Result<Vec<Agent>> {
    let cutoff = Utc::now() - heartbeat_timeout;
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE status = 'online' \
           AND current_builds < max_builds \
           AND last_heartbeat > $1 \
           AND labels @> $2 \
           AND (org_id IS NULL OR org_id = $3)",
    )
    .bind(cutoff)
    .bind(labels)
    .bind(org_id)
    .fetch_all(pool)
    .await
    .context("failed to find candidate agents")?;

    Ok(agents)
}

/// Increment `current_builds`, clamped at `max_builds`. Returns the new value.
pub async fn increment_builds(pool: &PgPool, id: Uuid) -> Result<Option<i32>> {
    let row: Option<(i32,)> = sqlx::query_as(
        "UPDATE agents \
         SET current_builds = LEAST(current_builds + 1, max_builds) \
         WHERE id = $1 \
         RETURNING current_builds",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to increment agent build count")?;

    Ok(row.map(|(n,)| n))
}

/// Decrement `current_builds`, clamped at 0. Returns the new value.
pub async fn decrement_builds(pool: &PgPool, id: Uuid) -> Result<Option<i32>> {
    let row: Option<(i32,)> = sqlx::query_as(
        "UPDATE agents \
         SET current_builds = GREATEST(current_builds - 1, 0) \
         WHERE id = $1 \
         RETURNING current_builds",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to decrement agent build count")?;

    Ok(row.map(|(n,)| n))
}

/// Transition every agent whose heartbeat has expired to `offline`.
/// Returns the number of agents newly marked offline.
pub async fn check_health(pool: &PgPool, heartbeat_timeout: chrono::Duration) -> Result<u64> {
    let cutoff = Utc::now() - heartbeat_timeout;
    let result = sqlx::query(
        "UPDATE agents \
         SET status = 'offline' \
         WHERE status != 'offline' AND last_heartbeat <= $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to run agent health check")?;

    Ok(result.rows_affected())
}

/// List agents, optionally scoped to a single org (shared agents always included).
pub async fn list_agents(pool: &PgPool, org_id: Option<&str>) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE org_id IS NULL OR $1 IS NULL OR org_id = $1 \
         ORDER BY registered_at ASC",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
    .context("failed to list agents")?;

    Ok(agents)
}

/// Status counts for observability / admin summary views.
#[derive(Debug, Clone, Default)]
pub struct AgentSummary {
    pub online: i64,
    pub draining: i64,
    pub offline: i64,
    pub total: i64,
}

/// Summarize agent counts by status, optionally scoped to a single org.
pub async fn summary(pool: &PgPool, org_id: Option<&str>) -> Result<AgentSummary> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM agents \
         WHERE org_id IS NULL OR $1 IS NULL OR org_id = $1 \
         GROUP BY status",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
    .context("failed to summarize agents")?;

    let mut summary = AgentSummary::default();
    for (status, count) in &rows {
        match status.as_str() {
            "online" => summary.online = *count,
            "draining" => summary.draining = *count,
            "offline" => summary.offline = *count,
            _ => {}
        }
        summary.total += count;
    }
    Ok(summary)
}

/// Return the ids of every currently-registered agent, used by the breaker's
/// `cleanup` operation (§4.2) to prune entries for vanished agents.
pub async fn list_agent_ids(pool: &PgPool) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM agents")
        .fetch_all(pool)
        .await
        .context("failed to list agent ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// List agents with a status other than `online`, used by the orphan
/// monitor to find offline agents whose dispatched work must be requeued.
pub async fn list_by_status(pool: &PgPool, status: AgentStatus) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE status = $1")
        .bind(status)
        .fetch_all(pool)
        .await
        .context("failed to list agents by status")?;

    Ok(agents)
}
