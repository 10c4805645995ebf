//! Leader Election (C7): singleton gate for C5/C6 across replicated
//! masters, built on PostgreSQL session-scoped advisory locks. No precedent
//! for this exists elsewhere in the codebase; this generalizes the raw-SQL
//! idiom already used in `foreman_db::pool` (`ensure_database_exists`,
//! `table_counts`) to `pg_try_advisory_lock`/`pg_advisory_unlock` instead of
//! system-catalog queries.
//!
//! Advisory locks are scoped to the *connection* that took them, so this
//! holds a single dedicated connection for the lifetime of the election
//! loop rather than borrowing from the shared pool.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::Connection;
use sqlx::PgConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Deterministic lock id for a named singleton service. Postgres advisory
/// locks key on a single 64-bit integer, so each named service maps to a
/// stable hash of its name.
pub fn lock_id_for(service_name: &str) -> i64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    service_name.hash(&mut hasher);
    hasher.finish() as i64
}

type StartFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
type StopFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub database_url: String,
    pub service_name: String,
    pub poll_interval: Duration,
}

/// Run the leader election loop for one named service until `cancel`
/// fires. On newly-acquired the lock, `start_fn` runs; on newly-lost (or
/// on a failed acquisition attempt after having led), `stop_fn` runs. On
/// shutdown, if currently leading, `stop_fn` runs before the lock is
/// released.
pub async fn run_leader_loop(config: LeaderConfig, start_fn: StartFn, stop_fn: StopFn, cancel: CancellationToken) {
    let lock_id = lock_id_for(&config.service_name);

    let mut conn = match PgConnection::connect(&config.database_url).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(service = %config.service_name, error = %e, "leader election failed to open dedicated connection");
            return;
        }
    };

    let mut is_leader = false;

    loop {
        if cancel.is_cancelled() {
            if is_leader {
                info!(service = %config.service_name, "releasing leadership on shutdown");
                stop_fn().await;
                let _ = release_lock(&mut conn, lock_id).await;
            }
            return;
        }

        match try_acquire(&mut conn, lock_id).await {
            Ok(true) => {
                if !is_leader {
                    info!(service = %config.service_name, "acquired leader lease");
                    is_leader = true;
                    start_fn().await;
                }
            }
            Ok(false) => {
                if is_leader {
                    warn!(service = %config.service_name, "lost leader lease");
                    stop_fn().await;
                }
                is_leader = false;
            }
            Err(e) => {
                error!(service = %config.service_name, error = %e, "leader election poll failed");
                if is_leader {
                    stop_fn().await;
                }
                is_leader = false;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = cancel.cancelled() => {
                continue;
            }
        }
    }
}

async fn try_acquire(conn: &mut PgConnection, lock_id: i64) -> anyhow::Result<bool> {
    let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .bind(lock_id)
        .fetch_one(conn)
        .await?;
    Ok(acquired)
}

async fn release_lock(conn: &mut PgConnection, lock_id: i64) -> anyhow::Result<()> {
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(lock_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Build a dedicated single-connection pool's URL-based connector used only
/// to validate `database_url` eagerly at startup (fail fast rather than in
/// the first poll iteration). Not part of the election loop itself.
pub async fn validate_database_url(database_url: &str) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new().max_connections(1).connect(database_url).await?;
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_id_is_stable_for_the_same_name() {
        assert_eq!(lock_id_for("queue-processor"), lock_id_for("queue-processor"));
    }

    #[test]
    fn lock_id_differs_across_service_names() {
        assert_ne!(lock_id_for("queue-processor"), lock_id_for("orphan-monitor"));
    }
}
