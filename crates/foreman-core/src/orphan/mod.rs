//! Orphan Monitor (C6): periodic sweep that reclaims builds stranded on
//! agents that stopped heartbeating, and prunes breaker state for agents
//! that no longer exist. Runs only while this master holds the
//! orphan-monitor leader lease (§4.7).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::queue::BuildQueue;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, Copy)]
pub struct OrphanMonitorConfig {
    pub interval: Duration,
}

pub struct OrphanMonitorDeps {
    pub queue: Arc<BuildQueue>,
    pub registry: Arc<AgentRegistry>,
    pub breaker: Arc<CircuitBreaker>,
}

/// Run the orphan monitor loop until `cancel` fires.
///
/// Each sweep runs in a fixed order (§4.6): health check completes before
/// requeue runs, so an agent cannot be requeued-from while still
/// considered online.
pub async fn run_orphan_monitor(deps: Arc<OrphanMonitorDeps>, config: OrphanMonitorConfig, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            info!("orphan monitor stopping");
            return;
        }

        sweep_once(&deps).await;

        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = cancel.cancelled() => {
                info!("orphan monitor stopping during interval sleep");
                return;
            }
        }
    }
}

/// Run a single sweep without entering the loop. Used by tests and by an
/// operator-triggered "reconcile now" admin command.
pub async fn sweep_once(deps: &OrphanMonitorDeps) {
    sweep(deps).await
}

async fn sweep(deps: &OrphanMonitorDeps) {
    let newly_offline = deps.registry.check_health().await;
    if newly_offline > 0 {
        warn!(count = newly_offline, "agents marked offline by orphan monitor");
    }

    let offline_agents = deps.registry.list_by_status(foreman_db::AgentStatus::Offline);
    let mut total_requeued = 0u64;
    let mut total_dead_lettered = 0u64;

    for agent in offline_agents {
        match deps.queue.requeue_for_agent(agent.id, "agent went offline").await {
            Ok((requeued, dead_lettered)) => {
                total_requeued += requeued;
                total_dead_lettered += dead_lettered;
            }
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "failed to requeue items for offline agent");
            }
        }
    }

    if total_requeued > 0 || total_dead_lettered > 0 {
        info!(
            requeued = total_requeued,
            dead_lettered = total_dead_lettered,
            "orphan monitor reclaimed builds from offline agents"
        );
    }

    let live_ids = deps.registry.ids();
    deps.breaker.cleanup(&live_ids);
}
