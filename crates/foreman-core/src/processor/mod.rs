//! Queue Processor (C5): the single cooperative worker that claims queued
//! builds, finds an eligible agent, and dispatches them. Runs only while
//! this master holds the queue-processor leader lease (§4.7).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::breaker::{Admission, CircuitBreaker};
use crate::queue::{BuildQueue, MarkFailedOutcome};
use crate::registry::AgentRegistry;
use crate::strategy::{Candidate, SchedulingStrategy};
use crate::transport::TransportPool;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub base_poll: Duration,
    pub max_idle: Duration,
    pub retry_backoff_base_ms: i64,
    pub retry_backoff_max_ms: i64,
    pub circuit_breaker_threshold: u32,
}

/// Shared handles the processor needs. Held behind `Arc` so the same
/// instances are shared with the orphan monitor and the admin server.
pub struct ProcessorDeps {
    pub queue: Arc<BuildQueue>,
    pub registry: Arc<AgentRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub transport: Arc<TransportPool>,
    pub strategy: Arc<dyn SchedulingStrategy>,
}

#[derive(serde::Serialize)]
struct DispatchRequest<'a> {
    build_id: &'a str,
    job_id: &'a str,
    payload: &'a serde_json::Value,
}

/// Run the processor loop until `cancel` fires. The current tick always
/// completes before the loop exits; no mid-transaction state is left
/// behind since every DB operation here is already atomic.
pub async fn run_processor(deps: Arc<ProcessorDeps>, config: ProcessorConfig, cancel: CancellationToken) {
    let mut consecutive_empty: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            info!("queue processor stopping");
            return;
        }

        match tick(&deps, &config).await {
            Tick::Dispatched => {
                consecutive_empty = 0;
            }
            Tick::NoAgent | Tick::Failed => {
                consecutive_empty = 0;
            }
            Tick::Empty => {
                consecutive_empty = consecutive_empty.saturating_add(1);
                let exponent = consecutive_empty.min(4);
                let idle = config.base_poll * 2u32.pow(exponent);
                let idle = idle.min(config.max_idle);
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = cancel.cancelled() => {
                        info!("queue processor stopping during idle sleep");
                        return;
                    }
                }
            }
        }
    }
}

/// Outcome of a single tick, public so callers (tests, admin "run once"
/// commands) can observe what happened without driving the whole loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Dispatched,
    NoAgent,
    Failed,
    Empty,
}

/// Run a single processor tick without entering the loop. Used by tests and
/// by an operator-triggered "process one item" admin command.
pub async fn run_once(deps: &ProcessorDeps, config: &ProcessorConfig) -> Tick {
    tick(deps, config).await
}

async fn tick(deps: &ProcessorDeps, config: &ProcessorConfig) -> Tick {
    let item = match deps.queue.dequeue_next().await {
        Ok(Some(item)) => item,
        Ok(None) => return Tick::Empty,
        Err(e) => {
            warn!(error = %e, "queue processor failed to claim next item");
            return Tick::Empty;
        }
    };

    let labels: Vec<String> = item.labels.clone();

    let agent = {
        let candidates = deps.registry.list(item.org_id.as_deref());
        let eligible: Vec<Candidate> = candidates
            .iter()
            .filter(|a| {
                a.status == foreman_db::AgentStatus::Online
                    && a.current_builds < a.max_builds
                    && labels.iter().all(|l| a.labels.iter().any(|al| al == l))
                    && deps.breaker.allow_request(a.id) != Admission::Denied
            })
            .map(|a| Candidate {
                id: a.id,
                current_builds: a.current_builds,
                max_builds: a.max_builds,
                system_info: a.system_info,
                region: a.region.clone(),
            })
            .collect();
        deps.strategy
            .select(&eligible, None)
            .and_then(|id| candidates.into_iter().find(|a| a.id == id))
    };

    let Some(agent) = agent else {
        let outcome = deps
            .queue
            .mark_failed(&item, "no eligible agent available", config.retry_backoff_base_ms, config.retry_backoff_max_ms)
            .await;
        log_mark_failed(&item.build_id, outcome);
        return Tick::NoAgent;
    };

    let request = DispatchRequest {
        build_id: &item.build_id,
        job_id: &item.job_id,
        payload: &item.payload,
    };

    match deps.transport.post(agent.id, &agent.url, "/builds", &request).await {
        Ok(_) => {
            deps.breaker.record_success(agent.id);
            deps.registry.increment_builds(agent.id).await;
            if let Err(e) = deps.queue.mark_dispatched(item.id, agent.id).await {
                warn!(error = %e, queue_id = %item.id, "failed to mark item dispatched after successful post");
                return Tick::Failed;
            }
            info!(build_id = %item.build_id, agent_id = %agent.id, "build dispatched");
            Tick::Dispatched
        }
        Err(e) => {
            deps.breaker.record_failure(agent.id);
            let outcome = deps
                .queue
                .mark_failed(&item, &e.to_string(), config.retry_backoff_base_ms, config.retry_backoff_max_ms)
                .await;
            log_mark_failed(&item.build_id, outcome);
            Tick::Failed
        }
    }
}

fn log_mark_failed(build_id: &str, outcome: anyhow::Result<MarkFailedOutcome>) {
    match outcome {
        Ok(MarkFailedOutcome::Requeued) => {
            info!(build_id, "build requeued after dispatch failure");
        }
        Ok(MarkFailedOutcome::DeadLettered) => {
            warn!(build_id, "build exhausted retries, moved to dead letter");
        }
        Ok(MarkFailedOutcome::NotFound) => {
            warn!(build_id, "mark_failed found no matching queue item");
        }
        Err(e) => {
            warn!(build_id, error = %e, "failed to record dispatch failure");
        }
    }
}
