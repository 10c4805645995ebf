//! `foreman dispatch` command: exercise the dispatch decision (spec.md
//! §4.4) directly from the command line, for operators testing routing
//! without going through a submitting client.

use std::time::Duration;

use anyhow::{Context, Result};
use foreman_core::breaker::CircuitBreaker;
use foreman_core::dispatch::{self, Build, DispatchConfig, DispatchOutcome};
use foreman_core::queue::BuildQueue;
use foreman_core::registry::{AgentRegistry, ResourceRequest};
use foreman_core::strategy;
use foreman_core::transport::TransportPool;
use sqlx::PgPool;

use crate::config::ForemanConfig;

#[allow(clippy::too_many_arguments)]
pub async fn run_dispatch(
    pool: &PgPool,
    config: &ForemanConfig,
    build_id: &str,
    job_id: &str,
    payload: serde_json::Value,
    labels: Vec<String>,
    org_id: Option<String>,
    cpu: Option<i32>,
    memory_gb: Option<f64>,
) -> Result<()> {
    let registry = AgentRegistry::new(Some(pool.clone()), config.heartbeat_timeout);
    registry.rehydrate().await.context("failed to rehydrate registry")?;

    let queue = BuildQueue::new(pool.clone());
    let breaker = CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_reset);
    let transport = TransportPool::new(Duration::from_secs(60), config.circuit_breaker_threshold, config.auth_token.clone());
    let strategy = strategy::strategy_for(config.resource_aware_scheduling);

    let resources = match (cpu, memory_gb) {
        (None, None) => None,
        (cpu, memory_gb) => Some(ResourceRequest { cpu, memory_gb }),
    };

    let build = Build {
        build_id: build_id.to_string(),
        job_id: job_id.to_string(),
        payload,
        labels,
        org_id,
        resources,
    };

    let dispatch_config = DispatchConfig {
        distributed_enabled: config.distributed_enabled,
        queue_enabled: config.queue_enabled,
        fallback_local: config.fallback_local,
        max_retries: config.max_retries,
    };

    let outcome = dispatch::dispatch(&build, &dispatch_config, &registry, &queue, &breaker, &transport, strategy.as_ref()).await;

    match outcome {
        DispatchOutcome::Local => println!("mode=local"),
        DispatchOutcome::Queued { queue_id } => println!("mode=queued queue_id={queue_id}"),
        DispatchOutcome::Remote { agent_id } => println!("mode=remote agent_id={agent_id}"),
        DispatchOutcome::FallbackLocal { reason } => println!("mode=local (fallback) reason={reason:?}"),
        DispatchOutcome::Failed { error } => {
            anyhow::bail!("mode=failed error={error:?}")
        }
    }

    Ok(())
}
