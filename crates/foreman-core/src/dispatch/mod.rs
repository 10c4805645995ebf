//! Dispatch Decision (C4): per-build routing between local execution,
//! durable queueing, and direct synchronous dispatch.

use serde::Serialize;
use uuid::Uuid;

use crate::breaker::{Admission, CircuitBreaker};
use crate::queue::BuildQueue;
use crate::registry::{AgentRegistry, RequestContext, ResourceRequest};
use crate::strategy::SchedulingStrategy;
use crate::transport::TransportPool;

/// A build accepted by the master, ready to be routed.
#[derive(Debug, Clone)]
pub struct Build {
    pub build_id: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    pub labels: Vec<String>,
    pub org_id: Option<String>,
    pub resources: Option<ResourceRequest>,
}

/// Outcome of a dispatch decision (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Local,
    Queued { queue_id: Uuid },
    Remote { agent_id: Uuid },
    FallbackLocal { reason: String },
    Failed { error: String },
}

/// Config knobs consumed by [`dispatch`].
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub distributed_enabled: bool,
    pub queue_enabled: bool,
    pub fallback_local: bool,
    pub max_retries: i32,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    build_id: &'a str,
    job_id: &'a str,
    payload: &'a serde_json::Value,
}

/// Decide how to route `build`, per §4.4's exact branching:
/// disabled -> local; queue-enabled -> enqueue; else -> direct POST with
/// fallback.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    build: &Build,
    config: &DispatchConfig,
    registry: &AgentRegistry,
    queue: &BuildQueue,
    breaker: &CircuitBreaker,
    transport: &TransportPool,
    strategy: &dyn SchedulingStrategy,
) -> DispatchOutcome {
    if !config.distributed_enabled {
        return DispatchOutcome::Local;
    }

    if config.queue_enabled {
        return match queue
            .enqueue(
                &build.build_id,
                &build.job_id,
                build.payload.clone(),
                build.org_id.as_deref(),
                &build.labels,
                config.max_retries,
            )
            .await
        {
            Ok(item) => DispatchOutcome::Queued { queue_id: item.id },
            Err(e) => DispatchOutcome::Failed { error: e.to_string() },
        };
    }

    let ctx = RequestContext {
        org_id: build.org_id.clone(),
    };
    let Some(agent) = registry.find_available(&build.labels, &ctx, build.resources, strategy) else {
        return fallback_or_fail(config, "no available agent");
    };

    if breaker.allow_request(agent.id) == Admission::Denied {
        return fallback_or_fail(config, "agent circuit breaker open");
    }

    let request = DispatchRequest {
        build_id: &build.build_id,
        job_id: &build.job_id,
        payload: &build.payload,
    };

    match transport.post(agent.id, &agent.url, "/builds", &request).await {
        Ok(_) => {
            breaker.record_success(agent.id);
            registry.increment_builds(agent.id).await;
            DispatchOutcome::Remote { agent_id: agent.id }
        }
        Err(e) => {
            breaker.record_failure(agent.id);
            fallback_or_fail(config, &e.to_string())
        }
    }
}

fn fallback_or_fail(config: &DispatchConfig, reason: &str) -> DispatchOutcome {
    if config.fallback_local {
        DispatchOutcome::FallbackLocal {
            reason: reason.to_string(),
        }
    } else {
        DispatchOutcome::Failed {
            error: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> Build {
        Build {
            build_id: "build-1".to_string(),
            job_id: "job-1".to_string(),
            payload: serde_json::json!({}),
            labels: vec![],
            org_id: None,
            resources: None,
        }
    }

    #[tokio::test]
    async fn disabled_distribution_always_runs_locally() {
        let registry = AgentRegistry::new(None, chrono::Duration::milliseconds(90_000));
        let queue_pool = sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://unused/unused").unwrap();
        let queue = BuildQueue::new(queue_pool);
        let breaker = CircuitBreaker::new(5, std::time::Duration::from_secs(60));
        let transport = TransportPool::new(std::time::Duration::from_secs(60), 3, None);
        let strategy = crate::strategy::LeastLoadedStrategy;

        let config = DispatchConfig {
            distributed_enabled: false,
            queue_enabled: false,
            fallback_local: true,
            max_retries: 3,
        };

        let outcome = dispatch(&build(), &config, &registry, &queue, &breaker, &transport, &strategy).await;
        assert_eq!(outcome, DispatchOutcome::Local);
    }

    #[tokio::test]
    async fn direct_mode_falls_back_local_when_no_agent_available() {
        let registry = AgentRegistry::new(None, chrono::Duration::milliseconds(90_000));
        let queue_pool = sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://unused/unused").unwrap();
        let queue = BuildQueue::new(queue_pool);
        let breaker = CircuitBreaker::new(5, std::time::Duration::from_secs(60));
        let transport = TransportPool::new(std::time::Duration::from_secs(60), 3, None);
        let strategy = crate::strategy::LeastLoadedStrategy;

        let config = DispatchConfig {
            distributed_enabled: true,
            queue_enabled: false,
            fallback_local: true,
            max_retries: 3,
        };

        let outcome = dispatch(&build(), &config, &registry, &queue, &breaker, &transport, &strategy).await;
        assert!(matches!(outcome, DispatchOutcome::FallbackLocal { .. }));
    }

    #[tokio::test]
    async fn direct_mode_fails_when_no_agent_available_and_fallback_disabled() {
        let registry = AgentRegistry::new(None, chrono::Duration::milliseconds(90_000));
        let queue_pool = sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://unused/unused").unwrap();
        let queue = BuildQueue::new(queue_pool);
        let breaker = CircuitBreaker::new(5, std::time::Duration::from_secs(60));
        let transport = TransportPool::new(std::time::Duration::from_secs(60), 3, None);
        let strategy = crate::strategy::LeastLoadedStrategy;

        let config = DispatchConfig {
            distributed_enabled: true,
            queue_enabled: false,
            fallback_local: false,
            max_retries: 3,
        };

        let outcome = dispatch(&build(), &config, &registry, &queue, &breaker, &transport, &strategy).await;
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    }
}
