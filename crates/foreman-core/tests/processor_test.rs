//! Integration test for a single queue processor tick against a real
//! database and an agent endpoint that refuses the connection, exercising
//! the transport failure -> mark-failed path end to end.

use std::sync::Arc;
use std::time::Duration;

use foreman_core::breaker::CircuitBreaker;
use foreman_core::processor::{self, ProcessorConfig, ProcessorDeps, Tick};
use foreman_core::queue::BuildQueue;
use foreman_core::registry::AgentRegistry;
use foreman_core::strategy::LeastLoadedStrategy;
use foreman_core::transport::TransportPool;
use foreman_db::queries::agents;
use foreman_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn tick_marks_item_failed_when_agent_is_unreachable() {
    let (pool, db_name) = create_test_db().await;

    agents::insert_agent(&pool, "worker", "http://127.0.0.1:1", &[], 2, None, None, None)
        .await
        .expect("insert should succeed");

    let queue = Arc::new(BuildQueue::new(pool.clone()));
    queue
        .enqueue("build-unreachable", "job-1", serde_json::json!({}), None, &[], 3)
        .await
        .expect("enqueue should succeed");

    let registry = Arc::new(AgentRegistry::new(Some(pool.clone()), chrono::Duration::milliseconds(90_000)));
    registry.rehydrate().await.expect("rehydrate should succeed");

    let deps = ProcessorDeps {
        queue: queue.clone(),
        registry,
        breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(60))),
        transport: Arc::new(TransportPool::new(Duration::from_secs(60), 3, None)),
        strategy: Arc::new(LeastLoadedStrategy),
    };
    let config = ProcessorConfig {
        base_poll: Duration::from_millis(10),
        max_idle: Duration::from_millis(100),
        retry_backoff_base_ms: 50,
        retry_backoff_max_ms: 5_000,
        circuit_breaker_threshold: 3,
    };

    let outcome = processor::run_once(&deps, &config).await;
    assert_eq!(outcome, Tick::Failed);

    let item = queue
        .by_build_id("build-unreachable")
        .await
        .expect("lookup should succeed")
        .expect("item should exist");
    assert_eq!(item.status, foreman_db::QueueStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert!(item.next_retry_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn tick_is_empty_when_queue_has_nothing_pending() {
    let (pool, db_name) = create_test_db().await;

    let queue = Arc::new(BuildQueue::new(pool.clone()));
    let registry = Arc::new(AgentRegistry::new(Some(pool.clone()), chrono::Duration::milliseconds(90_000)));

    let deps = ProcessorDeps {
        queue,
        registry,
        breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(60))),
        transport: Arc::new(TransportPool::new(Duration::from_secs(60), 3, None)),
        strategy: Arc::new(LeastLoadedStrategy),
    };
    let config = ProcessorConfig {
        base_poll: Duration::from_millis(10),
        max_idle: Duration::from_millis(100),
        retry_backoff_base_ms: 50,
        retry_backoff_max_ms: 5_000,
        circuit_breaker_threshold: 3,
    };

    let outcome = processor::run_once(&deps, &config).await;
    assert_eq!(outcome, Tick::Empty);

    pool.close().await;
    drop_test_db(&db_name).await;
}
