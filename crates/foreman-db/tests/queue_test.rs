//! Integration tests for the build queue's atomic claim, retry/backoff, and
//! dead-lettering behavior.

use foreman_db::models::QueueStatus;
use foreman_db::queries::agents;
use foreman_db::queries::queue::{self, MarkFailedOutcome};
use foreman_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn atomic_claim_under_contention() {
    let (pool, db_name) = create_test_db().await;

    let item = queue::enqueue(
        &pool,
        "build-1",
        "job-1",
        serde_json::json!({"org_id": "org-a"}),
        Some("org-a"),
        &[],
        3,
    )
    .await
    .expect("enqueue should succeed");

    // Two "processors" race for the same item via separate connections from
    // the same pool, mirroring replicated masters hitting the same table.
    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { queue::dequeue_next(&pool_a).await }),
        tokio::spawn(async move { queue::dequeue_next(&pool_b).await }),
    );

    let a = a.expect("task should not panic").expect("query should succeed");
    let b = b.expect("task should not panic").expect("query should succeed");

    let claims: Vec<_> = [a, b].into_iter().flatten().collect();
    assert_eq!(claims.len(), 1, "exactly one caller should claim the item");
    assert_eq!(claims[0].id, item.id);
    assert_eq!(claims[0].status, QueueStatus::Dispatching);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dequeue_next_returns_none_when_empty() {
    let (pool, db_name) = create_test_db().await;

    let claimed = queue::dequeue_next(&pool).await.expect("query should succeed");
    assert!(claimed.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn exhausted_retries_reach_dead_letter_after_max_retries_plus_one_attempts() {
    let (pool, db_name) = create_test_db().await;

    let item = queue::enqueue(
        &pool,
        "build-2",
        "job-2",
        serde_json::json!({}),
        None,
        &[],
        2,
    )
    .await
    .expect("enqueue should succeed");

    // Attempt 1: retry_count 0 -> 1, still under max_retries (2): requeued.
    let outcome_1 = queue::mark_failed(&pool, item.id, "agent unreachable", 100)
        .await
        .expect("mark_failed should succeed");
    assert_eq!(outcome_1, MarkFailedOutcome::Requeued);

    let after_1 = queue::by_build_id(&pool, "build-2")
        .await
        .expect("lookup should succeed")
        .expect("item should exist");
    assert_eq!(after_1.status, QueueStatus::Pending);
    assert_eq!(after_1.retry_count, 1);
    assert!(after_1.next_retry_at.is_some());

    // Attempt 2: retry_count 1 -> 2, still under max_retries (2): requeued.
    let outcome_2 = queue::mark_failed(&pool, item.id, "agent unreachable", 200)
        .await
        .expect("mark_failed should succeed");
    assert_eq!(outcome_2, MarkFailedOutcome::Requeued);

    // Attempt 3: retry_count 2 -> 3, now >= max_retries (2): dead-lettered.
    let outcome_3 = queue::mark_failed(&pool, item.id, "agent unreachable", 400)
        .await
        .expect("mark_failed should succeed");
    assert_eq!(outcome_3, MarkFailedOutcome::DeadLettered);

    let final_item = queue::by_build_id(&pool, "build-2")
        .await
        .expect("lookup should succeed")
        .expect("item should exist");
    assert_eq!(final_item.status, QueueStatus::DeadLetter);
    assert!(final_item.completed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn requeue_for_agent_moves_dispatched_items_to_pending_or_dead_letter() {
    let (pool, db_name) = create_test_db().await;

    let agent = agents::insert_agent(&pool, "offline-worker", "http://10.0.0.9:9000", &[], 2, None, None, None)
        .await
        .expect("insert should succeed");

    let within_budget = queue::enqueue(&pool, "build-3", "job-3", serde_json::json!({}), None, &[], 3)
        .await
        .expect("enqueue should succeed");
    let exhausted = queue::enqueue(&pool, "build-4", "job-4", serde_json::json!({}), None, &[], 1)
        .await
        .expect("enqueue should succeed");

    for item in [&within_budget, &exhausted] {
        let claimed = queue::dequeue_next(&pool).await.expect("claim should succeed");
        assert!(claimed.is_some());
        queue::mark_dispatched(&pool, item.id, agent.id)
            .await
            .expect("mark_dispatched should succeed");
    }

    // `exhausted` has max_retries 1: the first orphan event is still within
    // budget (retry_count 0 -> 1, 1 <= 1), so it requeues, not dead-letters.
    let (requeued, dead_lettered) = queue::requeue_for_agent(&pool, agent.id, "agent went offline")
        .await
        .expect("requeue_for_agent should succeed");
    assert_eq!(requeued, 2);
    assert_eq!(dead_lettered, 0);

    let within_budget_after = queue::by_build_id(&pool, "build-3")
        .await
        .expect("lookup should succeed")
        .expect("item should exist");
    assert_eq!(within_budget_after.status, QueueStatus::Pending);
    assert!(within_budget_after.agent_id.is_none());

    let exhausted_after_first = queue::by_build_id(&pool, "build-4")
        .await
        .expect("lookup should succeed")
        .expect("item should exist");
    assert_eq!(exhausted_after_first.status, QueueStatus::Pending);
    assert_eq!(exhausted_after_first.retry_count, 1);

    // Redispatch `exhausted` to the same agent and let it go offline again:
    // retry_count 1 -> 2 now exceeds max_retries (1), so it dead-letters.
    queue::dequeue_next(&pool).await.expect("claim should succeed");
    queue::mark_dispatched(&pool, exhausted.id, agent.id)
        .await
        .expect("mark_dispatched should succeed");

    let (requeued_2, dead_lettered_2) = queue::requeue_for_agent(&pool, agent.id, "agent went offline again")
        .await
        .expect("requeue_for_agent should succeed");
    assert_eq!(requeued_2, 0);
    assert_eq!(dead_lettered_2, 1);

    let exhausted_after = queue::by_build_id(&pool, "build-4")
        .await
        .expect("lookup should succeed")
        .expect("item should exist");
    assert_eq!(exhausted_after.status, QueueStatus::DeadLetter);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mark_completed_by_build_id_only_affects_dispatched_items() {
    let (pool, db_name) = create_test_db().await;

    let agent = agents::insert_agent(&pool, "worker", "http://10.0.0.10:9000", &[], 2, None, None, None)
        .await
        .expect("insert should succeed");
    let item = queue::enqueue(&pool, "build-5", "job-5", serde_json::json!({}), None, &[], 3)
        .await
        .expect("enqueue should succeed");

    // Still pending: no dispatched row to complete.
    let affected = queue::mark_completed_by_build_id(&pool, "build-5")
        .await
        .expect("query should succeed");
    assert_eq!(affected, 0);

    queue::dequeue_next(&pool).await.expect("claim should succeed");
    queue::mark_dispatched(&pool, item.id, agent.id)
        .await
        .expect("mark_dispatched should succeed");

    let affected = queue::mark_completed_by_build_id(&pool, "build-5")
        .await
        .expect("query should succeed");
    assert_eq!(affected, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sweep_stuck_dispatching_reclaims_old_rows_only() {
    let (pool, db_name) = create_test_db().await;

    let item = queue::enqueue(&pool, "build-6", "job-6", serde_json::json!({}), None, &[], 3)
        .await
        .expect("enqueue should succeed");
    queue::dequeue_next(&pool).await.expect("claim should succeed");

    // Too young to sweep.
    let swept = queue::sweep_stuck_dispatching(&pool, chrono::Duration::hours(1))
        .await
        .expect("sweep should succeed");
    assert_eq!(swept, 0);

    sqlx::query("UPDATE build_queue SET enqueued_at = NOW() - INTERVAL '2 hours' WHERE id = $1")
        .bind(item.id)
        .execute(&pool)
        .await
        .expect("backdating should succeed");

    let swept = queue::sweep_stuck_dispatching(&pool, chrono::Duration::hours(1))
        .await
        .expect("sweep should succeed");
    assert_eq!(swept, 1);

    let reclaimed = queue::by_build_id(&pool, "build-6")
        .await
        .expect("lookup should succeed")
        .expect("item should exist");
    assert_eq!(reclaimed.status, QueueStatus::Pending);

    pool.close().await;
    drop_test_db(&db_name).await;
}
