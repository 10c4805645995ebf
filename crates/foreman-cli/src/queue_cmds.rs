//! `foreman queue` subcommands: build-queue introspection for operators
//! (spec.md §6, "Queue introspection (depth, oldest age, dead-letter
//! listing)").

use anyhow::{Context, Result};
use foreman_core::queue::BuildQueue;
use sqlx::PgPool;

pub async fn depth(pool: &PgPool) -> Result<()> {
    let queue = BuildQueue::new(pool.clone());
    let depth = queue.depth_pending().await.context("failed to read queue depth")?;
    println!("pending: {depth}");
    Ok(())
}

pub async fn oldest_age(pool: &PgPool) -> Result<()> {
    let queue = BuildQueue::new(pool.clone());
    match queue
        .oldest_pending_age_ms()
        .await
        .context("failed to read oldest pending age")?
    {
        Some(age_ms) => println!("oldest pending item age: {age_ms} ms"),
        None => println!("queue is empty"),
    }
    Ok(())
}

pub async fn dead_letter(pool: &PgPool, limit: i64) -> Result<()> {
    let queue = BuildQueue::new(pool.clone());
    let items = queue.dead_letter(limit).await.context("failed to list dead-letter items")?;

    if items.is_empty() {
        println!("No dead-lettered items.");
        return Ok(());
    }

    for item in &items {
        println!(
            "{} build_id={} job_id={} retries={}/{} error={}",
            item.id,
            item.build_id,
            item.job_id,
            item.retry_count,
            item.max_retries,
            item.error.as_deref().unwrap_or("<none>"),
        );
    }
    Ok(())
}

pub async fn show(pool: &PgPool, build_id: &str) -> Result<()> {
    let queue = BuildQueue::new(pool.clone());
    match queue.by_build_id(build_id).await.context("failed to look up build")? {
        Some(item) => {
            println!("id:            {}", item.id);
            println!("build_id:      {}", item.build_id);
            println!("job_id:        {}", item.job_id);
            println!("status:        {}", item.status);
            println!("retry_count:   {}/{}", item.retry_count, item.max_retries);
            println!("agent_id:      {:?}", item.agent_id);
            println!("next_retry_at: {:?}", item.next_retry_at);
            println!("error:         {}", item.error.as_deref().unwrap_or("<none>"));
        }
        None => anyhow::bail!("no queue item found for build_id {build_id:?}"),
    }
    Ok(())
}
