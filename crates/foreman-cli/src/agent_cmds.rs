//! `foreman agent` subcommands: thin wrappers around
//! [`foreman_core::registry::AgentRegistry`] for one-shot operator actions
//! against the persisted agent table (spec.md §6, "Agent admin API").

use anyhow::{Context, Result};
use chrono::Duration;
use foreman_core::registry::{AgentRegistry, RegisterRequest};
use foreman_db::SystemInfo;
use sqlx::PgPool;
use uuid::Uuid;

#[allow(clippy::too_many_arguments)]
pub async fn register(
    pool: &PgPool,
    heartbeat_timeout: Duration,
    name: Option<String>,
    url: String,
    labels: Vec<String>,
    max_builds: Option<i32>,
    cpu: Option<i32>,
    memory_gb: Option<f64>,
    region: Option<String>,
    org_id: Option<String>,
) -> Result<()> {
    let registry = AgentRegistry::new(Some(pool.clone()), heartbeat_timeout);
    let system_info = match (cpu, memory_gb) {
        (None, None) => None,
        (cpu, memory_gb) => Some(SystemInfo {
            cpu_count: cpu.unwrap_or(0),
            memory_gb: memory_gb.unwrap_or(0.0),
        }),
    };

    let agent = registry
        .register(RegisterRequest {
            name,
            url,
            labels,
            max_builds,
            system_info,
            org_id,
            region,
        })
        .await
        .context("failed to register agent")?;

    println!("Registered agent {} ({})", agent.id, agent.name);
    println!("  url: {}", agent.url);
    println!("  labels: {:?}", agent.labels);
    println!("  max_builds: {}", agent.max_builds);
    if let Some(org) = &agent.org_id {
        println!("  org_id: {org}");
    }
    Ok(())
}

pub async fn heartbeat(pool: &PgPool, heartbeat_timeout: Duration, id: Uuid, current_builds: Option<i32>) -> Result<()> {
    let registry = AgentRegistry::new(Some(pool.clone()), heartbeat_timeout);
    registry.rehydrate().await.context("failed to rehydrate registry")?;

    if registry.heartbeat(id, current_builds, None).await {
        println!("Heartbeat recorded for agent {id}");
    } else {
        anyhow::bail!("agent {id} not found");
    }
    Ok(())
}

pub async fn deregister(pool: &PgPool, id: Uuid) -> Result<()> {
    foreman_db::queries::agents::deregister_agent(pool, id)
        .await
        .context("failed to deregister agent")?;
    println!("Deregistered agent {id}");
    Ok(())
}

pub async fn drain(pool: &PgPool, id: Uuid) -> Result<()> {
    let found = foreman_db::queries::agents::set_draining(pool, id)
        .await
        .context("failed to set agent draining")?;
    if found {
        println!("Agent {id} set to draining");
    } else {
        anyhow::bail!("agent {id} not found");
    }
    Ok(())
}

pub async fn list(pool: &PgPool, org_id: Option<&str>) -> Result<()> {
    let agents = foreman_db::queries::agents::list_agents(pool, org_id)
        .await
        .context("failed to list agents")?;

    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {:<10} {}", "ID", "NAME", "STATUS", "BUILDS", "URL");
    for agent in &agents {
        println!(
            "{:<38} {:<20} {:<10} {:<10} {}",
            agent.id,
            agent.name,
            agent.status,
            format!("{}/{}", agent.current_builds, agent.max_builds),
            agent.url,
        );
    }
    Ok(())
}

pub async fn summary(pool: &PgPool, org_id: Option<&str>) -> Result<()> {
    let summary = foreman_db::queries::agents::summary(pool, org_id)
        .await
        .context("failed to summarize agents")?;

    println!("online:   {}", summary.online);
    println!("draining: {}", summary.draining);
    println!("offline:  {}", summary.offline);
    println!("total:    {}", summary.total);
    Ok(())
}
