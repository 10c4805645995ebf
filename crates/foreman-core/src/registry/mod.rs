//! Agent registry (C1): in-memory map of agents, authoritative for dispatch
//! decisions, with optional write-through persistence.
//!
//! The in-memory map is the source of truth for liveness: a persistence
//! failure on a soft write (heartbeat, counter update) is logged and
//! swallowed rather than propagated (spec.md §7, "persistence failure on a
//! soft write"). On startup, callers that have a pool should call
//! [`AgentRegistry::rehydrate`] to restore state from the `agents` table.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use foreman_db::queries::agents as agent_db;
use foreman_db::{AgentStatus, SystemInfo};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::strategy::{Candidate, SchedulingStrategy};

/// Request context threaded explicitly through registry calls rather than
/// carried as implicit middleware state (spec.md §9, "request scoping").
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub org_id: Option<String>,
}

/// Resource requirements considered by resource-aware scheduling.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: Option<i32>,
    pub memory_gb: Option<f64>,
}

/// In-memory record for one agent. Mirrors [`foreman_db::Agent`] but is the
/// authority for dispatch decisions regardless of whether persistence is
/// configured.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub labels: Vec<String>,
    pub max_builds: i32,
    pub current_builds: i32,
    pub status: AgentStatus,
    pub system_info: Option<SystemInfo>,
    pub region: Option<String>,
    pub org_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Arguments to [`AgentRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub name: Option<String>,
    pub url: String,
    pub labels: Vec<String>,
    pub max_builds: Option<i32>,
    pub system_info: Option<SystemInfo>,
    pub org_id: Option<String>,
    pub region: Option<String>,
}

const DEFAULT_MAX_BUILDS: i32 = 2;

/// In-memory agent registry with optional write-through persistence.
pub struct AgentRegistry {
    agents: Mutex<HashMap<Uuid, AgentRecord>>,
    db: Option<PgPool>,
    heartbeat_timeout: chrono::Duration,
}

impl AgentRegistry {
    pub fn new(db: Option<PgPool>, heartbeat_timeout: chrono::Duration) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            db,
            heartbeat_timeout,
        }
    }

    /// Reload the in-memory map from the persistent store, if configured.
    /// Intended to run once at startup so a restarted master does not
    /// forget about agents that are still alive.
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let rows = agent_db::list_agents(db, None).await?;
        let mut map = self.agents.lock().expect("registry mutex poisoned");
        map.clear();
        for row in &rows {
            map.insert(row.id, record_from_row(row));
        }
        Ok(map.len())
    }

    /// Register a new agent. Always generates a fresh id.
    pub async fn register(&self, req: RegisterRequest) -> anyhow::Result<AgentRecord> {
        if req.url.trim().is_empty() {
            anyhow::bail!("agent url must not be empty");
        }
        let max_builds = req.max_builds.unwrap_or(DEFAULT_MAX_BUILDS).max(1);
        let now = Utc::now();
        let id = Uuid::new_v4();
        let record = AgentRecord {
            id,
            name: req.name.clone().unwrap_or_else(|| id.to_string()),
            url: req.url.clone(),
            labels: req.labels.clone(),
            max_builds,
            current_builds: 0,
            status: AgentStatus::Online,
            system_info: req.system_info,
            region: req.region.clone(),
            org_id: req.org_id.clone(),
            registered_at: now,
            last_heartbeat: now,
        };

        {
            let mut map = self.agents.lock().expect("registry mutex poisoned");
            map.insert(id, record.clone());
        }

        if let Some(db) = &self.db {
            if let Err(e) = agent_db::insert_agent(
                db,
                &record.name,
                &record.url,
                &record.labels,
                max_builds,
                record.system_info,
                record.region.as_deref(),
                record.org_id.as_deref(),
            )
            .await
            {
                warn!(error = %e, agent_id = %id, "failed to persist newly registered agent");
            }
        }

        Ok(record)
    }

    /// Record a heartbeat. Returns true iff the agent exists.
    pub async fn heartbeat(
        &self,
        id: Uuid,
        current_builds: Option<i32>,
        system_info: Option<SystemInfo>,
    ) -> bool {
        let existed = {
            let mut map = self.agents.lock().expect("registry mutex poisoned");
            match map.get_mut(&id) {
                Some(record) => {
                    record.last_heartbeat = Utc::now();
                    record.status = AgentStatus::Online;
                    if let Some(cb) = current_builds {
                        record.current_builds = cb.clamp(0, record.max_builds);
                    }
                    if let Some(si) = system_info {
                        record.system_info = Some(si);
                    }
                    true
                }
                None => false,
            }
        };

        if existed {
            if let Some(db) = &self.db {
                if let Err(e) = agent_db::heartbeat(db, id, current_builds, system_info).await {
                    warn!(error = %e, agent_id = %id, "failed to persist heartbeat");
                }
            }
        }

        existed
    }

    /// Remove an agent from memory and the store.
    pub async fn deregister(&self, id: Uuid) -> anyhow::Result<()> {
        {
            let mut map = self.agents.lock().expect("registry mutex poisoned");
            map.remove(&id);
        }
        if let Some(db) = &self.db {
            agent_db::deregister_agent(db, id).await?;
        }
        Ok(())
    }

    /// Mark an agent draining. Returns true iff the agent exists.
    pub async fn set_draining(&self, id: Uuid) -> bool {
        let existed = {
            let mut map = self.agents.lock().expect("registry mutex poisoned");
            match map.get_mut(&id) {
                Some(record) => {
                    record.status = AgentStatus::Draining;
                    true
                }
                None => false,
            }
        };
        if existed {
            if let Some(db) = &self.db {
                if let Err(e) = agent_db::set_draining(db, id).await {
                    warn!(error = %e, agent_id = %id, "failed to persist draining status");
                }
            }
        }
        existed
    }

    /// Find the best available agent for a build, per the given strategy.
    /// Returns `None` if no agent is eligible.
    pub fn find_available(
        &self,
        labels: &[String],
        ctx: &RequestContext,
        resources: Option<ResourceRequest>,
        strategy: &dyn SchedulingStrategy,
    ) -> Option<AgentRecord> {
        let now = Utc::now();
        let map = self.agents.lock().expect("registry mutex poisoned");

        let candidates: Vec<&AgentRecord> = map
            .values()
            .filter(|a| a.status == AgentStatus::Online)
            .filter(|a| a.current_builds < a.max_builds)
            .filter(|a| a.heartbeat_age(now) < self.heartbeat_timeout)
            .filter(|a| labels.iter().all(|l| a.labels.iter().any(|al| al == l)))
            .filter(|a| match &ctx.org_id {
                None => true,
                Some(requested) => a.org_id.is_none() || a.org_id.as_deref() == Some(requested.as_str()),
            })
            .filter(|a| match (resources, a.system_info) {
                (Some(req), Some(info)) => {
                    req.cpu.is_none_or(|c| info.cpu_count as f64 >= c as f64)
                        && req.memory_gb.is_none_or(|m| info.memory_gb >= m)
                }
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let scored: Vec<Candidate> = candidates
            .iter()
            .map(|a| Candidate {
                id: a.id,
                current_builds: a.current_builds,
                max_builds: a.max_builds,
                system_info: a.system_info,
                region: a.region.clone(),
            })
            .collect();

        let best_id = strategy.select(&scored, resources)?;
        candidates
            .into_iter()
            .find(|a| a.id == best_id)
            .cloned()
    }

    /// Increment `current_builds`, clamped at `max_builds`.
    pub async fn increment_builds(&self, id: Uuid) {
        let updated = {
            let mut map = self.agents.lock().expect("registry mutex poisoned");
            map.get_mut(&id).map(|a| {
                a.current_builds = (a.current_builds + 1).min(a.max_builds);
                a.current_builds
            })
        };
        if updated.is_some() {
            if let Some(db) = &self.db {
                if let Err(e) = agent_db::increment_builds(db, id).await {
                    warn!(error = %e, agent_id = %id, "failed to persist build increment");
                }
            }
        }
    }

    /// Decrement `current_builds`, clamped at 0.
    ///
    /// Idempotency across a double-complete report is not enforced here:
    /// the clamp at zero makes a second decrement a harmless no-op rather
    /// than going negative, matching the permissive behavior spec.md §9
    /// leaves as an open question.
    pub async fn decrement_builds(&self, id: Uuid) {
        let updated = {
            let mut map = self.agents.lock().expect("registry mutex poisoned");
            map.get_mut(&id).map(|a| {
                a.current_builds = (a.current_builds - 1).max(0);
                a.current_builds
            })
        };
        if updated.is_some() {
            if let Some(db) = &self.db {
                if let Err(e) = agent_db::decrement_builds(db, id).await {
                    warn!(error = %e, agent_id = %id, "failed to persist build decrement");
                }
            }
        }
    }

    /// Transition every agent whose heartbeat has expired to `offline`.
    /// Returns the count of newly-offline agents.
    pub async fn check_health(&self) -> u64 {
        let now = Utc::now();
        let newly_offline: Vec<Uuid> = {
            let mut map = self.agents.lock().expect("registry mutex poisoned");
            let mut ids = Vec::new();
            for agent in map.values_mut() {
                if agent.status != AgentStatus::Offline && agent.heartbeat_age(now) > self.heartbeat_timeout {
                    agent.status = AgentStatus::Offline;
                    ids.push(agent.id);
                }
            }
            ids
        };

        if !newly_offline.is_empty() {
            if let Some(db) = &self.db {
                if let Err(e) = agent_db::check_health(db, self.heartbeat_timeout).await {
                    warn!(error = %e, "failed to persist agent health check");
                }
            }
        }

        newly_offline.len() as u64
    }

    /// List agents, optionally scoped to an org (shared agents always included).
    pub fn list(&self, org_id: Option<&str>) -> Vec<AgentRecord> {
        let map = self.agents.lock().expect("registry mutex poisoned");
        map.values()
            .filter(|a| match org_id {
                None => true,
                Some(org) => a.org_id.is_none() || a.org_id.as_deref() == Some(org),
            })
            .cloned()
            .collect()
    }

    /// Status counts, optionally scoped to an org.
    pub fn summary(&self, org_id: Option<&str>) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for agent in self.list(org_id) {
            match agent.status {
                AgentStatus::Online => summary.online += 1,
                AgentStatus::Draining => summary.draining += 1,
                AgentStatus::Offline => summary.offline += 1,
            }
            summary.total += 1;
        }
        summary
    }

    /// Snapshot of every currently-registered agent id, for the breaker's
    /// `cleanup` operation.
    pub fn ids(&self) -> Vec<Uuid> {
        let map = self.agents.lock().expect("registry mutex poisoned");
        map.keys().copied().collect()
    }

    /// List agents with a given status, for the orphan monitor.
    pub fn list_by_status(&self, status: AgentStatus) -> Vec<AgentRecord> {
        let map = self.agents.lock().expect("registry mutex poisoned");
        map.values().filter(|a| a.status == status).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistrySummary {
    pub online: i64,
    pub draining: i64,
    pub offline: i64,
    pub total: i64,
}

fn record_from_row(row: &foreman_db::Agent) -> AgentRecord {
    AgentRecord {
        id: row.id,
        name: row.name.clone(),
        url: row.url.clone(),
        labels: row.labels.clone(),
        max_builds: row.max_builds,
        current_builds: row.current_builds,
        status: row.status,
        system_info: row.system_info.as_ref().map(|j| j.0),
        region: row.region.clone(),
        org_id: row.org_id.clone(),
        registered_at: row.registered_at,
        last_heartbeat: row.last_heartbeat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::LeastLoadedStrategy;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(None, chrono::Duration::milliseconds(90_000))
    }

    #[tokio::test]
    async fn register_then_heartbeat_then_find_available() {
        let reg = registry();
        let agent = reg
            .register(RegisterRequest {
                url: "http://agent-1:9000".to_string(),
                labels: vec!["linux".to_string()],
                max_builds: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(reg.heartbeat(agent.id, Some(1), None).await);

        let strategy = LeastLoadedStrategy;
        let found = reg.find_available(
            &["linux".to_string()],
            &RequestContext::default(),
            None,
            &strategy,
        );
        assert_eq!(found.unwrap().id, agent.id);

        let not_found = reg.find_available(
            &["gpu".to_string()],
            &RequestContext::default(),
            None,
            &strategy,
        );
        assert!(not_found.is_none());
    }

    #[tokio::test]
    async fn draining_agent_is_never_selected() {
        let reg = registry();
        let agent = reg
            .register(RegisterRequest {
                url: "http://agent-2:9000".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        reg.set_draining(agent.id).await;

        let strategy = LeastLoadedStrategy;
        let found = reg.find_available(&[], &RequestContext::default(), None, &strategy);
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_returns_false() {
        let reg = registry();
        assert!(!reg.heartbeat(Uuid::new_v4(), None, None).await);
    }

    #[tokio::test]
    async fn current_builds_never_exceeds_max() {
        let reg = registry();
        let agent = reg
            .register(RegisterRequest {
                url: "http://agent-3:9000".to_string(),
                max_builds: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        reg.increment_builds(agent.id).await;
        reg.increment_builds(agent.id).await;

        let current = reg.list(None).into_iter().find(|a| a.id == agent.id).unwrap();
        assert_eq!(current.current_builds, 1);

        reg.decrement_builds(agent.id).await;
        reg.decrement_builds(agent.id).await;
        let current = reg.list(None).into_iter().find(|a| a.id == agent.id).unwrap();
        assert_eq!(current.current_builds, 0);
    }

    #[tokio::test]
    async fn check_health_marks_stale_agents_offline() {
        let reg = AgentRegistry::new(None, chrono::Duration::milliseconds(50));
        let agent = reg
            .register(RegisterRequest {
                url: "http://agent-4:9000".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        let newly_offline = reg.check_health().await;
        assert_eq!(newly_offline, 1);

        let strategy = LeastLoadedStrategy;
        let found = reg.find_available(&[], &RequestContext::default(), None, &strategy);
        assert!(found.is_none());

        let _ = agent;
    }

    #[tokio::test]
    async fn register_rejects_empty_url() {
        let reg = registry();
        let result = reg
            .register(RegisterRequest {
                url: String::new(),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shared_agents_are_visible_across_orgs() {
        let reg = registry();
        let shared = reg
            .register(RegisterRequest {
                url: "http://shared:9000".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        reg.register(RegisterRequest {
            url: "http://org-a-only:9000".to_string(),
            org_id: Some("org-a".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let strategy = LeastLoadedStrategy;
        let ctx = RequestContext {
            org_id: Some("org-b".to_string()),
        };
        let found = reg.find_available(&[], &ctx, None, &strategy);
        assert_eq!(found.unwrap().id, shared.id);
    }
}
