//! Agent Transport Pool (C8): a per-agent HTTP client table with keep-alive
//! and health tracking, independent of the circuit breaker (C2) which gates
//! on dispatch outcomes rather than raw transport health).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error reaching agent: {0}")]
    Network(#[from] reqwest::Error),
    #[error("agent responded with client error: {0}")]
    ClientError(reqwest::StatusCode),
    #[error("agent responded with server error: {0}")]
    ServerError(reqwest::StatusCode),
}

struct PoolEntry {
    client: Client,
    endpoint: String,
    last_success_at: Option<Instant>,
    consecutive_failures: u32,
    created_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportStats {
    pub consecutive_failures: u32,
    pub healthy: bool,
}

/// Keyed HTTP client table. One `reqwest::Client` per agent so keep-alive
/// connections are reused across dispatches to the same endpoint.
pub struct TransportPool {
    entries: Mutex<HashMap<Uuid, PoolEntry>>,
    keep_alive: Duration,
    max_consecutive_failures: u32,
    auth_token: Option<String>,
}

impl TransportPool {
    pub fn new(keep_alive: Duration, max_consecutive_failures: u32, auth_token: Option<String>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            keep_alive,
            max_consecutive_failures: max_consecutive_failures.max(1),
            auth_token,
        }
    }

    fn client_for(&self, agent_id: Uuid, endpoint: &str) -> Client {
        let mut entries = self.entries.lock().expect("transport pool mutex poisoned");
        let keep_alive = self.keep_alive;
        let entry = entries.entry(agent_id).or_insert_with(|| PoolEntry {
            client: Client::builder()
                .pool_idle_timeout(keep_alive)
                .timeout(DISPATCH_TIMEOUT)
                .build()
                .expect("reqwest client should build with static config"),
            endpoint: endpoint.to_string(),
            last_success_at: None,
            consecutive_failures: 0,
            created_at: Instant::now(),
        });
        entry.endpoint = endpoint.to_string();
        entry.client.clone()
    }

    fn record_outcome(&self, agent_id: Uuid, success: bool) {
        let mut entries = self.entries.lock().expect("transport pool mutex poisoned");
        if let Some(entry) = entries.get_mut(&agent_id) {
            if success {
                entry.last_success_at = Some(Instant::now());
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
            }
        }
    }

    /// POST a JSON body to `{endpoint}{path}` on behalf of `agent_id`.
    pub async fn post<T: Serialize + ?Sized>(
        &self,
        agent_id: Uuid,
        endpoint: &str,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, TransportError> {
        let client = self.client_for(agent_id, endpoint);
        let mut request = client.post(format!("{endpoint}{path}")).json(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let result = request.send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                self.record_outcome(agent_id, true);
                Ok(response)
            }
            Ok(response) if response.status().is_client_error() => {
                self.record_outcome(agent_id, false);
                Err(TransportError::ClientError(response.status()))
            }
            Ok(response) => {
                self.record_outcome(agent_id, false);
                Err(TransportError::ServerError(response.status()))
            }
            Err(e) => {
                self.record_outcome(agent_id, false);
                Err(TransportError::Network(e))
            }
        }
    }

    /// GET `{endpoint}{path}` on behalf of `agent_id`.
    pub async fn get(&self, agent_id: Uuid, endpoint: &str, path: &str) -> Result<reqwest::Response, TransportError> {
        let client = self.client_for(agent_id, endpoint);
        let mut request = client.get(format!("{endpoint}{path}"));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let result = request.send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                self.record_outcome(agent_id, true);
                Ok(response)
            }
            Ok(response) if response.status().is_client_error() => {
                self.record_outcome(agent_id, false);
                Err(TransportError::ClientError(response.status()))
            }
            Ok(response) => {
                self.record_outcome(agent_id, false);
                Err(TransportError::ServerError(response.status()))
            }
            Err(e) => {
                self.record_outcome(agent_id, false);
                Err(TransportError::Network(e))
            }
        }
    }

    /// Drop the pooled client for one agent (e.g. on deregister).
    pub fn close_pool(&self, agent_id: Uuid) {
        let mut entries = self.entries.lock().expect("transport pool mutex poisoned");
        entries.remove(&agent_id);
    }

    /// Drop every pooled client, e.g. on shutdown.
    pub fn close_all(&self) {
        let mut entries = self.entries.lock().expect("transport pool mutex poisoned");
        entries.clear();
    }

    /// Snapshot health stats for every known agent.
    pub fn stats(&self) -> HashMap<Uuid, TransportStats> {
        let entries = self.entries.lock().expect("transport pool mutex poisoned");
        entries
            .iter()
            .map(|(id, entry)| {
                (
                    *id,
                    TransportStats {
                        consecutive_failures: entry.consecutive_failures,
                        healthy: entry.consecutive_failures < self.max_consecutive_failures,
                    },
                )
            })
            .collect()
    }

    #[cfg(test)]
    fn entry_age(&self, agent_id: Uuid) -> Option<Duration> {
        let entries = self.entries.lock().expect("transport pool mutex poisoned");
        entries.get(&agent_id).map(|e| e.created_at.elapsed())
    }
}
