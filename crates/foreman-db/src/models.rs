use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Draining,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Draining => "draining",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "draining" => Ok(Self::Draining),
            "offline" => Ok(Self::Offline),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Dispatching,
    Dispatched,
    Completed,
    Failed,
    DeadLetter,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

impl FromStr for QueueStatus {
    type Err = QueueStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatching" => Ok(Self::Dispatching),
            "dispatched" => Ok(Self::Dispatched),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(QueueStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`QueueStatus`] string.
#[derive(Debug, Clone)]
pub struct QueueStatusParseError(pub String);

impl fmt::Display for QueueStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid queue status: {:?}", self.0)
    }
}

impl std::error::Error for QueueStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// System resource description reported by an agent at registration time.
///
/// Stored as a JSON column; unknown fields are not preserved since this
/// struct is the canonical shape agents are expected to report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu_count: i32,
    pub memory_gb: f64,
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub labels: Vec<String>,
    pub max_builds: i32,
    pub current_builds: i32,
    pub status: AgentStatus,
    pub system_info: Option<Json<SystemInfo>>,
    pub region: Option<String>,
    pub org_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// A build awaiting or in dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueItem {
    pub id: Uuid,
    pub build_id: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    pub org_id: Option<String>,
    pub labels: Vec<String>,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent_id: Option<Uuid>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [AgentStatus::Online, AgentStatus::Draining, AgentStatus::Offline];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_invalid() {
        let result = "bogus".parse::<AgentStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn queue_status_display_roundtrip() {
        let variants = [
            QueueStatus::Pending,
            QueueStatus::Dispatching,
            QueueStatus::Dispatched,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::DeadLetter,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: QueueStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn queue_status_invalid() {
        let result = "nope".parse::<QueueStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn queue_status_dead_letter_uses_snake_case_wire_form() {
        assert_eq!(QueueStatus::DeadLetter.to_string(), "dead_letter");
        assert_eq!(
            "dead_letter".parse::<QueueStatus>().unwrap(),
            QueueStatus::DeadLetter
        );
    }
}
