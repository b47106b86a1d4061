use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// Monotone under the partial order `Waiting < Processing < {Completed,
/// Failed}`; see [`TaskStatus::code`] for the numeric code used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// The numeric status code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Processing => 1,
            Self::Completed => 2,
            Self::Failed => 3,
        }
    }

    /// Parse a numeric status code, if valid.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Waiting),
            1 => Some(Self::Processing),
            2 => Some(Self::Completed),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    /// `true` for `Completed` and `Failed` — terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task — the unit of work tracked by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: TaskStatus,
    /// Short human-readable string accompanying `status`.
    pub status_message: String,
    pub progress: u8,
    /// Opaque worker-owned scratchpad.
    pub state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// Deadline by which a `processing` task must report back before the
    /// broker reaps it as `worker-timeout`.
    pub processing_deadline: Option<DateTime<Utc>>,
    /// Optional idempotency key supplied at creation; a repeated key returns
    /// the original task instead of creating a duplicate.
    pub idempotency_key: Option<String>,
}

impl Task {
    /// Construct a new `waiting` task with server-assigned defaults.
    pub fn new(
        name: String,
        input: serde_json::Value,
        parent_id: Option<Uuid>,
        scheduled_start_at: Option<DateTime<Utc>>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            parent_id,
            input,
            output: None,
            status: TaskStatus::Waiting,
            status_message: "waiting".to_string(),
            progress: 0,
            state: None,
            created_at: Utc::now(),
            scheduled_start_at,
            started_at: None,
            ended_at: None,
            attempts: 0,
            processing_deadline: None,
            idempotency_key,
        }
    }

    /// `true` if the task is ready for delivery: still `waiting` and its
    /// scheduled start time, if any, has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Waiting
            && self.scheduled_start_at.map(|t| t <= now).unwrap_or(true)
    }
}

/// A registered HTTP worker for a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consumer {
    pub topic: String,
    pub endpoint_url: String,
    pub health_url: String,
    pub ready: bool,
    pub last_seen_at: DateTime<Utc>,
    /// Consecutive health-probe failures, used to flip `ready` to false
    /// after [`crate::config::BrokerConfig::health_failure_threshold`].
    pub consecutive_failures: u32,
}

impl Consumer {
    pub fn new(topic: String, endpoint_url: String, health_url: Option<String>) -> Self {
        let health_url = health_url.unwrap_or_else(|| default_health_url(&endpoint_url));
        Self {
            topic,
            endpoint_url,
            health_url,
            ready: true,
            last_seen_at: Utc::now(),
            consecutive_failures: 0,
        }
    }
}

/// Derive `<scheme>://<host>[:port]/health` from an endpoint URL.
pub fn default_health_url(endpoint_url: &str) -> String {
    match url_origin(endpoint_url) {
        Some(origin) => format!("{origin}/health"),
        None => format!("{endpoint_url}/health"),
    }
}

fn url_origin(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host_part = rest.split('/').next().unwrap_or(rest);
    Some(format!("{scheme}://{host_part}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrip() {
        let variants = [
            TaskStatus::Waiting,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
            assert_eq!(TaskStatus::from_code(v.code()), Some(*v));
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
        assert_eq!(TaskStatus::from_code(9), None);
    }

    #[test]
    fn task_status_terminal() {
        assert!(!TaskStatus::Waiting.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn task_is_due_without_schedule() {
        let task = Task::new(
            "parse-document".to_string(),
            serde_json::json!({}),
            None,
            None,
            None,
        );
        assert!(task.is_due(Utc::now()));
    }

    #[test]
    fn task_is_due_respects_future_schedule() {
        let future = Utc::now() + chrono::Duration::hours(1);
        let task = Task::new(
            "parse-document".to_string(),
            serde_json::json!({}),
            None,
            Some(future),
            None,
        );
        assert!(!task.is_due(Utc::now()));
        assert!(task.is_due(future + chrono::Duration::seconds(1)));
    }

    #[test]
    fn default_health_url_derivation() {
        assert_eq!(
            default_health_url("http://parser.internal:9000/parse"),
            "http://parser.internal:9000/health"
        );
        assert_eq!(
            default_health_url("https://chunker/chunk"),
            "https://chunker/health"
        );
    }
}
