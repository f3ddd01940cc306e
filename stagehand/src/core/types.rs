//! Shared record types for tasks, sessions, claims and issues.
//!
//! These are the persisted shapes. Field order is the serialized order, so
//! keep it stable.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::workflow::{Stage, WorkflowKind};
use crate::error::StateError;

/// Version stamped into every record written by this crate.
pub const RECORD_VERSION: u32 = 1;

const TASK_NAME_MAX: usize = 100;

static TASK_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("task name regex is valid"));

/// A validated task identifier: lowercase ascii letters, digits and `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskName(String);

impl TaskName {
    pub fn parse(raw: &str) -> Result<Self, StateError> {
        let invalid = |reason: &str| StateError::InvalidTaskName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if raw.len() > TASK_NAME_MAX {
            return Err(invalid("longer than 100 characters"));
        }
        if !TASK_NAME_RE.is_match(raw) {
            return Err(invalid(
                "use lowercase letters, digits and '-', starting with a letter or digit",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskName {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskName {
    type Error = StateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaskName> for String {
    fn from(value: TaskName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Incomplete,
    Failed,
    Completed,
    Issues,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Incomplete => "incomplete",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
            TaskStatus::Issues => "issues",
        }
    }

    /// Statuses the scheduler may pick up unattended.
    pub fn is_schedulable(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Incomplete | TaskStatus::Issues
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "incomplete" => Ok(TaskStatus::Incomplete),
            "failed" => Ok(TaskStatus::Failed),
            "completed" => Ok(TaskStatus::Completed),
            "issues" => Ok(TaskStatus::Issues),
            other => Err(format!(
                "unknown status '{other}' (expected pending, running, incomplete, failed, completed or issues)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Finished,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Running => "running",
            SessionStatus::Finished => "finished",
            SessionStatus::Failed => "failed",
        })
    }
}

/// Host and process that created a session or holds a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub pid: u32,
    pub host: String,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} on {}", self.pid, self.host)
    }
}

/// Persisted task record (`tasks/<name>/task.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub version: u32,
    pub name: TaskName,
    pub workflow: WorkflowKind,
    pub stage: Stage,
    pub status: TaskStatus,
    #[serde(default)]
    pub held: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_session: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Consecutive bounces across the workflow's oscillation pair.
    #[serde(default)]
    pub bounces: u32,
}

impl TaskRecord {
    /// A fresh task at the workflow's initial stage.
    pub fn new(name: TaskName, workflow: WorkflowKind, now: DateTime<Utc>) -> Self {
        Self {
            version: RECORD_VERSION,
            name,
            workflow,
            stage: workflow.definition().initial_stage(),
            status: TaskStatus::Pending,
            held: false,
            created_at: now,
            updated_at: now,
            last_session: None,
            last_error: None,
            bounces: 0,
        }
    }

    /// Advance `updated_at` without ever moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Persisted session record (`sessions/<id>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u32,
    pub session_id: String,
    pub task: TaskName,
    pub workflow: WorkflowKind,
    pub stage: Stage,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_stage: Option<Stage>,
    pub owner: Owner,
    #[serde(default)]
    pub error: Option<String>,
}

impl SessionRecord {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// Persisted claim record (`claims/<name>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub version: u32,
    pub task: TaskName,
    pub owner: Owner,
    /// Per-acquisition token; two handles in one process never share it.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl ClaimRecord {
    /// True once `now - acquired_at` exceeds the lease.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.acquired_at).num_seconds();
        age > i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Resolved,
}

/// Persisted issue record (`issues/<id>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub version: u32,
    pub id: String,
    pub task: TaskName,
    pub title: String,
    pub status: IssueStatus,
    /// Stage the task should be sent back to while this issue is open.
    #[serde(default)]
    pub stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn task_name_accepts_slugs() {
        for raw in ["alpha", "a1", "fix-login-bug", "2024-report"] {
            assert!(TaskName::parse(raw).is_ok(), "{raw} should be valid");
        }
    }

    #[test]
    fn task_name_rejects_paths_and_case() {
        for raw in ["", ".hidden", "a..b", "../x", "a/b", "Upper", "-lead", "sp ace"] {
            let err = TaskName::parse(raw).expect_err(raw);
            assert!(matches!(err, StateError::InvalidTaskName { .. }), "{raw}");
        }
        assert!(TaskName::parse(&"a".repeat(101)).is_err());
        assert!(TaskName::parse(&"a".repeat(100)).is_ok());
    }

    #[test]
    fn task_name_deserialization_validates() {
        let err = serde_json::from_str::<TaskName>("\"../etc\"");
        assert!(err.is_err());
        let ok: TaskName = serde_json::from_str("\"alpha\"").expect("parse");
        assert_eq!(ok.as_str(), "alpha");
    }

    #[test]
    fn claim_expiry_is_strictly_after_ttl() {
        let acquired_at = Utc::now();
        let claim = ClaimRecord {
            version: RECORD_VERSION,
            task: TaskName::parse("alpha").expect("name"),
            owner: Owner {
                pid: 1,
                host: "h".to_string(),
            },
            token: "t".to_string(),
            acquired_at,
            ttl_seconds: 60,
        };
        assert!(!claim.is_expired(acquired_at + Duration::seconds(60)));
        assert!(claim.is_expired(acquired_at + Duration::seconds(61)));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let now = Utc::now();
        let mut task = TaskRecord::new(
            TaskName::parse("alpha").expect("name"),
            WorkflowKind::Code,
            now,
        );
        task.touch(now - Duration::seconds(5));
        assert_eq!(task.updated_at, now);
        task.touch(now + Duration::seconds(5));
        assert_eq!(task.updated_at, now + Duration::seconds(5));
    }

    #[test]
    fn only_waiting_statuses_are_schedulable() {
        assert!(TaskStatus::Pending.is_schedulable());
        assert!(TaskStatus::Incomplete.is_schedulable());
        assert!(TaskStatus::Issues.is_schedulable());
        assert!(!TaskStatus::Running.is_schedulable());
        assert!(!TaskStatus::Failed.is_schedulable());
        assert!(!TaskStatus::Completed.is_schedulable());
    }
}
