//! Event catalog for workspace tasks, QC runs, issues and acceptance.
//!
//! Payloads are intentionally thin: checklist semantics and approval rules
//! belong to the workflows that emit these events, not to the core.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use qcflow_core::{AggregateId, UserId};

use crate::family::{DecodeError, EventFamily, decode_tagged, encode_tagged};
use crate::DomainEvent;

pub const TASK_CREATED: &str = "TaskCreated";
pub const TASK_ASSIGNED: &str = "TaskAssigned";
pub const TASK_COMPLETED: &str = "TaskCompleted";
pub const QC_PASSED: &str = "QCPassed";
pub const QC_FAILED: &str = "QCFailed";
pub const ISSUE_CREATED: &str = "IssueCreated";
pub const ISSUE_RESOLVED: &str = "IssueResolved";
pub const ACCEPTANCE_APPROVED: &str = "AcceptanceApproved";
pub const ACCEPTANCE_REJECTED: &str = "AcceptanceRejected";

const TASK_EVENT_TYPES: &[&str] = &[
    TASK_CREATED,
    TASK_ASSIGNED,
    TASK_COMPLETED,
    QC_PASSED,
    QC_FAILED,
    ISSUE_CREATED,
    ISSUE_RESOLVED,
    ACCEPTANCE_APPROVED,
    ACCEPTANCE_REJECTED,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub title: String,
    #[serde(default)]
    pub assignee: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub assignee: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompleted {
    #[serde(default)]
    pub completed_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcPassed {
    #[serde(default)]
    pub inspector: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcFailed {
    pub reason: String,
    #[serde(default)]
    pub inspector: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCreated {
    /// Task the issue was raised against.
    pub task_id: AggregateId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueResolved {
    #[serde(default)]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceApproved {
    #[serde(default)]
    pub approver: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceRejected {
    pub reason: String,
    #[serde(default)]
    pub approver: Option<UserId>,
}

/// The task / QC / acceptance event family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    TaskCreated(TaskCreated),
    TaskAssigned(TaskAssigned),
    TaskCompleted(TaskCompleted),
    #[serde(rename = "QCPassed")]
    QcPassed(QcPassed),
    #[serde(rename = "QCFailed")]
    QcFailed(QcFailed),
    IssueCreated(IssueCreated),
    IssueResolved(IssueResolved),
    AcceptanceApproved(AcceptanceApproved),
    AcceptanceRejected(AcceptanceRejected),
}

impl EventFamily for TaskEvent {
    const FAMILY: &'static str = "task";

    fn event_types() -> &'static [&'static str] {
        TASK_EVENT_TYPES
    }

    fn decode(event: &DomainEvent) -> Result<Self, DecodeError> {
        decode_tagged(Self::FAMILY, TASK_EVENT_TYPES, event)
    }

    fn event_type(&self) -> &'static str {
        match self {
            TaskEvent::TaskCreated(_) => TASK_CREATED,
            TaskEvent::TaskAssigned(_) => TASK_ASSIGNED,
            TaskEvent::TaskCompleted(_) => TASK_COMPLETED,
            TaskEvent::QcPassed(_) => QC_PASSED,
            TaskEvent::QcFailed(_) => QC_FAILED,
            TaskEvent::IssueCreated(_) => ISSUE_CREATED,
            TaskEvent::IssueResolved(_) => ISSUE_RESOLVED,
            TaskEvent::AcceptanceApproved(_) => ACCEPTANCE_APPROVED,
            TaskEvent::AcceptanceRejected(_) => ACCEPTANCE_REJECTED,
        }
    }

    fn to_payload(&self) -> Result<JsonValue, DecodeError> {
        encode_tagged(self)
    }
}
