//! JSON bodies exchanged over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Channel, Task, TaskId, TaskKind, TaskStatus, TerminalStatus};

/// Element of the `GET /api/tasks` response.
///
/// `kind` stays a plain string on the wire so that an agent older than the
/// server can still decode the batch and report unknown types as failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedTask {
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: String,
}

impl From<&Task> for DispatchedTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            kind: task.kind.as_str().to_string(),
            payload: task.payload.clone(),
        }
    }
}

/// Body of `POST /api/confirm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub task_id: TaskId,
    pub host: String,
    pub status: TerminalStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmAck {
    pub ok: bool,
    pub task_id: TaskId,
    /// False when the report was a duplicate, late, or for an unknown task.
    pub applied: bool,
}

/// Element of the `GET /api/notify_tasks` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTaskView {
    pub id: TaskId,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub payload: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
}

impl From<&Task> for UserTaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            kind: task.kind,
            payload: task.payload.clone(),
            status: task.status,
            created_at: task.created_at,
            due_at: task.due_at,
        }
    }
}

/// Body of the admin `POST /api/tasks` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub target: String,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

/// Body of `POST /api/add_observation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRequest {
    pub task_id: TaskId,
    pub username: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confirm_request_matches_documented_shape() {
        let request: ConfirmRequest = serde_json::from_value(json!({
            "task_id": 42,
            "host": "HOST1",
            "status": "success",
            "message": "message shown"
        }))
        .unwrap();
        assert_eq!(request.task_id, TaskId(42));
        assert_eq!(request.status, TerminalStatus::Success);
        assert!(request.token.is_none());

        let encoded = serde_json::to_value(&request).unwrap();
        assert!(encoded.get("token").is_none());
    }

    #[test]
    fn confirm_request_rejects_non_terminal_status() {
        let result = serde_json::from_value::<ConfirmRequest>(json!({
            "task_id": 42,
            "host": "HOST1",
            "status": "dispatched",
            "message": ""
        }));
        assert!(result.is_err());
    }

    #[test]
    fn dispatched_task_keeps_unknown_type_as_text() {
        let task: DispatchedTask = serde_json::from_value(json!({
            "id": 9,
            "title": "future",
            "type": "screenshot",
            "payload": ""
        }))
        .unwrap();
        assert_eq!(task.kind, "screenshot");
    }

    #[test]
    fn new_task_defaults_to_host_channel() {
        let task: NewTask = serde_json::from_value(json!({
            "target": "HOST1",
            "type": "message",
            "payload": "Backup done"
        }))
        .unwrap();
        assert_eq!(task.channel, Channel::Host);
        assert!(task.title.is_empty());
        assert!(task.due_at.is_none());
    }
}
