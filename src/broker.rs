use crate::error::StoreError;
use crate::types::{CorrelationId, TaskName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task published to the worker pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub name: TaskName,
    pub payload: Value,
    pub correlation_id: CorrelationId,
    /// Queue the worker should publish its reply to.
    pub reply_to: String,
}

/// Reply published by a worker.
///
/// `error` set means the worker failed the task; otherwise `result` carries
/// the application-level outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskReply {
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskReply {
    /// Successful reply carrying `result`.
    pub fn ok(correlation_id: CorrelationId, result: Value) -> Self {
        Self {
            correlation_id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed reply carrying `error`.
    pub fn err(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Message broker client used by the dispatcher.
///
/// Delivery to exactly one worker (competing consumers) and connection
/// recovery are the broker's concern. Replies reach the dispatcher through
/// [`crate::TaskDispatcher::spawn_reply_listener`] or
/// [`crate::TaskDispatcher::deliver`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `envelope` onto `queue`. Must fail rather than hang when the
    /// connection is gone.
    async fn publish(&self, queue: &str, envelope: TaskEnvelope) -> std::result::Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_wire_format_omits_absent_fields() {
        let reply = TaskReply::ok(CorrelationId::from_string("c-1".into()), json!({"success": true}));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            json!({"correlation_id": "c-1", "result": {"success": true}})
        );

        let parsed: TaskReply =
            serde_json::from_value(json!({"correlation_id": "c-2", "error": "boom"})).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("boom"));
        assert!(parsed.result.is_none());
    }
}
