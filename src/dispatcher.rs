//! Request/reply task dispatch over a message broker.
//!
//! Each call registers a one-shot waiter under a fresh correlation id, then
//! publishes the envelope. The waiter is removed on every exit path (reply,
//! timeout, publish failure, caller cancellation), so a reply that arrives
//! late finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{Broker, TaskEnvelope, TaskReply};
use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::types::{CorrelationId, TaskName};

pub(crate) const DEFAULT_TASK_QUEUE: &str = "tasks";
pub(crate) const DEFAULT_REPLY_QUEUE: &str = "tasks.replies";

type ReplyOutcome = std::result::Result<Value, String>;

#[derive(Debug, Default)]
struct PendingReplies {
    waiters: Mutex<HashMap<CorrelationId, oneshot::Sender<ReplyOutcome>>>,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<ReplyOutcome>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: CorrelationId) -> oneshot::Receiver<ReplyOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    fn take(&self, id: &CorrelationId) -> Option<oneshot::Sender<ReplyOutcome>> {
        self.lock().remove(id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) -> usize {
        let mut waiters = self.lock();
        let count = waiters.len();
        // Dropping the senders wakes every waiter with a closed-channel error.
        waiters.clear();
        count
    }
}

// Removes the waiter when the call future finishes or is dropped.
struct WaiterGuard<'a> {
    pending: &'a PendingReplies,
    id: CorrelationId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.take(&self.id);
    }
}

/// Sends named tasks to a worker pool and awaits correlated replies.
#[derive(Debug)]
pub struct TaskDispatcher<B> {
    broker: B,
    task_queue: String,
    reply_queue: String,
    pending: Arc<PendingReplies>,
}

impl<B> TaskDispatcher<B> {
    /// Creates a dispatcher publishing to the default queues.
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            reply_queue: DEFAULT_REPLY_QUEUE.to_string(),
            pending: Arc::new(PendingReplies::default()),
        }
    }

    /// Creates a dispatcher publishing to the queues named in `config`.
    pub fn with_config(broker: B, config: &DispatcherConfig) -> Self {
        Self::new(broker).with_queues(config.task_queue.clone(), config.reply_queue.clone())
    }

    /// Sets the task and reply queue names.
    pub fn with_queues(mut self, task_queue: impl Into<String>, reply_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self.reply_queue = reply_queue.into();
        self
    }

    /// Queue tasks are published to.
    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Queue replies are expected on.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Routes one reply to its waiter.
    ///
    /// Returns `false` when no call is waiting on the correlation id (already
    /// answered, timed out, or never issued); such replies are discarded.
    pub fn deliver(&self, reply: TaskReply) -> bool {
        deliver_to(&self.pending, reply)
    }

    /// Spawns a task that routes every reply from `replies`.
    ///
    /// When the stream ends, every outstanding call fails with a broker error
    /// instead of waiting for its timeout.
    pub fn spawn_reply_listener(&self, mut replies: mpsc::Receiver<TaskReply>) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                deliver_to(&pending, reply);
            }
            let failed = pending.clear();
            if failed > 0 {
                warn!(failed, "reply stream closed with calls in flight");
            }
        })
    }
}

fn deliver_to(pending: &PendingReplies, reply: TaskReply) -> bool {
    let Some(waiter) = pending.take(&reply.correlation_id) else {
        debug!(correlation_id = %reply.correlation_id, "discarding reply with no waiter");
        return false;
    };
    let outcome = match reply.error {
        Some(error) => Err(error),
        None => Ok(reply.result.unwrap_or(Value::Null)),
    };
    // The caller may have been cancelled between take and send.
    waiter.send(outcome).is_ok()
}

impl<B: Broker> TaskDispatcher<B> {
    /// Publishes `task` with `payload` and waits up to `timeout` for its reply.
    ///
    /// Resolves with the reply's `result`; the correlation id is never part of
    /// the returned value. Whether the result reports `success` is left to the
    /// caller (see [`TaskResult`]).
    pub async fn send_task_with_reply(
        &self,
        task: &TaskName,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let correlation_id = CorrelationId::generate();
        let reply = self.pending.register(correlation_id.clone());
        let _guard = WaiterGuard {
            pending: &self.pending,
            id: correlation_id.clone(),
        };

        let envelope = TaskEnvelope {
            name: task.clone(),
            payload,
            correlation_id: correlation_id.clone(),
            reply_to: self.reply_queue.clone(),
        };
        debug!(task = %task, correlation_id = %correlation_id, "publishing task");
        self.broker
            .publish(&self.task_queue, envelope)
            .await
            .map_err(Error::Broker)?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(Error::UpstreamApplication {
                task: task.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(Error::Broker("reply channel closed".into())),
            Err(_) => {
                warn!(task = %task, correlation_id = %correlation_id, "task timed out");
                Err(Error::UpstreamTimeout {
                    task: task.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

/// Application-level outcome carried inside a task reply.
///
/// Workers answer `{ "success": bool, "error"?: string, ... }`; everything
/// besides `success` and `error` is kept in `fields`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskResult {
    /// Parses `result` and fails unless it reports `success: true`.
    pub fn require_success(task: &TaskName, result: Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(result).map_err(|err| Error::UpstreamApplication {
            task: task.to_string(),
            message: format!("malformed task result: {err}"),
        })?;
        if !parsed.success {
            return Err(Error::UpstreamApplication {
                task: task.to_string(),
                message: parsed
                    .error
                    .unwrap_or_else(|| "task reported failure".to_string()),
            });
        }
        Ok(parsed)
    }

    /// Returns a top-level field, looking inside `data` when it is an object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).or_else(|| {
            self.fields
                .get("data")
                .and_then(Value::as_object)
                .and_then(|data| data.get(name))
        })
    }
}
