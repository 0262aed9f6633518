use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{Broker, TaskEnvelope, TaskReply};
use crate::error::StoreError;
use crate::types::TaskName;

/// Worker-side task handler.
///
/// `Err` becomes the reply's `error`; `Ok` becomes its `result`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskName, payload: Value) -> std::result::Result<Value, String>;
}

/// Adapts an async closure into a [`TaskHandler`].
#[derive(Clone)]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskName, Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, String>> + Send,
{
    async fn handle(&self, task: &TaskName, payload: Value) -> std::result::Result<Value, String> {
        (self.0)(task.clone(), payload).await
    }
}

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<TaskEnvelope>>>;

#[derive(Clone)]
struct Queue {
    tx: mpsc::UnboundedSender<TaskEnvelope>,
    rx: SharedReceiver,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, Queue>>,
    reply_queues: Mutex<HashMap<String, mpsc::Sender<TaskReply>>>,
    disconnected: AtomicBool,
}

/// In-process broker with competing-consumer task queues.
///
/// Every queue is consumed by any number of workers; each envelope goes to
/// exactly one of them. Replies are routed by the envelope's `reply_to` to
/// the receiver returned from [`MemoryBroker::reply_channel`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a connected broker with no queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the connection: publishes fail until [`MemoryBroker::reconnect`].
    pub fn disconnect(&self) {
        self.inner.disconnected.store(true, Ordering::SeqCst);
    }

    /// Restores the connection.
    pub fn reconnect(&self) {
        self.inner.disconnected.store(false, Ordering::SeqCst);
    }

    /// Declares `queue` as a reply queue and returns its consumer side.
    ///
    /// Declaring it again replaces the previous consumer.
    pub fn reply_channel(&self, queue: &str, capacity: usize) -> mpsc::Receiver<TaskReply> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        lock(&self.inner.reply_queues).insert(queue.to_string(), tx);
        rx
    }

    /// Starts one worker consuming `queue` with `handler`.
    pub fn spawn_worker<H>(&self, queue: &str, handler: Arc<H>) -> JoinHandle<()>
    where
        H: TaskHandler + ?Sized + 'static,
    {
        let rx = self.queue(queue).rx;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                // Hold the lock only while waiting, not while handling.
                let next = rx.lock().await.recv().await;
                let Some(envelope) = next else {
                    break;
                };
                let TaskEnvelope {
                    name,
                    payload,
                    correlation_id,
                    reply_to,
                } = envelope;
                debug!(task = %name, correlation_id = %correlation_id, "worker picked up task");
                let reply = match handler.handle(&name, payload).await {
                    Ok(result) => TaskReply::ok(correlation_id, result),
                    Err(error) => TaskReply::err(correlation_id, error),
                };
                let sender = lock(&inner.reply_queues).get(&reply_to).cloned();
                match sender {
                    Some(sender) => {
                        if sender.send(reply).await.is_err() {
                            warn!(queue = %reply_to, "reply queue consumer is gone");
                        }
                    }
                    None => warn!(queue = %reply_to, "reply queue not declared"),
                }
            }
        })
    }

    fn queue(&self, name: &str) -> Queue {
        lock(&self.inner.queues)
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Queue {
                    tx,
                    rx: Arc::new(AsyncMutex::new(rx)),
                }
            })
            .clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, envelope: TaskEnvelope) -> std::result::Result<(), StoreError> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err("broker connection lost".into());
        }
        self.queue(queue)
            .tx
            .send(envelope)
            .map_err(|_| StoreError::from("task queue closed"))
    }
}
