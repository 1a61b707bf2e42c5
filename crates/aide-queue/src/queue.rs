//! Owner-first priority queue with a single worker.
//!
//! Exactly one handler runs at a time across all conversations, so the LLM
//! sees one turn globally. Owner items overtake queued normal items but
//! never preempt a running handler; equal priorities run in enqueue order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePriority {
    Owner = 0,
    Normal = 1,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<String, QueueError>> + Send>>;

enum ItemKind {
    Job {
        task: HandlerFuture,
        done: oneshot::Sender<Result<String, QueueError>>,
    },
    /// Distinguished shutdown item; the worker exits after pulling it.
    Sentinel,
}

struct Item {
    priority: QueuePriority,
    seq: u64,
    message_id: String,
    kind: ItemKind,
}

impl Item {
    /// Heap key, smallest pops first. The sentinel beats everything so a
    /// shutdown drains immediately; otherwise owner-before-normal, then
    /// enqueue order.
    fn key(&self) -> (u8, QueuePriority, u64) {
        let sentinel = match self.kind {
            ItemKind::Sentinel => 0,
            ItemKind::Job { .. } => 1,
        };
        (sentinel, self.priority, self.seq)
    }
}

// BinaryHeap is a max-heap; invert so the smallest key pops first.
impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}
impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for Item {}

struct Shared {
    heap: Mutex<BinaryHeap<Item>>,
    notify: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
}

/// Handle for enqueueing work. Clone freely; `run_worker` drives execution.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a handler and wait for its result.
    ///
    /// Blocks the caller until the handler finishes, the queue shuts down,
    /// or `timeout` elapses. On timeout the item may still run later; only
    /// the waiter gives up.
    pub async fn enqueue<F>(
        &self,
        message_id: &str,
        is_owner: bool,
        timeout: Duration,
        task: F,
    ) -> Result<String, QueueError>
    where
        F: Future<Output = Result<String, QueueError>> + Send + 'static,
    {
        if self.shared.closed.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::Shutdown);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let priority = if is_owner {
            QueuePriority::Owner
        } else {
            QueuePriority::Normal
        };
        let item = Item {
            priority,
            seq: self.shared.seq.fetch_add(1, AtomicOrdering::SeqCst),
            message_id: message_id.to_string(),
            kind: ItemKind::Job {
                task: Box::pin(task),
                done: done_tx,
            },
        };

        self.shared.heap.lock().unwrap().push(item);
        self.shared.notify.notify_one();
        debug!(message_id, ?priority, "request enqueued");

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueueError::Shutdown),
            Err(_) => {
                warn!(message_id, "queue wait timed out");
                Err(QueueError::Timeout)
            }
        }
    }

    /// Push the shutdown sentinel. In-flight and queued waiters receive a
    /// shutdown error; the worker exits after draining.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, AtomicOrdering::SeqCst);
        let sentinel = Item {
            priority: QueuePriority::Owner,
            seq: 0,
            message_id: String::new(),
            kind: ItemKind::Sentinel,
        };
        self.shared.heap.lock().unwrap().push(sentinel);
        self.shared.notify.notify_one();
    }

    /// Worker loop. Spawn exactly one per queue.
    pub async fn run_worker(self) {
        info!("request queue worker started");
        loop {
            let item = loop {
                let popped = self.shared.heap.lock().unwrap().pop();
                match popped {
                    Some(item) => break item,
                    None => self.shared.notify.notified().await,
                }
            };

            match item.kind {
                ItemKind::Sentinel => {
                    let drained: Vec<Item> =
                        self.shared.heap.lock().unwrap().drain().collect();
                    for pending in drained {
                        if let ItemKind::Job { done, .. } = pending.kind {
                            let _ = done.send(Err(QueueError::Shutdown));
                        }
                    }
                    info!("request queue worker shutting down");
                    return;
                }
                ItemKind::Job { task, done } => {
                    debug!(message_id = %item.message_id, "handler started");
                    let result = task.await;
                    if let Err(e) = &result {
                        warn!(message_id = %item.message_id, error = %e, "handler failed");
                    }
                    // Waiter may have timed out; ignore the send failure.
                    let _ = done.send(result);
                }
            }
        }
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[tokio::test(start_paused = true)]
    async fn owner_overtakes_queued_normal_but_not_running() {
        let queue = RequestQueue::new();
        tokio::spawn(queue.clone().run_worker());

        let order: StdArc<Mutex<Vec<&'static str>>> = StdArc::new(Mutex::new(Vec::new()));

        // m1 (normal) starts running first and sleeps.
        let q1 = queue.clone();
        let o1 = order.clone();
        let h1 = tokio::spawn(async move {
            q1.enqueue("m1", false, Duration::from_secs(10), async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                o1.lock().unwrap().push("m1");
                Ok("r1".to_string())
            })
            .await
        });
        // Let the worker pick up m1 before the others arrive.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let q2 = queue.clone();
        let o2 = order.clone();
        let h2 = tokio::spawn(async move {
            q2.enqueue("m2", true, Duration::from_secs(10), async move {
                o2.lock().unwrap().push("m2");
                Ok("r2".to_string())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let q3 = queue.clone();
        let o3 = order.clone();
        let h3 = tokio::spawn(async move {
            q3.enqueue("m3", false, Duration::from_secs(10), async move {
                o3.lock().unwrap().push("m3");
                Ok("r3".to_string())
            })
            .await
        });

        assert_eq!(h1.await.unwrap().unwrap(), "r1");
        assert_eq!(h2.await.unwrap().unwrap(), "r2");
        assert_eq!(h3.await.unwrap().unwrap(), "r3");
        assert_eq!(*order.lock().unwrap(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_within_priority_class() {
        let queue = RequestQueue::new();
        let order: StdArc<Mutex<Vec<usize>>> = StdArc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let q = queue.clone();
            let o = order.clone();
            handles.push(tokio::spawn(async move {
                q.enqueue(&format!("m{i}"), true, Duration::from_secs(10), async move {
                    o.lock().unwrap().push(i);
                    Ok(String::new())
                })
                .await
            }));
            // Deterministic enqueue order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Start the worker only after everything is queued.
        tokio::spawn(queue.clone().run_worker());
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_propagates_to_caller() {
        let queue = RequestQueue::new();
        tokio::spawn(queue.clone().run_worker());

        let err = queue
            .enqueue("m1", false, Duration::from_secs(10), async {
                Err(QueueError::Handler("llm exploded".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Handler("llm exploded".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_on_slow_handler() {
        let queue = RequestQueue::new();
        tokio::spawn(queue.clone().run_worker());

        let err = queue
            .enqueue("m1", false, Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            })
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_pending_waiters() {
        let queue = RequestQueue::new();
        // No worker yet: the job stays queued.
        let q = queue.clone();
        let pending = tokio::spawn(async move {
            q.enqueue("m1", false, Duration::from_secs(10), async {
                Ok(String::new())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        queue.shutdown();
        tokio::spawn(queue.clone().run_worker());

        assert_eq!(pending.await.unwrap().unwrap_err(), QueueError::Shutdown);
        // New work is refused after shutdown.
        let err = queue
            .enqueue("m2", false, Duration::from_secs(1), async { Ok(String::new()) })
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Shutdown);
    }
}
