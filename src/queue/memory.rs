/// In-process task queue
///
/// A priority heap feeding a dispatcher loop that runs at most `concurrency`
/// attempts at a time. Each attempt resolves its handler through the Node
/// Executor Registry under a `tokio::time::timeout`. Failed retryable
/// attempts sleep out their backoff in a separate task and re-enter the heap
/// with the retry priority.

use super::{EnqueueOptions, NodeTask, TaskAck, TaskEvent, TaskQueue};
use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
use crate::nodes::{NodeContext, NodeExecutorRegistry};
use futures::future::BoxFuture;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

/// A task waiting in the heap for its next attempt
#[derive(Debug)]
struct QueuedAttempt {
    priority: i32,
    sequence: u64,
    attempt: u32,
    task: NodeTask,
    options: EnqueueOptions,
}

impl PartialEq for QueuedAttempt {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedAttempt {}

impl PartialOrd for QueuedAttempt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAttempt {
    /// Higher priority first, then lower sequence (FIFO)
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Handle on a spawned attempt or backoff timer
#[derive(Debug)]
struct Tracked {
    execution_id: String,
    handle: AbortHandle,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueuedAttempt>,
    /// Attempts currently running, by task id
    active: HashMap<String, Tracked>,
    /// Backoff timers waiting to re-enqueue, by task id
    delayed: HashMap<String, Tracked>,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    sequence: AtomicU64,
    registry: Arc<NodeExecutorRegistry>,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        // A panicking holder leaves the maps consistent: every critical section
        // is a handful of inserts and removes.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn push(&self, attempt: QueuedAttempt) -> usize {
        let queued = {
            let mut state = self.state();
            state.heap.push(attempt);
            state.heap.len()
        };
        self.notify.notify_one();
        queued
    }

    fn emit(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Task event receiver dropped");
        }
    }
}

/// Task queue running node attempts inside this process
pub struct InMemoryTaskQueue {
    shared: Arc<Shared>,
    worker: AbortHandle,
}

impl std::fmt::Debug for InMemoryTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("InMemoryTaskQueue")
            .field("queued", &state.heap.len())
            .field("active", &state.active.len())
            .field("delayed", &state.delayed.len())
            .finish()
    }
}

impl InMemoryTaskQueue {
    /// Start the dispatcher loop. Outcomes are sent on `events`.
    pub fn start(
        registry: Arc<NodeExecutorRegistry>,
        config: &QueueConfig,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            sequence: AtomicU64::new(0),
            registry,
            events,
        });

        let worker = tokio::spawn(dispatch_loop(Arc::clone(&shared))).abort_handle();
        tracing::info!(concurrency = config.concurrency.max(1), "🧵 Task queue started");

        Arc::new(Self { shared, worker })
    }

    /// Tasks waiting in the heap
    pub fn queued_len(&self) -> usize {
        self.shared.state().heap.len()
    }

    /// Attempts currently running
    pub fn active_len(&self) -> usize {
        self.shared.state().active.len()
    }
}

impl Drop for InMemoryTaskQueue {
    fn drop(&mut self) {
        self.worker.abort();
        let mut guard = self.shared.state();
        let state = &mut *guard;
        for (_, tracked) in state.active.drain().chain(state.delayed.drain()) {
            tracked.handle.abort();
        }
        state.heap.clear();
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, task: NodeTask, options: EnqueueOptions) -> BoxFuture<'_, Result<TaskAck>> {
        Box::pin(async move {
            if self.worker.is_finished() {
                return Err(EngineError::Queue("task queue is not running".to_string()));
            }

            let task_id = task.task_id.clone();
            tracing::debug!(
                task_id = %task_id,
                execution_id = %task.execution_id,
                node_id = %task.node_id,
                priority = options.priority,
                "Enqueued task"
            );

            let queued = self.shared.push(QueuedAttempt {
                priority: options.priority,
                sequence: self.shared.next_sequence(),
                attempt: 1,
                task,
                options: EnqueueOptions {
                    attempts: options.attempts.max(1),
                    ..options
                },
            });

            Ok(TaskAck { task_id, queued })
        })
    }

    fn remove_all_for_execution(&self, execution_id: String) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let removed = {
                let mut guard = self.shared.state();
                let state = &mut *guard;
                let before = state.heap.len();
                state.heap.retain(|queued| queued.task.execution_id != execution_id);
                let mut removed = before - state.heap.len();

                for tracked_map in [&mut state.active, &mut state.delayed] {
                    tracked_map.retain(|_, tracked| {
                        if tracked.execution_id == execution_id {
                            tracked.handle.abort();
                            removed += 1;
                            false
                        } else {
                            true
                        }
                    });
                }
                removed
            };

            tracing::debug!(execution_id = %execution_id, removed, "Removed tasks for execution");
            Ok(removed)
        })
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        let Ok(permit) = Arc::clone(&shared.semaphore).acquire_owned().await else {
            return;
        };

        let next = loop {
            let popped = shared.state().heap.pop();
            match popped {
                Some(next) => break next,
                None => shared.notify.notified().await,
            }
        };

        // Registered before the attempt can finish and look itself up
        let mut state = shared.state();
        let task_id = next.task.task_id.clone();
        let execution_id = next.task.execution_id.clone();
        let handle = tokio::spawn(run_attempt(Arc::clone(&shared), next, permit)).abort_handle();
        state.active.insert(task_id, Tracked { execution_id, handle });
    }
}

async fn run_attempt(shared: Arc<Shared>, queued: QueuedAttempt, permit: OwnedSemaphorePermit) {
    let QueuedAttempt {
        attempt,
        task,
        options,
        ..
    } = queued;

    shared.emit(TaskEvent::Started {
        execution_id: task.execution_id.clone(),
        node_id: task.node_id.clone(),
        task_id: task.task_id.clone(),
        attempt,
    });

    let ctx = NodeContext {
        execution_id: task.execution_id.clone(),
        workflow_id: task.workflow_id.clone(),
        user_id: task.user_id.clone(),
        node_id: task.node_id.clone(),
        configuration: task.configuration.clone(),
        variables: task.variables.clone(),
        attempt,
    };

    let timeout = Duration::from_millis(options.timeout_ms);
    let outcome = match tokio::time::timeout(
        timeout,
        shared.registry.execute(&task.node_type, task.input.clone(), ctx),
    )
    .await
    {
        Err(_) => Err(EngineError::Timeout {
            scope: format!("node {}", task.node_id),
            elapsed_ms: options.timeout_ms,
        }),
        Ok(Err(err)) => Err(err),
        Ok(Ok(result)) if result.success => Ok(result.output),
        Ok(Ok(result)) => Err(EngineError::node(
            task.node_type.clone(),
            result
                .error
                .unwrap_or_else(|| "node reported failure".to_string()),
        )),
    };
    drop(permit);

    let mut state = shared.state();
    if state.active.remove(&task.task_id).is_none() {
        // Removed by remove_all_for_execution while finishing
        return;
    }

    match outcome {
        Ok(output) => {
            drop(state);
            shared.emit(TaskEvent::Completed {
                execution_id: task.execution_id,
                node_id: task.node_id,
                task_id: task.task_id,
                attempt,
                output,
            });
        }
        Err(err) if err.is_retryable() && attempt < options.attempts => {
            let delay = options.backoff.delay_after(attempt);
            tracing::warn!(
                execution_id = %task.execution_id,
                node_id = %task.node_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );

            shared.emit(TaskEvent::Retrying {
                execution_id: task.execution_id.clone(),
                node_id: task.node_id.clone(),
                task_id: task.task_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });

            let task_id = task.task_id.clone();
            let execution_id = task.execution_id.clone();
            let retry = QueuedAttempt {
                priority: options.retry_priority,
                sequence: 0,
                attempt: attempt + 1,
                task,
                options,
            };
            let timer = tokio::spawn(requeue_after(Arc::clone(&shared), retry, delay));
            state.delayed.insert(
                task_id,
                Tracked {
                    execution_id,
                    handle: timer.abort_handle(),
                },
            );
        }
        Err(err) => {
            drop(state);
            tracing::debug!(
                execution_id = %task.execution_id,
                node_id = %task.node_id,
                attempt,
                error = %err,
                "Task failed permanently"
            );
            shared.emit(TaskEvent::Failed {
                execution_id: task.execution_id,
                node_id: task.node_id,
                task_id: task.task_id,
                attempt,
                error: err.to_string(),
            });
        }
    }
}

async fn requeue_after(shared: Arc<Shared>, mut retry: QueuedAttempt, delay: Duration) {
    tokio::time::sleep(delay).await;

    let still_pending = shared.state().delayed.remove(&retry.task.task_id).is_some();
    if still_pending {
        retry.sequence = shared.next_sequence();
        shared.push(retry);
    }
}
