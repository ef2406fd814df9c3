//! The `Task` primitive: a cold, multi-subscriber producer with priority
//! aggregation and cancellation on loss of all subscribers (spec.md §4.1).
//!
//! Modeled after the teacher's actor/supervisor vocabulary
//! (`tokio_util::sync::CancellationToken`, `Arc<Mutex<..>>` state guarded
//! by a single lock — see `ferrex-core/src/scan/orchestration/runtime/supervisor.rs`)
//! but scoped down to one task's subscriber bookkeeping instead of a whole
//! actor system.

pub mod arena;
pub mod backpressure;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::request::Priority;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Cancelled,
    Completed,
}

/// An emission from a `Task<V>`. Mirrors spec.md §4.1's
/// `progress | value(V, isFinal) | error`.
#[derive(Debug, Clone)]
pub enum Event<V> {
    Progress { completed: u64, total: Option<u64> },
    Value { value: V, is_final: bool },
    Error(PipelineError),
}

impl<V> Event<V> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Value { is_final: true, .. } | Event::Error(_))
    }
}

type SubId = u64;

type StartFn<V> = Box<dyn FnOnce(Arc<Task<V>>) -> BoxFuture + Send>;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct SubscriberEntry<V> {
    priority: Priority,
    sender: tokio::sync::mpsc::UnboundedSender<Event<V>>,
}

struct Inner<V> {
    state: TaskState,
    subscribers: HashMap<SubId, SubscriberEntry<V>>,
    next_sub_id: SubId,
    aggregated_priority: Priority,
    retained: Option<Event<V>>,
    /// Upstream subscriptions this task holds. Cleared (dropped) on
    /// cancellation or completion, which unsubscribes from the
    /// dependency in turn (spec.md §4.1 invariant 1).
    dependencies: Vec<Arc<dyn DependencySubscription>>,
    start: Option<StartFn<V>>,
}

/// A cold, shared-execution, multi-subscriber producer.
pub struct Task<V> {
    id: TaskId,
    inner: Mutex<Inner<V>>,
    cancel_token: CancellationToken,
}

impl<V> std::fmt::Debug for Task<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("subscribers", &inner.subscribers.len())
            .field("aggregated_priority", &inner.aggregated_priority)
            .finish()
    }
}

/// Object-safe handle to a live subscription, used so an upstream task can
/// be handed priority updates without knowing the downstream task's value
/// type.
pub trait DependencySubscription: Send + Sync {
    fn set_priority(&self, priority: Priority);
}

impl<V: Send + Sync + 'static> Task<V> {
    /// Construct a task whose work begins only once the first subscriber
    /// arrives (spec.md §4.1: "starts work on the first subscription").
    pub fn new_cold<F, Fut>(start: F) -> Arc<Self>
    where
        F: FnOnce(Arc<Task<V>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let start: StartFn<V> = Box::new(move |task| Box::pin(start(task)));
        Arc::new(Self {
            id: TaskId::next(),
            cancel_token: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: TaskState::Pending,
                subscribers: HashMap::new(),
                next_sub_id: 0,
                aggregated_priority: Priority::VeryLow,
                retained: None,
                dependencies: Vec::new(),
                start: Some(start),
            }),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state
    }

    pub fn aggregated_priority(&self) -> Priority {
        self.inner.lock().unwrap().aggregated_priority
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Poll-friendly cancellation checkpoint for long-running work items,
    /// matching spec.md §5: "work items poll `isCancelled` at natural
    /// checkpoints".
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel_token.cancelled()
    }

    /// Register an upstream subscription this task depends on. Priority
    /// changes propagate to it; it is dropped (and so unsubscribed) on
    /// cancellation or completion.
    pub fn register_dependency(&self, dependency: Arc<dyn DependencySubscription>) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, TaskState::Cancelled | TaskState::Completed) {
            // Dependency established after we already finished: drop
            // immediately rather than leak a subscription nobody will
            // release.
            return;
        }
        inner.dependencies.push(dependency);
    }

    /// Subscribe for this task's emissions. Starts the task's work on the
    /// first subscription. Late subscribers immediately receive the
    /// retained state (last preview, or terminal event) per spec.md §4.1.
    pub fn subscribe(self: &Arc<Self>, priority: Priority) -> (Subscription<V>, Receiver<V>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut start_to_run = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_sub_id;
            inner.next_sub_id += 1;

            if let Some(retained) = &inner.retained {
                let _ = tx.send(retained.clone());
            }

            inner
                .subscribers
                .insert(id, SubscriberEntry { priority, sender: tx });
            recompute_aggregated(&mut inner);

            if inner.state == TaskState::Pending {
                inner.state = TaskState::Running;
                start_to_run = inner.start.take();
            }

            let sub = Subscription {
                task: self.clone(),
                id,
            };
            drop(inner);

            if let Some(start) = start_to_run {
                let task = self.clone();
                tokio::spawn(start(task));
            }

            return (sub, rx);
        }
    }

    fn unsubscribe(&self, id: SubId) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.remove(&id);
        if inner.subscribers.is_empty() {
            if matches!(inner.state, TaskState::Pending | TaskState::Running) {
                inner.state = TaskState::Cancelled;
                self.cancel_token.cancel();
                inner.dependencies.clear();
            }
        } else {
            recompute_aggregated(&mut inner);
        }
    }

    fn set_priority(&self, id: SubId, priority: Priority) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.subscribers.get_mut(&id) {
            entry.priority = priority;
        }
        recompute_aggregated(&mut inner);
    }

    pub fn emit_progress(&self, completed: u64, total: Option<u64>) {
        let inner = self.inner.lock().unwrap();
        if matches!(inner.state, TaskState::Completed | TaskState::Cancelled) {
            return;
        }
        let event = Event::Progress { completed, total };
        for entry in inner.subscribers.values() {
            let _ = entry.sender.send(event.clone());
        }
    }

    /// Emit a value. `is_final` terminates the task. Per invariant 3,
    /// nothing may be emitted after a terminal event — enforced here by
    /// checking `state` first.
    pub fn emit_value(&self, value: V, is_final: bool)
    where
        V: Clone,
    {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, TaskState::Completed | TaskState::Cancelled) {
            return;
        }
        let event = Event::Value {
            value,
            is_final,
        };
        inner.retained = Some(event.clone());
        for entry in inner.subscribers.values() {
            let _ = entry.sender.send(event.clone());
        }
        if is_final {
            inner.state = TaskState::Completed;
            inner.dependencies.clear();
        }
    }

    pub fn emit_error(&self, error: PipelineError) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, TaskState::Completed | TaskState::Cancelled) {
            return;
        }
        let event = Event::Error(error);
        inner.retained = Some(event.clone());
        for entry in inner.subscribers.values() {
            let _ = entry.sender.send(event.clone());
        }
        inner.state = TaskState::Completed;
        inner.dependencies.clear();
    }
}

fn recompute_aggregated<V>(inner: &mut Inner<V>) {
    let max = inner
        .subscribers
        .values()
        .map(|e| e.priority)
        .max()
        .unwrap_or(Priority::VeryLow);
    if max != inner.aggregated_priority {
        inner.aggregated_priority = max;
        for dep in &inner.dependencies {
            dep.set_priority(max);
        }
    }
}

pub type Receiver<V> = tokio::sync::mpsc::UnboundedReceiver<Event<V>>;

/// RAII handle returned by [`Task::subscribe`]. Dropping it unsubscribes,
/// which cancels the task if it was the last live subscriber.
pub struct Subscription<V> {
    task: Arc<Task<V>>,
    id: SubId,
}

impl<V> Subscription<V> {
    pub fn task(&self) -> &Arc<Task<V>> {
        &self.task
    }

    pub fn set_priority(&self, priority: Priority) {
        self.task.set_priority(self.id, priority);
    }
}

impl<V> std::fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("task_id", &self.task.id)
            .field("id", &self.id)
            .finish()
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        self.task.unsubscribe(self.id);
    }
}

impl<V: Send + Sync + 'static> DependencySubscription for Subscription<V> {
    fn set_priority(&self, priority: Priority) {
        Subscription::set_priority(self, priority);
    }
}
