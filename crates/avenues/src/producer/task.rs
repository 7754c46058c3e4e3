use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::{Completion, ProduceResult, Producer};
use crate::sync::Synchronized;
use crate::types::ProcessingState;
use crate::utils::defer::defer;

type ProduceFn<K, V> = dyn Fn(K) -> BoxFuture<'static, ProduceResult<V>> + Send + Sync;

enum TaskState {
    /// The abort handle is missing while the task is being spawned.
    Running {
        abort: Option<AbortHandle>,
        run_id: u64,
    },
    Completed,
}

impl TaskState {
    fn is_run(&self, run_id: u64) -> bool {
        matches!(self, Self::Running { run_id: id, .. } if *id == run_id)
    }

    fn abort(self) {
        if let Self::Running {
            abort: Some(abort), ..
        } = self
        {
            abort.abort();
        }
    }
}

struct TaskInner<K, V> {
    name: &'static str,
    runtime: Handle,
    produce: Box<ProduceFn<K, V>>,
    tasks: Synchronized<HashMap<K, TaskState>>,
    next_run: AtomicU64,
}

impl<K: Eq + Hash, V> TaskInner<K, V> {
    /// Removes the state of `key`, but only if it still belongs to the given run.
    fn forget_run(&self, key: &K, run_id: u64) {
        self.tasks.mutate(|tasks| {
            if tasks.get(key).is_some_and(|state| state.is_run(run_id)) {
                tasks.remove(key);
            }
        })
    }

    /// Marks `key` as completed, returning `false` if the run has been superseded or cancelled.
    fn complete_run(&self, key: &K, run_id: u64) -> bool {
        self.tasks.mutate(|tasks| match tasks.get_mut(key) {
            Some(state) if state.is_run(run_id) => {
                *state = TaskState::Completed;
                true
            }
            _ => false,
        })
    }
}

/// A [`Producer`] running each production as a task on a tokio runtime.
///
/// Productions are plain async functions from key to value. Cancelling a key aborts its task,
/// and the completion of an aborted task is dropped without reporting anything.
pub struct TaskProducer<K, V> {
    inner: Arc<TaskInner<K, V>>,
}

impl<K, V> Clone for TaskProducer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TaskProducer<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    /// Creates a producer spawning `produce` on `runtime`.
    pub fn new<F, Fut>(runtime: Handle, produce: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProduceResult<V>> + Send + 'static,
    {
        Self::with_name("task", runtime, produce)
    }

    /// Creates a named producer.
    ///
    /// The name is attached to logs and metrics.
    pub fn with_name<F, Fut>(name: &'static str, runtime: Handle, produce: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProduceResult<V>> + Send + 'static,
    {
        let produce: Box<ProduceFn<K, V>> = Box::new(move |key| Box::pin(produce(key)));
        let inner = TaskInner {
            name,
            runtime,
            produce,
            tasks: Synchronized::new(HashMap::new()),
            next_run: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The number of productions currently running.
    pub fn running(&self) -> usize {
        self.inner.tasks.read_with(|tasks| {
            tasks
                .values()
                .filter(|state| matches!(state, TaskState::Running { .. }))
                .count()
        })
    }
}

impl<K, V> Producer<K, V> for TaskProducer<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    fn start(&self, key: K, completion: Completion<V>) {
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let production = (self.inner.produce)(key.clone());
        let name = self.inner.name;

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = async move {
            // Removes the bookkeeping of runs that end without completing, e.g. aborted ones.
            let guard = defer(|| inner.forget_run(&task_key, run_id));

            tracing::trace!(producer = name, key = ?task_key, "production started");
            let result = production.await;
            guard.cancel();

            if inner.complete_run(&task_key, run_id) {
                completion.complete(result);
            } else {
                tracing::trace!(producer = name, key = ?task_key, "dropping superseded result");
            }
        };

        let placeholder = TaskState::Running {
            abort: None,
            run_id,
        };
        let previous = self
            .inner
            .tasks
            .mutate(|tasks| tasks.insert(key.clone(), placeholder));
        if let Some(previous) = previous {
            previous.abort();
        }

        let abort = self.inner.runtime.spawn(task).abort_handle();

        let cancelled = self.inner.tasks.mutate(|tasks| match tasks.get_mut(&key) {
            Some(TaskState::Running {
                abort: slot,
                run_id: id,
            }) if *id == run_id => {
                *slot = Some(abort.clone());
                false
            }
            // Finished already.
            Some(TaskState::Completed) => false,
            // Cancelled or superseded while spawning.
            _ => true,
        });
        if cancelled {
            abort.abort();
        }
    }

    fn cancel(&self, key: &K) {
        let removed = self.inner.tasks.mutate(|tasks| tasks.remove(key));
        if let Some(state @ TaskState::Running { .. }) = removed {
            tracing::trace!(producer = self.inner.name, key = ?key, "aborting production");
            metric!(counter("avenues.task.abort") += 1, "producer" => self.inner.name);
            state.abort();
        }
    }

    fn cancel_all(&self) {
        let tasks = self.inner.tasks.replace(HashMap::new());
        for state in tasks.into_values() {
            if matches!(state, TaskState::Running { .. }) {
                metric!(counter("avenues.task.abort") += 1, "producer" => self.inner.name);
                state.abort();
            }
        }
    }

    fn status(&self, key: &K) -> ProcessingState {
        self.inner.tasks.read_with(|tasks| match tasks.get(key) {
            Some(TaskState::Running { .. }) => ProcessingState::Running,
            Some(TaskState::Completed) => ProcessingState::Completed,
            None => ProcessingState::None,
        })
    }
}

impl<K, V> fmt::Debug for TaskProducer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProducer")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}
