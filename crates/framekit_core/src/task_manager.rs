//! Registry of running tasks with message routing by task id.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::task::{ActivateOptions, MAIN_TASK_ID, MessageQueue, Task, TaskHandle, TaskId};

/// Default maximum number of live tasks.
pub const DEFAULT_TASK_LIMIT: usize = 1024;

/// How [`TaskManager::pop_msg`] waits for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopMode {
    Try,
    Blocking,
    Timed(Duration),
}

/// Creates, activates and tracks tasks of one kind.
///
/// Task id [`MAIN_TASK_ID`] addresses a queue drained by the main thread.
pub struct TaskManager<T: Task> {
    tasks: DashMap<TaskId, TaskHandle<T>>,
    main_queue: MessageQueue<T::Message>,
    next_id: AtomicU32,
    count: AtomicUsize,
    limit: usize,
}

impl<T: Task> TaskManager<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_TASK_LIMIT)
    }

    /// Create a manager that refuses more than `limit` live tasks.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            main_queue: MessageQueue::new(),
            next_id: AtomicU32::new(MAIN_TASK_ID + 1),
            count: AtomicUsize::new(0),
            limit,
        }
    }

    /// Create a task and activate it with `threads` workers.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceLimitReached`] when the task limit is reached, or any
    /// error from [`TaskHandle::activate`].
    pub fn create_task(&self, task: T, threads: usize, opts: &ActivateOptions) -> Result<TaskId> {
        let reserved = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.limit).then_some(n + 1));
        if reserved.is_err() {
            return Err(Error::ResourceLimitReached(format!(
                "task limit {} reached",
                self.limit
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id, task);
        if let Err(err) = handle.activate(threads, opts) {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }
        self.tasks.insert(id, handle);
        info!(task = id, threads, "task created");
        Ok(id)
    }

    /// Returns a handle to a live task.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<TaskHandle<T>> {
        self.tasks.get(&id).map(|entry| entry.value().clone())
    }

    /// Queue `msg` for task `id`, or for the main thread when `id` is 0.
    pub fn push_msg(&self, id: TaskId, msg: T::Message) -> Result<()> {
        if id == MAIN_TASK_ID {
            self.main_queue.push(msg);
            return Ok(());
        }
        let handle = self.lookup(id)?;
        handle.push(msg);
        Ok(())
    }

    /// Take a message from task `id`'s queue (or the main queue for id 0).
    pub fn pop_msg(&self, id: TaskId, mode: PopMode) -> Result<Option<T::Message>> {
        if id == MAIN_TASK_ID {
            return Ok(pop_with(&self.main_queue, mode));
        }
        // Clone out of the map so a blocking pop does not hold the shard lock.
        let handle = self.lookup(id)?;
        Ok(pop_with(handle.queue(), mode))
    }

    /// Stop tracking task `id`. Call after its workers exited.
    pub fn remove_task(&self, id: TaskId) -> Option<TaskHandle<T>> {
        let (_, handle) = self.tasks.remove(&id)?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        debug!(task = id, "task removed");
        Some(handle)
    }

    /// Returns the number of live tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the queue addressed by [`MAIN_TASK_ID`].
    #[must_use]
    pub fn main_queue(&self) -> &MessageQueue<T::Message> {
        &self.main_queue
    }

    fn lookup(&self, id: TaskId) -> Result<TaskHandle<T>> {
        self.get(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }
}

impl<T: Task> Default for TaskManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn pop_with<M>(queue: &MessageQueue<M>, mode: PopMode) -> Option<M> {
    match mode {
        PopMode::Try => queue.try_pop(),
        PopMode::Blocking => queue.pop(),
        PopMode::Timed(timeout) => queue.timed_pop(timeout),
    }
}
