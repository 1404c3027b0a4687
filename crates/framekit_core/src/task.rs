//! Thread/task runtime.
//!
//! A [`Task`] is one logical unit of work executed by N worker threads that
//! share a single FIFO message queue. Each worker owns a [`WorkerContext`]
//! holding its private [`TimerScheduler`] and [`PoolInstance`]; the context is
//! created when the worker starts and dropped before the worker exits.
//!
//! [`TaskHandle::activate`] is all-or-nothing: it returns only after every
//! worker has reported in, and if any spawn fails the workers that did start
//! are released without running the task body.

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};
use crate::pool::PoolInstance;
use crate::timer::TimerScheduler;

/// Identifier of a task. Id 0 is reserved for the main thread queue.
pub type TaskId = u32;

/// Task id addressing the main thread queue.
pub const MAIN_TASK_ID: TaskId = 0;

/// The body executed by every worker thread of a task.
///
/// Hooks run on the worker thread in the order `on_thread_start`, `svc`,
/// `on_thread_stop`. `cleanup` runs once, on the last worker to exit.
pub trait Task: Send + Sync + 'static {
    /// Messages carried by the task queue.
    type Message: Send + 'static;

    /// Runs on each worker before `svc`, after every worker has started.
    fn on_thread_start(&self, _ctx: &mut WorkerContext<Self::Message>) {}

    /// The worker main routine. Returning ends the worker.
    fn svc(&self, ctx: &mut WorkerContext<Self::Message>);

    /// Runs on each worker after `svc` returns, while the worker context is
    /// still alive.
    fn on_thread_stop(&self, _ctx: &mut WorkerContext<Self::Message>) {}

    /// Runs once per activation, on the last worker to exit.
    fn cleanup(&self) {}
}

/// Cooperative control signal observed by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskSignal {
    #[default]
    Running,
    Suspended,
    Cancelled,
    /// Hard stop request carrying a signal number.
    Killed(i32),
}

/// Multi-producer multi-consumer FIFO shared by the workers of a task.
pub struct MessageQueue<M> {
    tx: flume::Sender<M>,
    rx: flume::Receiver<M>,
}

impl<M> MessageQueue<M> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Append a message.
    pub fn push(&self, msg: M) {
        // Never disconnected: the queue holds its own receiver.
        let _ = self.tx.send(msg);
    }

    /// Block until a message is available.
    pub fn pop(&self) -> Option<M> {
        self.rx.recv().ok()
    }

    /// Take a message if one is queued.
    pub fn try_pop(&self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a message.
    pub fn timed_pop(&self, timeout: Duration) -> Option<M> {
        self.rx.recv_timeout(timeout).ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<M> Clone for MessageQueue<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<M> Default for MessageQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for MessageQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue").field("len", &self.rx.len()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Pending,
    Open,
    Aborted,
}

#[derive(Debug)]
struct ControlState {
    requested: usize,
    active: usize,
    started: usize,
    gate: Gate,
    start_completed: bool,
    signal: TaskSignal,
}

/// Task bookkeeping. Every field is guarded by the one mutex.
#[derive(Debug)]
struct TaskControl {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                requested: 0,
                active: 0,
                started: 0,
                gate: Gate::Pending,
                start_completed: false,
                signal: TaskSignal::Running,
            }),
            cond: Condvar::new(),
        }
    }
}

/// Per-worker state, owned by the worker thread for its whole life.
pub struct WorkerContext<M> {
    task_id: TaskId,
    index: usize,
    timers: TimerScheduler,
    pool: PoolInstance,
    queue: MessageQueue<M>,
    control: Arc<TaskControl>,
    // The context never leaves the worker thread.
    _not_send: PhantomData<*const ()>,
}

impl<M> WorkerContext<M> {
    fn new(task_id: TaskId, index: usize, queue: MessageQueue<M>, control: Arc<TaskControl>) -> Self {
        Self {
            task_id,
            index,
            timers: TimerScheduler::new(),
            pool: PoolInstance::new(),
            queue,
            control,
            _not_send: PhantomData,
        }
    }

    /// Returns the id of the task this worker belongs to.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns the worker index within its task, starting at 0.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timers_mut(&mut self) -> &mut TimerScheduler {
        &mut self.timers
    }

    pub fn pool_mut(&mut self) -> &mut PoolInstance {
        &mut self.pool
    }

    /// Borrow the worker's pool and timer scheduler together.
    pub fn resources_mut(&mut self) -> (&mut PoolInstance, &mut TimerScheduler) {
        (&mut self.pool, &mut self.timers)
    }

    #[must_use]
    pub fn queue(&self) -> &MessageQueue<M> {
        &self.queue
    }

    /// Returns the current control signal.
    #[must_use]
    pub fn signal(&self) -> TaskSignal {
        self.control.state.lock().signal
    }

    /// Returns `true` once the task was cancelled or killed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal(), TaskSignal::Cancelled | TaskSignal::Killed(_))
    }

    /// Block while the task is suspended. Returns the signal that ended the wait.
    pub fn wait_while_suspended(&self) -> TaskSignal {
        let mut state = self.control.state.lock();
        while state.signal == TaskSignal::Suspended {
            self.control.cond.wait(&mut state);
        }
        state.signal
    }
}

/// Spawn parameters for one worker thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadSpec {
    pub name: String,
    pub stack_size: Option<usize>,
    pub priority: i32,
    pub flags: u32,
}

/// Creates and signals OS threads on behalf of tasks.
pub trait ThreadManager: Send + Sync {
    fn spawn(&self, spec: &ThreadSpec, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;

    /// Forward a control signal. Signals are cooperative by default.
    fn signal(&self, _task_id: TaskId, _signal: TaskSignal) -> Result<()> {
        Ok(())
    }
}

/// [`ThreadManager`] backed by `std::thread::Builder`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadManager;

impl ThreadManager for OsThreadManager {
    fn spawn(&self, spec: &ThreadSpec, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(spec.name.clone());
        if let Some(size) = spec.stack_size {
            builder = builder.stack_size(size);
        }
        if spec.priority != 0 {
            trace!(thread = %spec.name, priority = spec.priority, "thread priority ignored");
        }
        builder.spawn(body)
    }
}

/// Options for [`TaskHandle::activate`].
#[derive(Debug, Clone, Default)]
pub struct ActivateOptions {
    pub flags: u32,
    pub priority: i32,
    /// Stack size per worker index; missing or zero entries use the default.
    pub stack_sizes: Vec<usize>,
}

impl ActivateOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_stack_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.stack_sizes = sizes;
        self
    }
}

struct TaskShared<T: Task> {
    id: TaskId,
    task: Arc<T>,
    queue: MessageQueue<T::Message>,
    control: Arc<TaskControl>,
    manager: Arc<dyn ThreadManager>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to a task and its worker threads.
pub struct TaskHandle<T: Task> {
    shared: Arc<TaskShared<T>>,
}

impl<T: Task> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Task> TaskHandle<T> {
    /// Create an inactive task that spawns OS threads.
    #[must_use]
    pub fn new(id: TaskId, task: T) -> Self {
        Self::with_manager(id, task, Arc::new(OsThreadManager))
    }

    /// Create an inactive task using a custom [`ThreadManager`].
    #[must_use]
    pub fn with_manager(id: TaskId, task: T, manager: Arc<dyn ThreadManager>) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id,
                task: Arc::new(task),
                queue: MessageQueue::new(),
                control: Arc::new(TaskControl::new()),
                manager,
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    #[must_use]
    pub fn task(&self) -> &Arc<T> {
        &self.shared.task
    }

    /// Returns the thread count fixed by the last successful `activate`.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.control.state.lock().requested
    }

    /// Returns the number of workers that have not exited yet.
    #[must_use]
    pub fn active_thread_count(&self) -> usize {
        self.shared.control.state.lock().active
    }

    /// Returns `true` once every worker of the current activation reported in.
    #[must_use]
    pub fn is_start_completed(&self) -> bool {
        self.shared.control.state.lock().start_completed
    }

    /// Spawn `thread_count` workers and block until all of them have started.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `thread_count` is 0.
    /// - [`Error::Reentry`] if the task is already active. An activation
    ///   stays current until [`TaskHandle::wait`] has joined its workers, so
    ///   reactivating after the workers returned on their own still needs a
    ///   `wait()` first.
    /// - [`Error::Spawn`] if any thread could not be created. No worker runs
    ///   the task body in that case and the thread count is reset to 0.
    pub fn activate(&self, thread_count: usize, opts: &ActivateOptions) -> Result<()> {
        let shared = &self.shared;
        let control = &shared.control;
        if thread_count == 0 {
            return Err(Error::InvalidArgument("thread count must be at least 1".into()));
        }
        {
            let mut state = control.state.lock();
            if state.requested != 0 || state.active != 0 {
                return Err(Error::Reentry(format!("task {} is already active", shared.id)));
            }
            state.requested = thread_count;
            state.started = 0;
            state.gate = Gate::Pending;
            state.start_completed = false;
            state.signal = TaskSignal::Running;
        }

        let mut spawned = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let spec = ThreadSpec {
                name: format!("task-{}-{}", shared.id, index),
                stack_size: opts.stack_sizes.get(index).copied().filter(|s| *s > 0),
                priority: opts.priority,
                flags: opts.flags,
            };
            let worker_shared = Arc::clone(shared);
            match shared
                .manager
                .spawn(&spec, Box::new(move || run_worker(worker_shared, index)))
            {
                Ok(handle) => spawned.push(handle),
                Err(err) => {
                    error!(task = shared.id, index, error = %err, "failed to spawn worker thread");
                    control.state.lock().gate = Gate::Aborted;
                    control.cond.notify_all();
                    for handle in spawned {
                        let _ = handle.join();
                    }
                    let mut state = control.state.lock();
                    state.requested = 0;
                    state.started = 0;
                    state.gate = Gate::Pending;
                    return Err(Error::Spawn(format!(
                        "task {} worker {index}: {err}",
                        shared.id
                    )));
                }
            }
        }

        {
            let mut state = control.state.lock();
            while state.started < thread_count {
                control.cond.wait(&mut state);
            }
            state.gate = Gate::Open;
            state.start_completed = true;
        }
        control.cond.notify_all();
        shared.handles.lock().extend(spawned);
        info!(task = shared.id, threads = thread_count, "task activated");
        Ok(())
    }

    pub fn push(&self, msg: T::Message) {
        self.shared.queue.push(msg);
    }

    pub fn pop(&self) -> Option<T::Message> {
        self.shared.queue.pop()
    }

    pub fn try_pop(&self) -> Option<T::Message> {
        self.shared.queue.try_pop()
    }

    pub fn timed_pop(&self, timeout: Duration) -> Option<T::Message> {
        self.shared.queue.timed_pop(timeout)
    }

    #[must_use]
    pub fn queue(&self) -> &MessageQueue<T::Message> {
        &self.shared.queue
    }

    pub fn suspend(&self) -> Result<()> {
        self.set_signal(TaskSignal::Suspended)
    }

    pub fn resume(&self) -> Result<()> {
        self.set_signal(TaskSignal::Running)
    }

    pub fn cancel(&self) -> Result<()> {
        self.set_signal(TaskSignal::Cancelled)
    }

    pub fn kill(&self, signo: i32) -> Result<()> {
        self.set_signal(TaskSignal::Killed(signo))
    }

    fn set_signal(&self, signal: TaskSignal) -> Result<()> {
        let control = &self.shared.control;
        let mut state = control.state.lock();
        // A cancelled or killed task cannot be resumed or suspended again.
        if matches!(state.signal, TaskSignal::Cancelled | TaskSignal::Killed(_))
            && matches!(signal, TaskSignal::Running | TaskSignal::Suspended)
        {
            return Ok(());
        }
        self.shared.manager.signal(self.shared.id, signal)?;
        state.signal = signal;
        debug!(task = self.shared.id, ?signal, "task signal changed");
        drop(state);
        control.cond.notify_all();
        Ok(())
    }

    /// Join every worker of the current activation.
    ///
    /// Must not be called from one of the task's own workers.
    pub fn wait(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!(task = self.shared.id, "worker thread panicked");
            }
        }
        let mut state = self.shared.control.state.lock();
        if state.active == 0 {
            state.requested = 0;
            state.start_completed = false;
        }
    }
}

impl<T: Task> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.control.state.lock();
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("requested", &state.requested)
            .field("active", &state.active)
            .field("signal", &state.signal)
            .finish()
    }
}

/// Decrements the active count when a worker leaves, even by panic.
struct ActiveGuard<'a, T: Task> {
    shared: &'a TaskShared<T>,
}

impl<T: Task> Drop for ActiveGuard<'_, T> {
    fn drop(&mut self) {
        let control = &self.shared.control;
        let last = {
            let mut state = control.state.lock();
            state.active -= 1;
            state.active == 0
        };
        control.cond.notify_all();
        if last {
            debug!(task = self.shared.id, "last worker exiting, running cleanup");
            self.shared.task.cleanup();
        }
    }
}

fn run_worker<T: Task>(shared: Arc<TaskShared<T>>, index: usize) {
    let control = &shared.control;
    let mut ctx = WorkerContext::new(shared.id, index, shared.queue.clone(), Arc::clone(control));

    {
        let mut state = control.state.lock();
        state.started += 1;
        state.active += 1;
        control.cond.notify_all();
        while state.gate == Gate::Pending {
            control.cond.wait(&mut state);
        }
        if state.gate == Gate::Aborted {
            state.started -= 1;
            state.active -= 1;
            debug!(task = shared.id, index, "activation aborted, worker exiting");
            return;
        }
    }

    let guard = ActiveGuard { shared: &shared };
    trace!(task = shared.id, index, "worker started");
    let task = &shared.task;
    task.on_thread_start(&mut ctx);
    task.svc(&mut ctx);
    task.on_thread_stop(&mut ctx);
    drop(ctx);
    trace!(task = shared.id, index, "worker stopped");
    drop(guard);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingTask {
        thread_starts: AtomicUsize,
        svc_runs: AtomicUsize,
        thread_stops: AtomicUsize,
        cleanups: AtomicUsize,
        received: Mutex<Vec<u32>>,
        seen_ids: Mutex<Vec<(TaskId, usize)>>,
    }

    impl Task for CountingTask {
        type Message = u32;

        fn on_thread_start(&self, ctx: &mut WorkerContext<u32>) {
            self.thread_starts.fetch_add(1, Ordering::SeqCst);
            self.seen_ids.lock().push((ctx.task_id(), ctx.index()));
        }

        fn svc(&self, ctx: &mut WorkerContext<u32>) {
            self.svc_runs.fetch_add(1, Ordering::SeqCst);
            while !ctx.is_cancelled() {
                if let Some(msg) = ctx.queue().timed_pop(Duration::from_millis(5)) {
                    self.received.lock().push(msg);
                }
            }
        }

        fn on_thread_stop(&self, _ctx: &mut WorkerContext<u32>) {
            self.thread_stops.fetch_add(1, Ordering::SeqCst);
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingManager {
        fail_at: usize,
        calls: AtomicUsize,
    }

    impl ThreadManager for FailingManager {
        fn spawn(&self, spec: &ThreadSpec, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(io::Error::other("out of threads"));
            }
            OsThreadManager.spawn(spec, body)
        }
    }

    #[test]
    fn test_activate_runs_every_worker_and_cleans_up_once() {
        let handle = TaskHandle::new(7, CountingTask::default());
        handle.activate(3, &ActivateOptions::default()).unwrap();
        assert_eq!(handle.thread_count(), 3);
        assert!(handle.is_start_completed());

        for n in 0..5 {
            handle.push(n);
        }
        while !handle.queue().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        handle.cancel().unwrap();
        handle.wait();

        let task = handle.task();
        assert_eq!(task.thread_starts.load(Ordering::SeqCst), 3);
        assert_eq!(task.svc_runs.load(Ordering::SeqCst), 3);
        assert_eq!(task.thread_stops.load(Ordering::SeqCst), 3);
        assert_eq!(task.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(handle.active_thread_count(), 0);

        let mut received = task.received.lock().clone();
        received.sort_unstable();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);

        let mut ids = task.seen_ids.lock().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![(7, 0), (7, 1), (7, 2)]);
    }

    #[test]
    fn test_activate_zero_threads_is_invalid() {
        let handle = TaskHandle::new(1, CountingTask::default());
        assert!(matches!(
            handle.activate(0, &ActivateOptions::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_activate_twice_is_reentry() {
        let handle = TaskHandle::new(1, CountingTask::default());
        handle.activate(1, &ActivateOptions::default()).unwrap();
        assert!(matches!(
            handle.activate(1, &ActivateOptions::default()),
            Err(Error::Reentry(_))
        ));
        handle.cancel().unwrap();
        handle.wait();
        assert_eq!(handle.thread_count(), 0);
    }

    #[test]
    fn test_reactivate_requires_wait_after_workers_finish() {
        let handle = TaskHandle::new(2, CountingTask::default());
        handle.activate(2, &ActivateOptions::default()).unwrap();
        handle.cancel().unwrap();
        while handle.active_thread_count() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            handle.activate(1, &ActivateOptions::default()),
            Err(Error::Reentry(_))
        ));

        handle.wait();
        handle.activate(1, &ActivateOptions::default()).unwrap();
        assert_eq!(handle.thread_count(), 1);
        handle.cancel().unwrap();
        handle.wait();
        assert_eq!(handle.task().svc_runs.load(Ordering::SeqCst), 3);
        assert_eq!(handle.task().cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_spawn_failure_releases_started_workers() {
        let manager = Arc::new(FailingManager {
            fail_at: 2,
            calls: AtomicUsize::new(0),
        });
        let handle = TaskHandle::with_manager(2, CountingTask::default(), manager);
        let err = handle.activate(4, &ActivateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert_eq!(handle.thread_count(), 0);
        assert_eq!(handle.active_thread_count(), 0);

        let task = handle.task();
        assert_eq!(task.thread_starts.load(Ordering::SeqCst), 0);
        assert_eq!(task.svc_runs.load(Ordering::SeqCst), 0);
        assert_eq!(task.cleanups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_suspended_worker_waits_for_resume() {
        struct Sleeper {
            resumed_with: Mutex<Option<TaskSignal>>,
        }

        impl Task for Sleeper {
            type Message = ();

            fn svc(&self, ctx: &mut WorkerContext<()>) {
                // Wait for the test to suspend us before blocking on it.
                let _ = ctx.queue().pop();
                *self.resumed_with.lock() = Some(ctx.wait_while_suspended());
            }
        }

        let handle = TaskHandle::new(3, Sleeper {
            resumed_with: Mutex::new(None),
        });
        handle.activate(1, &ActivateOptions::default()).unwrap();
        handle.suspend().unwrap();
        handle.push(());
        thread::sleep(Duration::from_millis(20));
        assert!(handle.task().resumed_with.lock().is_none());
        handle.resume().unwrap();
        handle.wait();
        assert_eq!(*handle.task().resumed_with.lock(), Some(TaskSignal::Running));
    }

    #[test]
    fn test_stack_sizes_are_per_worker() {
        let opts = ActivateOptions::new()
            .with_priority(5)
            .with_stack_sizes(vec![256 * 1024, 0]);
        let handle = TaskHandle::new(4, CountingTask::default());
        handle.activate(3, &opts).unwrap();
        assert_eq!(handle.thread_count(), 3);
        handle.kill(9).unwrap();
        handle.resume().unwrap();
        handle.wait();
        assert_eq!(handle.task().cleanups.load(Ordering::SeqCst), 1);
    }
}
