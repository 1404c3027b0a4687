//! # framekit_core
//!
//! Execution primitives shared by every framekit service.
//!
//! This crate provides:
//!
//! - [`pool`] — thread-affine object pool with declared destruction order.
//! - [`event`] — id-keyed multicast event bus.
//! - [`timer`] — per-worker deadline scheduler.
//! - [`task`] — worker-thread task runtime with a shared message queue.
//! - [`task_manager`] — registry routing messages to tasks by id.
//! - [`error`] — the framework error type.

pub mod error;
pub mod event;
pub mod pool;
pub mod task;
pub mod task_manager;
pub mod timer;

pub use error::{Error, Result};
pub use event::{Event, EventBus, EventFirer, EventId, ListenerStub, ListenerTarget};
pub use pool::{OrderTable, PoolInstance, PoolStats, PoolTypeId, Poolable};
pub use task::{
    ActivateOptions, MessageQueue, OsThreadManager, Task, TaskHandle, TaskId, TaskSignal,
    ThreadManager, ThreadSpec, WorkerContext,
};
pub use task_manager::{PopMode, TaskManager};
pub use timer::{TimerCallback, TimerId, TimerScheduler};
