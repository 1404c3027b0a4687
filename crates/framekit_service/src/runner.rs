//! Driving a service on its own worker thread.
//!
//! [`Service::spawn`] moves a service into a single-threaded task that runs
//! frames at the configured rate. The returned [`ServiceHandle`] talks to it
//! through the task queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Instant;

use framekit_core::{ActivateOptions, Error, Result, Task, TaskHandle, TaskSignal, WorkerContext};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::service::{FrameCallable, Service};

static NEXT_SERVICE_TASK: AtomicU32 = AtomicU32::new(1);

/// Messages accepted by a running service thread.
pub enum ServiceCommand {
    /// Run a callable inside the next frame.
    Post(FrameCallable),
    /// Stop at the end of the next frame.
    Stop,
}

impl std::fmt::Debug for ServiceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceCommand::Post(_) => f.write_str("Post(..)"),
            ServiceCommand::Stop => f.write_str("Stop"),
        }
    }
}

struct ServiceTask {
    name: String,
    service: Mutex<Option<Service>>,
}

impl ServiceTask {
    fn run_frames(&self, service: &mut Service, ctx: &mut WorkerContext<ServiceCommand>) {
        loop {
            let start = Instant::now();

            while let Some(command) = ctx.queue().try_pop() {
                match command {
                    ServiceCommand::Post(callable) => service.post_callable(callable),
                    ServiceCommand::Stop => service.request_stop(),
                }
            }
            if ctx.wait_while_suspended() != TaskSignal::Running {
                service.request_stop();
            }

            if !service.main_loop() {
                info!(service = %self.name, frames = service.frame_count(), "frame loop finished");
                break;
            }

            let budget = service.frame_interval();
            let elapsed = start.elapsed();
            if elapsed < budget {
                thread::sleep(budget - elapsed);
            } else {
                warn!(
                    service = %self.name,
                    frame = service.frame_count(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = budget.as_millis() as u64,
                    "frame exceeded time budget"
                );
            }
        }
    }
}

impl Task for ServiceTask {
    type Message = ServiceCommand;

    fn svc(&self, ctx: &mut WorkerContext<ServiceCommand>) {
        let mut guard = self.service.lock();
        let Some(service) = guard.as_mut() else {
            warn!(service = %self.name, "service task has no service to drive");
            return;
        };
        let (pool, timers) = ctx.resources_mut();
        service.swap_worker_resources(pool, timers);
        self.run_frames(service, ctx);
        let (pool, timers) = ctx.resources_mut();
        service.swap_worker_resources(pool, timers);
    }

    fn cleanup(&self) {
        debug!(service = %self.name, "service thread exited");
    }
}

impl Service {
    /// Start the service if needed and run its frames on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Any error from [`Service::start`], or [`Error::Spawn`] if the thread
    /// could not be created.
    pub fn spawn(mut self) -> Result<ServiceHandle> {
        if !self.is_started() {
            self.start()?;
        }
        let name = self.name().to_string();
        let id = NEXT_SERVICE_TASK.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(
            id,
            ServiceTask {
                name: name.clone(),
                service: Mutex::new(Some(self)),
            },
        );
        handle.activate(1, &ActivateOptions::new())?;
        info!(service = %name, task = id, "service thread spawned");
        Ok(ServiceHandle { name, handle })
    }
}

/// Control handle for a service running on its own thread.
///
/// Dropping the handle stops the service and joins the thread.
pub struct ServiceHandle {
    name: String,
    handle: TaskHandle<ServiceTask>,
}

impl ServiceHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `callable` on the service thread inside an upcoming frame.
    pub fn post<F>(&self, callable: F)
    where
        F: FnOnce(&mut ServiceContext<'_>) + Send + 'static,
    {
        self.handle.push(ServiceCommand::Post(Box::new(callable)));
    }

    /// Ask the service to stop. Use [`ServiceHandle::join`] to wait for it.
    pub fn stop(&self) {
        self.handle.push(ServiceCommand::Stop);
    }

    /// Returns `true` while the service thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.active_thread_count() > 0
    }

    /// Wait for the service thread to exit and take the service back.
    ///
    /// Does not stop the service; call [`ServiceHandle::stop`] first unless
    /// it stops itself.
    pub fn join(self) -> Result<Service> {
        self.handle.wait();
        self.handle
            .task()
            .service
            .lock()
            .take()
            .ok_or_else(|| Error::NotFound(format!("service {}", self.name)))
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
            self.handle.wait();
        }
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("task", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::component::{Component, HookResult, HookStatus};
    use crate::config::ServiceConfig;
    use crate::service::ServiceState;

    #[test]
    fn test_spawned_service_runs_posted_callables() {
        let service = Service::new(ServiceConfig::new("spawned").with_fps(1000)).unwrap();
        let handle = service.spawn().unwrap();
        assert!(handle.is_running());

        let (tx, rx) = flume::bounded(1);
        handle.post(move |ctx| {
            let _ = tx.send(ctx.frame_count());
        });
        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(frame >= 1);

        handle.stop();
        let service = handle.join().unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_spawned_service_fires_timers() {
        let mut service = Service::new(ServiceConfig::new("ticking").with_fps(1000)).unwrap();
        service.start().unwrap();
        let (tx, rx) = flume::unbounded();
        let early = tx.clone();
        service.schedule_timer(Duration::ZERO, None, move || {
            let _ = early.send("scheduled before spawn");
        });
        let handle = service.spawn().unwrap();

        handle.post(move |ctx| {
            ctx.schedule_timer(Duration::from_millis(1), None, move || {
                let _ = tx.send("scheduled on the service thread");
            });
        });
        let mut fired = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        fired.sort_unstable();
        assert_eq!(fired, vec!["scheduled before spawn", "scheduled on the service thread"]);

        handle.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_component_can_stop_its_own_service() {
        struct OneShot {
            stopped: Arc<AtomicBool>,
        }

        impl Component for OneShot {
            fn on_late_start(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
                ctx.post(|ctx| ctx.request_stop());
                Ok(HookStatus::Done)
            }

            fn on_stop(&mut self, _ctx: &mut ServiceContext<'_>) -> HookStatus {
                self.stopped.store(true, Ordering::SeqCst);
                HookStatus::Done
            }
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let mut service = Service::new(ServiceConfig::new("oneshot").with_fps(1000)).unwrap();
        service
            .add_component(OneShot {
                stopped: Arc::clone(&stopped),
            })
            .unwrap();
        let handle = service.spawn().unwrap();
        let service = handle.join().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_spawn_reports_start_failure() {
        struct Broken;

        impl Component for Broken {
            fn on_init(&mut self, _ctx: &mut ServiceContext<'_>) -> HookResult {
                Err(Error::InvalidArgument("no config".into()))
            }
        }

        let mut service = Service::new(ServiceConfig::new("broken")).unwrap();
        service.add_component(Broken).unwrap();
        assert!(matches!(service.spawn(), Err(Error::HookFailed(_))));
    }

    #[test]
    fn test_dropping_handle_stops_service() {
        let destroyed = Arc::new(AtomicBool::new(false));

        struct Flag(Arc<AtomicBool>);

        impl Component for Flag {
            fn on_destroy(&mut self, _ctx: &mut ServiceContext<'_>) -> HookStatus {
                self.0.store(true, Ordering::SeqCst);
                HookStatus::Done
            }
        }

        let mut service = Service::new(ServiceConfig::new("dropped").with_fps(1000)).unwrap();
        service.add_component(Flag(Arc::clone(&destroyed))).unwrap();
        drop(service.spawn().unwrap());
        assert!(destroyed.load(Ordering::SeqCst));
    }
}
