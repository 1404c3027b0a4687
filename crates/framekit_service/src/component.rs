//! Application components hosted by a service.

use std::sync::atomic::{AtomicU64, Ordering};

use framekit_core::{ListenerTarget, Result};

use crate::context::ServiceContext;

/// Outcome of a lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookStatus {
    /// The hook finished.
    #[default]
    Done,
    /// The hook needs more time; the service calls it again later in the
    /// same phase.
    Pending,
}

/// Result of a startup hook. `Err` aborts startup.
pub type HookResult = Result<HookStatus>;

/// A unit of application logic plugged into a service.
///
/// Startup hooks run in registration order, phase by phase:
/// `on_init`, `on_late_init`, `on_start`, `on_late_start`. Shutdown hooks run
/// in reverse registration order, phase by phase: `on_early_stop`, `on_stop`,
/// `on_early_destroy`, `on_destroy`.
///
/// Listeners registered through the hook's [`ServiceContext`] belong to the
/// component and are removed when the service stops.
#[allow(unused_variables)]
pub trait Component: Send + 'static {
    /// Unique name within a service. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_init(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
        Ok(HookStatus::Done)
    }

    fn on_late_init(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
        Ok(HookStatus::Done)
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
        Ok(HookStatus::Done)
    }

    fn on_late_start(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
        Ok(HookStatus::Done)
    }

    fn on_early_stop(&mut self, ctx: &mut ServiceContext<'_>) -> HookStatus {
        HookStatus::Done
    }

    fn on_stop(&mut self, ctx: &mut ServiceContext<'_>) -> HookStatus {
        HookStatus::Done
    }

    fn on_early_destroy(&mut self, ctx: &mut ServiceContext<'_>) -> HookStatus {
        HookStatus::Done
    }

    fn on_destroy(&mut self, ctx: &mut ServiceContext<'_>) -> HookStatus {
        HookStatus::Done
    }
}

/// Lifecycle phases, in the order a full start/stop cycle visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Init,
    LateInit,
    Start,
    LateStart,
    EarlyStop,
    Stop,
    EarlyDestroy,
    Destroy,
}

impl Phase {
    pub(crate) fn invoke(self, component: &mut dyn Component, ctx: &mut ServiceContext<'_>) -> HookResult {
        match self {
            Phase::Init => component.on_init(ctx),
            Phase::LateInit => component.on_late_init(ctx),
            Phase::Start => component.on_start(ctx),
            Phase::LateStart => component.on_late_start(ctx),
            Phase::EarlyStop => Ok(component.on_early_stop(ctx)),
            Phase::Stop => Ok(component.on_stop(ctx)),
            Phase::EarlyDestroy => Ok(component.on_early_destroy(ctx)),
            Phase::Destroy => Ok(component.on_destroy(ctx)),
        }
    }
}

static NEXT_TARGET: AtomicU64 = AtomicU64::new(1);

/// A registered component and its lifecycle progress.
pub(crate) struct ComponentSlot {
    pub(crate) target: ListenerTarget,
    pub(crate) component: Box<dyn Component>,
    pub(crate) initialized: bool,
    pub(crate) started: bool,
}

impl ComponentSlot {
    pub(crate) fn new(component: Box<dyn Component>) -> Self {
        Self {
            target: ListenerTarget(NEXT_TARGET.fetch_add(1, Ordering::Relaxed)),
            component,
            initialized: false,
            started: false,
        }
    }
}
