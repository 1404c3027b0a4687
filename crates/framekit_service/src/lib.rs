//! # framekit_service
//!
//! Frame-driven services hosting application components.
//!
//! This crate provides:
//!
//! - [`Service`] — lifecycle, component hooks and the per-frame loop.
//! - [`ServiceContext`] — what hooks and frame callables see of their service.
//! - [`DispatchContextExt`] — posting frame callables from packet handlers.
//! - [`Component`] — the lifecycle hooks an application implements.
//! - [`ServiceConfig`] — name, type, frame rate and codec of a service.
//! - [`ServiceHandle`] — control of a service running on its own thread.
//!
//! A service is driven one frame at a time, either by the caller through
//! [`Service::main_loop`] or by its own thread through [`Service::spawn`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use framekit_service::{Component, HookResult, HookStatus, Service, ServiceConfig, ServiceContext};
//!
//! struct Greeter;
//!
//! impl Component for Greeter {
//!     fn on_init(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
//!         ctx.subscribe(1, |packet, dispatch| {
//!             let _ = dispatch.reply(packet, &"hello".to_string());
//!         })?;
//!         Ok(HookStatus::Done)
//!     }
//! }
//!
//! fn main() -> framekit_core::Result<()> {
//!     let mut service = Service::new(ServiceConfig::new("greeter"))?;
//!     service.add_component(Greeter)?;
//!     let handle = service.spawn()?;
//!     handle.stop();
//!     handle.join()?;
//!     Ok(())
//! }
//! ```

pub mod component;
pub mod config;
pub mod context;
pub mod runner;
pub mod service;

pub use component::{Component, HookResult, HookStatus};
pub use config::{DEFAULT_FPS, FPS_ENV, MAX_FPS, MIN_FPS, ServiceConfig, validate_fps};
pub use context::{DispatchContextExt, ServiceContext};
pub use runner::{ServiceCommand, ServiceHandle};
pub use service::{FrameCallable, Service, ServiceCore, ServiceState};
