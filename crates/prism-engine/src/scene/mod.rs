//! Scene lifecycle.
//!
//! A scene is a self-contained unit of GPU resource creation, per-frame work
//! and teardown. `mount` returns a [`Cleanup`]; the [`SceneHost`] makes sure at
//! most one scene is mounted at a time and that every cleanup runs exactly
//! once.
//!
//! Per-scene state machine: `Unmounted -> Mounting -> Mounted -> Unmounting ->
//! Unmounted`.

mod cleanup;
mod context;
mod events;
mod frame;
mod host;
mod root;
mod selector;

use futures::future::LocalBoxFuture;

use crate::device::Backend;

pub use cleanup::{Cleanup, DisposeStack};
pub use context::MountContext;
pub use events::{EventKind, EventListeners, ListenerId, WindowSignal};
pub use frame::{FrameLoop, FrameRequestId, FrameScheduler};
pub use host::{Activation, SceneError, SceneHost};
pub use root::{CanvasDescriptor, CanvasRoot, ContentRoot};
pub use selector::{SceneEntry, SceneSelector};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScenePhase {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

/// Uniform mount contract for demo content.
///
/// `mount` allocates everything the scene needs (device, surfaces, pipelines,
/// listeners, a frame loop) and returns the cleanup that releases all of it.
/// A failed mount must release whatever it acquired before returning the
/// error.
pub trait Scene<B: Backend> {
    fn id(&self) -> &str;

    fn title(&self) -> &str;

    fn mount(&self, ctx: MountContext<B>) -> LocalBoxFuture<'static, anyhow::Result<Cleanup>>;
}
