use futures::executor::LocalSpawner;

use super::events::EventListeners;
use super::frame::FrameScheduler;
use super::root::ContentRoot;
use crate::device::Backend;

/// Everything a scene may touch while mounted.
pub struct MountContext<B: Backend> {
    pub backend: B,
    pub root: ContentRoot<B::Canvas>,
    pub frames: FrameScheduler,
    pub listeners: EventListeners,
    /// Local executor for continuations (readbacks, deferred work).
    pub spawner: LocalSpawner,
}

impl<B: Backend> Clone for MountContext<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            root: self.root.clone(),
            frames: self.frames.clone(),
            listeners: self.listeners.clone(),
            spawner: self.spawner.clone(),
        }
    }
}

impl<B: Backend> MountContext<B> {
    pub fn primary_canvas(&self) -> B::Canvas {
        self.root.primary()
    }
}
