use std::rc::Rc;

use futures::future::LocalBoxFuture;

/// Request for an additional canvas under the content root.
#[derive(Debug, Clone)]
pub struct CanvasDescriptor {
    pub title: String,
    /// Logical size in points.
    pub logical_size: (f64, f64),
}

/// The container a scene renders into.
///
/// The primary canvas always exists. Extra canvases belong to the mount that
/// created them; a scene releases its own, and the scene host clears the whole
/// root between mounts.
pub trait CanvasRoot<C> {
    fn primary(&self) -> C;

    fn create_canvas(&self, desc: CanvasDescriptor) -> LocalBoxFuture<'static, anyhow::Result<C>>;

    /// Releases one extra canvas. Unknown ids are ignored.
    fn release(&self, canvas_id: u64);

    /// Releases every extra canvas.
    fn clear(&self);

    /// Number of live extra canvases.
    fn canvas_count(&self) -> usize;
}

pub type ContentRoot<C> = Rc<dyn CanvasRoot<C>>;
