use super::backend::Backend;
use super::surface::BackingSize;

/// Represents a single acquired frame.
///
/// This object is short-lived and must be presented promptly. Holding the
/// surface texture prevents acquisition of subsequent frames.
pub struct FrameContext<B: Backend> {
    backend: B,
    surface_texture: B::SurfaceTexture,
    pub color_view: B::TextureView,
    /// View of the surface's current depth texture, when one is configured.
    pub depth_view: Option<B::TextureView>,
    pub format: wgpu::TextureFormat,
    pub size: BackingSize,
}

impl<B: Backend> FrameContext<B> {
    pub(crate) fn new(
        backend: B,
        surface_texture: B::SurfaceTexture,
        color_view: B::TextureView,
        depth_view: Option<B::TextureView>,
        format: wgpu::TextureFormat,
        size: BackingSize,
    ) -> Self {
        Self {
            backend,
            surface_texture,
            color_view,
            depth_view,
            format,
            size,
        }
    }

    /// Schedules the acquired texture for presentation.
    pub fn present(self) {
        self.backend.present(self.surface_texture);
    }
}
