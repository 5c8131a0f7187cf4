use std::sync::Arc;

use futures::future::LocalBoxFuture;

use super::AcquireError;

/// Receives the message of every uncaptured device error.
pub type UncapturedErrorSink = Arc<dyn Fn(String) + Send + Sync>;

/// Receives `(reason, message)` when the device is lost.
pub type DeviceLostSink = Arc<dyn Fn(String, String) + Send + Sync>;

/// A drawable target bound to a display output.
///
/// Sizes are reported in logical pixels; the device-pixel-ratio converts them to
/// physical backing pixels.
pub trait Canvas: Clone + 'static {
    /// Stable identifier, unique among live canvases.
    fn canvas_id(&self) -> u64;

    /// Client-measured size in logical pixels. May be zero or negative while
    /// the target is hidden or collapsed.
    fn client_size(&self) -> (f64, f64);

    fn device_pixel_ratio(&self) -> f64;
}

/// Parameters of a single device request.
#[derive(Debug, Clone)]
pub struct DeviceRequest<'a> {
    pub label: &'a str,
    pub features: wgpu::Features,
    pub limits: &'a wgpu::Limits,
}

/// Graphics driver capability boundary.
///
/// The lifecycle core (`DeviceHost`, `SurfaceManager`, `ReadbackPool`) is written
/// against this trait only. Descriptor values (features, limits, formats, alpha
/// modes, surface configuration) are the plain `wgpu` value types; the resource
/// handles are associated types so a backend without a GPU can stand in.
#[allow(async_fn_in_trait)]
pub trait Backend: Clone + 'static {
    type Canvas: Canvas;
    type Adapter: Clone;
    type Device: Clone;
    type Queue: Clone;
    type Surface;
    type SurfaceTexture;
    type Texture;
    type TextureView: Clone;
    type Buffer: Clone;

    // ── adapter / device ───────────────────────────────────────────────────

    async fn request_adapter(
        &self,
        power_preference: wgpu::PowerPreference,
        compatible_canvas: Option<&Self::Canvas>,
    ) -> Option<Self::Adapter>;

    fn adapter_features(&self, adapter: &Self::Adapter) -> wgpu::Features;

    fn adapter_limits(&self, adapter: &Self::Adapter) -> wgpu::Limits;

    /// Requests a logical device. Failure carries the driver's reason text.
    async fn request_device(
        &self,
        adapter: &Self::Adapter,
        request: &DeviceRequest<'_>,
    ) -> Result<(Self::Device, Self::Queue), String>;

    fn set_uncaptured_error_sink(&self, device: &Self::Device, sink: UncapturedErrorSink);

    fn set_device_lost_sink(&self, device: &Self::Device, sink: DeviceLostSink);

    fn destroy_device(&self, device: &Self::Device);

    // ── presentation ───────────────────────────────────────────────────────

    fn create_surface(&self, canvas: &Self::Canvas) -> Result<Self::Surface, String>;

    /// Formats the surface supports on `adapter`, most preferred first.
    fn surface_formats(
        &self,
        surface: &Self::Surface,
        adapter: &Self::Adapter,
    ) -> Vec<wgpu::TextureFormat>;

    fn surface_alpha_modes(
        &self,
        surface: &Self::Surface,
        adapter: &Self::Adapter,
    ) -> Vec<wgpu::CompositeAlphaMode>;

    fn configure_surface(
        &self,
        surface: &Self::Surface,
        device: &Self::Device,
        config: &wgpu::SurfaceConfiguration,
    );

    fn acquire_texture(
        &self,
        surface: &Self::Surface,
    ) -> Result<(Self::SurfaceTexture, Self::TextureView), AcquireError>;

    fn present(&self, texture: Self::SurfaceTexture);

    // ── resources ──────────────────────────────────────────────────────────

    fn create_depth_texture(
        &self,
        device: &Self::Device,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> (Self::Texture, Self::TextureView);

    fn destroy_texture(&self, texture: &Self::Texture);

    /// Creates a CPU-mappable buffer used as a copy destination for readbacks.
    fn create_readback_buffer(&self, device: &Self::Device, size: u64) -> Self::Buffer;

    /// Maps `buffer` for reading and resolves with a copy of its contents.
    /// The buffer is unmapped again before the future resolves.
    fn map_read(
        &self,
        device: &Self::Device,
        buffer: &Self::Buffer,
    ) -> LocalBoxFuture<'static, Result<Vec<u8>, String>>;

    fn destroy_buffer(&self, buffer: &Self::Buffer);
}
