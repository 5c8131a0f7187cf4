use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use winit::dpi::LogicalSize;
use winit::window::Window;

use super::backend::{Backend, Canvas, DeviceLostSink, DeviceRequest, UncapturedErrorSink};
use super::AcquireError;

/// A winit window used as a presentation target.
#[derive(Clone, Debug)]
pub struct WindowCanvas(Arc<Window>);

impl WindowCanvas {
    pub fn new(window: Arc<Window>) -> Self {
        Self(window)
    }

    pub fn window(&self) -> &Window {
        &self.0
    }
}

impl Canvas for WindowCanvas {
    fn canvas_id(&self) -> u64 {
        u64::from(self.0.id())
    }

    fn client_size(&self) -> (f64, f64) {
        let logical: LogicalSize<f64> = self.0.inner_size().to_logical(self.0.scale_factor());
        (logical.width, logical.height)
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.0.scale_factor()
    }
}

/// `Backend` implementation over `wgpu`.
///
/// Owns the `wgpu::Instance`; every surface and adapter is created from it.
#[derive(Clone)]
pub struct WgpuBackend {
    instance: wgpu::Instance,
}

impl WgpuBackend {
    pub fn new() -> Self {
        // Use all backends to allow wgpu to select the optimal platform backend.
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        Self { instance }
    }

    pub fn instance(&self) -> &wgpu::Instance {
        &self.instance
    }
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for WgpuBackend {
    type Canvas = WindowCanvas;
    type Adapter = wgpu::Adapter;
    type Device = wgpu::Device;
    type Queue = wgpu::Queue;
    type Surface = wgpu::Surface<'static>;
    type SurfaceTexture = wgpu::SurfaceTexture;
    type Texture = wgpu::Texture;
    type TextureView = wgpu::TextureView;
    type Buffer = wgpu::Buffer;

    async fn request_adapter(
        &self,
        power_preference: wgpu::PowerPreference,
        compatible_canvas: Option<&WindowCanvas>,
    ) -> Option<wgpu::Adapter> {
        // The probe surface only steers adapter selection; each SurfaceManager
        // creates its own surface later.
        let probe = match compatible_canvas {
            Some(canvas) => match self.instance.create_surface(canvas.0.clone()) {
                Ok(surface) => Some(surface),
                Err(err) => {
                    log::warn!("cannot create probe surface for adapter selection: {err}");
                    None
                }
            },
            None => None,
        };

        match self
            .instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: probe.as_ref(),
                force_fallback_adapter: false,
            })
            .await
        {
            Ok(adapter) => {
                let info = adapter.get_info();
                log::debug!(
                    "selected adapter `{}` ({:?}, {:?})",
                    info.name,
                    info.backend,
                    info.device_type
                );
                Some(adapter)
            }
            Err(err) => {
                log::debug!("adapter request failed: {err}");
                None
            }
        }
    }

    fn adapter_features(&self, adapter: &wgpu::Adapter) -> wgpu::Features {
        adapter.features()
    }

    fn adapter_limits(&self, adapter: &wgpu::Adapter) -> wgpu::Limits {
        adapter.limits()
    }

    async fn request_device(
        &self,
        adapter: &wgpu::Adapter,
        request: &DeviceRequest<'_>,
    ) -> Result<(wgpu::Device, wgpu::Queue), String> {
        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(request.label),
                required_features: request.features,
                required_limits: request.limits.clone(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|err| err.to_string())
    }

    fn set_uncaptured_error_sink(&self, device: &wgpu::Device, sink: UncapturedErrorSink) {
        device.on_uncaptured_error(Arc::new(move |err: wgpu::Error| sink(err.to_string())));
    }

    fn set_device_lost_sink(&self, device: &wgpu::Device, sink: DeviceLostSink) {
        device.set_device_lost_callback(move |reason, message| {
            sink(format!("{reason:?}"), message);
        });
    }

    fn destroy_device(&self, device: &wgpu::Device) {
        device.destroy();
    }

    fn create_surface(&self, canvas: &WindowCanvas) -> Result<wgpu::Surface<'static>, String> {
        self.instance
            .create_surface(canvas.0.clone())
            .map_err(|err| err.to_string())
    }

    fn surface_formats(
        &self,
        surface: &wgpu::Surface<'static>,
        adapter: &wgpu::Adapter,
    ) -> Vec<wgpu::TextureFormat> {
        surface.get_capabilities(adapter).formats
    }

    fn surface_alpha_modes(
        &self,
        surface: &wgpu::Surface<'static>,
        adapter: &wgpu::Adapter,
    ) -> Vec<wgpu::CompositeAlphaMode> {
        surface.get_capabilities(adapter).alpha_modes
    }

    fn configure_surface(
        &self,
        surface: &wgpu::Surface<'static>,
        device: &wgpu::Device,
        config: &wgpu::SurfaceConfiguration,
    ) {
        surface.configure(device, config);
    }

    fn acquire_texture(
        &self,
        surface: &wgpu::Surface<'static>,
    ) -> Result<(wgpu::SurfaceTexture, wgpu::TextureView), AcquireError> {
        let surface_texture = surface.get_current_texture().map_err(|err| match err {
            wgpu::SurfaceError::Lost => AcquireError::Lost,
            wgpu::SurfaceError::Outdated => AcquireError::Outdated,
            wgpu::SurfaceError::Timeout => AcquireError::Timeout,
            wgpu::SurfaceError::OutOfMemory => AcquireError::OutOfMemory,
            wgpu::SurfaceError::Other => AcquireError::Other,
        })?;
        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        Ok((surface_texture, view))
    }

    fn present(&self, texture: wgpu::SurfaceTexture) {
        texture.present();
    }

    fn create_depth_texture(
        &self,
        device: &wgpu::Device,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("prism depth texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    fn destroy_texture(&self, texture: &wgpu::Texture) {
        texture.destroy();
    }

    fn create_readback_buffer(&self, device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("prism readback buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// The map callback only fires while the device is polled; native frame
    /// loops call `device.poll` once per frame to retire it.
    fn map_read(
        &self,
        _device: &wgpu::Device,
        buffer: &wgpu::Buffer,
    ) -> LocalBoxFuture<'static, Result<Vec<u8>, String>> {
        let (tx, rx) = oneshot::channel();
        buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });

        let buffer = buffer.clone();
        Box::pin(async move {
            rx.await
                .map_err(|_| "map callback dropped".to_string())?
                .map_err(|err| err.to_string())?;
            // Destroyed while the callback was queued.
            if !matches!(buffer.map_state(), wgpu::MapState::Mapped) {
                return Err("buffer unmapped before read".to_string());
            }
            let bytes = buffer.slice(..).get_mapped_range().to_vec();
            buffer.unmap();
            Ok(bytes)
        })
    }

    fn destroy_buffer(&self, buffer: &wgpu::Buffer) {
        buffer.destroy();
    }
}
