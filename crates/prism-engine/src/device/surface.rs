use std::rc::Rc;

use super::backend::{Backend, Canvas};
use super::frame::FrameContext;
use super::host::GpuContext;
use super::{AcquireError, GpuError, SurfaceErrorAction};

/// Overrides the canvas's client-measured logical size.
pub type SizeProvider = Rc<dyn Fn() -> (f64, f64)>;

/// Desired presentation setup for a [`SurfaceManager`].
#[derive(Clone)]
pub struct SurfaceConfig {
    /// Presentation format. `None` selects the driver's preferred format
    /// (sRGB when available).
    pub format: Option<wgpu::TextureFormat>,

    /// Depth attachment format. `None` means no depth texture is ever allocated.
    pub depth_format: Option<wgpu::TextureFormat>,

    /// Alpha compositing mode. Falls back to a supported mode when unsupported.
    pub alpha_mode: Option<wgpu::CompositeAlphaMode>,

    /// FIFO is broadly supported and generally appropriate for demo workloads.
    pub present_mode: wgpu::PresentMode,

    /// This value is a hint; support depends on platform/backend.
    pub desired_maximum_frame_latency: u32,

    pub size_provider: Option<SizeProvider>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            format: None,
            depth_format: None,
            alpha_mode: None,
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            size_provider: None,
        }
    }
}

impl SurfaceConfig {
    pub fn with_depth(mut self, format: wgpu::TextureFormat) -> Self {
        self.depth_format = Some(format);
        self
    }
}

/// Backing-buffer size in physical pixels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BackingSize {
    pub width: u32,
    pub height: u32,
    pub device_pixel_ratio: f64,
}

impl BackingSize {
    /// Converts a logical size to backing pixels.
    ///
    /// Each axis is `floor(logical * dpr)` clamped to at least 1. Non-finite or
    /// non-positive ratios count as 1.
    pub fn from_logical(width: f64, height: f64, device_pixel_ratio: f64) -> Self {
        let dpr = if device_pixel_ratio.is_finite() && device_pixel_ratio > 0.0 {
            device_pixel_ratio
        } else {
            1.0
        };
        // Float-to-int casts saturate: NaN and negatives land on 0.
        let axis = |logical: f64| ((logical * dpr).floor() as u32).max(1);
        Self {
            width: axis(width),
            height: axis(height),
            device_pixel_ratio: dpr,
        }
    }

    fn same_extent(&self, other: &BackingSize) -> bool {
        self.width == other.width && self.height == other.height
    }
}

struct DepthTarget<B: Backend> {
    texture: B::Texture,
    view: B::TextureView,
}

struct Configured<B: Backend> {
    gpu: GpuContext<B>,
    canvas: B::Canvas,
    surface: B::Surface,
    config: wgpu::SurfaceConfiguration,
    depth_format: Option<wgpu::TextureFormat>,
    size_provider: Option<SizeProvider>,
    size: Option<BackingSize>,
    depth: Option<DepthTarget<B>>,
}

/// Owns one presentation surface and its depth texture.
pub struct SurfaceManager<B: Backend> {
    state: Option<Configured<B>>,
    depth_generation: u64,
}

impl<B: Backend> Default for SurfaceManager<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> SurfaceManager<B> {
    pub fn new() -> Self {
        Self {
            state: None,
            depth_generation: 0,
        }
    }

    /// Binds `canvas` to the device and performs the initial resize.
    ///
    /// Reconfiguring an already configured manager releases the previous
    /// surface and depth texture first.
    pub fn configure(
        &mut self,
        gpu: &GpuContext<B>,
        canvas: B::Canvas,
        config: SurfaceConfig,
    ) -> Result<(), GpuError> {
        self.dispose();

        let backend = &gpu.backend;
        let surface = backend
            .create_surface(&canvas)
            .map_err(|reason| GpuError::SurfaceCreationFailed { reason })?;

        let format = match config.format {
            Some(format) => format,
            None => choose_surface_format(&backend.surface_formats(&surface, &gpu.adapter), true)
                .ok_or_else(|| GpuError::SurfaceCreationFailed {
                    reason: "no supported surface formats".to_string(),
                })?,
        };
        let alpha_mode = choose_alpha_mode(
            &backend.surface_alpha_modes(&surface, &gpu.adapter),
            config.alpha_mode,
        );

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: 1,
            height: 1,
            present_mode: config.present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: config.desired_maximum_frame_latency,
        };

        log::debug!(
            "configuring surface for canvas {} as {format:?} (depth {:?})",
            canvas.canvas_id(),
            config.depth_format
        );

        self.state = Some(Configured {
            gpu: gpu.clone(),
            canvas,
            surface,
            config: surface_config,
            depth_format: config.depth_format,
            size_provider: config.size_provider,
            size: None,
            depth: None,
        });
        self.resize();
        Ok(())
    }

    /// Recomputes the backing size and reconfigures the surface.
    ///
    /// The depth texture is recreated only when the backing extent changes.
    /// Returns `None` before `configure`.
    pub fn resize(&mut self) -> Option<BackingSize> {
        let state = self.state.as_mut()?;

        let (width, height) = match &state.size_provider {
            Some(provider) => provider(),
            None => state.canvas.client_size(),
        };
        let size = BackingSize::from_logical(width, height, state.canvas.device_pixel_ratio());

        let backend = &state.gpu.backend;
        state.config.width = size.width;
        state.config.height = size.height;
        backend.configure_surface(&state.surface, &state.gpu.device, &state.config);

        let extent_changed = state.size.is_none_or(|prev| !prev.same_extent(&size));
        if let Some(depth_format) = state.depth_format {
            if extent_changed || state.depth.is_none() {
                if let Some(old) = state.depth.take() {
                    backend.destroy_texture(&old.texture);
                }
                let (texture, view) = backend.create_depth_texture(
                    &state.gpu.device,
                    size.width,
                    size.height,
                    depth_format,
                );
                state.depth = Some(DepthTarget { texture, view });
                self.depth_generation += 1;
            }
        }

        state.size = Some(size);
        Some(size)
    }

    /// Acquires the drawable for the current frame.
    pub fn acquire_frame(&self) -> Result<FrameContext<B>, GpuError> {
        let state = self.state.as_ref().ok_or(GpuError::SurfaceNotConfigured)?;
        let size = state.size.ok_or(GpuError::SurfaceNotConfigured)?;

        let (surface_texture, color_view) = state
            .gpu
            .backend
            .acquire_texture(&state.surface)
            .map_err(GpuError::SurfaceAcquire)?;

        Ok(FrameContext::new(
            state.gpu.backend.clone(),
            surface_texture,
            color_view,
            state.depth.as_ref().map(|d| d.view.clone()),
            state.config.format,
            size,
        ))
    }

    /// Converts a driver acquisition error into a higher-level action.
    pub fn handle_acquire_error(&mut self, err: AcquireError) -> SurfaceErrorAction {
        match err {
            AcquireError::Lost | AcquireError::Outdated => {
                if let Some(state) = self.state.as_ref() {
                    state
                        .gpu
                        .backend
                        .configure_surface(&state.surface, &state.gpu.device, &state.config);
                }
                SurfaceErrorAction::Reconfigured
            }
            AcquireError::OutOfMemory => SurfaceErrorAction::Fatal,
            AcquireError::Timeout | AcquireError::Other => SurfaceErrorAction::SkipFrame,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    /// Presentation format fixed at configure time.
    pub fn format(&self) -> Option<wgpu::TextureFormat> {
        self.state.as_ref().map(|s| s.config.format)
    }

    pub fn size(&self) -> Option<BackingSize> {
        self.state.as_ref().and_then(|s| s.size)
    }

    pub fn canvas(&self) -> Option<&B::Canvas> {
        self.state.as_ref().map(|s| &s.canvas)
    }

    pub fn depth_texture(&self) -> Option<&B::Texture> {
        self.state
            .as_ref()
            .and_then(|s| s.depth.as_ref())
            .map(|d| &d.texture)
    }

    /// Number of depth textures allocated over this manager's lifetime.
    pub fn depth_generation(&self) -> u64 {
        self.depth_generation
    }

    /// Destroys the depth texture and forgets the surface. Idempotent.
    pub fn dispose(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        if let Some(depth) = state.depth {
            state.gpu.backend.destroy_texture(&depth.texture);
        }
        log::debug!("surface for canvas {} disposed", state.canvas.canvas_id());
    }
}

impl<B: Backend> Drop for SurfaceManager<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub(crate) fn choose_surface_format(
    formats: &[wgpu::TextureFormat],
    prefer_srgb: bool,
) -> Option<wgpu::TextureFormat> {
    if formats.is_empty() {
        return None;
    }

    if prefer_srgb {
        let preferred = [
            wgpu::TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Rgba8UnormSrgb,
        ];
        for f in preferred {
            if formats.contains(&f) {
                return Some(f);
            }
        }
    }

    Some(formats[0])
}

pub(crate) fn choose_alpha_mode(
    supported: &[wgpu::CompositeAlphaMode],
    requested: Option<wgpu::CompositeAlphaMode>,
) -> wgpu::CompositeAlphaMode {
    requested
        .filter(|m| supported.contains(m))
        .or_else(|| supported.first().copied())
        .unwrap_or(wgpu::CompositeAlphaMode::Auto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::{HeadlessBackend, HeadlessCanvas};
    use crate::device::{DeviceHost, DeviceHostOptions};

    fn host_with_canvas(canvas: &HeadlessCanvas) -> (HeadlessBackend, DeviceHost<HeadlessBackend>) {
        let backend = HeadlessBackend::new();
        let host = pollster::block_on(DeviceHost::init(
            backend.clone(),
            DeviceHostOptions {
                canvas: Some(canvas.clone()),
                ..DeviceHostOptions::default()
            },
        ))
        .unwrap();
        (backend, host)
    }

    // ── backing size ──────────────────────────────────────────────────────

    #[test]
    fn backing_size_scales_by_dpr() {
        let s = BackingSize::from_logical(300.0, 150.0, 2.0);
        assert_eq!((s.width, s.height), (600, 300));
    }

    #[test]
    fn backing_size_floors_fractional_pixels() {
        let s = BackingSize::from_logical(100.5, 33.3, 1.5);
        assert_eq!((s.width, s.height), (150, 49));
    }

    #[test]
    fn backing_size_never_below_one() {
        for (w, h) in [(0.0, 0.0), (-20.0, -1.0), (0.2, 0.4), (f64::NAN, 5.0)] {
            for dpr in [1.0, 1.25, 2.0, 3.0] {
                let s = BackingSize::from_logical(w, h, dpr);
                assert!(s.width >= 1 && s.height >= 1, "{w}x{h}@{dpr} -> {s:?}");
            }
        }
    }

    #[test]
    fn invalid_dpr_counts_as_one() {
        let s = BackingSize::from_logical(10.0, 20.0, 0.0);
        assert_eq!((s.width, s.height, s.device_pixel_ratio), (10, 20, 1.0));
    }

    // ── format / alpha selection ─────────────────────────────────────────

    #[test]
    fn prefers_srgb_format() {
        let formats = [wgpu::TextureFormat::Bgra8Unorm, wgpu::TextureFormat::Rgba8UnormSrgb];
        assert_eq!(
            choose_surface_format(&formats, true),
            Some(wgpu::TextureFormat::Rgba8UnormSrgb)
        );
        assert_eq!(
            choose_surface_format(&formats, false),
            Some(wgpu::TextureFormat::Bgra8Unorm)
        );
        assert_eq!(choose_surface_format(&[], true), None);
    }

    #[test]
    fn unsupported_alpha_mode_falls_back() {
        let supported = [wgpu::CompositeAlphaMode::Opaque];
        assert_eq!(
            choose_alpha_mode(&supported, Some(wgpu::CompositeAlphaMode::PreMultiplied)),
            wgpu::CompositeAlphaMode::Opaque
        );
        assert_eq!(choose_alpha_mode(&[], None), wgpu::CompositeAlphaMode::Auto);
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    #[test]
    fn acquire_before_configure_fails() {
        let surface: SurfaceManager<HeadlessBackend> = SurfaceManager::new();
        assert!(matches!(
            surface.acquire_frame(),
            Err(GpuError::SurfaceNotConfigured)
        ));
    }

    #[test]
    fn resize_before_configure_is_a_no_op() {
        let mut surface: SurfaceManager<HeadlessBackend> = SurfaceManager::new();
        assert!(surface.resize().is_none());
    }

    #[test]
    fn configure_applies_backing_size() {
        let canvas = HeadlessCanvas::new(7, 300.0, 150.0, 2.0);
        let (backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        host.configure_surface(&mut surface, SurfaceConfig::default())
            .unwrap();

        let cfg = backend.surface_config(7).unwrap();
        assert_eq!((cfg.width, cfg.height), (600, 300));
        assert_eq!(cfg.format, wgpu::TextureFormat::Bgra8UnormSrgb);
    }

    #[test]
    fn size_provider_overrides_client_size() {
        let canvas = HeadlessCanvas::new(1, 300.0, 150.0, 1.0);
        let (_backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        let config = SurfaceConfig {
            size_provider: Some(Rc::new(|| (64.0, 32.0))),
            ..SurfaceConfig::default()
        };
        host.configure_surface(&mut surface, config).unwrap();
        let size = surface.size().unwrap();
        assert_eq!((size.width, size.height), (64, 32));
    }

    #[test]
    fn depth_texture_reused_when_size_unchanged() {
        let canvas = HeadlessCanvas::new(1, 300.0, 150.0, 1.0);
        let (backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        host.configure_surface(
            &mut surface,
            SurfaceConfig::default().with_depth(wgpu::TextureFormat::Depth24Plus),
        )
        .unwrap();

        let first = surface.depth_texture().unwrap().id;
        surface.resize();
        surface.resize();
        assert_eq!(surface.depth_texture().unwrap().id, first);
        assert_eq!(surface.depth_generation(), 1);
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn depth_texture_recreated_on_size_change() {
        let canvas = HeadlessCanvas::new(1, 300.0, 150.0, 1.0);
        let (backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        host.configure_surface(
            &mut surface,
            SurfaceConfig::default().with_depth(wgpu::TextureFormat::Depth32Float),
        )
        .unwrap();
        let first = surface.depth_texture().unwrap().id;

        canvas.set_device_pixel_ratio(2.0);
        surface.resize();

        let depth = surface.depth_texture().unwrap();
        assert_ne!(depth.id, first);
        assert_eq!((depth.width, depth.height), (600, 300));
        assert_eq!(backend.live_textures(), 1);
        assert_eq!(backend.textures_created(), 2);
    }

    #[test]
    fn no_depth_format_never_allocates() {
        let canvas = HeadlessCanvas::new(1, 300.0, 150.0, 1.0);
        let (backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        host.configure_surface(&mut surface, SurfaceConfig::default())
            .unwrap();
        canvas.set_client_size(10.0, 10.0);
        surface.resize();
        assert!(surface.depth_texture().is_none());
        assert_eq!(backend.textures_created(), 0);

        let frame = surface.acquire_frame().unwrap();
        assert!(frame.depth_view.is_none());
    }

    #[test]
    fn frame_carries_depth_view_of_current_texture() {
        let canvas = HeadlessCanvas::new(1, 40.0, 30.0, 1.0);
        let (backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        host.configure_surface(
            &mut surface,
            SurfaceConfig::default().with_depth(wgpu::TextureFormat::Depth24Plus),
        )
        .unwrap();

        let depth_id = surface.depth_texture().unwrap().id;
        let frame = surface.acquire_frame().unwrap();
        assert_eq!(frame.depth_view.as_ref().unwrap().texture_id, depth_id);
        assert_eq!(frame.size.width, 40);
        frame.present();
        assert_eq!(backend.presented_frames(), 1);
    }

    #[test]
    fn lost_surface_is_reconfigured() {
        let canvas = HeadlessCanvas::new(1, 40.0, 30.0, 1.0);
        let (backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        host.configure_surface(&mut surface, SurfaceConfig::default())
            .unwrap();

        backend.fail_next_acquire(AcquireError::Lost);
        let Err(GpuError::SurfaceAcquire(err)) = surface.acquire_frame() else {
            panic!("expected acquisition failure");
        };
        assert_eq!(
            surface.handle_acquire_error(err),
            SurfaceErrorAction::Reconfigured
        );
        assert_eq!(
            surface.handle_acquire_error(AcquireError::OutOfMemory),
            SurfaceErrorAction::Fatal
        );
        assert!(surface.acquire_frame().is_ok());
    }

    #[test]
    fn dispose_releases_depth_and_is_idempotent() {
        let canvas = HeadlessCanvas::new(1, 40.0, 30.0, 1.0);
        let (backend, host) = host_with_canvas(&canvas);
        let mut surface = SurfaceManager::new();
        host.configure_surface(
            &mut surface,
            SurfaceConfig::default().with_depth(wgpu::TextureFormat::Depth24Plus),
        )
        .unwrap();

        surface.dispose();
        surface.dispose();
        assert!(!surface.is_configured());
        assert_eq!(backend.live_textures(), 0);
        assert!(matches!(
            surface.acquire_frame(),
            Err(GpuError::SurfaceNotConfigured)
        ));
    }
}
