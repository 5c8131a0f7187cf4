//! In-process backend without a GPU.
//!
//! Every resource is an identity-carrying token; the backend counts what is
//! alive so lifecycle code can be checked for leaks. Adapter and device requests
//! can be made to fail, supported features are configurable, and driver
//! notifications (device lost, uncaptured errors) can be injected.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;

use super::backend::{Backend, Canvas, DeviceLostSink, DeviceRequest, UncapturedErrorSink};
use super::AcquireError;
use crate::scene::{CanvasDescriptor, CanvasRoot};

// ── canvas ────────────────────────────────────────────────────────────────

/// Canvas whose client size and device-pixel-ratio are set by the caller.
#[derive(Clone, Debug)]
pub struct HeadlessCanvas {
    id: u64,
    size: Rc<Cell<(f64, f64)>>,
    dpr: Rc<Cell<f64>>,
}

impl HeadlessCanvas {
    pub fn new(id: u64, width: f64, height: f64, device_pixel_ratio: f64) -> Self {
        Self {
            id,
            size: Rc::new(Cell::new((width, height))),
            dpr: Rc::new(Cell::new(device_pixel_ratio)),
        }
    }

    pub fn set_client_size(&self, width: f64, height: f64) {
        self.size.set((width, height));
    }

    pub fn set_device_pixel_ratio(&self, dpr: f64) {
        self.dpr.set(dpr);
    }
}

impl Canvas for HeadlessCanvas {
    fn canvas_id(&self) -> u64 {
        self.id
    }

    fn client_size(&self) -> (f64, f64) {
        self.size.get()
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.dpr.get()
    }
}

// ── handles ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessAdapter {
    pub id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessDevice {
    pub id: u64,
    pub features: wgpu::Features,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessQueue {
    pub device_id: u64,
}

#[derive(Debug)]
pub struct HeadlessSurface {
    pub id: u64,
    pub canvas_id: u64,
}

#[derive(Debug)]
pub struct HeadlessSurfaceTexture {
    pub surface_id: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct HeadlessTexture {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessView {
    pub texture_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessBuffer {
    pub id: u64,
    pub size: u64,
}

// ── backend state ─────────────────────────────────────────────────────────

struct State {
    next_id: u64,

    adapter_available: bool,
    supported_features: wgpu::Features,
    limits: wgpu::Limits,
    surface_formats: Vec<wgpu::TextureFormat>,
    alpha_modes: Vec<wgpu::CompositeAlphaMode>,
    fail_device_requests: bool,
    device_requests: Vec<wgpu::Features>,

    live_devices: HashSet<u64>,
    uncaptured_sinks: Vec<(u64, UncapturedErrorSink)>,
    lost_sinks: Vec<(u64, DeviceLostSink)>,

    surface_configs: HashMap<u64, wgpu::SurfaceConfiguration>,
    next_acquire_error: Option<AcquireError>,
    presented: u64,

    live_textures: HashSet<u64>,
    textures_created: u64,

    live_buffers: HashSet<u64>,
    buffers_created: u64,
    /// Outstanding maps, keyed by buffer id.
    pending_reads: Vec<(u64, oneshot::Sender<Result<Vec<u8>, String>>)>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Recording backend used by tests and tooling.
#[derive(Clone)]
pub struct HeadlessBackend {
    state: Rc<RefCell<State>>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// Creates a backend with one adapter, no optional features, default limits
    /// and an sRGB-capable surface format list.
    pub fn new() -> Self {
        let state = State {
            next_id: 0,
            adapter_available: true,
            supported_features: wgpu::Features::empty(),
            limits: wgpu::Limits::default(),
            surface_formats: vec![
                wgpu::TextureFormat::Bgra8Unorm,
                wgpu::TextureFormat::Bgra8UnormSrgb,
            ],
            alpha_modes: vec![
                wgpu::CompositeAlphaMode::Opaque,
                wgpu::CompositeAlphaMode::PreMultiplied,
            ],
            fail_device_requests: false,
            device_requests: Vec::new(),
            live_devices: HashSet::new(),
            uncaptured_sinks: Vec::new(),
            lost_sinks: Vec::new(),
            surface_configs: HashMap::new(),
            next_acquire_error: None,
            presented: 0,
            live_textures: HashSet::new(),
            textures_created: 0,
            live_buffers: HashSet::new(),
            buffers_created: 0,
            pending_reads: Vec::new(),
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    // ── configuration ──────────────────────────────────────────────────────

    pub fn set_adapter_available(&self, available: bool) {
        self.state.borrow_mut().adapter_available = available;
    }

    pub fn set_supported_features(&self, features: wgpu::Features) {
        self.state.borrow_mut().supported_features = features;
    }

    /// Makes every device request fail regardless of the requested features.
    pub fn set_fail_device_requests(&self, fail: bool) {
        self.state.borrow_mut().fail_device_requests = fail;
    }

    pub fn set_surface_formats(&self, formats: Vec<wgpu::TextureFormat>) {
        self.state.borrow_mut().surface_formats = formats;
    }

    /// The next `acquire_texture` call fails with `err`.
    pub fn fail_next_acquire(&self, err: AcquireError) {
        self.state.borrow_mut().next_acquire_error = Some(err);
    }

    // ── injected notifications ─────────────────────────────────────────────

    pub fn emit_uncaptured_error(&self, message: &str) {
        let sinks: Vec<UncapturedErrorSink> = {
            let st = self.state.borrow();
            st.uncaptured_sinks
                .iter()
                .filter(|(device, _)| st.live_devices.contains(device))
                .map(|(_, sink)| sink.clone())
                .collect()
        };
        for sink in sinks {
            sink(message.to_string());
        }
    }

    pub fn emit_device_lost(&self, reason: &str, message: &str) {
        let sinks: Vec<DeviceLostSink> = {
            let st = self.state.borrow();
            st.lost_sinks.iter().map(|(_, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink(reason.to_string(), message.to_string());
        }
    }

    /// Resolves every outstanding `map_read` with `bytes`. Returns how many
    /// reads were completed.
    pub fn complete_reads(&self, bytes: &[u8]) -> usize {
        let pending = std::mem::take(&mut self.state.borrow_mut().pending_reads);
        let count = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Ok(bytes.to_vec()));
        }
        count
    }

    // ── inspection ─────────────────────────────────────────────────────────

    /// Feature sets of every device request, in the order they were made.
    pub fn device_requests(&self) -> Vec<wgpu::Features> {
        self.state.borrow().device_requests.clone()
    }

    pub fn live_devices(&self) -> usize {
        self.state.borrow().live_devices.len()
    }

    pub fn live_textures(&self) -> usize {
        self.state.borrow().live_textures.len()
    }

    pub fn textures_created(&self) -> u64 {
        self.state.borrow().textures_created
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().live_buffers.len()
    }

    pub fn buffers_created(&self) -> u64 {
        self.state.borrow().buffers_created
    }

    pub fn pending_reads(&self) -> usize {
        self.state.borrow().pending_reads.len()
    }

    pub fn presented_frames(&self) -> u64 {
        self.state.borrow().presented
    }

    /// Last configuration applied to the surface of `canvas_id`.
    pub fn surface_config(&self, canvas_id: u64) -> Option<wgpu::SurfaceConfiguration> {
        self.state.borrow().surface_configs.get(&canvas_id).cloned()
    }
}

impl Backend for HeadlessBackend {
    type Canvas = HeadlessCanvas;
    type Adapter = HeadlessAdapter;
    type Device = HeadlessDevice;
    type Queue = HeadlessQueue;
    type Surface = HeadlessSurface;
    type SurfaceTexture = HeadlessSurfaceTexture;
    type Texture = HeadlessTexture;
    type TextureView = HeadlessView;
    type Buffer = HeadlessBuffer;

    async fn request_adapter(
        &self,
        _power_preference: wgpu::PowerPreference,
        _compatible_canvas: Option<&HeadlessCanvas>,
    ) -> Option<HeadlessAdapter> {
        let mut st = self.state.borrow_mut();
        if !st.adapter_available {
            return None;
        }
        Some(HeadlessAdapter { id: st.next_id() })
    }

    fn adapter_features(&self, _adapter: &HeadlessAdapter) -> wgpu::Features {
        self.state.borrow().supported_features
    }

    fn adapter_limits(&self, _adapter: &HeadlessAdapter) -> wgpu::Limits {
        self.state.borrow().limits.clone()
    }

    async fn request_device(
        &self,
        _adapter: &HeadlessAdapter,
        request: &DeviceRequest<'_>,
    ) -> Result<(HeadlessDevice, HeadlessQueue), String> {
        let mut st = self.state.borrow_mut();
        st.device_requests.push(request.features);

        if st.fail_device_requests {
            return Err("device creation rejected".to_string());
        }
        let missing = request.features.difference(st.supported_features);
        if !missing.is_empty() {
            return Err(format!("unsupported features requested: {missing:?}"));
        }

        let id = st.next_id();
        st.live_devices.insert(id);
        Ok((
            HeadlessDevice {
                id,
                features: request.features,
            },
            HeadlessQueue { device_id: id },
        ))
    }

    fn set_uncaptured_error_sink(&self, device: &HeadlessDevice, sink: UncapturedErrorSink) {
        let mut st = self.state.borrow_mut();
        st.uncaptured_sinks.retain(|(id, _)| *id != device.id);
        st.uncaptured_sinks.push((device.id, sink));
    }

    fn set_device_lost_sink(&self, device: &HeadlessDevice, sink: DeviceLostSink) {
        let mut st = self.state.borrow_mut();
        st.lost_sinks.retain(|(id, _)| *id != device.id);
        st.lost_sinks.push((device.id, sink));
    }

    fn destroy_device(&self, device: &HeadlessDevice) {
        self.state.borrow_mut().live_devices.remove(&device.id);
    }

    fn create_surface(&self, canvas: &HeadlessCanvas) -> Result<HeadlessSurface, String> {
        let mut st = self.state.borrow_mut();
        Ok(HeadlessSurface {
            id: st.next_id(),
            canvas_id: canvas.canvas_id(),
        })
    }

    fn surface_formats(
        &self,
        _surface: &HeadlessSurface,
        _adapter: &HeadlessAdapter,
    ) -> Vec<wgpu::TextureFormat> {
        self.state.borrow().surface_formats.clone()
    }

    fn surface_alpha_modes(
        &self,
        _surface: &HeadlessSurface,
        _adapter: &HeadlessAdapter,
    ) -> Vec<wgpu::CompositeAlphaMode> {
        self.state.borrow().alpha_modes.clone()
    }

    fn configure_surface(
        &self,
        surface: &HeadlessSurface,
        _device: &HeadlessDevice,
        config: &wgpu::SurfaceConfiguration,
    ) {
        self.state
            .borrow_mut()
            .surface_configs
            .insert(surface.canvas_id, config.clone());
    }

    fn acquire_texture(
        &self,
        surface: &HeadlessSurface,
    ) -> Result<(HeadlessSurfaceTexture, HeadlessView), AcquireError> {
        let mut st = self.state.borrow_mut();
        if let Some(err) = st.next_acquire_error.take() {
            return Err(err);
        }
        let texture_id = st.next_id();
        Ok((
            HeadlessSurfaceTexture {
                surface_id: surface.id,
            },
            HeadlessView { texture_id },
        ))
    }

    fn present(&self, _texture: HeadlessSurfaceTexture) {
        self.state.borrow_mut().presented += 1;
    }

    fn create_depth_texture(
        &self,
        _device: &HeadlessDevice,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> (HeadlessTexture, HeadlessView) {
        let mut st = self.state.borrow_mut();
        let id = st.next_id();
        st.live_textures.insert(id);
        st.textures_created += 1;
        (
            HeadlessTexture {
                id,
                width,
                height,
                format,
            },
            HeadlessView { texture_id: id },
        )
    }

    fn destroy_texture(&self, texture: &HeadlessTexture) {
        self.state.borrow_mut().live_textures.remove(&texture.id);
    }

    fn create_readback_buffer(&self, _device: &HeadlessDevice, size: u64) -> HeadlessBuffer {
        let mut st = self.state.borrow_mut();
        let id = st.next_id();
        st.live_buffers.insert(id);
        st.buffers_created += 1;
        HeadlessBuffer { id, size }
    }

    fn map_read(
        &self,
        _device: &HeadlessDevice,
        buffer: &HeadlessBuffer,
    ) -> LocalBoxFuture<'static, Result<Vec<u8>, String>> {
        let (tx, rx) = oneshot::channel();
        self.state.borrow_mut().pending_reads.push((buffer.id, tx));
        Box::pin(async move {
            rx.await
                .map_err(|_| "headless read abandoned".to_string())?
        })
    }

    /// Destroying a buffer aborts its pending map, as wgpu does.
    fn destroy_buffer(&self, buffer: &HeadlessBuffer) {
        let mut st = self.state.borrow_mut();
        st.live_buffers.remove(&buffer.id);
        st.pending_reads.retain(|(id, _)| *id != buffer.id);
    }
}

// ── content root ──────────────────────────────────────────────────────────

/// Content root backed by headless canvases. Extra canvases are created
/// immediately with the requested logical size and the primary canvas's
/// device-pixel-ratio.
pub struct HeadlessRoot {
    primary: HeadlessCanvas,
    extra: RefCell<Vec<HeadlessCanvas>>,
    next_id: Cell<u64>,
}

impl HeadlessRoot {
    pub fn new(primary: HeadlessCanvas) -> Self {
        Self {
            next_id: Cell::new(primary.canvas_id() + 1),
            primary,
            extra: RefCell::new(Vec::new()),
        }
    }
}

impl CanvasRoot<HeadlessCanvas> for HeadlessRoot {
    fn primary(&self) -> HeadlessCanvas {
        self.primary.clone()
    }

    fn create_canvas(
        &self,
        desc: CanvasDescriptor,
    ) -> LocalBoxFuture<'static, anyhow::Result<HeadlessCanvas>> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let (width, height) = desc.logical_size;
        let canvas = HeadlessCanvas::new(id, width, height, self.primary.device_pixel_ratio());
        self.extra.borrow_mut().push(canvas.clone());
        Box::pin(async move { Ok(canvas) })
    }

    fn release(&self, canvas_id: u64) {
        self.extra.borrow_mut().retain(|c| c.canvas_id() != canvas_id);
    }

    fn clear(&self) {
        self.extra.borrow_mut().clear();
    }

    fn canvas_count(&self) -> usize {
        self.extra.borrow().len()
    }
}
