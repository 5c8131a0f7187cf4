//! Plumbing shared by every scene: device + surface acquisition registered on
//! the scene's dispose stack, resize wiring, and per-frame submission.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context;
use prism_engine::device::{
    Canvas, DeviceHost, DeviceHostOptions, ErrorHandler, FrameContext, GpuError, LostFlag,
    SurfaceConfig, SurfaceErrorAction, SurfaceManager, WgpuBackend, WindowCanvas,
};
use prism_engine::scene::{DisposeStack, EventKind, FrameLoop, MountContext, WindowSignal};
use prism_engine::time::FrameTime;

pub(crate) type Ctx = MountContext<WgpuBackend>;
pub(crate) type SharedSurface = Rc<RefCell<SurfaceManager<WgpuBackend>>>;

pub(crate) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24Plus;

/// Device and primary surface of a mounted scene.
pub(crate) struct SceneGpu {
    pub host: Rc<RefCell<DeviceHost<WgpuBackend>>>,
    pub surface: SharedSurface,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub format: wgpu::TextureFormat,
    pub lost: LostFlag,
}

/// Logs device-layer errors under the scene's label. Device loss is logged by
/// the host itself and ends the frame loop.
pub(crate) fn log_errors(label: &str) -> ErrorHandler {
    let label = label.to_string();
    Arc::new(move |err: &GpuError| {
        if !matches!(err, GpuError::DeviceLost { .. }) {
            log::error!("{label}: {err}");
        }
    })
}

/// Acquires a device bound to the primary canvas and configures its surface.
///
/// Both are pushed onto `stack`, device first, so the surface is released
/// before the device goes away.
pub(crate) async fn acquire_gpu(
    ctx: &Ctx,
    stack: &mut DisposeStack,
    label: &str,
    options: DeviceHostOptions<WgpuBackend>,
    surface_config: SurfaceConfig,
) -> anyhow::Result<SceneGpu> {
    let primary = ctx.primary_canvas();
    let host = DeviceHost::init(
        ctx.backend.clone(),
        DeviceHostOptions {
            canvas: Some(primary.clone()),
            label: label.to_string(),
            on_error: Some(log_errors(label)),
            ..options
        },
    )
    .await
    .with_context(|| format!("{label}: device initialization failed"))?;

    let device = host.device().clone();
    let queue = host.queue().clone();
    let lost = host.lost_flag();
    let host = Rc::new(RefCell::new(host));
    let h = host.clone();
    stack.defer("device", move || h.borrow_mut().dispose());

    let mut surface = SurfaceManager::new();
    host.borrow()
        .configure_surface(&mut surface, surface_config)
        .with_context(|| format!("{label}: surface configuration failed"))?;
    let format = surface
        .format()
        .context("configured surface reports no format")?;
    let surface = Rc::new(RefCell::new(surface));
    let s = surface.clone();
    stack.defer("surface", move || s.borrow_mut().dispose());

    watch_resize(ctx, stack, &surface, primary.canvas_id());

    Ok(SceneGpu {
        host,
        surface,
        device,
        queue,
        format,
        lost,
    })
}

/// Configures an additional surface on an existing device.
pub(crate) fn attach_surface(
    ctx: &Ctx,
    stack: &mut DisposeStack,
    gpu: &SceneGpu,
    canvas: WindowCanvas,
    config: SurfaceConfig,
) -> anyhow::Result<SharedSurface> {
    let canvas_id = canvas.canvas_id();
    let mut surface = SurfaceManager::new();
    surface
        .configure(gpu.host.borrow().context(), canvas, config)
        .with_context(|| format!("surface for canvas {canvas_id}"))?;
    let surface = Rc::new(RefCell::new(surface));
    let s = surface.clone();
    stack.defer("canvas surface", move || s.borrow_mut().dispose());
    watch_resize(ctx, stack, &surface, canvas_id);
    Ok(surface)
}

/// Resizes `surface` whenever its canvas reports a size change.
pub(crate) fn watch_resize(
    ctx: &Ctx,
    stack: &mut DisposeStack,
    surface: &SharedSurface,
    canvas_id: u64,
) {
    let s = surface.clone();
    let id = ctx.listeners.add_listener(EventKind::Resize, move |signal| {
        if *signal == (WindowSignal::Resized { canvas_id }) {
            s.borrow_mut().resize();
        }
    });
    let listeners = ctx.listeners.clone();
    stack.defer("resize listener", move || {
        listeners.remove_listener(id);
    });
}

/// Starts the scene's frame loop; cancelling it is the last thing pushed, so
/// it is the first thing undone. The loop stops for good if the device is lost.
pub(crate) fn start_loop(
    ctx: &Ctx,
    stack: &mut DisposeStack,
    gpu: &SceneGpu,
    body: impl FnMut(FrameTime) -> ControlFlow<()> + 'static,
) -> FrameLoop {
    let frame_loop = FrameLoop::start_until_lost(&ctx.frames, gpu.lost.clone(), body);
    let fl = frame_loop.clone();
    stack.defer("frame loop", move || fl.cancel());
    frame_loop
}

/// Acquires a frame, lets `encode` record into a fresh encoder, submits and
/// presents.
///
/// Transient acquisition errors skip the frame; fatal ones stop the loop.
pub(crate) fn draw_frame(
    surface: &RefCell<SurfaceManager<WgpuBackend>>,
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    encode: impl FnOnce(&mut wgpu::CommandEncoder, &FrameContext<WgpuBackend>),
) -> ControlFlow<()> {
    let acquired = surface.borrow().acquire_frame();
    let frame = match acquired {
        Ok(frame) => frame,
        Err(GpuError::SurfaceAcquire(err)) => {
            return match surface.borrow_mut().handle_acquire_error(err) {
                SurfaceErrorAction::Fatal => {
                    log::error!("{label}: surface lost for good ({err:?}); stopping");
                    ControlFlow::Break(())
                }
                action => {
                    log::trace!("{label}: frame skipped ({err:?} -> {action:?})");
                    ControlFlow::Continue(())
                }
            };
        }
        Err(err) => {
            log::error!("{label}: {err}");
            return ControlFlow::Break(());
        }
    };

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some(label),
    });
    encode(&mut encoder, &frame);
    queue.submit(std::iter::once(encoder.finish()));
    frame.present();
    ControlFlow::Continue(())
}

pub(crate) fn shader_module(
    device: &wgpu::Device,
    label: &str,
    source: &'static str,
) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

pub(crate) fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Color attachment that clears to `clear` and stores.
pub(crate) fn clear_attachment<'a>(
    view: &'a wgpu::TextureView,
    clear: wgpu::Color,
) -> wgpu::RenderPassColorAttachment<'a> {
    wgpu::RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: wgpu::Operations {
            load: wgpu::LoadOp::Clear(clear),
            store: wgpu::StoreOp::Store,
        },
        depth_slice: None,
    }
}

/// Aspect ratio of a frame, guarded against degenerate sizes.
pub(crate) fn aspect(frame: &FrameContext<WgpuBackend>) -> f32 {
    frame.size.width.max(1) as f32 / frame.size.height.max(1) as f32
}

/// Depth attachment that clears to the far plane and discards on store.
pub(crate) fn depth_attachment(view: &wgpu::TextureView) -> wgpu::RenderPassDepthStencilAttachment<'_> {
    wgpu::RenderPassDepthStencilAttachment {
        view,
        depth_ops: Some(wgpu::Operations {
            load: wgpu::LoadOp::Clear(1.0),
            store: wgpu::StoreOp::Discard,
        }),
        stencil_ops: None,
    }
}

/// Standard less-than depth test with writes.
pub(crate) fn depth_state() -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: true,
        depth_compare: wgpu::CompareFunction::Less,
        stencil: wgpu::StencilState::default(),
        bias: wgpu::DepthBiasState::default(),
    }
}

/// Settings shared by every scene in the catalog.
#[derive(Debug, Clone, Copy)]
pub struct SceneSettings {
    pub power_preference: wgpu::PowerPreference,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }
}

impl SceneSettings {
    pub(crate) fn device_options(&self) -> DeviceHostOptions<WgpuBackend> {
        DeviceHostOptions {
            power_preference: self.power_preference,
            ..DeviceHostOptions::default()
        }
    }
}

/// Unit quad corner in `[0, 1]^2`, shared by billboard and glyph pipelines.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct QuadVertex {
    pub corner: [f32; 2],
}

impl QuadVertex {
    const ATTRS: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];

    pub(crate) fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRS,
        }
    }
}

pub(crate) const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { corner: [0.0, 0.0] },
    QuadVertex { corner: [1.0, 0.0] },
    QuadVertex { corner: [1.0, 1.0] },
    QuadVertex { corner: [0.0, 1.0] },
];

pub(crate) const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];
