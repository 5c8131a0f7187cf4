//! One device, many surfaces: the primary canvas plus a row of extra canvases,
//! each with its own configured surface and uniform, all drawn every frame.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use futures::future::LocalBoxFuture;
use prism_engine::device::{Canvas, SurfaceConfig, WgpuBackend};
use prism_engine::scene::{CanvasDescriptor, Cleanup, DisposeStack, MountContext, Scene};

use crate::common::{
    acquire_gpu, aspect, attach_surface, clear_attachment, draw_frame, shader_module, start_loop,
    uniform_entry, Ctx, SceneSettings, SharedSurface,
};

pub const ID: &str = "multi-canvas";

#[derive(Debug, Clone)]
pub struct MultiCanvasOptions {
    /// Canvases created in addition to the primary one.
    pub extra_canvases: usize,
    pub canvas_size: (f64, f64),
}

impl Default for MultiCanvasOptions {
    fn default() -> Self {
        Self {
            extra_canvases: 4,
            canvas_size: (320.0, 240.0),
        }
    }
}

pub struct MultiCanvasScene {
    pub settings: SceneSettings,
    pub options: MultiCanvasOptions,
}

impl Scene<WgpuBackend> for MultiCanvasScene {
    fn id(&self) -> &str {
        ID
    }

    fn title(&self) -> &str {
        "Multiple canvases"
    }

    fn mount(&self, ctx: MountContext<WgpuBackend>) -> LocalBoxFuture<'static, anyhow::Result<Cleanup>> {
        let settings = self.settings;
        let options = self.options.clone();
        Box::pin(async move {
            let mut stack = DisposeStack::new(ID);
            let result = build(&ctx, settings, &options, &mut stack).await;
            stack.finish(result).await
        })
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct TintUniform {
    color: [f32; 4],
    params: [f32; 4],
}

/// Fully saturated color at `index / count` around the hue wheel.
fn hue(index: usize, count: usize) -> [f32; 3] {
    let h = (index as f32 / count.max(1) as f32).fract() * 6.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    match h as u32 {
        0 => [1.0, x, 0.0],
        1 => [x, 1.0, 0.0],
        2 => [0.0, 1.0, x],
        3 => [0.0, x, 1.0],
        4 => [x, 0.0, 1.0],
        _ => [1.0, 0.0, x],
    }
}

struct View {
    surface: SharedSurface,
    ubo: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    pipeline: wgpu::RenderPipeline,
    color: [f32; 3],
    speed: f32,
}

async fn build(
    ctx: &Ctx,
    settings: SceneSettings,
    options: &MultiCanvasOptions,
    stack: &mut DisposeStack,
) -> anyhow::Result<()> {
    let gpu = acquire_gpu(ctx, stack, ID, settings.device_options(), SurfaceConfig::default()).await?;
    let device = gpu.device.clone();
    let queue = gpu.queue.clone();

    let mut surfaces = vec![gpu.surface.clone()];
    for i in 0..options.extra_canvases {
        let canvas = ctx
            .root
            .create_canvas(CanvasDescriptor {
                title: format!("canvas {}", i + 1),
                logical_size: options.canvas_size,
            })
            .await?;
        let canvas_id = canvas.canvas_id();
        let root = ctx.root.clone();
        stack.defer(format!("canvas {canvas_id}"), move || root.release(canvas_id));

        surfaces.push(attach_surface(ctx, stack, &gpu, canvas, SurfaceConfig::default())?);
    }

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("multi-canvas bgl"),
        entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX_FRAGMENT)],
    });
    let shader = shader_module(&device, "multi-canvas shader", include_str!("shaders/multi_canvas.wgsl"));
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("multi-canvas pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        immediate_size: 0,
    });

    // Surfaces usually agree on a format; build one pipeline per distinct one.
    let mut pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline> = HashMap::new();
    let mut views = Vec::with_capacity(surfaces.len());
    let total = surfaces.len();
    for (i, surface) in surfaces.into_iter().enumerate() {
        let format = surface.borrow().format().unwrap_or(gpu.format);
        let pipeline = pipelines
            .entry(format)
            .or_insert_with(|| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("multi-canvas pipeline"),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &shader,
                        entry_point: Some("vs_main"),
                        compilation_options: Default::default(),
                        buffers: &[],
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &shader,
                        entry_point: Some("fs_main"),
                        compilation_options: Default::default(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview_mask: None,
                    cache: None,
                })
            })
            .clone();

        let ubo = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("multi-canvas tint"),
            size: std::mem::size_of::<TintUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let b = ubo.clone();
        stack.defer("tint buffer", move || b.destroy());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("multi-canvas bind group"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: ubo.as_entire_binding(),
            }],
        });

        views.push(View {
            surface,
            ubo,
            bind_group,
            pipeline,
            color: hue(i, total),
            speed: 0.5 + 0.35 * i as f32,
        });
    }

    start_loop(ctx, stack, &gpu, move |time| {
        for view in &views {
            let flow = draw_frame(&view.surface, &device, &queue, "multi-canvas frame", |encoder, frame| {
                let [r, g, b] = view.color;
                let uniform = TintUniform {
                    color: [r, g, b, 1.0],
                    params: [time.elapsed * view.speed, aspect(frame), 0.0, 0.0],
                };
                queue.write_buffer(&view.ubo, 0, bytemuck::bytes_of(&uniform));

                let background = wgpu::Color {
                    r: r as f64 * 0.08,
                    g: g as f64 * 0.08,
                    b: b as f64 * 0.08,
                    a: 1.0,
                };
                let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("multi-canvas pass"),
                    color_attachments: &[Some(clear_attachment(&frame.color_view, background))],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                    multiview_mask: None,
                });
                rpass.set_pipeline(&view.pipeline);
                rpass.set_bind_group(0, &view.bind_group, &[]);
                rpass.draw(0..3, 0..1);
            });
            if flow.is_break() {
                return flow;
            }
        }
        std::ops::ControlFlow::Continue(())
    });

    log::info!("{ID}: mounted with {total} canvases on one device");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hues_are_distinct_and_saturated() {
        let colors: Vec<[f32; 3]> = (0..5).map(|i| hue(i, 5)).collect();
        for (i, a) in colors.iter().enumerate() {
            assert!(a.iter().all(|c| (0.0..=1.0).contains(c)));
            assert!(a.iter().any(|&c| c == 1.0), "{a:?} not saturated");
            for b in &colors[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn first_hue_is_red() {
        assert_eq!(hue(0, 3), [1.0, 0.0, 0.0]);
        assert_eq!(hue(0, 0), [1.0, 0.0, 0.0]);
    }
}
